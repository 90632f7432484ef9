//! Inbound pipeline: datagrams copied off the socket, waiting to be processed
//! by at most one worker task at a time.

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tracing::error;

/// An owned copy of one received datagram, the receive buffer is reused
/// right after the copy.
#[derive(Debug, Clone)]
pub struct EnqueuedRead {
    pub bytes: Bytes,
    pub from: SocketAddr,
}

#[derive(Debug)]
pub struct InboundQueue {
    sender: flume::Sender<EnqueuedRead>,
    receiver: flume::Receiver<EnqueuedRead>,
    processor_running: AtomicBool,
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundQueue {
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();

        Self {
            sender,
            receiver,
            processor_running: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn is_processing(&self) -> bool {
        self.processor_running.load(Ordering::Acquire)
    }

    pub fn push(&self, read: EnqueuedRead) {
        let _ = self.sender.send(read);
    }

    /// Returns true if there is work and no processor is running, in which case
    /// the caller is now responsible for scheduling one, see [Self::process].
    pub fn claim_processor(&self) -> bool {
        !self.receiver.is_empty()
            && self
                .processor_running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Body of the processing task: handle every queued datagram, including
    /// the ones arriving while processing, then release the claim.
    pub fn process(&self, mut handle: impl FnMut(EnqueuedRead)) {
        loop {
            while let Ok(read) = self.receiver.try_recv() {
                let from = read.from;
                if catch_unwind(AssertUnwindSafe(|| handle(read))).is_err() {
                    error!(context = "socket_error", ?from, "Panicked handling packet");
                }
            }

            self.processor_running.store(false, Ordering::Release);

            // A datagram pushed after the last poll but before the release saw
            // the processor running and didn't schedule another one.
            if !self.claim_processor() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn read(byte: u8) -> EnqueuedRead {
        EnqueuedRead {
            bytes: Bytes::copy_from_slice(&[byte]),
            from: "127.0.0.1:6881".parse().unwrap(),
        }
    }

    #[test]
    fn single_flight() {
        let queue = InboundQueue::new();
        assert!(!queue.claim_processor(), "nothing to process");

        queue.push(read(0));
        assert!(queue.claim_processor());
        queue.push(read(1));
        assert!(!queue.claim_processor(), "processor already claimed");

        let mut handled = vec![];
        queue.process(|read| handled.push(read.bytes[0]));

        assert_eq!(handled, vec![0, 1]);
        assert!(!queue.is_processing());
        assert!(queue.is_empty());
    }

    #[test]
    fn reads_pushed_while_processing_are_picked_up() {
        let queue = InboundQueue::new();
        queue.push(read(0));
        assert!(queue.claim_processor());

        let mut handled = vec![];
        queue.process(|read| {
            if read.bytes[0] < 3 {
                queue.push(super::test::read(read.bytes[0] + 1));
                assert!(!queue.claim_processor());
            }
            handled.push(read.bytes[0]);
        });

        assert_eq!(handled, vec![0, 1, 2, 3]);
        assert!(!queue.is_processing());
    }

    #[test]
    fn panicking_handler_releases_the_claim() {
        let queue = InboundQueue::new();
        queue.push(read(0));
        queue.push(read(1));
        assert!(queue.claim_processor());

        let mut handled = vec![];
        queue.process(|read| {
            if read.bytes[0] == 0 {
                panic!("bad packet");
            }
            handled.push(read.bytes[0]);
        });

        assert_eq!(handled, vec![1]);
        assert!(!queue.is_processing());
    }

    #[test]
    fn concurrent_producers_single_processor() {
        let queue = Arc::new(InboundQueue::new());
        let processors = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handled = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let processors = processors.clone();
                let handled = handled.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        queue.push(read(i as u8));
                        if queue.claim_processor() {
                            queue.process(|_| {
                                assert_eq!(processors.fetch_add(1, Ordering::SeqCst), 0);
                                handled.fetch_add(1, Ordering::SeqCst);
                                processors.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(handled.load(Ordering::SeqCst), 1000);
        assert!(queue.is_empty());
    }
}
