//! Outbound pipeline: a FIFO of pending sends drained by one exclusive writer.
//!
//! Any thread may enqueue and then attempt to drain. The writer is claimed with
//! a compare-and-set on a three state machine, `Idle`, `Draining` and
//! `AwaitingWriteReady`, so that exactly one thread writes to the socket at a
//! time and no thread ever blocks waiting for another.

use std::fmt::{self, Debug, Formatter};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use crate::common::{Id, Message, MessageType};
use crate::{Error, Result};

use super::call::RpcCall;

const IDLE: u8 = 0;
const DRAINING: u8 = 1;
const AWAITING_WRITE_READY: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Idle,
    Draining,
    /// The socket buffer was full, draining resumes on the next writable event.
    AwaitingWriteReady,
}

/// A message waiting to be written, with the call it belongs to if it is a request.
pub struct EnqueuedSend {
    message: Message,
    destination: SocketAddr,
    call: Option<Arc<RpcCall>>,
    encoded: OnceLock<Bytes>,
}

impl EnqueuedSend {
    /// Requests and responses without a sender id are stamped with `sender_id`.
    pub fn new(mut message: Message, destination: SocketAddr, sender_id: Id) -> Self {
        if message.sender_id.is_none() && !matches!(message.message_type, MessageType::Error(_)) {
            message.sender_id = Some(sender_id);
        }

        Self {
            message,
            destination,
            call: None,
            encoded: OnceLock::new(),
        }
    }

    pub fn with_call(call: Arc<RpcCall>, sender_id: Id) -> Self {
        let mut send = Self::new(call.request(), call.destination(), sender_id);
        send.call = Some(call);
        send
    }

    /// Stamp the client version, unless the message already carries one.
    pub fn with_version(mut self, version: Option<[u8; 4]>) -> Self {
        if self.message.version.is_none() {
            self.message.version = version.map(|v| Bytes::copy_from_slice(&v));
        }
        self
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn call(&self) -> Option<&Arc<RpcCall>> {
        self.call.as_ref()
    }

    /// Encoded form, computed on first use and cached across would-block retries.
    pub fn encoded(&self) -> Result<&Bytes> {
        if let Some(bytes) = self.encoded.get() {
            return Ok(bytes);
        }

        let bytes = Bytes::from(self.message.to_bytes()?);
        Ok(self.encoded.get_or_init(|| bytes))
    }
}

impl Debug for EnqueuedSend {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnqueuedSend")
            .field("message", &self.message.kind())
            .field("destination", &self.destination)
            .field("call", &self.call.is_some())
            .finish()
    }
}

/// Where the drainer writes to, and whom it reports outcomes to.
pub trait SendTarget {
    fn send_to(&self, bytes: &[u8], to: SocketAddr) -> io::Result<usize>;
    /// Ask the reactor for a writable notification.
    fn await_writable(&self);
    fn on_sent(&self, send: &EnqueuedSend, bytes: usize);
    fn on_send_failed(&self, send: &EnqueuedSend, error: &Error);
}

#[derive(Debug)]
pub struct OutboundPipeline {
    sender: flume::Sender<EnqueuedSend>,
    receiver: flume::Receiver<EnqueuedSend>,
    state: AtomicU8,
}

impl Default for OutboundPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundPipeline {
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();

        Self {
            sender,
            receiver,
            state: AtomicU8::new(IDLE),
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn state(&self) -> WriteState {
        match self.state.load(Ordering::Acquire) {
            DRAINING => WriteState::Draining,
            AWAITING_WRITE_READY => WriteState::AwaitingWriteReady,
            _ => WriteState::Idle,
        }
    }

    // === Public Methods ===

    /// Append to the tail of the queue, without draining.
    pub fn push(&self, send: EnqueuedSend) {
        // Both ends are owned by self, so the channel can't be disconnected.
        let _ = self.sender.send(send);
    }

    /// Drop every queued send, returning how many were dropped.
    pub fn clear(&self) -> usize {
        self.receiver.drain().count()
    }

    /// Attempt to become the exclusive writer and drain the queue.
    ///
    /// Off the reactor thread the writer optimistically assumes `Idle`, so it
    /// never steals the socket from a writer waiting for a writable event. On
    /// the reactor thread the real state is claimed, unless someone else is
    /// already draining.
    pub fn drain(&self, on_reactor_thread: bool, target: &impl SendTarget) {
        loop {
            let current = if on_reactor_thread {
                let state = self.state.load(Ordering::Acquire);
                if state == DRAINING {
                    return;
                }
                state
            } else {
                IDLE
            };

            if self
                .state
                .compare_exchange(current, DRAINING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            while let Ok(send) = self.receiver.try_recv() {
                let result = send
                    .encoded()
                    .and_then(|bytes| target.send_to(bytes, send.destination).map_err(Error::from));

                match result {
                    Ok(0) => {
                        self.await_writable(send, target);
                        return;
                    }
                    Err(Error::IO(error)) if error.kind() == io::ErrorKind::WouldBlock => {
                        self.await_writable(send, target);
                        return;
                    }
                    Ok(bytes) => target.on_sent(&send, bytes),
                    Err(error) => {
                        target.on_send_failed(&send, &error);
                        break;
                    }
                }
            }

            self.state.store(IDLE, Ordering::Release);

            // Something enqueued between the last poll and the release above
            // would otherwise wait for the next unrelated trigger.
            if self.receiver.is_empty() {
                return;
            }
        }
    }

    // === Private Methods ===

    /// Socket is full: requeue at the tail and wait for the reactor.
    fn await_writable(&self, send: EnqueuedSend, target: &impl SendTarget) {
        self.push(send);
        // Set before asking for write interest, a writable event that arrives
        // right away must be able to claim the drain.
        self.state.store(AWAITING_WRITE_READY, Ordering::Release);
        target.await_writable();
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::thread;

    use crate::common::{RequestSpecific, ResponseSpecific};

    use super::*;

    #[derive(Default)]
    struct Target {
        sent: Mutex<Vec<Bytes>>,
        failed: Mutex<Vec<Bytes>>,
        would_block: AtomicUsize,
        fail: AtomicUsize,
        write_interest: AtomicUsize,
        writers: AtomicUsize,
    }

    impl SendTarget for Target {
        fn send_to(&self, bytes: &[u8], _to: SocketAddr) -> io::Result<usize> {
            assert_eq!(
                self.writers.fetch_add(1, Ordering::SeqCst),
                0,
                "more than one writer"
            );

            let result = if self
                .would_block
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                Err(io::ErrorKind::WouldBlock.into())
            } else if self
                .fail
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                Err(io::ErrorKind::PermissionDenied.into())
            } else {
                Ok(bytes.len())
            };

            self.writers.fetch_sub(1, Ordering::SeqCst);
            result
        }
        fn await_writable(&self) {
            self.write_interest.fetch_add(1, Ordering::SeqCst);
        }
        fn on_sent(&self, send: &EnqueuedSend, _bytes: usize) {
            self.sent.lock().unwrap().push(send.message().transaction_id.clone());
        }
        fn on_send_failed(&self, send: &EnqueuedSend, _error: &Error) {
            self.failed.lock().unwrap().push(send.message().transaction_id.clone());
        }
    }

    fn send(tid: u32) -> EnqueuedSend {
        let message = Message::response(
            Bytes::copy_from_slice(&tid.to_be_bytes()),
            ResponseSpecific::default(),
        );
        EnqueuedSend::new(message, "127.0.0.1:6881".parse().unwrap(), Id::random())
    }

    fn tid(tid: u32) -> Bytes {
        Bytes::copy_from_slice(&tid.to_be_bytes())
    }

    #[test]
    fn stamps_default_sender_id() {
        let id = Id::random();
        let request = Message::request(None, RequestSpecific::Ping);
        let send = EnqueuedSend::new(request, "127.0.0.1:1".parse().unwrap(), id);
        assert_eq!(send.message().sender_id, Some(id));

        let own = Id::random();
        let request = Message::request(Some(own), RequestSpecific::Ping);
        let send = EnqueuedSend::new(request, "127.0.0.1:1".parse().unwrap(), id);
        assert_eq!(send.message().sender_id, Some(own));

        let error = Message::error(Bytes::new(), crate::common::ErrorCode::Generic, "");
        let send = EnqueuedSend::new(error, "127.0.0.1:1".parse().unwrap(), id);
        assert_eq!(send.message().sender_id, None);
    }

    #[test]
    fn encoded_is_cached() {
        let send = send(1);

        assert!(std::ptr::eq(send.encoded().unwrap(), send.encoded().unwrap()));
    }

    #[test]
    fn drains_in_order() {
        let pipeline = OutboundPipeline::new();
        let target = Target::default();

        for i in 0..3 {
            pipeline.push(send(i));
        }
        pipeline.drain(false, &target);

        assert_eq!(*target.sent.lock().unwrap(), vec![tid(0), tid(1), tid(2)]);
        assert_eq!(pipeline.state(), WriteState::Idle);
        assert!(pipeline.is_empty());
    }

    #[test]
    fn would_block_requeues_at_tail_and_waits_for_writable() {
        let pipeline = OutboundPipeline::new();
        let target = Target::default();
        target.would_block.store(1, Ordering::SeqCst);

        pipeline.push(send(0));
        pipeline.push(send(1));
        pipeline.drain(false, &target);

        assert!(target.sent.lock().unwrap().is_empty());
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline.state(), WriteState::AwaitingWriteReady);
        assert_eq!(target.write_interest.load(Ordering::SeqCst), 1);

        // A producer thread doesn't steal the socket from the awaiting writer.
        pipeline.push(send(2));
        pipeline.drain(false, &target);
        assert_eq!(pipeline.len(), 3);

        // Writable notification on the reactor thread resumes from the current head.
        pipeline.drain(true, &target);

        // The retried item went to the tail, behind later arrivals.
        assert_eq!(*target.sent.lock().unwrap(), vec![tid(1), tid(0), tid(2)]);
        assert_eq!(pipeline.state(), WriteState::Idle);
    }

    /// Delivers the writable event from inside the interest request, like a
    /// reactor thread that wakes up before the writer returns.
    struct EagerReactor<'a> {
        pipeline: &'a OutboundPipeline,
        target: Target,
        seen: Mutex<Vec<WriteState>>,
    }

    impl SendTarget for EagerReactor<'_> {
        fn send_to(&self, bytes: &[u8], to: SocketAddr) -> io::Result<usize> {
            self.target.send_to(bytes, to)
        }
        fn await_writable(&self) {
            self.seen.lock().unwrap().push(self.pipeline.state());
            self.pipeline.drain(true, self);
        }
        fn on_sent(&self, send: &EnqueuedSend, bytes: usize) {
            self.target.on_sent(send, bytes)
        }
        fn on_send_failed(&self, send: &EnqueuedSend, error: &Error) {
            self.target.on_send_failed(send, error)
        }
    }

    #[test]
    fn writable_event_during_interest_request_resumes_drain() {
        let pipeline = OutboundPipeline::new();
        let reactor = EagerReactor {
            pipeline: &pipeline,
            target: Target::default(),
            seen: Mutex::new(Vec::new()),
        };
        reactor.target.would_block.store(1, Ordering::SeqCst);

        pipeline.push(send(0));
        pipeline.push(send(1));
        pipeline.drain(false, &reactor);

        assert_eq!(*reactor.seen.lock().unwrap(), vec![WriteState::AwaitingWriteReady]);
        assert_eq!(*reactor.target.sent.lock().unwrap(), vec![tid(1), tid(0)]);
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.state(), WriteState::Idle);
    }

    #[test]
    fn io_error_abandons_the_pass() {
        let pipeline = OutboundPipeline::new();
        let target = Target::default();
        target.fail.store(1, Ordering::SeqCst);

        for i in 0..3 {
            pipeline.push(send(i));
        }
        pipeline.drain(false, &target);

        // The failed item is dropped, the untouched ones stay queued and are
        // picked up again by the re-check after the writer is released.
        assert_eq!(*target.failed.lock().unwrap(), vec![tid(0)]);
        assert_eq!(*target.sent.lock().unwrap(), vec![tid(1), tid(2)]);
        assert_eq!(pipeline.state(), WriteState::Idle);
    }

    #[test]
    fn reactor_drain_skips_while_someone_else_drains() {
        let pipeline = OutboundPipeline::new();
        let target = Target::default();

        pipeline.push(send(0));
        pipeline.state.store(DRAINING, Ordering::SeqCst);

        pipeline.drain(true, &target);
        pipeline.drain(false, &target);

        assert_eq!(pipeline.len(), 1);
        assert!(target.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn concurrent_producers_single_writer() {
        let pipeline = Arc::new(OutboundPipeline::new());
        let target = Arc::new(Target::default());

        let handles: Vec<_> = (0..8u32)
            .map(|thread| {
                let pipeline = pipeline.clone();
                let target = target.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        pipeline.push(send(thread * 1000 + i));
                        pipeline.drain(false, &*target);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut sent = target.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 8 * 500);
        sent.sort();
        sent.dedup();
        assert_eq!(sent.len(), 8 * 500, "no duplicated sends");
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.state(), WriteState::Idle);
    }
}
