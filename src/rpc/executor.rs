//! Offloading packet processing from the reactor thread.

use std::fmt::{self, Debug, Formatter};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere to run tasks without blocking the caller for long.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Runs every task immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        task()
    }
}

/// A fixed set of threads consuming a bounded task queue.
///
/// When the queue is full the task runs on the submitting thread instead,
/// throttling the producer.
pub struct WorkerPool {
    sender: Option<flume::Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize, capacity: usize) -> std::io::Result<Self> {
        let (sender, receiver) = flume::bounded::<Task>(capacity);

        let workers = (0..threads.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("krpc-worker-{i}"))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            task();
                        }
                    })
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }
}

impl Executor for WorkerPool {
    fn execute(&self, task: Task) {
        let Some(sender) = &self.sender else {
            return task();
        };

        match sender.try_send(task) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(task)) => {
                debug!(context = "rpc_server", "Worker pool saturated, running task inline");
                task()
            }
            Err(flume::TrySendError::Disconnected(task)) => task(),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Disconnect, so workers exit after the remaining tasks.
        self.sender.take();

        let current = thread::current().id();

        for worker in self.workers.drain(..) {
            // Dropped from one of its own tasks, that worker exits on its own.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!(context = "rpc_server", "Worker thread panicked");
            }
        }
    }
}

impl Debug for WorkerPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}
