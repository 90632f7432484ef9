//! Pending calls by transaction id, bounded by the active calls limit.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::common::TransactionId;

use super::call::RpcCall;

/// Default bound on concurrently pending calls per server.
pub const MAX_ACTIVE_CALLS: usize = 256;

/// Outcome of correlating a response with the registry.
#[derive(Debug)]
pub enum Completion {
    /// The call was pending and is now removed, its slot freed.
    Completed(Arc<RpcCall>),
    /// A call is pending under this id, but it was sent elsewhere.
    OriginMismatch(Arc<RpcCall>),
    /// Nothing pending under this id.
    Unknown,
}

/// Maps transaction ids to pending calls, and queues calls beyond capacity.
#[derive(Debug)]
pub struct TransactionRegistry {
    capacity: usize,
    /// Reserved slots, always >= `calls.len()`.
    active: AtomicUsize,
    calls: DashMap<TransactionId, Arc<RpcCall>>,
    overflow_sender: flume::Sender<Arc<RpcCall>>,
    overflow_receiver: flume::Receiver<Arc<RpcCall>>,
}

impl TransactionRegistry {
    pub fn new(capacity: usize) -> Self {
        let (overflow_sender, overflow_receiver) = flume::unbounded();

        Self {
            capacity,
            active: AtomicUsize::new(0),
            calls: DashMap::new(),
            overflow_sender,
            overflow_receiver,
        }
    }

    // === Getters ===

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of calls registered under a transaction id.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Number of calls waiting for a free slot.
    pub fn queued(&self) -> usize {
        self.overflow_receiver.len()
    }

    pub fn get(&self, transaction_id: &TransactionId) -> Option<Arc<RpcCall>> {
        self.calls.get(transaction_id).map(|entry| entry.value().clone())
    }

    pub fn calls(&self) -> Vec<Arc<RpcCall>> {
        self.calls.iter().map(|entry| entry.value().clone()).collect()
    }

    // === Public Methods ===

    /// Register the call under a fresh random transaction id, stamping it into
    /// the call, or queue it if all slots are taken.
    ///
    /// Returns the assigned id, None if the call was queued or has already
    /// completed.
    pub fn issue(&self, call: &Arc<RpcCall>) -> Option<TransactionId> {
        if !self.reserve_slot() {
            debug!(
                context = "rpc_server",
                destination = ?call.destination(),
                "Queueing RPC call, no slots available at the moment"
            );
            let _ = self.overflow_sender.send(call.clone());
            return None;
        }

        self.register(call)
    }

    /// Remove the call registered under `transaction_id` if, and only if, it was
    /// sent to `origin`.
    ///
    /// Removal is atomic: of two concurrent identical responses, only one completes.
    pub fn complete(&self, transaction_id: &TransactionId, origin: &SocketAddr) -> Completion {
        if let Some((_, call)) = self
            .calls
            .remove_if(transaction_id, |_, call| call.destination() == *origin)
        {
            self.release_slot();
            return Completion::Completed(call);
        }

        match self.get(transaction_id) {
            Some(call) => Completion::OriginMismatch(call),
            None => Completion::Unknown,
        }
    }

    /// Remove this exact call, if still registered.
    pub fn remove(&self, call: &Arc<RpcCall>) -> bool {
        let Some(transaction_id) = call.transaction_id() else {
            return false;
        };

        let removed = self
            .calls
            .remove_if(&transaction_id, |_, registered| Arc::ptr_eq(registered, call))
            .is_some();

        if removed {
            self.release_slot();
        }

        removed
    }

    /// Issue queued calls, oldest first, while slots are available.
    ///
    /// A slot is reserved before a call leaves the queue, so a popped call is
    /// never queued again behind younger ones. Calls that completed while
    /// queued are dropped.
    ///
    /// `dispatch` is called for every call that got a transaction id.
    pub fn promote(&self, mut dispatch: impl FnMut(&Arc<RpcCall>, TransactionId)) {
        while !self.overflow_receiver.is_empty() && self.reserve_slot() {
            let Ok(call) = self.overflow_receiver.try_recv() else {
                self.release_slot();
                return;
            };

            if let Some(transaction_id) = self.register(&call) {
                dispatch(&call, transaction_id);
            }
        }
    }

    /// Drop every queued call, returning them.
    pub fn clear_queue(&self) -> Vec<Arc<RpcCall>> {
        self.overflow_receiver.drain().collect()
    }

    // === Private Methods ===

    /// Insert the call into an already reserved slot.
    fn register(&self, call: &Arc<RpcCall>) -> Option<TransactionId> {
        loop {
            let transaction_id = TransactionId::random();

            if let Entry::Vacant(entry) = self.calls.entry(transaction_id) {
                if !call.assign(transaction_id) {
                    drop(entry);
                    self.release_slot();
                    debug!(
                        context = "rpc_server",
                        destination = ?call.destination(),
                        state = ?call.state(),
                        "Dropping RPC call that completed before it got a slot"
                    );
                    return None;
                }
                entry.insert(call.clone());

                return Some(transaction_id);
            }
        }
    }

    fn reserve_slot(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < self.capacity).then_some(active + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
