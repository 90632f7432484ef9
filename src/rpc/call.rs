//! Outbound requests awaiting a correlated response.

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use tracing::trace;

use crate::common::{Message, MessageKind, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle of an [RpcCall].
pub enum CallState {
    Unsent,
    Sent,
    /// Pending for unusually long, as signalled by the timeout estimator.
    Stalled,
    Responded,
    TimedOut,
    SendFailed,
}

impl CallState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Responded | CallState::TimedOut | CallState::SendFailed
        )
    }
}

/// Observer of [RpcCall] state transitions.
///
/// Listeners are called synchronously, on whichever thread caused the
/// transition, so they need to be fast.
pub trait RpcCallListener: Send + Sync {
    fn on_sent(&self, _call: &Arc<RpcCall>) {}
    fn on_response(&self, _call: &Arc<RpcCall>, _response: &Message) {}
    fn on_timeout(&self, _call: &Arc<RpcCall>) {}
    fn on_stall(&self, _call: &Arc<RpcCall>) {}
    fn on_send_failed(&self, _call: &Arc<RpcCall>) {}
}

/// A tracked outbound request.
///
/// Owned by the transaction registry while pending, the issuer keeps a clone
/// of the `Arc` and observes completion through its [RpcCallListener]s.
pub struct RpcCall {
    request: Message,
    destination: SocketAddr,
    created_at: Instant,
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<Arc<dyn RpcCallListener>>>,
}

#[derive(Debug)]
struct Inner {
    state: CallState,
    transaction_id: Option<TransactionId>,
    sent_at: Option<Instant>,
    response: Option<Message>,
}

enum Transition<'a> {
    Sent,
    Response(&'a Message),
    Timeout,
    Stall,
    SendFailed,
}

impl RpcCall {
    pub fn new(request: Message, destination: SocketAddr) -> Arc<RpcCall> {
        Arc::new(RpcCall {
            request,
            destination,
            created_at: Instant::now(),
            inner: Mutex::new(Inner {
                state: CallState::Unsent,
                transaction_id: None,
                sent_at: None,
                response: None,
            }),
            listeners: Mutex::new(Vec::new()),
        })
    }

    // === Getters ===

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn request_kind(&self) -> MessageKind {
        self.request.kind()
    }

    pub fn state(&self) -> CallState {
        self.inner().state
    }

    /// The transaction id assigned when the call got a registry slot.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.inner().transaction_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn sent_at(&self) -> Option<Instant> {
        self.inner().sent_at
    }

    pub fn response(&self) -> Option<Message> {
        self.inner().response.clone()
    }

    /// The request, with the assigned transaction id stamped into it.
    pub fn request(&self) -> Message {
        let mut request = self.request.clone();
        if let Some(tid) = self.transaction_id() {
            request.transaction_id = Bytes::copy_from_slice(tid.as_bytes());
        }
        request
    }

    // === Public Methods ===

    pub fn add_listener(&self, listener: Arc<dyn RpcCallListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// The request left the socket.
    pub fn sent(self: &Arc<Self>) {
        self.transition(Transition::Sent);
    }

    /// A response or error from the call's destination arrived.
    pub fn responded(self: &Arc<Self>, response: &Message) {
        self.transition(Transition::Response(response));
    }

    pub fn timed_out(self: &Arc<Self>) {
        self.transition(Transition::Timeout);
    }

    pub fn stalled(self: &Arc<Self>) {
        self.transition(Transition::Stall);
    }

    pub fn send_failed(self: &Arc<Self>) {
        self.transition(Transition::SendFailed);
    }

    // === Private Methods ===

    /// Stamp the transaction id, unless the call already completed.
    pub(crate) fn assign(&self, transaction_id: TransactionId) -> bool {
        let mut inner = self.inner();
        if inner.state.is_terminal() {
            return false;
        }
        inner.transaction_id = Some(transaction_id);
        true
    }

    /// Time out a call that never got a transaction id.
    ///
    /// Checked and applied under the same lock as [Self::assign], so a queued
    /// call is either issued or expired, never both.
    pub(crate) fn expire_unassigned(self: &Arc<Self>) -> bool {
        {
            let mut inner = self.inner();
            if inner.transaction_id.is_some() || inner.state.is_terminal() {
                return false;
            }
            trace!(context = "rpc_call", from = ?inner.state, to = ?CallState::TimedOut, "Expired while queued");
            inner.state = CallState::TimedOut;
        }

        self.notify(&Transition::Timeout);
        true
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(self: &Arc<Self>, transition: Transition<'_>) {
        {
            let mut inner = self.inner();

            let next = match (&transition, inner.state) {
                (_, state) if state.is_terminal() => return,
                (Transition::Sent, CallState::Unsent) => {
                    inner.sent_at = Some(Instant::now());
                    CallState::Sent
                }
                (Transition::Sent, _) => return,
                (Transition::Stall, CallState::Stalled) => return,
                (Transition::Stall, _) => CallState::Stalled,
                (Transition::Response(response), _) => {
                    inner.response = Some((*response).clone());
                    CallState::Responded
                }
                (Transition::Timeout, _) => CallState::TimedOut,
                (Transition::SendFailed, _) => CallState::SendFailed,
            };

            trace!(context = "rpc_call", from = ?inner.state, to = ?next, tid = ?inner.transaction_id);
            inner.state = next;
        }

        self.notify(&transition);
    }

    fn notify(self: &Arc<Self>, transition: &Transition<'_>) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in listeners {
            match transition {
                Transition::Sent => listener.on_sent(self),
                Transition::Response(response) => listener.on_response(self, response),
                Transition::Timeout => listener.on_timeout(self),
                Transition::Stall => listener.on_stall(self),
                Transition::SendFailed => listener.on_send_failed(self),
            }
        }
    }
}

impl Debug for RpcCall {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let inner = self.inner();
        f.debug_struct("RpcCall")
            .field("destination", &self.destination)
            .field("state", &inner.state)
            .field("transaction_id", &inner.transaction_id)
            .field("request", &self.request.kind())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::common::{Id, RequestSpecific};

    use super::*;

    #[derive(Default)]
    struct Counter {
        sent: AtomicUsize,
        responses: AtomicUsize,
        timeouts: AtomicUsize,
        stalls: AtomicUsize,
        send_failures: AtomicUsize,
    }

    impl RpcCallListener for Counter {
        fn on_sent(&self, _: &Arc<RpcCall>) {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
        fn on_response(&self, _: &Arc<RpcCall>, _: &Message) {
            self.responses.fetch_add(1, Ordering::SeqCst);
        }
        fn on_timeout(&self, _: &Arc<RpcCall>) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
        fn on_stall(&self, _: &Arc<RpcCall>) {
            self.stalls.fetch_add(1, Ordering::SeqCst);
        }
        fn on_send_failed(&self, _: &Arc<RpcCall>) {
            self.send_failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ping_call() -> Arc<RpcCall> {
        RpcCall::new(
            Message::request(Some(Id::random()), RequestSpecific::Ping),
            "127.0.0.1:6881".parse().unwrap(),
        )
    }

    #[test]
    fn request_is_stamped_with_assigned_tid() {
        let call = ping_call();
        assert!(call.request().transaction_id.is_empty());

        assert!(call.assign(TransactionId([9, 8, 7, 6])));

        assert_eq!(call.request().tid(), Some(TransactionId([9, 8, 7, 6])));
    }

    #[test]
    fn expired_call_cannot_be_assigned() {
        let call = ping_call();
        let counter = Arc::new(Counter::default());
        call.add_listener(counter.clone());

        assert!(call.expire_unassigned());
        assert!(!call.expire_unassigned());
        assert!(!call.assign(TransactionId([1, 2, 3, 4])));

        assert_eq!(call.state(), CallState::TimedOut);
        assert_eq!(call.transaction_id(), None);
        assert_eq!(counter.timeouts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn assigned_call_is_not_expired_as_queued() {
        let call = ping_call();

        assert!(call.assign(TransactionId([1, 2, 3, 4])));
        assert!(!call.expire_unassigned());
        assert_eq!(call.state(), CallState::Unsent);
    }

    #[test]
    fn lifecycle_notifies_listeners() {
        let call = ping_call();
        let counter = Arc::new(Counter::default());
        call.add_listener(counter.clone());

        call.sent();
        assert_eq!(call.state(), CallState::Sent);
        assert!(call.sent_at().is_some());

        call.stalled();
        call.stalled();
        assert_eq!(call.state(), CallState::Stalled);

        let response = Message::response(Bytes::new(), Default::default());
        call.responded(&response);
        assert_eq!(call.state(), CallState::Responded);
        assert_eq!(call.response(), Some(response));

        assert_eq!(counter.sent.load(Ordering::SeqCst), 1);
        assert_eq!(counter.stalls.load(Ordering::SeqCst), 1);
        assert_eq!(counter.responses.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn terminal_states_are_final() {
        let call = ping_call();
        let counter = Arc::new(Counter::default());
        call.add_listener(counter.clone());

        call.timed_out();
        call.responded(&Message::response(Bytes::new(), Default::default()));
        call.sent();
        call.send_failed();

        assert_eq!(call.state(), CallState::TimedOut);
        assert_eq!(counter.timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(counter.responses.load(Ordering::SeqCst), 0);
        assert_eq!(counter.sent.load(Ordering::SeqCst), 0);
        assert_eq!(counter.send_failures.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn late_sent_does_not_override_response() {
        let call = ping_call();

        call.responded(&Message::response(Bytes::new(), Default::default()));
        call.sent();

        assert_eq!(call.state(), CallState::Responded);
    }
}
