//! A Krpc server bound to one UDP endpoint.

use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Instant;

use bytes::Bytes;
use mio::{Interest, Token};
use tracing::{debug, error, info, trace, warn};

use crate::common::{decode, ErrorCode, Id, Message, RequestSpecific, TransactionId};
use crate::{Error, Result};

use super::call::{CallState, RpcCall, RpcCallListener};
use super::config::{Config, ServerContext};
use super::executor::Executor;
use super::inbound::{EnqueuedRead, InboundQueue};
use super::outbound::{EnqueuedSend, OutboundPipeline, SendTarget};
use super::reachability::Reachability;
use super::reactor::{Reactor, Selectable};
use super::registry::{Completion, TransactionRegistry};
use super::socket::{header_length, Udp, RECEIVE_BUFFER_SIZE};
use super::stats::RpcStats;
use super::table::{ReceivedMessage, ServerManager, Table};
use super::timeout::TimeoutEstimator;

#[derive(Debug, Clone)]
struct Bound {
    udp: Arc<dyn Udp>,
    token: Token,
}

/// Owns one UDP socket, correlates requests with their responses, and
/// multiplexes reads and writes without ever blocking its callers.
///
/// Created with [RpcServer::new], then [started](RpcServer::start) once, and
/// finally [stopped](RpcServer::stop), after which it can't be restarted.
pub struct RpcServer {
    config: Config,
    id: Id,

    table: Arc<dyn Table>,
    manager: Arc<dyn ServerManager>,
    reactor: Arc<dyn Reactor>,
    executor: Arc<dyn Executor>,
    timeout_estimator: Arc<dyn TimeoutEstimator>,
    stats: Arc<RpcStats>,

    registry: TransactionRegistry,
    outbound: OutboundPipeline,
    inbound: InboundQueue,
    reachability: Mutex<Reachability>,

    /// Never locked across socket I/O, the Arc is cloned out first.
    socket: RwLock<Option<Bound>>,
    num_sent: AtomicU64,
    num_received: AtomicU64,
    stopped: AtomicBool,

    this: Weak<RpcServer>,
}

/// Ties a dispatched call's terminal states back to the server that issued it.
struct CallTracker(Weak<RpcServer>);

impl RpcCallListener for CallTracker {
    /// Only does anything if the call timed out behind the server's back,
    /// [RpcServer::timeout] claims the call before transitioning it.
    fn on_timeout(&self, call: &Arc<RpcCall>) {
        if let Some(server) = self.0.upgrade() {
            if server.registry.remove(call) {
                server.call_timed_out(call);
            }
        }
    }

    fn on_send_failed(&self, call: &Arc<RpcCall>) {
        if let Some(server) = self.0.upgrade() {
            if server.registry.remove(call) {
                server.promote();
            }
        }
    }
}

impl RpcServer {
    /// Create a server and register its identity with the table layer.
    pub fn new(config: Config, context: ServerContext) -> Arc<RpcServer> {
        let ServerContext {
            table,
            manager,
            reactor,
            executor,
            timeout_estimator,
            stats,
        } = context;

        let id = table.register_server(SocketAddr::new(config.bind_address, config.port));

        Arc::new_cyclic(|this| RpcServer {
            registry: TransactionRegistry::new(config.max_active_calls),
            outbound: OutboundPipeline::new(),
            inbound: InboundQueue::new(),
            reachability: Mutex::new(Reachability::new(
                config.reachability_timeout,
                Instant::now(),
            )),
            config,
            id,
            table,
            manager,
            reactor,
            executor,
            timeout_estimator,
            stats,
            socket: RwLock::new(None),
            num_sent: AtomicU64::new(0),
            num_received: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    // === Getters ===

    /// Default sender id of outgoing messages.
    pub fn derived_id(&self) -> &Id {
        &self.id
    }

    pub fn bind_address(&self) -> IpAddr {
        self.config.bind_address
    }

    /// The bound port if running, the configured one otherwise.
    pub fn port(&self) -> u16 {
        self.local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.config.port)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket().and_then(|bound| bound.udp.local_addr().ok())
    }

    /// The bound address, if it is a globally routable unicast address.
    pub fn public_address(&self) -> Option<IpAddr> {
        self.local_addr()
            .map(|addr| addr.ip())
            .filter(is_global_unicast)
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::Acquire) && self.socket().is_some()
    }

    pub fn is_reachable(&self) -> bool {
        self.reachability
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_reachable()
    }

    pub fn num_active_calls(&self) -> usize {
        self.registry.len()
    }

    /// Calls waiting for a free slot.
    pub fn num_queued_calls(&self) -> usize {
        self.registry.queued()
    }

    pub fn num_sent(&self) -> u64 {
        self.num_sent.load(Ordering::Relaxed)
    }

    pub fn num_received(&self) -> u64 {
        self.num_received.load(Ordering::Relaxed)
    }

    pub fn find_call(&self, transaction_id: &TransactionId) -> Option<Arc<RpcCall>> {
        self.registry.get(transaction_id)
    }

    pub fn stats(&self) -> &Arc<RpcStats> {
        &self.stats
    }

    pub fn timeout_estimator(&self) -> &Arc<dyn TimeoutEstimator> {
        &self.timeout_estimator
    }

    // === Public Methods ===

    /// Bind the socket and register it with the reactor for read interest.
    #[cfg(unix)]
    pub fn start(&self) -> Result<()> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        info!(context = "rpc_server", ?addr, "Starting RPC server");

        let socket = super::socket::bind(addr)?;
        self.attach(Arc::new(socket))
    }

    /// Sockets are only registered through file descriptors so far.
    #[cfg(not(unix))]
    pub fn start(&self) -> Result<()> {
        Err(Error::IO(io::ErrorKind::Unsupported.into()))
    }

    /// Close the socket and unregister from the table layer and the manager.
    ///
    /// Queued sends are dropped, not flushed. Calling it again does nothing.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(context = "rpc_server", id = %self.id, "Stopping RPC server");

        self.outbound.clear();
        self.registry.clear_queue();

        let bound = self
            .socket
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(bound) = bound {
            if let Err(error) = self.reactor.deregister(bound.udp.as_ref(), bound.token) {
                warn!(context = "socket_error", ?error, "Failed to deregister socket");
            }
            // Closed once the last in-flight reference is dropped.
            drop(bound);
        }

        self.table.remove_server(&self.id);
        self.manager.server_removed(&self.id);
    }

    /// Issue a call: assign a transaction id and send it, or queue it if the
    /// maximum number of active calls is reached.
    ///
    /// Never blocks.
    pub fn do_call(&self, call: &Arc<RpcCall>) {
        if self.stopped.load(Ordering::Acquire) {
            debug!(context = "rpc_server", ?call, "Server stopped, dropping call");
            call.send_failed();
            return;
        }

        if self.registry.issue(call).is_some() {
            self.dispatch_call(call);
        } else {
            // A slot may have been freed between the failed reservation and
            // queueing, with nobody left to promote this call.
            self.promote();
        }
    }

    /// Ping `address` with this server's derived id.
    pub fn ping(&self, address: SocketAddr) -> Arc<RpcCall> {
        let call = RpcCall::new(
            Message::request(Some(self.id), RequestSpecific::Ping),
            address,
        );
        self.do_call(&call);
        call
    }

    /// Send a message that isn't tracked by a call, like a response to a query.
    pub fn send_message(&self, message: Message, to: SocketAddr) {
        self.enqueue(EnqueuedSend::new(message, to, self.id));
    }

    /// Expire a call, releasing its slot.
    ///
    /// The call is claimed from the registry first, so it completes either
    /// by this timeout or by a response, never both. A call still waiting in
    /// the overflow queue is marked timed out and skipped when promoted.
    pub fn timeout(&self, call: &Arc<RpcCall>) {
        if self.registry.remove(call) {
            call.timed_out();
        } else if !call.expire_unassigned() {
            return;
        }

        self.call_timed_out(call);
    }

    /// Update reachability from the received messages counter, resetting the
    /// timeout estimator after a prolonged silence.
    pub fn check_reachability(&self, now: Instant) {
        let stale = self
            .reachability
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check(now, self.num_received());

        if stale {
            debug!(context = "rpc_server", id = %self.id, "Unreachable, resetting timeouts");
            self.timeout_estimator.reset();
        }
    }

    /// Decode, parse and correlate one datagram, then forward it to the table layer.
    pub fn handle_packet(&self, bytes: &[u8], from: SocketAddr) {
        let value = match decode(bytes) {
            Ok(value) => value,
            Err(error) => {
                trace!(
                    context = "socket_error",
                    ?error,
                    ?from,
                    message = ?String::from_utf8_lossy(bytes),
                    "Received invalid Bencode message."
                );
                self.send_message(
                    Message::error(
                        Bytes::copy_from_slice(TransactionId::FILLER.as_bytes()),
                        ErrorCode::Protocol,
                        error.to_string(),
                    ),
                    from,
                );
                return;
            }
        };

        let message = match Message::parse(&value) {
            Ok(message) => message,
            Err(error) => {
                debug!(context = "socket_validation", ?error, ?from, "Invalid Krpc message");
                let transaction_id = error
                    .transaction_id
                    .unwrap_or_else(|| Bytes::copy_from_slice(TransactionId::FILLER.as_bytes()));
                self.send_message(
                    Message::error(transaction_id, error.code, error.description),
                    from,
                );
                return;
            }
        };

        debug!(context = "socket_message_receiving", %message, ?from, "Received message");
        self.stats.add_received(message.kind());

        let mut call = None;

        if let Some(transaction_id) = message.tid().filter(|_| message.is_reply()) {
            match self.registry.complete(&transaction_id, &from) {
                Completion::Completed(completed) => {
                    completed.responded(&message);
                    self.promote();

                    if completed.state() == CallState::Responded {
                        call = Some(completed);
                    } else {
                        debug!(
                            context = "socket_validation",
                            ?from,
                            state = ?completed.state(),
                            "Response arrived for a call that already completed"
                        );
                    }
                }
                Completion::OriginMismatch(pending) => {
                    info!(
                        context = "socket_validation",
                        ?from,
                        expected = ?pending.destination(),
                        "Response source mismatches request destination, ignoring response"
                    );
                    return;
                }
                Completion::Unknown => {}
            }
        }

        self.table.dispatch(ReceivedMessage {
            message,
            from,
            server: self.id,
            call,
        });
    }

    /// Snapshot of this server's state.
    pub fn info(&self) -> super::Info {
        super::Info::from(self)
    }

    // === Private Methods ===

    /// Register an already bound socket with the reactor.
    pub(crate) fn attach(&self, udp: Arc<dyn Udp>) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::NotRunning);
        }

        self.timeout_estimator.reset();

        let handler: Weak<dyn Selectable> = self.this.clone();
        let token = self.reactor.register(udp.as_ref(), handler)?;

        debug!(context = "rpc_server", local_addr = ?udp.local_addr().ok(), "Socket registered");

        *self.socket.write().unwrap_or_else(PoisonError::into_inner) = Some(Bound { udp, token });

        Ok(())
    }

    fn socket(&self) -> Option<Bound> {
        self.socket
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn dispatch_call(&self, call: &Arc<RpcCall>) {
        call.add_listener(Arc::new(CallTracker(self.this.clone())));
        self.timeout_estimator.register_call(call);
        self.enqueue(EnqueuedSend::with_call(call.clone(), self.id));
    }

    fn promote(&self) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        self.registry.promote(|call, _| self.dispatch_call(call));
    }

    fn enqueue(&self, send: EnqueuedSend) {
        self.outbound.push(send.with_version(self.config.version));
        self.outbound.drain(false, self);
    }

    /// Bookkeeping for a call this server has just claimed as timed out.
    fn call_timed_out(&self, call: &Arc<RpcCall>) {
        self.stats.add_timeout(call.request_kind());
        self.table.on_call_timeout(call);
        self.promote();
    }

    /// Backstop for calls nobody timed out.
    fn expire_calls(&self, now: Instant) {
        let timeout = self.timeout_estimator.current_estimate();

        for call in self.registry.calls() {
            let expired = call
                .sent_at()
                .is_some_and(|sent_at| now.saturating_duration_since(sent_at) > timeout);

            if expired {
                trace!(context = "rpc_server", ?call, "Expiring call");
                self.timeout(&call);
            }
        }
    }

    fn update_interest(&self) {
        let Some(bound) = self.socket() else {
            return;
        };

        let interest = if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };

        if let Err(error) = self
            .reactor
            .set_interest(bound.udp.as_ref(), bound.token, interest)
        {
            warn!(context = "socket_error", ?error, "Failed to update interest");
        }
    }

    fn read_event(&self) {
        let Some(bound) = self.socket() else {
            return;
        };

        let mut buf = [0u8; RECEIVE_BUFFER_SIZE];

        loop {
            match bound.udp.recv_from(&mut buf) {
                Ok((amt, from)) => {
                    // Can't reply to port 0, and responses from it are useless.
                    if from.port() == 0 {
                        trace!(context = "socket_validation", ?from, "Datagram from port 0");
                        continue;
                    }

                    self.inbound.push(EnqueuedRead {
                        bytes: Bytes::copy_from_slice(&buf[..amt]),
                        from,
                    });
                    if self.inbound.claim_processor() {
                        self.schedule_processor();
                    }

                    self.num_received.fetch_add(1, Ordering::Relaxed);
                    self.stats.add_received_bytes(amt + header_length(&from));
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    warn!(context = "socket_error", ?error, "IO error receiving datagram");
                    break;
                }
            }
        }

        if self.inbound.claim_processor() {
            self.schedule_processor();
        }
    }

    /// Only called by whoever won [InboundQueue::claim_processor].
    fn schedule_processor(&self) {
        let Some(server) = self.this.upgrade() else {
            return;
        };

        self.executor.execute(Box::new(move || {
            server
                .inbound
                .process(|read| server.handle_packet(&read.bytes, read.from));
        }));
    }
}

impl SendTarget for RpcServer {
    fn send_to(&self, bytes: &[u8], to: SocketAddr) -> io::Result<usize> {
        match self.socket() {
            Some(bound) => bound.udp.send_to(bytes, to),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn await_writable(&self) {
        self.update_interest();
    }

    fn on_sent(&self, send: &EnqueuedSend, bytes: usize) {
        if let Some(call) = send.call() {
            call.sent();
        }

        self.num_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.add_sent(send.message().kind());
        self.stats
            .add_sent_bytes(bytes + header_length(&send.destination()));

        debug!(
            context = "socket_message_sending",
            message = %send.message(),
            to = ?send.destination(),
            "Sent message"
        );
    }

    fn on_send_failed(&self, send: &EnqueuedSend, error: &Error) {
        error!(
            context = "socket_error",
            %error,
            "{:?} -> {}",
            self.local_addr(),
            send.destination()
        );

        if let Some(call) = send.call() {
            call.send_failed();
        }
    }
}

impl Selectable for RpcServer {
    fn on_readable(&self) {
        self.read_event();
    }

    fn on_writable(&self) {
        self.outbound.drain(true, self);
    }

    fn on_health_check(&self, now: Instant) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        let closed = self
            .socket()
            .map_or(true, |bound| bound.udp.local_addr().is_err());

        if closed || !self.table.is_address_still_valid(self.config.bind_address) {
            warn!(
                context = "rpc_server",
                id = %self.id,
                closed,
                "Socket closed or bind address no longer valid, retiring server"
            );
            self.outbound.clear();
            self.stop();
            return;
        }

        self.update_interest();
        self.expire_calls(now);
        self.check_reachability(now);
    }
}

impl Display for RpcServer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let public_address = self
            .public_address()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "None".to_string());

        writeln!(f, "{}\t{}:{}", self.id, public_address, self.port())?;
        writeln!(
            f,
            "rx: {} tx: {} active: {} baseRTT: {:?}",
            self.num_received(),
            self.num_sent(),
            self.num_active_calls(),
            self.timeout_estimator.current_estimate()
        )
    }
}

impl fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServer")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr())
            .field("active_calls", &self.num_active_calls())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            let [a, b, ..] = ip.octets();
            !(ip.is_unspecified()
                || ip.is_private()
                || ip.is_loopback()
                || ip.is_link_local()
                || ip.is_broadcast()
                || ip.is_documentation()
                || ip.is_multicast()
                // Shared address space, 100.64.0.0/10
                || (a == 100 && (b & 0xc0) == 64))
        }
        IpAddr::V6(ip) => (ip.segments()[0] & 0xe000) == 0x2000,
    }
}
