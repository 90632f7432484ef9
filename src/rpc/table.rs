//! Interfaces of the layers above the RPC server.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::common::{Id, Message};

use super::call::RpcCall;

/// A decoded inbound message handed to the table layer.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: Message,
    pub from: SocketAddr,
    /// Derived id of the server that received it.
    pub server: Id,
    /// The call this message completed, if it was a correlated reply.
    pub call: Option<Arc<RpcCall>>,
}

/// Routing table and node bookkeeping, which owns the DHT semantics.
///
/// Methods are called from worker and reactor threads and must not block.
pub trait Table: Send + Sync {
    /// Reserve an id for a new server bound to `local_addr`.
    fn register_server(&self, local_addr: SocketAddr) -> Id;
    fn remove_server(&self, server: &Id);
    fn on_call_timeout(&self, call: &Arc<RpcCall>);
    /// Queries, and replies that were or weren't claimed by a call.
    fn dispatch(&self, message: ReceivedMessage);
    /// Whether a server bound to `address` should keep running.
    fn is_address_still_valid(&self, address: IpAddr) -> bool;
}

/// Owner of the servers of one node.
pub trait ServerManager: Send + Sync {
    /// A server stopped, either explicitly or after failing its health check.
    fn server_removed(&self, server: &Id);
}
