use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::Id;

use super::RpcServer;

/// Information and statistics about an [RpcServer].
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: Option<SocketAddr>,
    public_address: Option<IpAddr>,
    reachable: bool,
    active_calls: usize,
    queued_calls: usize,
    num_sent: u64,
    num_received: u64,
    timeout_estimate: Duration,
}

impl Info {
    /// The server's derived [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Local UDP socket address that this server is listening on, if running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
    /// The bound address, only if it is globally routable.
    pub fn public_address(&self) -> Option<IpAddr> {
        self.public_address
    }
    /// Returns `true` if the server received anything recently.
    pub fn reachable(&self) -> bool {
        self.reachable
    }
    pub fn active_calls(&self) -> usize {
        self.active_calls
    }
    /// Calls waiting for one of the active ones to complete.
    pub fn queued_calls(&self) -> usize {
        self.queued_calls
    }
    pub fn num_sent(&self) -> u64 {
        self.num_sent
    }
    pub fn num_received(&self) -> u64 {
        self.num_received
    }
    pub fn timeout_estimate(&self) -> Duration {
        self.timeout_estimate
    }
}

impl From<&RpcServer> for Info {
    fn from(server: &RpcServer) -> Self {
        Self {
            id: *server.derived_id(),
            local_addr: server.local_addr(),
            public_address: server.public_address(),
            reachable: server.is_reachable(),
            active_calls: server.num_active_calls(),
            queued_calls: server.num_queued_calls(),
            num_sent: server.num_sent(),
            num_received: server.num_received(),
            timeout_estimate: server.timeout_estimator().current_estimate(),
        }
    }
}
