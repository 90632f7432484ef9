use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use super::executor::Executor;
use super::reachability::REACHABILITY_TIMEOUT;
use super::reactor::Reactor;
use super::registry::MAX_ACTIVE_CALLS;
use super::stats::RpcStats;
use super::table::{ServerManager, Table};
use super::timeout::TimeoutEstimator;

/// Default UDP port of the Mainline DHT.
pub const DEFAULT_PORT: u16 = 6881;

#[derive(Debug, Clone)]
/// RPC server configurations
pub struct Config {
    /// Local address to bind the UDP socket to.
    ///
    /// Defaults to `0.0.0.0`
    pub bind_address: IpAddr,
    /// Port to listen on, `0` lets the OS pick one.
    ///
    /// Defaults to [DEFAULT_PORT]
    pub port: u16,
    /// Maximum number of calls awaiting a response, calls issued beyond that
    /// are queued until a slot frees up.
    ///
    /// Defaults to [MAX_ACTIVE_CALLS]
    pub max_active_calls: usize,
    /// How long the server may go without receiving anything before it is
    /// considered unreachable.
    ///
    /// Defaults to [REACHABILITY_TIMEOUT]
    pub reachability_timeout: Duration,
    /// Client version stamped on outgoing messages (the `v` key).
    ///
    /// Defaults to None
    pub version: Option<[u8; 4]>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_active_calls: MAX_ACTIVE_CALLS,
            reachability_timeout: REACHABILITY_TIMEOUT,
            version: None,
        }
    }
}

/// The collaborators a server is wired to.
#[derive(Clone)]
pub struct ServerContext {
    pub table: Arc<dyn Table>,
    pub manager: Arc<dyn ServerManager>,
    pub reactor: Arc<dyn Reactor>,
    /// Where inbound packets are decoded and dispatched.
    pub executor: Arc<dyn Executor>,
    pub timeout_estimator: Arc<dyn TimeoutEstimator>,
    /// Shared by every server of a node.
    pub stats: Arc<RpcStats>,
}
