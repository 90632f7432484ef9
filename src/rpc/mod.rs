//! K-RPC transport: one [RpcServer] per UDP endpoint.

mod call;
mod config;
mod executor;
mod inbound;
mod info;
mod outbound;
mod reachability;
mod reactor;
mod registry;
mod server;
mod socket;
mod stats;
mod table;
mod timeout;

pub use call::{CallState, RpcCall, RpcCallListener};
pub use config::{Config, ServerContext, DEFAULT_PORT};
pub use executor::{Executor, InlineExecutor, Task, WorkerPool};
pub use inbound::{EnqueuedRead, InboundQueue};
pub use info::Info;
pub use outbound::{EnqueuedSend, OutboundPipeline, SendTarget, WriteState};
pub use reachability::{Reachability, REACHABILITY_TIMEOUT};
pub use reactor::{MioReactor, Reactor, Selectable, HEALTH_CHECK_INTERVAL};
pub use registry::{Completion, TransactionRegistry, MAX_ACTIVE_CALLS};
pub use server::RpcServer;
pub use socket::{bind, header_length, Udp, RECEIVE_BUFFER_SIZE};
pub use stats::{RpcStats, StatsSnapshot};
pub use table::{ReceivedMessage, ServerManager, Table};
pub use timeout::{StaticTimeout, TimeoutEstimator, DEFAULT_REQUEST_TIMEOUT};
