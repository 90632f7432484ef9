//! Request timeout estimation.

use std::sync::Arc;
use std::time::Duration;

use super::call::RpcCall;

/// Default time to wait for a response to a request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Adaptive round trip time estimator, informed of every dispatched call.
pub trait TimeoutEstimator: Send + Sync {
    /// Called once per call, before it is enqueued for sending. Implementations
    /// typically subscribe to the call as an [RpcCallListener](super::RpcCallListener).
    fn register_call(&self, call: &Arc<RpcCall>);
    /// Forget accumulated statistics.
    fn reset(&self);
    fn current_estimate(&self) -> Duration;
}

/// A [TimeoutEstimator] that doesn't adapt.
#[derive(Debug, Clone)]
pub struct StaticTimeout(pub Duration);

impl Default for StaticTimeout {
    fn default() -> Self {
        Self(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl TimeoutEstimator for StaticTimeout {
    fn register_call(&self, _call: &Arc<RpcCall>) {}

    fn reset(&self) {}

    fn current_estimate(&self) -> Duration {
        self.0
    }
}
