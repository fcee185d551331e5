//! Subscription Protocol Engine: a client-side driver of
//! `graphql-transport-ws`, plus the pluggable liveness monitors and
//! reconnection policy that compose around it.
//!
//! `engine.rs` holds the connection state machine, `timeout.rs` holds
//! the per-connection liveness monitors, `reconnect.rs` holds the
//! backoff policy, and `ws_transport.rs` is the socket capability seam
//! (parallel to `http::Transport`).

mod engine;
mod reconnect;
mod timeout;
pub(crate) mod ws_transport;

pub use engine::{Engine, EngineConfig, GeneratePayloadHook, SubscribeOptions, SubscriptionHandle};
pub use reconnect::{ExponentialBackoff, ReconnectDecision, ReconnectionHandler, ReconnectionStrategy};
pub use timeout::{CorrelatedPingTimeout, IdleTimeout, TimeoutApi, TimeoutHandler, TimeoutStrategy};
pub use ws_transport::{TungsteniteTransport, WebSocketConnection, WebSocketTransport};

/// Close reason taxonomy surfaced to consumers of a subscription or the
/// Auto-Subscription Orchestrator. Exactly one fires per subscription
/// handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Consumer-initiated `abort()`.
    Client,
    /// Clean server-side completion (`complete` frame).
    Server,
    /// Server rejected the subscription before it ever received a `next`.
    ServerError,
    /// A timeout strategy's `abort(Timeout)` fired.
    Timeout,
    /// Transport-level loss: socket closed unexpectedly, a parse
    /// failure, or a server `error` frame after the operation was
    /// already active (had received at least one `next`).
    Error,
}

impl CloseReason {
    /// Whether a reconnection strategy is even allowed to attempt a
    /// reconnect for this reason. `Server` and `ServerError` are terminal
    /// by protocol contract; only `Error`/`Timeout` are recoverable.
    pub fn is_reconnectable(self) -> bool {
        matches!(self, CloseReason::Error | CloseReason::Timeout)
    }
}
