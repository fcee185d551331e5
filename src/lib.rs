//! `graphql-core-client`
//!
//! A transport-agnostic GraphQL client runtime: an HTTP Query Executor,
//! a content-addressed Query Cache & De-duplicator, and a
//! `graphql-transport-ws` Subscription Protocol Engine with pluggable
//! liveness timeouts and an Auto-Subscription Orchestrator that keeps a
//! subscription alive across reconnects.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use graphql_core_client::{Client, Request};
//!
//! # async fn run() -> graphql_core_client::Result<()> {
//! let client = Client::new("https://api.example.com/graphql")?;
//!
//! let (result, _abort) = client.execute_query_raw(Request::from_query("{ viewer { id } }"));
//! let response = result.await;
//! println!("{:?}", response.data);
//! # Ok(())
//! # }
//! ```

/// Crate version, exposed for diagnostics and `User-Agent` construction.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cache;
pub mod cancel;
pub mod client;
pub mod codec;
pub mod error;
pub mod http;
pub mod orchestrator;
pub mod request;
pub mod response;
pub mod subscription;

pub use cache::{Cache, CacheConfig, CacheMode, QueryResponse, Unsubscribe};
pub use client::{Client, ClientBuilder, Config};
pub use codec::{Message, SubscribePayload};
pub use error::{CoreError, Result};
pub use http::{AbortHandle, QueryExecutor, QueryExecutorConfig, RequestEncoding, Transport};
pub use orchestrator::{AutoSubscription, OrchestratorState, SubscriptionSpec, Variables};
pub use request::{Fingerprint, Request};
pub use response::{ErrorLocation, ErrorRecord, GraphQlResult};
pub use subscription::{
    CloseReason, CorrelatedPingTimeout, Engine, EngineConfig, ExponentialBackoff, IdleTimeout,
    ReconnectDecision, ReconnectionHandler, ReconnectionStrategy, SubscribeOptions,
    SubscriptionHandle, TimeoutHandler, TimeoutStrategy, WebSocketConnection, WebSocketTransport,
};
