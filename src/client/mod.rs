//! Consumer-facing facade over the Query Cache, HTTP Query Executor, and
//! Subscription Protocol Engine.
//!
//! One struct owns the transport-level machinery and exposes a small,
//! stable surface to application code, constructed either directly
//! ([`Client::new`]) or through [`ClientBuilder`] (`client::builder`)
//! for advanced configuration (injected transports, custom timeouts,
//! persisted query / form-body settings).

pub mod builder;

pub use builder::ClientBuilder;

use crate::cache::{Cache, CacheConfig, CacheMode, QueryResponse};
use crate::error::Result;
use crate::http::transport::Transport;
use crate::http::{AbortHandle, QueryExecutor, QueryExecutorConfig, RequestEncoding, TransformRequestHook};
use crate::request::Request;
use crate::response::GraphQlResult;
use crate::subscription::ws_transport::WebSocketTransport;
use crate::subscription::{
    CloseReason, Engine, EngineConfig, GeneratePayloadHook, SubscribeOptions, SubscriptionHandle,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

/// The enumerated configuration surface, constructed via
/// [`ClientBuilder`].
#[derive(Clone)]
pub struct Config {
    pub url: String,
    pub websocket_url: String,
    pub default_fetch_policy: CacheMode,
    pub default_cache_ttl_ms: u64,
    pub max_cache_bytes: u64,
    pub as_form: bool,
    pub send_document_id_as_query: bool,
    pub transform_request: Option<TransformRequestHook>,
    pub generate_payload: Option<GeneratePayloadHook>,
    pub default_subscription_options: SubscribeOptions,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            url: String::new(),
            websocket_url: String::new(),
            default_fetch_policy: CacheMode::default(),
            default_cache_ttl_ms: crate::cache::DEFAULT_CACHE_TTL_MS,
            max_cache_bytes: crate::cache::DEFAULT_MAX_CACHE_BYTES,
            as_form: false,
            send_document_id_as_query: false,
            transform_request: None,
            generate_payload: None,
            default_subscription_options: SubscribeOptions::default(),
        }
    }
}

/// The consumer-facing facade: one configured `url`/`websocket_url`
/// pair, one shared [`Cache`], and one lazily-connected [`Engine`].
pub struct Client {
    cache: Cache,
    executor: Arc<QueryExecutor>,
    engine: Arc<Engine>,
    config: Config,
    pending_requests: Arc<AtomicUsize>,
    subscriptions: Arc<StdMutex<HashMap<u64, SubscriptionHandle>>>,
    next_subscription_id: AtomicU64,
}

impl Client {
    /// Convenience constructor using the default `reqwest`/
    /// `tokio-tungstenite` transports. Use [`ClientBuilder`] for
    /// injected transports or any other non-default configuration.
    pub fn new(url: impl Into<String>) -> Result<Client> {
        ClientBuilder::new().url(url).build()
    }

    pub(crate) fn from_parts(
        config: Config,
        http_transport: Arc<dyn Transport>,
        ws_transport: Arc<dyn WebSocketTransport>,
    ) -> Client {
        let executor = Arc::new(QueryExecutor::new(
            http_transport,
            QueryExecutorConfig {
                url: config.url.clone(),
                encoding: if config.as_form {
                    RequestEncoding::Form
                } else {
                    RequestEncoding::Json
                },
                send_document_id_as_query: config.send_document_id_as_query,
                transform_request: config.transform_request.clone(),
            },
        ));

        let cache = Cache::new(
            executor.clone(),
            CacheConfig {
                default_cache_ttl_ms: config.default_cache_ttl_ms,
                max_cache_bytes: config.max_cache_bytes,
            },
        );

        let engine = Arc::new(Engine::new(
            ws_transport,
            EngineConfig {
                url: config.websocket_url.clone(),
                subprotocol: "graphql-transport-ws".to_string(),
                generate_payload: config.generate_payload.clone(),
                default_timeout_strategy: config
                    .default_subscription_options
                    .timeout_strategy
                    .clone(),
            },
        ));

        Client {
            cache,
            executor,
            engine,
            config,
            pending_requests: Arc::new(AtomicUsize::new(0)),
            subscriptions: Arc::new(StdMutex::new(HashMap::new())),
            next_subscription_id: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bypass the cache entirely. The returned future never rejects:
    /// transport failures resolve to a `networkError: true` result.
    pub fn execute_query_raw(
        &self,
        request: Request,
    ) -> (impl Future<Output = GraphQlResult> + Send + 'static, AbortHandle) {
        let (fut, abort) = self.executor.execute_query_raw(request);
        let pending = self.pending_requests.clone();
        pending.fetch_add(1, Ordering::SeqCst);
        let tracked = async move {
            let result = fut.await;
            pending.fetch_sub(1, Ordering::SeqCst);
            result
        };
        (tracked, abort)
    }

    /// Cache-aware query/mutation execution. `mode` defaults to
    /// [`Config::default_fetch_policy`]; `ttl_override` defaults to
    /// [`Config::default_cache_ttl_ms`].
    pub fn execute_query(
        &self,
        request: Request,
        mode: Option<CacheMode>,
        ttl_override: Option<Duration>,
    ) -> QueryResponse {
        self.cache.execute_query(
            request,
            mode.unwrap_or(self.config.default_fetch_policy),
            ttl_override,
        )
    }

    /// Keep one subscription alive for as long as the returned handle
    /// is not aborted. `options` defaults to
    /// [`Config::default_subscription_options`].
    pub async fn execute_subscription(
        &self,
        request: Request,
        on_data: impl Fn(GraphQlResult) + Send + Sync + 'static,
        on_close: impl Fn(CloseReason) + Send + Sync + 'static,
        options: Option<SubscribeOptions>,
    ) -> (impl Future<Output = ()> + Send + 'static, SubscriptionHandle) {
        let options = options.unwrap_or_else(|| self.config.default_subscription_options.clone());
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        let subscriptions_for_close = self.subscriptions.clone();

        let wrapped_close = move |reason: CloseReason| {
            subscriptions_for_close.lock().unwrap().remove(&id);
            on_close(reason);
        };

        let (connected, handle) = self
            .engine
            .subscribe(request, on_data, wrapped_close, options)
            .await;

        self.subscriptions.lock().unwrap().insert(id, handle.clone());

        (connected, handle)
    }

    /// Refresh every cache entry that currently has at least one
    /// subscriber. `force` cancels any in-flight fetch first.
    pub fn refresh_all(&self, force: bool) {
        self.cache.refresh_all(force);
    }

    /// Expire and evict every unsubscribed cache entry; subscribed
    /// entries are expired but kept.
    pub fn clear_cache(&self) {
        self.cache.clear_cache();
    }

    /// Like `refresh_all(true)`, but subscribers observe `None` before
    /// the refreshed value arrives.
    pub fn reset_store(&self) {
        self.cache.reset_store();
    }

    /// Number of `execute_query_raw` calls currently in flight.
    pub fn pending_requests(&self) -> usize {
        self.pending_requests.load(Ordering::SeqCst)
    }

    /// Number of `execute_subscription` calls currently tracked as
    /// open (not yet closed or aborted).
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }
}
