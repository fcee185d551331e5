//! Fluent builder for [`Client`].
//!
//! Every optional field has a sensible default, and `build()` is the
//! one place construction-time validation happens — config errors
//! surface immediately rather than being deferred to first use.

use crate::cache::CacheMode;
use crate::client::{Client, Config};
use crate::error::{CoreError, Result};
use crate::http::transport::{ReqwestTransport, Transport, TransportConfig};
use crate::http::TransformRequestHook;
use crate::subscription::ws_transport::{TungsteniteTransport, WebSocketTransport};
use crate::subscription::{GeneratePayloadHook, SubscribeOptions};
use std::sync::Arc;

/// Builder for [`Client`]. See module docs.
#[derive(Default)]
pub struct ClientBuilder {
    url: Option<String>,
    websocket_url: Option<String>,
    default_fetch_policy: Option<CacheMode>,
    default_cache_ttl_ms: Option<u64>,
    max_cache_bytes: Option<u64>,
    as_form: bool,
    send_document_id_as_query: bool,
    transform_request: Option<TransformRequestHook>,
    generate_payload: Option<GeneratePayloadHook>,
    default_subscription_options: Option<SubscribeOptions>,
    http_transport: Option<Arc<dyn Transport>>,
    ws_transport: Option<Arc<dyn WebSocketTransport>>,
    transport_config: Option<TransportConfig>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        ClientBuilder::default()
    }

    /// The HTTP endpoint for queries and mutations. Required.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// The WebSocket endpoint for subscriptions. Defaults to `url` with
    /// its scheme swapped (`http`→`ws`, `https`→`wss`) if not set.
    pub fn websocket_url(mut self, url: impl Into<String>) -> Self {
        self.websocket_url = Some(url.into());
        self
    }

    pub fn default_fetch_policy(mut self, policy: CacheMode) -> Self {
        self.default_fetch_policy = Some(policy);
        self
    }

    pub fn default_cache_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.default_cache_ttl_ms = Some(ttl_ms);
        self
    }

    pub fn max_cache_bytes(mut self, bytes: u64) -> Self {
        self.max_cache_bytes = Some(bytes);
        self
    }

    /// Send request bodies as `multipart/form-data` instead of JSON.
    pub fn as_form(mut self, as_form: bool) -> Self {
        self.as_form = as_form;
        self
    }

    /// Append `?documentId=<id>` to the URL and omit it from the body.
    pub fn send_document_id_as_query(mut self, enabled: bool) -> Self {
        self.send_document_id_as_query = enabled;
        self
    }

    pub fn transform_request(mut self, hook: TransformRequestHook) -> Self {
        self.transform_request = Some(hook);
        self
    }

    /// Hook invoked once per WebSocket connection attempt to produce
    /// the `connection_init` payload.
    pub fn generate_payload(mut self, hook: GeneratePayloadHook) -> Self {
        self.generate_payload = Some(hook);
        self
    }

    pub fn default_subscription_options(mut self, options: SubscribeOptions) -> Self {
        self.default_subscription_options = Some(options);
        self
    }

    /// Inject a custom HTTP transport (e.g. a test double). Defaults to
    /// a pooled `reqwest::Client` built from `transport_config`.
    pub fn http_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.http_transport = Some(transport);
        self
    }

    /// Inject a custom WebSocket transport (e.g. a test double).
    /// Defaults to `tokio-tungstenite`.
    pub fn ws_transport(mut self, transport: Arc<dyn WebSocketTransport>) -> Self {
        self.ws_transport = Some(transport);
        self
    }

    /// Tuning knobs for the default `reqwest` transport. Ignored if
    /// `http_transport` was injected directly.
    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = Some(config);
        self
    }

    pub fn build(self) -> Result<Client> {
        let url = self
            .url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| CoreError::MissingConfiguration("url".to_string()))?;

        let websocket_url = self
            .websocket_url
            .unwrap_or_else(|| derive_websocket_url(&url));

        let http_transport = match self.http_transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::with_config(
                self.transport_config.unwrap_or_default(),
            )?),
        };
        let ws_transport: Arc<dyn WebSocketTransport> = self
            .ws_transport
            .unwrap_or_else(|| Arc::new(TungsteniteTransport));

        let config = Config {
            url,
            websocket_url,
            default_fetch_policy: self.default_fetch_policy.unwrap_or_default(),
            default_cache_ttl_ms: self
                .default_cache_ttl_ms
                .unwrap_or(crate::cache::DEFAULT_CACHE_TTL_MS),
            max_cache_bytes: self
                .max_cache_bytes
                .unwrap_or(crate::cache::DEFAULT_MAX_CACHE_BYTES),
            as_form: self.as_form,
            send_document_id_as_query: self.send_document_id_as_query,
            transform_request: self.transform_request,
            generate_payload: self.generate_payload,
            default_subscription_options: self.default_subscription_options.unwrap_or_default(),
        };

        Ok(Client::from_parts(config, http_transport, ws_transport))
    }
}

fn derive_websocket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
