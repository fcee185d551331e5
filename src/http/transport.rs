//! The [`Transport`] capability seam and its `reqwest`-backed
//! implementation.
//!
//! `ReqwestTransport` builds its client with the usual tuning knobs
//! (timeout, connect_timeout, pool_idle_timeout, user_agent) but owns a
//! single client rather than a pool keyed by endpoint, since this crate
//! talks to one configured URL per `Client` instance.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// An outgoing HTTP request, already fully assembled by the executor.
#[derive(Debug, Clone)]
pub struct HttpRequestSpec {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

/// The request body, in whichever encoding the caller configured.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

/// A raw HTTP response, reduced to what the executor needs to interpret
/// a GraphQL payload.
#[derive(Debug, Clone)]
pub struct HttpResponseSpec {
    pub status: u16,
    pub is_success: bool,
    pub body: String,
}

/// Sends an assembled request and returns a raw response, or an error
/// description on transport failure (connection refused, DNS failure,
/// TLS error, etc). Never panics; the executor turns both paths into a
/// [`crate::response::GraphQlResult`] value.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequestSpec) -> Result<HttpResponseSpec, String>;
}

/// Production transport backed by a pooled `reqwest::Client`.
pub struct ReqwestTransport {
    client: Client,
}

/// Tuning knobs for the underlying `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            pool_idle_timeout: Duration::from_secs(90),
            user_agent: format!("graphql-core-client/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ReqwestTransport {
    pub fn new() -> crate::error::Result<Self> {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> crate::error::Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| crate::error::CoreError::custom(format!("failed to build HTTP client: {e}")))?;

        Ok(ReqwestTransport { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequestSpec) -> Result<HttpResponseSpec, String> {
        let mut builder = match &request.body {
            RequestBody::Json(value) => self.client.post(&request.url).json(value),
            RequestBody::Form(fields) => {
                let mut form = reqwest::multipart::Form::new();
                for (name, value) in fields {
                    form = form.text(name.clone(), value.clone());
                }
                self.client.post(&request.url).multipart(form)
            }
        };

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        let is_success = status.is_success();
        let body = response.text().await.map_err(|e| e.to_string())?;

        Ok(HttpResponseSpec {
            status: status.as_u16(),
            is_success,
            body,
        })
    }
}
