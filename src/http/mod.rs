//! HTTP Query Executor: a single-shot request/response cycle for a
//! [`Request`](crate::request::Request), delegated to an injectable
//! [`Transport`].
//!
//! Header construction, JSON body, and a `reqwest::Client` built with
//! pooling and a user agent, but with the transport itself behind a
//! capability trait so a test double can stand in for `reqwest`.

pub(crate) mod transport;

pub use transport::{HttpRequestSpec, HttpResponseSpec, ReqwestTransport, RequestBody, Transport};

use crate::cancel::CancelToken;
use crate::request::Request;
use crate::response::GraphQlResult;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Request body encoding selected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestEncoding {
    Json,
    Form,
}

/// A synchronous-looking hook that may mutate the outgoing request before
/// it is sent (e.g. to attach an auth header). Returns a future so it can
/// await a token refresh.
pub type TransformRequestHook = Arc<
    dyn Fn(
            HttpRequestSpec,
        )
            -> std::pin::Pin<Box<dyn std::future::Future<Output = HttpRequestSpec> + Send>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct QueryExecutorConfig {
    pub url: String,
    pub encoding: RequestEncoding,
    pub send_document_id_as_query: bool,
    pub transform_request: Option<TransformRequestHook>,
}

impl Default for QueryExecutorConfig {
    fn default() -> Self {
        QueryExecutorConfig {
            url: String::new(),
            encoding: RequestEncoding::Json,
            send_document_id_as_query: false,
            transform_request: None,
        }
    }
}

/// A handle that aborts the in-flight HTTP request it was returned
/// alongside. Safe to call more than once, and safe to call from within
/// the future's own completion callback.
#[derive(Clone)]
pub struct AbortHandle {
    cancel: CancelToken,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

/// Executes one query/mutation/subscription-over-HTTP request against an
/// injected [`Transport`].
pub struct QueryExecutor {
    transport: Arc<dyn Transport>,
    config: QueryExecutorConfig,
}

impl QueryExecutor {
    pub fn new(transport: Arc<dyn Transport>, config: QueryExecutorConfig) -> Self {
        QueryExecutor { transport, config }
    }

    /// Execute `request`, bypassing any cache. Cancellation resolves the
    /// future with a `networkError` result; it never rejects.
    pub fn execute_query_raw(
        &self,
        request: Request,
    ) -> (
        impl std::future::Future<Output = GraphQlResult> + Send + 'static,
        AbortHandle,
    ) {
        let cancel = CancelToken::new();
        let abort_handle = AbortHandle {
            cancel: cancel.clone(),
        };
        let transport = self.transport.clone();
        let config = self.config.clone();

        let fut = async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("query aborted before completion");
                    GraphQlResult::network_error("request aborted")
                }
                result = send_and_parse(transport, config, request) => result,
            }
        };

        (fut, abort_handle)
    }
}

async fn send_and_parse(
    transport: Arc<dyn Transport>,
    config: QueryExecutorConfig,
    request: Request,
) -> GraphQlResult {
    let mut spec = build_request_spec(&config, &request);

    if let Some(hook) = &config.transform_request {
        spec = hook(spec).await;
    }

    debug!(url = %spec.url, "sending GraphQL request");

    let response = match transport.send(spec).await {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "GraphQL transport error");
            return GraphQlResult::network_error(err);
        }
    };

    parse_response(response)
}

fn build_request_spec(config: &QueryExecutorConfig, request: &Request) -> HttpRequestSpec {
    let mut url = config.url.clone();
    let mut document_id_in_body = true;

    if config.send_document_id_as_query {
        if let Some(id) = &request.document_id {
            let separator = if url.contains('?') { '&' } else { '?' };
            url = format!("{url}{separator}documentId={id}");
            document_id_in_body = false;
        }
    }

    let body = match config.encoding {
        RequestEncoding::Json => {
            let mut obj = serde_json::Map::new();
            if let Some(q) = &request.query {
                obj.insert("query".to_string(), json!(q));
            }
            if document_id_in_body {
                if let Some(id) = &request.document_id {
                    obj.insert("documentId".to_string(), json!(id));
                }
            }
            if let Some(v) = &request.variables {
                obj.insert("variables".to_string(), v.clone());
            }
            if let Some(n) = &request.operation_name {
                obj.insert("operationName".to_string(), json!(n));
            }
            if let Some(e) = &request.extensions {
                obj.insert("extensions".to_string(), e.clone());
            }
            RequestBody::Json(serde_json::Value::Object(obj))
        }
        RequestEncoding::Form => {
            let mut fields = Vec::new();
            if let Some(q) = &request.query {
                fields.push(("query".to_string(), q.clone()));
            }
            if document_id_in_body {
                if let Some(id) = &request.document_id {
                    fields.push(("documentId".to_string(), id.clone()));
                }
            }
            if let Some(v) = &request.variables {
                fields.push(("variables".to_string(), v.to_string()));
            }
            if let Some(n) = &request.operation_name {
                fields.push(("operationName".to_string(), n.clone()));
            }
            if let Some(e) = &request.extensions {
                fields.push(("extensions".to_string(), e.to_string()));
            }
            RequestBody::Form(fields)
        }
    };

    HttpRequestSpec {
        url,
        headers: vec![(
            "Accept".to_string(),
            "application/json, application/graphql-response+json".to_string(),
        )],
        body,
    }
}

fn parse_response(response: HttpResponseSpec) -> GraphQlResult {
    if !response.is_success {
        return GraphQlResult::network_error(format!("HTTP error: {}", response.status));
    }

    #[derive(serde::Deserialize)]
    struct Wire {
        data: Option<serde_json::Value>,
        errors: Option<Vec<crate::response::ErrorRecord>>,
        extensions: Option<serde_json::Value>,
    }

    match serde_json::from_str::<Wire>(&response.body) {
        Ok(wire) if wire.errors.as_ref().is_some_and(|e| !e.is_empty()) => {
            GraphQlResult::graphql_errors(wire.errors.unwrap(), response.body.len())
        }
        Ok(wire) => GraphQlResult::success(wire.data, wire.extensions, response.body.len()),
        Err(err) => GraphQlResult::network_error(format!("invalid response body: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::transport::tests::MockTransport;
    use serde_json::json;

    #[tokio::test]
    async fn test_s1_single_query_success() {
        let transport = MockTransport::respond_json(r#"{"data":{"a":1}}"#);
        let executor = QueryExecutor::new(
            Arc::new(transport.clone()),
            QueryExecutorConfig {
                url: "https://x/g".to_string(),
                ..Default::default()
            },
        );

        let (fut, _abort) = executor.execute_query_raw(Request::from_query("{a}"));
        let result = fut.await;

        assert!(!result.network_error);
        assert_eq!(result.data, Some(json!({"a": 1})));
        assert!(result.size >= 15);

        let sent = transport.sent_requests();
        assert_eq!(sent.len(), 1);
        match &sent[0].body {
            RequestBody::Json(v) => assert_eq!(v, &json!({"query": "{a}"})),
            RequestBody::Form(_) => panic!("expected JSON body"),
        }
    }

    #[tokio::test]
    async fn test_graphql_errors_do_not_set_network_error() {
        let transport =
            MockTransport::respond_json(r#"{"errors":[{"message":"nope"}]}"#);
        let executor = QueryExecutor::new(
            Arc::new(transport),
            QueryExecutorConfig {
                url: "https://x/g".to_string(),
                ..Default::default()
            },
        );

        let (fut, _abort) = executor.execute_query_raw(Request::from_query("{a}"));
        let result = fut.await;

        assert!(!result.network_error);
        assert!(result.is_failure());
        assert_eq!(result.errors.unwrap()[0].message, "nope");
    }

    #[tokio::test]
    async fn test_transport_failure_becomes_network_error_not_panic() {
        let transport = MockTransport::fail("connection refused");
        let executor = QueryExecutor::new(
            Arc::new(transport),
            QueryExecutorConfig {
                url: "https://x/g".to_string(),
                ..Default::default()
            },
        );

        let (fut, _abort) = executor.execute_query_raw(Request::from_query("{a}"));
        let result = fut.await;

        assert!(result.network_error);
    }

    #[tokio::test]
    async fn test_cancellation_resolves_with_network_error_never_rejects() {
        let transport = MockTransport::hang();
        let executor = QueryExecutor::new(
            Arc::new(transport),
            QueryExecutorConfig {
                url: "https://x/g".to_string(),
                ..Default::default()
            },
        );

        let (fut, abort) = executor.execute_query_raw(Request::from_query("{a}"));
        abort.abort();
        let result = fut.await;

        assert!(result.network_error);
    }

    #[tokio::test]
    async fn test_document_id_as_query_string_omits_body_field() {
        let transport = MockTransport::respond_json(r#"{"data":{}}"#);
        let executor = QueryExecutor::new(
            Arc::new(transport.clone()),
            QueryExecutorConfig {
                url: "https://x/g".to_string(),
                send_document_id_as_query: true,
                ..Default::default()
            },
        );

        let (fut, _abort) = executor.execute_query_raw(Request::from_document_id("abc123"));
        let _ = fut.await;

        let sent = transport.sent_requests();
        assert!(sent[0].url.contains("documentId=abc123"));
        match &sent[0].body {
            RequestBody::Json(v) => assert!(v.get("documentId").is_none()),
            RequestBody::Form(_) => panic!("expected JSON body"),
        }
    }

    #[tokio::test]
    async fn test_form_encoding_json_encodes_variables() {
        let transport = MockTransport::respond_json(r#"{"data":{}}"#);
        let executor = QueryExecutor::new(
            Arc::new(transport.clone()),
            QueryExecutorConfig {
                url: "https://x/g".to_string(),
                encoding: RequestEncoding::Form,
                ..Default::default()
            },
        );

        let request = Request::from_query("{a}").with_variables(json!({"x": 1}));
        let (fut, _abort) = executor.execute_query_raw(request);
        let _ = fut.await;

        let sent = transport.sent_requests();
        match &sent[0].body {
            RequestBody::Form(fields) => {
                let variables = fields
                    .iter()
                    .find(|(k, _)| k == "variables")
                    .map(|(_, v)| v.clone());
                assert_eq!(variables, Some("{\"x\":1}".to_string()));
            }
            RequestBody::Json(_) => panic!("expected form body"),
        }
    }
}
