//! Response data model.
//!
//! `GraphQlResult` holds a query or subscription outcome — named to
//! avoid colliding with `std::result::Result` and the crate's own
//! `error::Result<T>` alias.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Per-entry byte overhead charged against the cache budget, and the flat
/// charge assessed for a failed request (no body to measure).
pub const SIZE_OVERHEAD_BYTES: usize = 1000;

/// One GraphQL error, as found in a response's `errors` array or an
/// `error` protocol frame's payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<ErrorLocation>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<HashMap<String, Value>>,
}

impl ErrorRecord {
    pub fn message(message: impl Into<String>) -> Self {
        ErrorRecord {
            message: message.into(),
            locations: None,
            path: None,
            extensions: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorLocation {
    pub line: u32,
    pub column: u32,
}

/// The outcome of executing one GraphQL operation.
///
/// `data` is absent whenever `errors` is non-empty. `size` is an upper
/// bound on the byte footprint charged against the cache budget: response
/// body length plus [`SIZE_OVERHEAD_BYTES`], or exactly
/// [`SIZE_OVERHEAD_BYTES`] for a failed request.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct GraphQlResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ErrorRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
    #[serde(skip)]
    pub network_error: bool,
    #[serde(skip)]
    pub size: usize,
}

impl GraphQlResult {
    /// Build a successful result from a decoded response body.
    pub fn success(data: Option<Value>, extensions: Option<Value>, body_len: usize) -> Self {
        GraphQlResult {
            data,
            errors: None,
            extensions,
            network_error: false,
            size: body_len + SIZE_OVERHEAD_BYTES,
        }
    }

    /// Build a result carrying GraphQL-level errors (the request reached
    /// the server and got a structured error response).
    pub fn graphql_errors(errors: Vec<ErrorRecord>, body_len: usize) -> Self {
        GraphQlResult {
            data: None,
            errors: Some(errors),
            extensions: None,
            network_error: false,
            size: body_len + SIZE_OVERHEAD_BYTES,
        }
    }

    /// Build a result for a transport-level failure (connection refused,
    /// timeout, malformed body, cancellation). Never thrown — always
    /// delivered as a value.
    pub fn network_error(message: impl Into<String>) -> Self {
        GraphQlResult {
            data: None,
            errors: Some(vec![ErrorRecord::message(message)]),
            extensions: None,
            network_error: true,
            size: SIZE_OVERHEAD_BYTES,
        }
    }

    /// True when this result should not be reused from the cache, i.e.
    /// it should expire immediately on arrival.
    pub fn is_failure(&self) -> bool {
        self.network_error || self.errors.as_ref().is_some_and(|e| !e.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_size_accounts_for_overhead() {
        let r = GraphQlResult::success(Some(json!({"a": 1})), None, 10);
        assert_eq!(r.size, 10 + SIZE_OVERHEAD_BYTES);
        assert!(!r.is_failure());
    }

    #[test]
    fn test_network_error_is_failure_with_flat_size() {
        let r = GraphQlResult::network_error("boom");
        assert!(r.network_error);
        assert!(r.is_failure());
        assert_eq!(r.size, SIZE_OVERHEAD_BYTES);
        assert!(r.data.is_none());
    }

    #[test]
    fn test_graphql_errors_is_failure_without_network_error() {
        let r = GraphQlResult::graphql_errors(vec![ErrorRecord::message("bad")], 5);
        assert!(!r.network_error);
        assert!(r.is_failure());
    }
}
