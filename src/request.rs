//! Request data model and Fingerprint canonicalization
//!
//! A [`Request`] carries either a `query` document or a content-addressed
//! `document_id`; exactly one carries the operation's identity. A
//! [`Fingerprint`] is the canonical serialization used as the cache key.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One GraphQL operation request: a query, mutation, or subscription.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Request {
    /// Raw GraphQL document text. Mutually exclusive with `document_id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Content-hash identifier for a persisted/trusted document. Mutually
    /// exclusive with `query`.
    #[serde(skip_serializing_if = "Option::is_none", rename = "documentId")]
    pub document_id: Option<String>,
    /// Operation variables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    /// Operation name, for documents containing multiple named operations.
    #[serde(skip_serializing_if = "Option::is_none", rename = "operationName")]
    pub operation_name: Option<String>,
    /// Free-form protocol extensions (e.g. persisted-query hashes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl Request {
    /// Build a request from a query document string.
    pub fn from_query(query: impl Into<String>) -> Self {
        Request {
            query: Some(query.into()),
            ..Default::default()
        }
    }

    /// Build a request from a persisted document id.
    pub fn from_document_id(document_id: impl Into<String>) -> Self {
        Request {
            document_id: Some(document_id.into()),
            ..Default::default()
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    pub fn with_extensions(mut self, extensions: Value) -> Self {
        self.extensions = Some(extensions);
        self
    }

    /// Compute the canonical [`Fingerprint`] used as the cache key.
    ///
    /// Canonicalizes by recursively sorting object keys before
    /// serializing, so two requests differing only in variable-key order
    /// collide to the same cache entry (see DESIGN.md).
    pub fn fingerprint(&self) -> Fingerprint {
        let identity = self
            .document_id
            .as_deref()
            .or(self.query.as_deref())
            .unwrap_or_default();

        let canonical = serde_json::json!({
            "identity": identity,
            "variables": canonicalize(self.variables.as_ref().unwrap_or(&Value::Null)),
            "operationName": self.operation_name,
            "extensions": canonicalize(self.extensions.as_ref().unwrap_or(&Value::Null)),
        });

        Fingerprint(canonical.to_string())
    }
}

/// Recursively sort object keys so structurally-equal values with
/// differently-ordered keys serialize identically.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: std::collections::BTreeMap<String, Value> =
                std::collections::BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k.clone(), canonicalize(v));
            }
            serde_json::to_value(sorted).unwrap_or(Value::Null)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonical, cache-key identity of a [`Request`]. Opaque to callers;
/// wraps the canonical JSON string (not just a hash) so collisions are
/// debuggable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_key_order_is_canonicalized() {
        let a = Request::from_query("{a}").with_variables(json!({"x": 1, "y": 2}));
        let b = Request::from_query("{a}").with_variables(json!({"y": 2, "x": 1}));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_variables() {
        let a = Request::from_query("{a}").with_variables(json!({"x": 1}));
        let b = Request::from_query("{a}").with_variables(json!({"x": 2}));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_query_vs_document_id() {
        let a = Request::from_query("{a}");
        let b = Request::from_document_id("{a}");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_operation_name() {
        let a = Request::from_query("query A{a} query B{a}").with_operation_name("A");
        let b = Request::from_query("query A{a} query B{a}").with_operation_name("B");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_nested_key_order_is_canonicalized() {
        let a = Request::from_query("{a}").with_variables(json!({"outer": {"x": 1, "y": 2}}));
        let b = Request::from_query("{a}").with_variables(json!({"outer": {"y": 2, "x": 1}}));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
