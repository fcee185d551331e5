//! `graphql-transport-ws` wire-message codec.
//!
//! Encodes and decodes the tagged JSON-text-frame variants exchanged over
//! a `graphql-transport-ws` WebSocket connection. Unknown `type` values
//! decode into [`Message::Unknown`] rather than being rejected, so a
//! timeout strategy gets a chance to inspect them before the engine's
//! default handling discards them.

use crate::response::{ErrorRecord, GraphQlResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One `graphql-transport-ws` protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ConnectionInit { payload: Option<Value> },
    ConnectionAck { payload: Option<Value> },
    Ping { payload: Option<Value> },
    Pong { payload: Option<Value> },
    Subscribe { id: String, payload: SubscribePayload },
    Next { id: String, payload: GraphQlResult },
    Error { id: String, payload: Vec<ErrorRecord> },
    Complete { id: String },
    /// A frame whose `type` the codec does not recognize. Carried intact
    /// (not discarded) so callers — notably timeout strategies — can
    /// inspect it before the engine's default handling drops it.
    Unknown { raw: Value },
}

/// The `subscribe` frame's payload: everything a [`crate::request::Request`] needs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubscribePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "documentId")]
    pub document_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "operationName")]
    pub operation_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl From<&crate::request::Request> for SubscribePayload {
    fn from(request: &crate::request::Request) -> Self {
        SubscribePayload {
            query: request.query.clone(),
            document_id: request.document_id.clone(),
            variables: request.variables.clone(),
            operation_name: request.operation_name.clone(),
            extensions: request.extensions.clone(),
        }
    }
}

impl Message {
    /// Encode this message as a `graphql-transport-ws` JSON text frame.
    pub fn encode(&self) -> String {
        let value = match self {
            Message::ConnectionInit { payload } => json!({
                "type": "connection_init",
                "payload": payload,
            }),
            Message::ConnectionAck { payload } => json!({
                "type": "connection_ack",
                "payload": payload,
            }),
            Message::Ping { payload } => json!({
                "type": "ping",
                "payload": payload,
            }),
            Message::Pong { payload } => json!({
                "type": "pong",
                "payload": payload,
            }),
            Message::Subscribe { id, payload } => json!({
                "type": "subscribe",
                "id": id,
                "payload": payload,
            }),
            Message::Next { id, payload } => json!({
                "type": "next",
                "id": id,
                "payload": payload,
            }),
            Message::Error { id, payload } => json!({
                "type": "error",
                "id": id,
                "payload": payload,
            }),
            Message::Complete { id } => json!({
                "type": "complete",
                "id": id,
            }),
            Message::Unknown { raw } => raw.clone(),
        };
        value.to_string()
    }

    /// Decode a `graphql-transport-ws` JSON text frame.
    pub fn decode(text: &str) -> Result<Message, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;

        let msg_type = value.get("type").and_then(Value::as_str).unwrap_or("");
        let id = || {
            value
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let payload = value.get("payload").cloned();

        let decoded = match msg_type {
            "connection_init" => Message::ConnectionInit { payload },
            "connection_ack" => Message::ConnectionAck { payload },
            "ping" => Message::Ping { payload },
            "pong" => Message::Pong { payload },
            "subscribe" => Message::Subscribe {
                id: id(),
                payload: payload
                    .map(serde_json::from_value)
                    .transpose()?
                    .unwrap_or_default(),
            },
            "next" => Message::Next {
                id: id(),
                payload: payload
                    .map(serde_json::from_value)
                    .transpose()?
                    .unwrap_or_default(),
            },
            "error" => Message::Error {
                id: id(),
                payload: payload
                    .map(serde_json::from_value)
                    .transpose()?
                    .unwrap_or_default(),
            },
            "complete" => Message::Complete { id: id() },
            _ => Message::Unknown { raw: value },
        };

        Ok(decoded)
    }
}
