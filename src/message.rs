//! JSON-RPC message encoding and inbound classification.
//!
//! Outbound calls are encoded as `{"jsonrpc":"2.0","id":N,"method":..,"params":..}`.
//! Inbound objects are classified by the keys they carry:
//!
//! | keys present                  | classification              |
//! |-------------------------------|-----------------------------|
//! | `id` + (`result` \| `error`)  | response                    |
//! | `id` only                     | request (server → client)   |
//! | neither                       | notification                |
//!
//! Presence is checked on the raw object, so a `"result": null` response is
//! still a response.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ClientError, Result};

/// JSON-RPC protocol version tag sent with every outbound message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Error object attached to a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Unsolicited server message carrying no id.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Answer to a call this client made.
    Response {
        id: u64,
        outcome: std::result::Result<Value, RpcError>,
    },
    /// Answer to a call this client made whose error object could not be
    /// read. The caller still gets a failure.
    MalformedResponse { id: u64, reason: String },
    /// Server calling the client. Not part of this protocol.
    Request {
        id: Value,
        method: Option<String>,
        params: Option<Value>,
    },
    Notification(Notification),
}

#[derive(Serialize)]
struct OutboundRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Serialize)]
struct OutboundNotification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

/// Encode a call into its wire body (without framing).
pub fn encode_request(id: u64, method: &str, params: Option<&Value>) -> Result<String> {
    let request = OutboundRequest {
        jsonrpc: JSONRPC_VERSION,
        id,
        method,
        params,
    };
    Ok(serde_json::to_string(&request)?)
}

/// Encode a client notification (no id, no response expected).
pub fn encode_notification(method: &str, params: Option<&Value>) -> Result<String> {
    let notification = OutboundNotification {
        jsonrpc: JSONRPC_VERSION,
        method,
        params,
    };
    Ok(serde_json::to_string(&notification)?)
}

/// Decode one wire body into an [`Inbound`] message.
///
/// # Errors
///
/// Returns `ClientError::Json` if the body is not JSON and
/// `ClientError::Protocol` if it is JSON of an unrecognised shape.
pub fn decode(body: &str) -> Result<Inbound> {
    let value: Value = serde_json::from_str(body)?;
    let Value::Object(mut obj) = value else {
        return Err(ClientError::Protocol(format!(
            "Expected a JSON object, got: {}",
            truncate(body)
        )));
    };

    let id = obj.remove("id");
    let has_result = obj.contains_key("result");
    let has_error = obj.contains_key("error");

    match id {
        Some(id) if has_result || has_error => decode_response(id, obj, has_error),
        Some(id) => Ok(Inbound::Request {
            id,
            method: take_method(&mut obj),
            params: obj.remove("params"),
        }),
        None => match take_method(&mut obj) {
            Some(method) => Ok(Inbound::Notification(Notification {
                method,
                params: obj.remove("params"),
            })),
            None => Err(ClientError::Protocol(format!(
                "Message has neither id nor method: {}",
                truncate(body)
            ))),
        },
    }
}

fn decode_response(id: Value, mut obj: Map<String, Value>, has_error: bool) -> Result<Inbound> {
    let id = call_id(&id)
        .ok_or_else(|| ClientError::Protocol(format!("Response id is not a call id: {}", id)))?;

    if !has_error {
        return Ok(Inbound::Response {
            id,
            outcome: Ok(obj.remove("result").unwrap_or(Value::Null)),
        });
    }

    let error = obj.remove("error").unwrap_or(Value::Null);
    // Some servers send `"error": null` next to a result
    if error.is_null() && obj.contains_key("result") {
        return Ok(Inbound::Response {
            id,
            outcome: Ok(obj.remove("result").unwrap_or(Value::Null)),
        });
    }

    match serde_json::from_value::<RpcError>(error.clone()) {
        Ok(error) => Ok(Inbound::Response {
            id,
            outcome: Err(error),
        }),
        Err(e) => Ok(Inbound::MalformedResponse {
            id,
            reason: format!("Malformed error object {}: {}", error, e),
        }),
    }
}

/// Ids this client issues are unsigned integers; some servers echo them back
/// as decimal strings.
fn call_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn take_method(obj: &mut Map<String, Value>) -> Option<String> {
    match obj.remove("method") {
        Some(Value::String(method)) => Some(method),
        _ => None,
    }
}

/// Shorten a body for log and error output.
fn truncate(body: &str) -> &str {
    const LIMIT: usize = 200;
    if body.len() <= LIMIT {
        return body;
    }
    let mut end = LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
