//! msgpack-rpc message framing
//!
//! Every frame on a worker channel carries exactly one message encoded as a
//! MessagePack array:
//!
//! ```text
//! [0, msgid, method, params]   request
//! [1, msgid, error, result]    response
//! [2, method, params]          notification
//! ```

use serde_json::Value;
use thiserror::Error;

const REQUEST: u64 = 0;
const RESPONSE: u64 = 1;
const NOTIFICATION: u64 = 2;

/// Errors that can occur while encoding or decoding a frame
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Encoding failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decoding failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// A single msgpack-rpc message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        msgid: u32,
        method: String,
        params: Vec<Value>,
    },
    Response {
        msgid: u32,
        error: Value,
        result: Value,
    },
    Notification {
        method: String,
        params: Vec<Value>,
    },
}

impl Message {
    /// Build a successful response
    pub fn ok(msgid: u32, result: Value) -> Self {
        Self::Response {
            msgid,
            error: Value::Null,
            result,
        }
    }

    /// Build an error response
    pub fn err(msgid: u32, error: Value) -> Self {
        Self::Response {
            msgid,
            error,
            result: Value::Null,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let bytes = match self {
            Self::Request {
                msgid,
                method,
                params,
            } => rmp_serde::to_vec(&(REQUEST, msgid, method, params))?,
            Self::Response {
                msgid,
                error,
                result,
            } => rmp_serde::to_vec(&(RESPONSE, msgid, error, result))?,
            Self::Notification { method, params } => {
                rmp_serde::to_vec(&(NOTIFICATION, method, params))?
            }
        };
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let value: Value = rmp_serde::from_slice(bytes)?;
        let Value::Array(mut items) = value else {
            return Err(MessageError::Malformed("message is not an array".into()));
        };

        let kind = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| MessageError::Malformed("missing message type".into()))?;

        match (kind, items.len()) {
            (REQUEST, 4) => {
                let params = params(items.pop())?;
                let method = method(items.pop())?;
                let msgid = msgid(&items[1])?;
                Ok(Self::Request {
                    msgid,
                    method,
                    params,
                })
            }
            (RESPONSE, 4) => {
                let result = items.pop().unwrap_or(Value::Null);
                let error = items.pop().unwrap_or(Value::Null);
                let msgid = msgid(&items[1])?;
                Ok(Self::Response {
                    msgid,
                    error,
                    result,
                })
            }
            (NOTIFICATION, 3) => {
                let params = params(items.pop())?;
                let method = method(items.pop())?;
                Ok(Self::Notification { method, params })
            }
            (kind, len) => Err(MessageError::Malformed(format!(
                "unexpected message type {} with {} elements",
                kind, len
            ))),
        }
    }
}

fn msgid(value: &Value) -> Result<u32, MessageError> {
    value
        .as_u64()
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| MessageError::Malformed(format!("invalid msgid: {}", value)))
}

fn method(value: Option<Value>) -> Result<String, MessageError> {
    match value {
        Some(Value::String(method)) => Ok(method),
        other => Err(MessageError::Malformed(format!(
            "invalid method: {:?}",
            other
        ))),
    }
}

fn params(value: Option<Value>) -> Result<Vec<Value>, MessageError> {
    match value {
        Some(Value::Array(params)) => Ok(params),
        Some(Value::Null) => Ok(Vec::new()),
        other => Err(MessageError::Malformed(format!(
            "invalid params: {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_layout() {
        let msg = Message::Request {
            msgid: 7,
            method: "invoke".into(),
            params: vec![json!("cmd"), json!(["echo 1", {}])],
        };
        let bytes = msg.encode().unwrap();

        // Wire layout is a plain msgpack array
        let raw: Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(raw, json!([0, 7, "invoke", ["cmd", ["echo 1", {}]]]));

        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_notification_without_params() {
        let bytes = Message::Notification {
            method: "reload".into(),
            params: vec![],
        }
        .encode()
        .unwrap();

        match Message::decode(&bytes).unwrap() {
            Message::Notification { method, params } => {
                assert_eq!(method, "reload");
                assert!(params.is_empty());
            }
            other => panic!("Expected notification, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_error_response() {
        let bytes = rmp_serde::to_vec(&json!([1, 3, {"name": "Interrupted"}, null])).unwrap();
        match Message::decode(&bytes).unwrap() {
            Message::Response { msgid, error, .. } => {
                assert_eq!(msgid, 3);
                assert_eq!(error["name"], "Interrupted");
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_reject_malformed() {
        let not_array = rmp_serde::to_vec(&json!({"a": 1})).unwrap();
        assert!(matches!(
            Message::decode(&not_array),
            Err(MessageError::Malformed(_))
        ));

        let bad_kind = rmp_serde::to_vec(&json!([9, "x", []])).unwrap();
        assert!(matches!(
            Message::decode(&bad_kind),
            Err(MessageError::Malformed(_))
        ));
    }
}
