//! RPC envelopes.
//!
//! # Wire Format
//!
//! ```text
//! request       [0, msgid, method, params]
//! response      [1, msgid, error, result]
//! notification  [2, method, params]
//! ```

use super::Value;
use crate::error::{Result, RpcError};

const REQUEST: u64 = 0;
const RESPONSE: u64 = 1;
const NOTIFICATION: u64 = 2;

/// One decoded RPC unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Expects exactly one response with the same id.
    Request {
        id: u32,
        method: String,
        args: Vec<Value>,
    },
    /// Reply to the request with the same id. `Err` carries the error payload.
    Response {
        id: u32,
        result: std::result::Result<Value, Value>,
    },
    /// Fire-and-forget call.
    Notification { method: String, args: Vec<Value> },
}

impl Message {
    pub fn request(id: u32, method: impl Into<String>, args: Vec<Value>) -> Self {
        Message::Request {
            id,
            method: method.into(),
            args,
        }
    }

    pub fn notification(method: impl Into<String>, args: Vec<Value>) -> Self {
        Message::Notification {
            method: method.into(),
            args,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request { .. } => "request",
            Message::Response { .. } => "response",
            Message::Notification { .. } => "notification",
        }
    }

    pub fn id(&self) -> Option<u32> {
        match self {
            Message::Request { id, .. } | Message::Response { id, .. } => Some(*id),
            Message::Notification { .. } => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => {
                Some(method)
            }
            Message::Response { .. } => None,
        }
    }

    /// Array form sent on the wire.
    pub(crate) fn to_envelope(&self) -> Value {
        match self {
            Message::Request { id, method, args } => Value::Array(vec![
                Value::from(REQUEST),
                Value::from(*id),
                Value::from(method.as_str()),
                Value::Array(args.clone()),
            ]),
            Message::Response { id, result } => {
                let (error, result) = match result {
                    Ok(value) => (Value::Nil, value.clone()),
                    Err(error) => (error.clone(), Value::Nil),
                };
                Value::Array(vec![Value::from(RESPONSE), Value::from(*id), error, result])
            }
            Message::Notification { method, args } => Value::Array(vec![
                Value::from(NOTIFICATION),
                Value::from(method.as_str()),
                Value::Array(args.clone()),
            ]),
        }
    }

    /// Interpret a decoded value as an envelope.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Decode` for anything that is not one of the three
    /// envelope shapes.
    pub(crate) fn from_envelope(value: Value) -> Result<Self> {
        let items = match value {
            Value::Array(items) => items,
            other => return Err(malformed(format!("expected array, got {}", other))),
        };

        let kind = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| malformed("missing message type"))?;

        match (kind, items.len()) {
            (REQUEST, 4) => {
                let mut items = items.into_iter().skip(1);
                let id = msgid(items.next())?;
                let method = method_name(items.next())?;
                let args = params(items.next())?;
                Ok(Message::Request { id, method, args })
            }
            (RESPONSE, 4) => {
                let mut items = items.into_iter().skip(1);
                let id = msgid(items.next())?;
                let error = items.next().unwrap_or(Value::Nil);
                let result = items.next().unwrap_or(Value::Nil);
                let result = if error.is_nil() { Ok(result) } else { Err(error) };
                Ok(Message::Response { id, result })
            }
            (NOTIFICATION, 3) => {
                let mut items = items.into_iter().skip(1);
                let method = method_name(items.next())?;
                let args = params(items.next())?;
                Ok(Message::Notification { method, args })
            }
            (kind, len) => Err(malformed(format!(
                "message type {} with {} elements",
                kind, len
            ))),
        }
    }
}

fn malformed(detail: impl std::fmt::Display) -> RpcError {
    RpcError::Decode(format!("malformed envelope: {}", detail))
}

fn msgid(value: Option<Value>) -> Result<u32> {
    value
        .as_ref()
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| malformed("invalid message id"))
}

fn method_name(value: Option<Value>) -> Result<String> {
    match value {
        Some(Value::String(name)) => Ok(name),
        // Older hosts send method names as raw bytes.
        Some(Value::Binary(bytes)) => {
            String::from_utf8(bytes).map_err(|_| malformed("method name is not UTF-8"))
        }
        _ => Err(malformed("invalid method name")),
    }
}

fn params(value: Option<Value>) -> Result<Vec<Value>> {
    match value {
        Some(Value::Array(args)) => Ok(args),
        _ => Err(malformed("params is not an array")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_envelope_shape() {
        let msg = Message::request(3, "nvim_eval", vec![Value::from("1+1")]);
        assert_eq!(
            msg.to_envelope(),
            Value::Array(vec![
                Value::from(0u64),
                Value::from(3u32),
                Value::from("nvim_eval"),
                Value::Array(vec![Value::from("1+1")]),
            ])
        );
        assert_eq!(msg.kind(), "request");
        assert_eq!(msg.id(), Some(3));
        assert_eq!(msg.method(), Some("nvim_eval"));
    }

    #[test]
    fn test_response_error_discrimination() {
        let ok = Message::from_envelope(Value::Array(vec![
            Value::from(1),
            Value::from(9),
            Value::Nil,
            Value::from("pong"),
        ]))
        .unwrap();
        assert_eq!(
            ok,
            Message::Response {
                id: 9,
                result: Ok(Value::from("pong"))
            }
        );

        let err = Message::from_envelope(Value::Array(vec![
            Value::from(1),
            Value::from(9),
            Value::from("boom"),
            Value::Nil,
        ]))
        .unwrap();
        assert_eq!(
            err,
            Message::Response {
                id: 9,
                result: Err(Value::from("boom"))
            }
        );
    }

    #[test]
    fn test_binary_method_name_accepted() {
        let msg = Message::from_envelope(Value::Array(vec![
            Value::from(2),
            Value::Binary(b"redraw".to_vec()),
            Value::Array(vec![]),
        ]))
        .unwrap();
        assert_eq!(msg, Message::notification("redraw", vec![]));
    }

    #[test]
    fn test_rejects_malformed_envelopes() {
        let cases = vec![
            Value::from("not an array"),
            Value::Array(vec![]),
            Value::Array(vec![Value::from(7), Value::from(1), Value::Nil]),
            // Request with wrong arity
            Value::Array(vec![Value::from(0), Value::from(1), Value::from("m")]),
            // Negative id
            Value::Array(vec![
                Value::from(0),
                Value::from(-1),
                Value::from("m"),
                Value::Array(vec![]),
            ]),
            // Params not an array
            Value::Array(vec![Value::from(2), Value::from("m"), Value::Nil]),
        ];

        for case in cases {
            let err = Message::from_envelope(case.clone()).unwrap_err();
            assert!(
                matches!(err, RpcError::Decode(_)),
                "Expected decode error for {}, got {:?}",
                case,
                err
            );
        }
    }
}
