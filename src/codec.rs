//! msgpack-RPC codec.
//!
//! Turns raw bytes into [`Message`]s and back. Extension values are lifted
//! into [`RemoteHandle`]s and [`FunctionRef`]s using a per-session
//! [`TypeTable`] configured from host metadata.
//!
//! # Architecture
//!
//! ```text
//!   bytes ──► Framer::feed ──► rmpv::Value ──► Codec::lift ──► Message
//!   Message ──► Codec::lower ──► rmpv::Value ──► bytes
//! ```

mod framer;
mod message;
mod types;
mod value;

use std::sync::{PoisonError, RwLock};

use tracing::warn;

pub use framer::Framer;
pub use message::Message;
pub use types::{SessionId, TypeTable};
pub use value::{FunctionRef, Integer, RemoteHandle, Value};

use crate::error::{Result, RpcError};

/// Type name the host uses for callables passed back to it.
pub const FUNCTION_TYPE: &str = "Function";

/// Session-scoped encoder/decoder.
#[derive(Debug)]
pub struct Codec {
    session: SessionId,
    types: RwLock<Option<TypeTable>>,
}

impl Codec {
    pub fn new() -> Self {
        Self {
            session: SessionId::next(),
            types: RwLock::new(None),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Install the extension type table.
    ///
    /// Replacing an existing table is allowed; handles decoded earlier keep
    /// the type name they were decoded with.
    pub fn configure(&self, table: TypeTable) {
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        if types.is_some() {
            warn!("Replacing extension type table for {}", self.session);
        }
        *types = Some(table);
    }

    pub fn is_configured(&self) -> bool {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Snapshot of the configured type table.
    pub fn types(&self) -> Option<TypeTable> {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Serialize one message.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let value = self.lower(message.to_envelope())?;
        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, &value)
            .map_err(|e| RpcError::Encode(e.to_string()))?;
        Ok(out)
    }

    /// Interpret one decoded msgpack value as a message.
    pub fn decode(&self, raw: rmpv::Value) -> Result<Message> {
        Message::from_envelope(self.lift(raw)?)
    }

    /// Convert a raw msgpack value, materializing extension values.
    pub fn lift(&self, raw: rmpv::Value) -> Result<Value> {
        Ok(match raw {
            rmpv::Value::Nil => Value::Nil,
            rmpv::Value::Boolean(b) => Value::Boolean(b),
            rmpv::Value::Integer(i) => Value::Integer(i),
            rmpv::Value::F32(v) => Value::F32(v),
            rmpv::Value::F64(v) => Value::F64(v),
            rmpv::Value::String(s) => {
                if s.is_str() {
                    Value::String(s.into_str().unwrap_or_default())
                } else {
                    // Invalid UTF-8 is kept as raw bytes.
                    Value::Binary(s.into_bytes())
                }
            }
            rmpv::Value::Binary(bytes) => Value::Binary(bytes),
            rmpv::Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.lift(item))
                    .collect::<Result<_>>()?,
            ),
            rmpv::Value::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((self.lift(k)?, self.lift(v)?)))
                    .collect::<Result<_>>()?,
            ),
            rmpv::Value::Ext(code, data) => self.lift_ext(code, data)?,
        })
    }

    fn lift_ext(&self, code: i8, data: Vec<u8>) -> Result<Value> {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        let table = types.as_ref().ok_or_else(|| {
            RpcError::Decode(format!(
                "extension type {} received before the type table was configured",
                code
            ))
        })?;
        let name = table
            .name_for(code)
            .ok_or_else(|| RpcError::Decode(format!("unknown extension type {}", code)))?;

        if name.as_ref() == FUNCTION_TYPE {
            let mut payload = data.as_slice();
            return match rmpv::decode::read_value(&mut payload) {
                Ok(rmpv::Value::String(s)) if s.is_str() => {
                    Ok(Value::Function(FunctionRef::new(s.into_str().unwrap_or_default())))
                }
                _ => Err(RpcError::Decode(
                    "function reference payload is not a string".to_string(),
                )),
            };
        }

        Ok(Value::Handle(RemoteHandle::new(
            self.session,
            name.clone(),
            code,
            data,
        )))
    }

    /// Convert a value to raw msgpack, encoding handles and callables as
    /// extension values.
    pub fn lower(&self, value: Value) -> Result<rmpv::Value> {
        Ok(match value {
            Value::Nil => rmpv::Value::Nil,
            Value::Boolean(b) => rmpv::Value::Boolean(b),
            Value::Integer(i) => rmpv::Value::Integer(i),
            Value::F32(v) => rmpv::Value::F32(v),
            Value::F64(v) => rmpv::Value::F64(v),
            Value::String(s) => rmpv::Value::String(s.into()),
            Value::Binary(bytes) => rmpv::Value::Binary(bytes),
            Value::Array(items) => rmpv::Value::Array(
                items
                    .into_iter()
                    .map(|item| self.lower(item))
                    .collect::<Result<_>>()?,
            ),
            Value::Map(entries) => rmpv::Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((self.lower(k)?, self.lower(v)?)))
                    .collect::<Result<_>>()?,
            ),
            Value::Handle(handle) => {
                if handle.session() != self.session {
                    return Err(RpcError::Encode(format!(
                        "{} belongs to {}, not {}",
                        handle,
                        handle.session(),
                        self.session
                    )));
                }
                rmpv::Value::Ext(handle.code(), handle.data().to_vec())
            }
            Value::Function(func) => {
                let code = self
                    .types
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_ref()
                    .and_then(|table| table.code_for(FUNCTION_TYPE))
                    .ok_or_else(|| {
                        RpcError::Encode(format!(
                            "cannot send function {}: host declared no {} type",
                            func.name(),
                            FUNCTION_TYPE
                        ))
                    })?;
                let mut payload = Vec::new();
                rmpv::encode::write_value(&mut payload, &rmpv::Value::from(func.name()))
                    .map_err(|e| RpcError::Encode(e.to_string()))?;
                rmpv::Value::Ext(code, payload)
            }
        })
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn configured() -> Codec {
        let codec = Codec::new();
        let mut table = TypeTable::new();
        table.insert("Buffer", 0).unwrap();
        table.insert("Window", 1).unwrap();
        table.insert(FUNCTION_TYPE, 3).unwrap();
        codec.configure(table);
        codec
    }

    fn pack(value: &rmpv::Value) -> Vec<u8> {
        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, value).unwrap();
        out
    }

    fn decode_bytes(codec: &Codec, bytes: &[u8]) -> Result<Message> {
        let mut reader = bytes;
        codec.decode(rmpv::decode::read_value(&mut reader).unwrap())
    }

    #[test]
    fn test_round_trip_with_handle() {
        let codec = configured();
        let raw = rmpv::Value::Array(vec![
            rmpv::Value::from(2),
            rmpv::Value::from("nvim_buf_lines_event"),
            rmpv::Value::Array(vec![
                rmpv::Value::Ext(0, pack(&rmpv::Value::from(4))),
                rmpv::Value::from(12),
            ]),
        ]);
        let msg = decode_bytes(&codec, &pack(&raw)).unwrap();

        let Message::Notification { method, args } = &msg else {
            panic!("Expected notification, got {:?}", msg);
        };
        assert_eq!(method, "nvim_buf_lines_event");
        let handle = args[0].as_handle().unwrap();
        assert_eq!(handle.type_name(), "Buffer");
        assert_eq!(handle.id(), Some(4));

        let encoded = codec.encode(&msg).unwrap();
        assert_eq!(decode_bytes(&codec, &encoded).unwrap(), msg);
    }

    #[test]
    fn test_ext_before_configure_is_error() {
        let codec = Codec::new();
        let raw = rmpv::Value::Array(vec![
            rmpv::Value::from(2),
            rmpv::Value::from("event"),
            rmpv::Value::Array(vec![rmpv::Value::Ext(0, vec![0x01])]),
        ]);
        let err = codec.decode(raw).unwrap_err();
        assert!(err.to_string().contains("before the type table"), "{}", err);
        assert!(!codec.is_configured());
    }

    #[test]
    fn test_unknown_ext_tag_is_error() {
        let codec = configured();
        let raw = rmpv::Value::Array(vec![
            rmpv::Value::from(1),
            rmpv::Value::from(1),
            rmpv::Value::Nil,
            rmpv::Value::Ext(9, vec![0x01]),
        ]);
        let err = codec.decode(raw).unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
        assert!(err.to_string().contains("unknown extension type 9"), "{}", err);
    }

    #[test]
    fn test_handle_from_other_session_rejected() {
        let a = configured();
        let b = configured();
        let handle = a.lift(rmpv::Value::Ext(1, pack(&rmpv::Value::from(1000)))).unwrap();

        let msg = Message::request(1, "nvim_win_get_cursor", vec![handle]);
        assert!(a.encode(&msg).is_ok());
        let err = b.encode(&msg).unwrap_err();
        assert!(matches!(err, RpcError::Encode(_)), "{:?}", err);
    }

    #[test]
    fn test_function_encodes_as_extension() {
        let codec = configured();
        let func = Value::Function(FunctionRef::new("on_lines_1"));

        let lowered = codec.lower(func.clone()).unwrap();
        assert_eq!(
            lowered,
            rmpv::Value::Ext(3, pack(&rmpv::Value::from("on_lines_1")))
        );
        assert_eq!(codec.lift(lowered).unwrap(), func);

        let unconfigured = Codec::new();
        assert!(matches!(
            unconfigured.lower(func),
            Err(RpcError::Encode(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_string_becomes_binary() {
        let codec = Codec::new();
        // fixstr of length 2 with invalid UTF-8
        let bytes = [0xa2, 0xff, 0xfe];
        let mut reader = &bytes[..];
        let raw = rmpv::decode::read_value(&mut reader).unwrap();
        assert_eq!(codec.lift(raw).unwrap(), Value::Binary(vec![0xff, 0xfe]));
    }
}
