//! Dynamic values carried in message arguments and results.

use std::fmt;
use std::sync::Arc;

pub use rmpv::Integer;

use super::types::SessionId;

/// A msgpack value with the two application extensions lifted out:
/// remote object handles and local callables.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(Integer),
    F32(f32),
    F64(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    /// Object living in the remote host.
    Handle(RemoteHandle),
    /// Local function the remote host may call back by name.
    Function(FunctionRef),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => i.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Integer(i) => i.as_u64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&RemoteHandle> {
        match self {
            Value::Handle(handle) => Some(handle),
            _ => None,
        }
    }

    /// Look up a string key in a map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Handle(handle) => write!(f, "{}", handle),
            Value::Function(func) => write!(f, "<function {}>", func.name()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(Integer::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(Integer::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Integer(Integer::from(i))
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        Value::Integer(Integer::from(i))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Binary(bytes)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<RemoteHandle> for Value {
    fn from(handle: RemoteHandle) -> Self {
        Value::Handle(handle)
    }
}

impl From<FunctionRef> for Value {
    fn from(func: FunctionRef) -> Self {
        Value::Function(func)
    }
}

/// Opaque reference to an object in the remote host.
///
/// Only meaningful on the session that decoded it; encoding it on another
/// session fails.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteHandle {
    session: SessionId,
    type_name: Arc<str>,
    code: i8,
    data: Vec<u8>,
}

impl RemoteHandle {
    pub(crate) fn new(session: SessionId, type_name: Arc<str>, code: i8, data: Vec<u8>) -> Self {
        Self {
            session,
            type_name,
            code,
            data,
        }
    }

    /// Type name from the host metadata, e.g. `Buffer`.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Extension type code on the wire.
    pub fn code(&self) -> i8 {
        self.code
    }

    /// Serialized payload, as received.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Numeric object id, when the payload is a msgpack integer.
    pub fn id(&self) -> Option<i64> {
        let mut payload = self.data.as_slice();
        match rmpv::decode::read_value(&mut payload) {
            Ok(rmpv::Value::Integer(i)) if payload.is_empty() => i.as_i64(),
            _ => None,
        }
    }
}

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "<{} {}>", self.type_name, id),
            None => write!(f, "<{} ext {}>", self.type_name, self.code),
        }
    }
}

/// Name under which a local callable is registered.
///
/// Names are unique for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionRef {
    name: Arc<str>,
}

impl FunctionRef {
    pub(crate) fn new(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed_int(i: i64) -> Vec<u8> {
        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, &rmpv::Value::from(i)).unwrap();
        out
    }

    #[test]
    fn test_handle_id_from_payload() {
        let handle = RemoteHandle::new(SessionId::next(), Arc::from("Buffer"), 0, packed_int(7));
        assert_eq!(handle.id(), Some(7));
        assert_eq!(handle.type_name(), "Buffer");
        assert_eq!(handle.to_string(), "<Buffer 7>");
    }

    #[test]
    fn test_handle_id_non_integer_payload() {
        let handle = RemoteHandle::new(SessionId::next(), Arc::from("Window"), 1, vec![0xc0]);
        assert_eq!(handle.id(), None);
        assert_eq!(handle.to_string(), "<Window ext 1>");
    }

    #[test]
    fn test_value_display() {
        let value = Value::Array(vec![
            Value::from(1),
            Value::from("two"),
            Value::Map(vec![(Value::from("k"), Value::Nil)]),
            Value::Binary(vec![1, 2, 3]),
        ]);
        assert_eq!(value.to_string(), r#"[1, "two", {"k": nil}, <3 bytes>]"#);
    }

    #[test]
    fn test_value_map_get() {
        let value = Value::Map(vec![
            (Value::from("id"), Value::from(3)),
            (Value::from(1), Value::from("ignored")),
        ]);
        assert_eq!(value.get("id").and_then(Value::as_i64), Some(3));
        assert_eq!(value.get("missing"), None);
        assert_eq!(Value::Nil.get("id"), None);
    }
}
