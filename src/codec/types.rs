//! Per-session extension type table.
//!
//! The remote host describes its object types in its API metadata:
//!
//! ```text
//! { "types": { "Buffer": {"id": 0, "prefix": "nvim_buf_"}, "Window": {"id": 1, ...} } }
//! ```
//!
//! The table maps the wire extension code back to a type name so decoded
//! extension values become [`RemoteHandle`](super::RemoteHandle)s.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::Value;
use crate::error::{Result, RpcError};

/// Identity of one session, used to reject handles from other sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Extension code ↔ type name mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeTable {
    by_code: HashMap<i8, Arc<str>>,
    by_name: HashMap<Arc<str>, i8>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table from host metadata.
    ///
    /// Accepts either the full API metadata map (with a `types` key) or the
    /// `types` map itself.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Decode` if the metadata is not a map, a type has no
    /// integer `id`, an id does not fit an extension code, or two types share
    /// an id.
    pub fn from_metadata(metadata: &Value) -> Result<Self> {
        let types = metadata.get("types").unwrap_or(metadata);
        let Value::Map(entries) = types else {
            return Err(invalid("types is not a map"));
        };

        let mut table = TypeTable::new();
        for (name, info) in entries {
            let name = name
                .as_str()
                .ok_or_else(|| invalid(format!("type name {} is not a string", name)))?;
            let id = info
                .get("id")
                .and_then(Value::as_i64)
                .ok_or_else(|| invalid(format!("type {} has no integer id", name)))?;
            let code = i8::try_from(id)
                .map_err(|_| invalid(format!("type {} id {} is out of range", name, id)))?;
            table.insert(name, code)?;
        }

        Ok(table)
    }

    /// Register one type.
    pub fn insert(&mut self, name: &str, code: i8) -> Result<()> {
        if let Some(existing) = self.by_code.get(&code) {
            return Err(invalid(format!(
                "types {} and {} share id {}",
                existing, name, code
            )));
        }
        let name: Arc<str> = Arc::from(name);
        self.by_code.insert(code, Arc::clone(&name));
        self.by_name.insert(name, code);
        Ok(())
    }

    pub fn name_for(&self, code: i8) -> Option<&Arc<str>> {
        self.by_code.get(&code)
    }

    pub fn code_for(&self, name: &str) -> Option<i8> {
        self.by_name.get(name).copied()
    }

    /// Type names sorted by code.
    pub fn names(&self) -> Vec<(i8, &str)> {
        let mut names: Vec<_> = self
            .by_code
            .iter()
            .map(|(code, name)| (*code, name.as_ref()))
            .collect();
        names.sort_unstable_by_key(|(code, _)| *code);
        names
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

fn invalid(message: impl fmt::Display) -> RpcError {
    RpcError::Decode(format!("invalid type metadata: {}", message))
}
