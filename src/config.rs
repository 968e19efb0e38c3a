//! Transport selection and session tuning.
//!
//! Exactly one [`TransportTarget`] is chosen per session. Both types
//! deserialize with serde so embedders can keep them in their own config
//! files; every [`SessionConfig`] field has a default.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variables consulted by [`TransportTarget::from_env`], in order.
pub const ADDRESS_ENV_VARS: [&str; 2] = ["NVIM_LISTEN_ADDRESS", "NVIM"];

/// Where the remote host lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportTarget {
    /// TCP connection to `host:port`.
    Tcp { host: String, port: u16 },
    /// Unix domain socket, or a named pipe on Windows.
    Socket { path: PathBuf },
    /// This process's own stdin/stdout.
    Stdio,
    /// Spawn `argv` and talk over its stdin/stdout; stderr is auxiliary.
    Spawn { argv: Vec<String> },
}

/// Kind of transport, without its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Socket,
    Stdio,
    Spawn,
}

impl TransportTarget {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportTarget::Tcp { .. } => TransportKind::Tcp,
            TransportTarget::Socket { .. } => TransportKind::Socket,
            TransportTarget::Stdio => TransportKind::Stdio,
            TransportTarget::Spawn { .. } => TransportKind::Spawn,
        }
    }

    /// Parse a listen address as printed by the host.
    ///
    /// `host:port` becomes TCP, with IPv6 hosts written as `[addr]:port`;
    /// anything containing a path separator or without a numeric port is
    /// treated as a socket path.
    pub fn from_address(address: &str) -> Self {
        let address = address.trim();
        let looks_like_path = address.contains('/') || address.contains('\\');

        if !looks_like_path {
            if let Some((host, port)) = address.rsplit_once(':') {
                let host = host
                    .strip_prefix('[')
                    .and_then(|h| h.strip_suffix(']'))
                    .unwrap_or(host);
                if let Ok(port) = port.parse::<u16>() {
                    if !host.is_empty() {
                        return TransportTarget::Tcp {
                            host: host.to_string(),
                            port,
                        };
                    }
                }
            }
        }

        TransportTarget::Socket {
            path: PathBuf::from(address),
        }
    }

    /// Resolve the target from the environment.
    ///
    /// Resolution order:
    /// 1. `$NVIM_LISTEN_ADDRESS`
    /// 2. `$NVIM`
    ///
    /// Returns `None` when neither is set to a non-empty value.
    pub fn from_env() -> Option<Self> {
        ADDRESS_ENV_VARS.iter().find_map(|var| {
            std::env::var(var)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(|value| Self::from_address(&value))
        })
    }
}

impl fmt::Display for TransportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportTarget::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{}]:{}", host, port)
            }
            TransportTarget::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            TransportTarget::Socket { path } => write!(f, "socket:{}", path.display()),
            TransportTarget::Stdio => write!(f, "stdio"),
            TransportTarget::Spawn { argv } => write!(f, "spawn:{}", argv.join(" ")),
        }
    }
}

/// Tuning knobs for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Threads serving inbound requests while `run` is active.
    pub worker_threads: usize,
    /// Per-request timeout; `None` waits forever.
    pub request_timeout_ms: Option<u64>,
    /// Size of each transport read.
    pub read_buffer_size: usize,
    /// Intercept SIGINT/SIGTERM while `run` is active.
    pub handle_signals: bool,
    /// How long `run` waits for handler threads before detaching them.
    pub shutdown_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            request_timeout_ms: None,
            read_buffer_size: 64 * 1024,
            handle_signals: true,
            shutdown_grace_ms: 2000,
        }
    }
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Worker count, never zero.
    pub fn workers(&self) -> usize {
        self.worker_threads.max(1)
    }
}
