//! Blocking msgpack-RPC client for Neovim-style hosts.
//!
//! The crate is layered bottom-up:
//!
//! - `event_loop` - asynchronous transport backend (TCP, Unix socket / named
//!   pipe, stdio, child process), timers and signal interception
//! - `stream` - blocking byte stream over one event loop, safe to share
//!   between threads
//! - `codec` - message envelopes, msgpack framing and extension types
//! - `rpc_stream` - whole messages over a blocking stream
//! - `session` - request/response correlation, dispatch of host calls,
//!   handshake and callback functions
//!
//! # Example
//!
//! ```ignore
//! use nvim_rpc::{socket_session, Value};
//!
//! let session = socket_session("/tmp/nvim.sock")?;
//! let channel = session.handshake()?;
//! let line = session.request("nvim_get_current_line", vec![])?;
//! session.notify("nvim_command", vec![Value::from("echo 'hi'")])?;
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod logging;
pub mod rpc_stream;
pub mod session;
pub mod stream;

pub use codec::{FunctionRef, Message, RemoteHandle, Value};
pub use config::{SessionConfig, TransportKind, TransportTarget};
pub use error::{Result, RpcError};
pub use session::{
    attach, child_session, socket_session, stdio_session, tcp_session, Dispatcher, Reply,
    Session,
};
