//! Fake msgpack-RPC host shared by the integration tests.
//!
//! The host side speaks raw `rmpv` so it checks the wire format
//! independently of the crate's own codec.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use rmpv::Value as Wire;

/// Upper bound for any single blocking step in a test.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Generate a unique socket path for this test to avoid conflicts.
pub fn test_socket_path(test_name: &str) -> PathBuf {
    let pid = std::process::id();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    PathBuf::from(format!(
        "/tmp/nvim-rpc-test-{}-{}-{}.sock",
        test_name, pid, timestamp
    ))
}

/// Clean up socket file after test.
pub fn cleanup_socket(path: &PathBuf) {
    let _ = std::fs::remove_file(path);
}

/// Session config with a request timeout so a broken test fails instead of
/// hanging.
pub fn bounded_config() -> nvim_rpc::SessionConfig {
    nvim_rpc::SessionConfig {
        request_timeout_ms: Some(STEP_TIMEOUT.as_millis() as u64),
        handle_signals: false,
        ..Default::default()
    }
}

/// Poll `accept` until a client connects or `STEP_TIMEOUT` elapses.
///
/// The client connects lazily, on its first blocking call, so tests accept
/// on the host thread.
pub fn accept_within<S>(mut accept: impl FnMut() -> std::io::Result<S>) -> S {
    let deadline = Instant::now() + STEP_TIMEOUT;
    loop {
        match accept() {
            Ok(stream) => return stream,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "client never connected");
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => panic!("accept failed: {}", e),
        }
    }
}

pub fn read_msg(stream: &mut impl Read) -> Wire {
    rmpv::decode::read_value(stream).expect("host failed to read a message")
}

pub fn write_msg(stream: &mut impl Write, message: Wire) {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &message).unwrap();
    stream.write_all(&buf).unwrap();
    stream.flush().unwrap();
}

/// Split a `[0, id, method, args]` request.
pub fn expect_request(message: &Wire) -> (u64, String, Vec<Wire>) {
    let items = message.as_array().expect("envelope is not an array");
    assert_eq!(items.len(), 4, "not a request: {}", message);
    assert_eq!(items[0].as_u64(), Some(0), "not a request: {}", message);
    (
        items[1].as_u64().unwrap(),
        items[2].as_str().unwrap().to_string(),
        items[3].as_array().unwrap().clone(),
    )
}

/// Split a `[1, id, error, result]` response.
pub fn expect_response(message: &Wire) -> (u64, Wire, Wire) {
    let items = message.as_array().expect("envelope is not an array");
    assert_eq!(items.len(), 4, "not a response: {}", message);
    assert_eq!(items[0].as_u64(), Some(1), "not a response: {}", message);
    (items[1].as_u64().unwrap(), items[2].clone(), items[3].clone())
}

/// Split a `[2, method, args]` notification.
pub fn expect_notification(message: &Wire) -> (String, Vec<Wire>) {
    let items = message.as_array().expect("envelope is not an array");
    assert_eq!(items.len(), 3, "not a notification: {}", message);
    assert_eq!(items[0].as_u64(), Some(2), "not a notification: {}", message);
    (
        items[1].as_str().unwrap().to_string(),
        items[2].as_array().unwrap().clone(),
    )
}

pub fn request(id: u64, method: &str, args: Vec<Wire>) -> Wire {
    Wire::Array(vec![
        Wire::from(0),
        Wire::from(id),
        Wire::from(method),
        Wire::Array(args),
    ])
}

pub fn response(id: u64, error: Wire, result: Wire) -> Wire {
    Wire::Array(vec![Wire::from(1), Wire::from(id), error, result])
}

pub fn notification(method: &str, args: Vec<Wire>) -> Wire {
    Wire::Array(vec![Wire::from(2), Wire::from(method), Wire::Array(args)])
}

/// `[channel, {"types": {...}}]` as returned by `nvim_get_api_info`.
pub fn api_info(channel: i64, types: &[(&str, i8)]) -> Wire {
    let types = types
        .iter()
        .map(|(name, id)| {
            (
                Wire::from(*name),
                Wire::Map(vec![(Wire::from("id"), Wire::from(*id))]),
            )
        })
        .collect();
    Wire::Array(vec![
        Wire::from(channel),
        Wire::Map(vec![(Wire::from("types"), Wire::Map(types))]),
    ])
}

/// msgpack bytes of a single value, as carried inside an ext payload.
pub fn packed(value: Wire) -> Vec<u8> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &value).unwrap();
    buf
}
