//! Incremental message framing.
//!
//! msgpack values are self-delimiting, so there is no length prefix: the
//! framer buffers bytes until a complete top-level value can be read.

use std::io::{self, Cursor};

use tracing::debug;

use super::{Codec, Message};
use crate::error::{Result, RpcError};

/// Maximum number of undecoded bytes held before the stream is considered
/// corrupt (100MB).
const MAX_BUFFERED: usize = 100 * 1024 * 1024;

/// Consumed prefix size that triggers compaction of the buffer.
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// Accumulates bytes and yields complete messages in arrival order.
#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
    pos: usize,
    failed: Option<RpcError>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Decode and remove one message from the front of the buffer.
    ///
    /// Returns `Ok(None)` when the buffered bytes do not yet form a complete
    /// value; partial input is left untouched.
    ///
    /// # Errors
    ///
    /// Malformed bytes, non-envelope values and unknown extension tags are
    /// decode errors. Decode errors are terminal: once one is returned, every
    /// later call returns it again.
    pub fn next_message(&mut self, codec: &Codec) -> Result<Option<Message>> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        if self.pos == self.buf.len() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&self.buf[self.pos..]);
        let (raw, consumed) = match rmpv::decode::read_value(&mut cursor) {
            Ok(raw) => (raw, cursor.position() as usize),
            Err(
                rmpv::decode::Error::InvalidMarkerRead(e) | rmpv::decode::Error::InvalidDataRead(e),
            ) if e.kind() == io::ErrorKind::UnexpectedEof => {
                if self.buffered() > MAX_BUFFERED {
                    return Err(self.fail(RpcError::Decode(format!(
                        "incomplete message exceeds {} bytes",
                        MAX_BUFFERED
                    ))));
                }
                debug!("Framer needs more data ({} bytes buffered)", self.buffered());
                return Ok(None);
            }
            Err(e) => return Err(self.fail(RpcError::Decode(e.to_string()))),
        };

        self.pos += consumed;
        self.compact();

        match codec.decode(raw) {
            Ok(message) => Ok(Some(message)),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn fail(&mut self, err: RpcError) -> RpcError {
        self.failed = Some(err.clone());
        err
    }

    fn compact(&mut self) {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos >= COMPACT_THRESHOLD {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{TypeTable, Value};
    use pretty_assertions::assert_eq;

    fn encode_all(codec: &Codec, messages: &[Message]) -> Vec<u8> {
        messages
            .iter()
            .flat_map(|m| codec.encode(m).unwrap())
            .collect()
    }

    fn drain(framer: &mut Framer, codec: &Codec) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(msg) = framer.next_message(codec).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_partial_feed_any_split() {
        let codec = Codec::new();
        let msg = Message::request(
            7,
            "nvim_call_function",
            vec![
                Value::from("bufnr"),
                Value::Array(vec![Value::from("%"), Value::from(true)]),
            ],
        );
        let bytes = codec.encode(&msg).unwrap();

        for split in 0..=bytes.len() {
            let mut framer = Framer::new();
            framer.feed(&bytes[..split]);
            if split < bytes.len() {
                assert_eq!(framer.next_message(&codec).unwrap(), None, "split {}", split);
                assert_eq!(framer.buffered(), split);
            }
            framer.feed(&bytes[split..]);
            assert_eq!(drain(&mut framer, &codec), vec![msg.clone()], "split {}", split);
            assert_eq!(framer.buffered(), 0);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let codec = Codec::new();
        let messages = vec![
            Message::notification("redraw", vec![Value::Array(vec![])]),
            Message::Response {
                id: 1,
                result: Ok(Value::from("pong")),
            },
        ];
        let bytes = encode_all(&codec, &messages);

        let mut framer = Framer::new();
        let mut decoded = Vec::new();
        for byte in bytes {
            framer.feed(&[byte]);
            decoded.extend(drain(&mut framer, &codec));
        }
        assert_eq!(decoded, messages);
    }

    #[test]
    fn test_order_preserved() {
        let codec = Codec::new();
        let messages: Vec<Message> = (0..200)
            .map(|i| Message::notification("tick", vec![Value::from(i)]))
            .collect();
        let bytes = encode_all(&codec, &messages);

        let mut framer = Framer::new();
        for chunk in bytes.chunks(37) {
            framer.feed(chunk);
        }
        assert_eq!(drain(&mut framer, &codec), messages);
    }

    #[test]
    fn test_decode_error_is_sticky() {
        let codec = Codec::new();
        let mut table = TypeTable::new();
        table.insert("Buffer", 0).unwrap();
        codec.configure(table);

        let mut bytes = Vec::new();
        let bad = rmpv::Value::Array(vec![
            rmpv::Value::from(2),
            rmpv::Value::from("event"),
            rmpv::Value::Array(vec![rmpv::Value::Ext(5, vec![0x00])]),
        ]);
        rmpv::encode::write_value(&mut bytes, &bad).unwrap();
        bytes.extend(codec.encode(&Message::notification("after", vec![])).unwrap());

        let mut framer = Framer::new();
        framer.feed(&bytes);
        let first = framer.next_message(&codec).unwrap_err();
        assert!(first.to_string().contains("unknown extension type 5"), "{}", first);
        let second = framer.next_message(&codec).unwrap_err();
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn test_non_envelope_is_error() {
        let codec = Codec::new();
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &rmpv::Value::from(42)).unwrap();

        let mut framer = Framer::new();
        framer.feed(&bytes);
        assert!(matches!(
            framer.next_message(&codec),
            Err(RpcError::Decode(_))
        ));
    }
}
