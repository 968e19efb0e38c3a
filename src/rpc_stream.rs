//! Message-level stream: framing and codec on top of [`BlockingStream`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use tracing::debug;

use crate::codec::{Codec, Framer, Message};
use crate::error::{Result, RpcError};
use crate::stream::{BlockingStream, ReadOutcome};

/// Result of one [`MessageStream::pump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    /// A chunk was read; this many complete messages were delivered.
    Delivered(usize),
    TimedOut,
    Interrupted,
}

/// Sends and receives whole [`Message`]s.
///
/// Decoded messages are delivered in the order their bytes arrived.
/// Readers are serialized by the framer lock, which is held while messages
/// are handed to the callback.
pub struct MessageStream {
    stream: BlockingStream,
    framer: Mutex<Framer>,
    codec: Arc<Codec>,
    stopped: AtomicBool,
}

impl MessageStream {
    pub fn new(stream: BlockingStream, codec: Arc<Codec>) -> Self {
        Self {
            stream,
            framer: Mutex::new(Framer::new()),
            codec,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    pub fn stream(&self) -> &BlockingStream {
        &self.stream
    }

    /// Encode and write one message, waiting for the flush.
    pub fn send(&self, message: &Message) -> Result<()> {
        let bytes = self.codec.encode(message)?;
        debug!(
            "Sending {} {:?} {:?} ({} bytes)",
            message.kind(),
            message.id(),
            message.method(),
            bytes.len()
        );
        self.stream.write(bytes)
    }

    /// Read one chunk and deliver every message it completes.
    pub fn pump(
        &self,
        timeout: Option<Duration>,
        on_message: &mut dyn FnMut(Message),
    ) -> Result<Pump> {
        let mut framer = self.lock_framer();
        let outcome = self.stream.read(timeout)?;
        self.deliver(&mut framer, outcome, on_message)
    }

    /// Like [`pump`](Self::pump), but returns `None` instead of waiting when
    /// another thread is already reading.
    pub fn try_pump(
        &self,
        timeout: Option<Duration>,
        on_message: &mut dyn FnMut(Message),
    ) -> Option<Result<Pump>> {
        let mut framer = match self.framer.try_lock() {
            Ok(framer) => framer,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        let outcome = match self.stream.try_read(timeout)? {
            Ok(outcome) => outcome,
            Err(err) => return Some(Err(err)),
        };
        Some(self.deliver(&mut framer, outcome, on_message))
    }

    fn deliver(
        &self,
        framer: &mut Framer,
        outcome: ReadOutcome,
        on_message: &mut dyn FnMut(Message),
    ) -> Result<Pump> {
        let chunk = match outcome {
            ReadOutcome::Data(chunk) => chunk,
            ReadOutcome::TimedOut => return Ok(Pump::TimedOut),
            ReadOutcome::Interrupted => return Ok(Pump::Interrupted),
        };

        framer.feed(&chunk);
        let mut delivered = 0;
        while let Some(message) = framer.next_message(&self.codec)? {
            debug!(
                "Received {} {:?} {:?}",
                message.kind(),
                message.id(),
                message.method()
            );
            on_message(message);
            delivered += 1;
        }
        Ok(Pump::Delivered(delivered))
    }

    /// Deliver messages until [`loop_stop`](Self::loop_stop) or an error.
    ///
    /// The error that ended the loop is passed to `on_error`; this includes
    /// an intercepted signal, which is not fatal to the transport. A stop
    /// requested since the last [`loop_reset`](Self::loop_reset) returns
    /// before anything is read.
    pub fn loop_start(
        &self,
        on_message: &mut dyn FnMut(Message),
        on_error: &mut dyn FnMut(RpcError),
    ) {
        debug!("Message loop started");

        while !self.stopped.load(Ordering::SeqCst) {
            if let Err(err) = self.pump(None, on_message) {
                on_error(err);
                break;
            }
        }

        debug!("Exiting message loop");
    }

    /// Clear a previous stop. Call before anything that may stop the next
    /// loop can run.
    pub fn loop_reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Make `loop_start` return. Safe to call from any thread.
    pub fn loop_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stream.interrupt();
    }

    pub fn interrupt(&self) {
        self.stream.interrupt();
    }

    fn lock_framer(&self) -> MutexGuard<'_, Framer> {
        self.framer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
