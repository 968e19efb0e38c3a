//! Event loop abstraction.
//!
//! A backend owns exactly one transport endpoint and turns readiness,
//! timers, signals and cross-thread wake-ups into [`LoopCallbacks`] calls.
//! The loop is driven one iteration at a time by [`EventLoop::run`]; the
//! blocking bridge in [`crate::stream`] is its only caller.
//!
//! Other threads talk to a running loop through a [`LoopHandle`].

mod tokio_loop;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use tokio_loop::TokioEventLoop;

use crate::config::{TransportKind, TransportTarget};
use crate::error::{Result, RpcError};

/// Interrupt from the keyboard.
pub const SIGINT: i32 = 2;
/// Termination request.
pub const SIGTERM: i32 = 15;

/// Callback fired by a backend timer, on the thread driving the loop.
pub type TimerCallback = Box<dyn FnMut() + Send>;

/// How long one call to [`EventLoop::run`] may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Handle whatever is ready right now, then report a timeout if nothing
    /// was.
    NoWait,
    /// Block until one event was handled, or until `deadline` passes.
    Once { deadline: Option<Instant> },
}

/// Events a backend reports to its driver.
pub trait LoopCallbacks {
    /// The transport is connected.
    fn on_connect(&mut self);

    /// A chunk arrived on the primary stream.
    fn on_data(&mut self, data: Vec<u8>);

    /// A chunk arrived on the auxiliary stream (child stderr).
    fn on_stderr(&mut self, data: Vec<u8>);

    /// Write `seq` and every write before it were fully flushed.
    fn on_written(&mut self, seq: u64);

    /// Connection failure, EOF or an I/O error. The backend stops driving
    /// the transport after reporting a fatal error.
    fn on_error(&mut self, err: RpcError);

    /// [`LoopHandle::interrupt`] was called.
    fn on_interrupt(&mut self);

    /// [`LoopHandle::wake`] was called.
    fn on_wake(&mut self) {}

    /// An intercepted process signal arrived.
    fn on_signal(&mut self, signal: i32);

    /// The run deadline passed, or nothing was ready in `NoWait` mode.
    fn on_timeout(&mut self);
}

/// Capability interface every backend implements.
pub trait EventLoop: Send {
    /// Start establishing the transport. Completion or failure is reported
    /// through `on_connect`/`on_error` from a later `run`.
    fn connect(&mut self, target: &TransportTarget);

    /// Arm read notification on the primary stream.
    fn start_reading(&mut self);

    /// Queue bytes for writing; returns the sequence number reported by
    /// `on_written` once they are flushed.
    fn send(&mut self, data: Vec<u8>) -> u64;

    /// Drive the loop for one iteration.
    fn run(&mut self, mode: RunMode, callbacks: &mut dyn LoopCallbacks);

    /// Register a timer; `repeat` re-arms it every `delay`.
    fn schedule(&mut self, delay: Duration, repeat: bool, callback: TimerCallback);

    /// Register a periodic timer.
    fn schedule_repeating(&mut self, interval: Duration, callback: TimerCallback) {
        self.schedule(interval, true, callback);
    }

    /// Intercept `signals` while the loop runs; they are reported through
    /// `on_signal` instead of their default action.
    fn setup_signal_handlers(&mut self, signals: &[i32]) -> Result<()>;

    /// Stop reporting intercepted signals.
    fn teardown_signal_handlers(&mut self);

    /// Thread-safe control handle.
    fn handle(&self) -> LoopHandle;

    /// Kind of the transport passed to `connect`.
    fn transport_kind(&self) -> Option<TransportKind>;
}

/// Requests posted to a loop from other threads.
pub enum LoopCommand {
    Interrupt,
    Wake,
    Schedule {
        delay: Duration,
        repeat: bool,
        callback: TimerCallback,
    },
}

impl fmt::Debug for LoopCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopCommand::Interrupt => write!(f, "Interrupt"),
            LoopCommand::Wake => write!(f, "Wake"),
            LoopCommand::Schedule { delay, repeat, .. } => f
                .debug_struct("Schedule")
                .field("delay", delay)
                .field("repeat", repeat)
                .finish_non_exhaustive(),
        }
    }
}

/// Backend side of a [`LoopHandle`].
pub trait CommandSink: Send + Sync {
    /// Deliver a command. Returns `false` if the loop is gone.
    fn post(&self, command: LoopCommand) -> bool;
}

/// Cloneable, thread-safe remote control for an event loop.
#[derive(Clone)]
pub struct LoopHandle {
    sink: Arc<dyn CommandSink>,
}

impl LoopHandle {
    pub fn new(sink: Arc<dyn CommandSink>) -> Self {
        Self { sink }
    }

    /// Make the current or next `run` report `on_interrupt`. This is also
    /// how a driven loop is stopped.
    pub fn interrupt(&self) -> bool {
        self.sink.post(LoopCommand::Interrupt)
    }

    /// Make the current or next `run` return without any other effect.
    pub fn wake(&self) -> bool {
        self.sink.post(LoopCommand::Wake)
    }

    /// Register a timer from any thread.
    pub fn schedule(&self, delay: Duration, repeat: bool, callback: TimerCallback) -> bool {
        self.sink.post(LoopCommand::Schedule {
            delay,
            repeat,
            callback,
        })
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle").finish_non_exhaustive()
    }
}

/// Create the default backend for this platform.
pub fn default_backend(read_buffer_size: usize) -> Result<Box<dyn EventLoop>> {
    Ok(Box::new(TokioEventLoop::new(read_buffer_size)?))
}
