//! Blocking read/write over an event loop backend.
//!
//! [`BlockingStream`] is the only place that drives an [`EventLoop`]. A
//! caller that blocks in `read` or `write` drives the loop itself until its
//! condition holds, so no background thread is needed.
//!
//! # Concurrency
//!
//! The backend sits behind a single-driver lock. A thread that wants to
//! write while another thread is driving (typically blocked in `read`)
//! queues the chunk in an outbox, wakes the loop and waits for the driver
//! to confirm the flush. If the lock frees up first, the waiting writer
//! becomes the driver and flushes the outbox itself.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::{SessionConfig, TransportKind, TransportTarget};
use crate::error::{Result, RpcError};
use crate::event_loop::{
    default_backend, EventLoop, LoopCallbacks, LoopHandle, RunMode, TimerCallback, SIGINT,
};

/// How often a writer waiting on another driver re-checks the lock.
const HANDOFF_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Receives chunks from the auxiliary stream of a spawned child.
pub type StderrHandler = Box<dyn FnMut(&[u8]) + Send>;

/// Result of a [`BlockingStream::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One chunk, in arrival order.
    Data(Vec<u8>),
    /// The timeout elapsed before data arrived.
    TimedOut,
    /// [`BlockingStream::interrupt`] was called.
    Interrupted,
}

/// How a `run_until` ended without error.
enum Wait {
    Ready,
    TimedOut,
    Interrupted,
}

struct QueuedWrite {
    data: Vec<u8>,
    done: mpsc::Sender<Result<()>>,
}

/// Callback-side state, filled in by the backend.
struct StreamState {
    kind: TransportKind,
    connected: bool,
    data: VecDeque<Vec<u8>>,
    /// Errors not yet raised to a caller.
    errors: VecDeque<RpcError>,
    /// Fatal error every later call fails with.
    terminal: Option<RpcError>,
    flushed: u64,
    interrupted: bool,
    timed_out: bool,
    signal: Option<i32>,
    /// Writes handed over by other threads, awaiting flush.
    relayed: VecDeque<(u64, mpsc::Sender<Result<()>>)>,
    stderr: StderrHandler,
}

impl StreamState {
    fn take_error(&mut self) -> Result<()> {
        if let Some(err) = self.errors.pop_front() {
            return Err(err);
        }
        match &self.terminal {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl LoopCallbacks for StreamState {
    fn on_connect(&mut self) {
        self.connected = true;
    }

    fn on_data(&mut self, data: Vec<u8>) {
        self.data.push_back(data);
    }

    fn on_stderr(&mut self, data: Vec<u8>) {
        (self.stderr)(&data);
    }

    fn on_written(&mut self, seq: u64) {
        self.flushed = self.flushed.max(seq);
        while self
            .relayed
            .front()
            .is_some_and(|(relayed, _)| *relayed <= seq)
        {
            if let Some((_, done)) = self.relayed.pop_front() {
                let _ = done.send(Ok(()));
            }
        }
    }

    fn on_error(&mut self, err: RpcError) {
        if err.is_fatal() {
            for (_, done) in self.relayed.drain(..) {
                let _ = done.send(Err(err.clone()));
            }
            self.terminal = Some(err.clone());
        }
        self.errors.push_back(err);
    }

    fn on_interrupt(&mut self) {
        self.interrupted = true;
    }

    fn on_signal(&mut self, signal: i32) {
        // A stdio client is a child of the host; Ctrl-C belongs to the host.
        if self.kind == TransportKind::Stdio && signal == SIGINT {
            debug!("Ignoring SIGINT on stdio transport");
            return;
        }
        self.signal = Some(signal);
    }

    fn on_timeout(&mut self) {
        self.timed_out = true;
    }
}

struct Driver {
    backend: Box<dyn EventLoop>,
    state: StreamState,
}

/// Synchronous `read`/`write` pair over one transport.
pub struct BlockingStream {
    driver: Mutex<Driver>,
    outbox: Mutex<VecDeque<QueuedWrite>>,
    handle: LoopHandle,
    target: TransportTarget,
}

impl BlockingStream {
    /// Connect to `target` with the default backend.
    ///
    /// Connection failures are not reported here; they surface from the first
    /// blocking call.
    pub fn connect(target: TransportTarget, config: &SessionConfig) -> Result<Self> {
        let backend = default_backend(config.read_buffer_size)?;
        Ok(Self::with_backend(target, backend))
    }

    /// Wrap an existing backend and start connecting it.
    pub fn with_backend(target: TransportTarget, mut backend: Box<dyn EventLoop>) -> Self {
        backend.connect(&target);
        backend.start_reading();
        let handle = backend.handle();

        Self {
            driver: Mutex::new(Driver {
                backend,
                state: StreamState {
                    kind: target.kind(),
                    connected: false,
                    data: VecDeque::new(),
                    errors: VecDeque::new(),
                    terminal: None,
                    flushed: 0,
                    interrupted: false,
                    timed_out: false,
                    signal: None,
                    relayed: VecDeque::new(),
                    stderr: Box::new(log_stderr),
                },
            }),
            outbox: Mutex::new(VecDeque::new()),
            handle,
            target,
        }
    }

    pub fn target(&self) -> &TransportTarget {
        &self.target
    }

    pub fn kind(&self) -> TransportKind {
        self.target.kind()
    }

    /// Return one chunk of data, driving the loop until some arrives.
    ///
    /// A `Some(Duration::ZERO)` timeout runs a single non-blocking iteration.
    ///
    /// # Errors
    ///
    /// Connection failures, EOF and I/O errors are raised once to the call
    /// that observes them; every later call fails with the same error.
    /// An intercepted signal is raised as `RpcError::Signal`.
    pub fn read(&self, timeout: Option<Duration>) -> Result<ReadOutcome> {
        let mut driver = self.lock_driver();
        self.read_locked(&mut driver, timeout)
    }

    /// Like [`read`](Self::read), but returns `None` instead of waiting when
    /// another thread is driving the loop.
    pub fn try_read(&self, timeout: Option<Duration>) -> Option<Result<ReadOutcome>> {
        let mut driver = match self.driver.try_lock() {
            Ok(driver) => driver,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(self.read_locked(&mut driver, timeout))
    }

    fn read_locked(&self, driver: &mut Driver, timeout: Option<Duration>) -> Result<ReadOutcome> {
        if let Some(data) = driver.state.data.pop_front() {
            return Ok(ReadOutcome::Data(data));
        }

        let outcome = match timeout {
            Some(t) if t.is_zero() => self.run_nowait(driver)?,
            _ => {
                let deadline = timeout.map(|t| Instant::now() + t);
                match self.run_until(driver, deadline, true, |s| s.connected)? {
                    Wait::Ready => self.run_until(driver, deadline, true, |s| !s.data.is_empty())?,
                    other => other,
                }
            }
        };

        Ok(match outcome {
            Wait::Ready => match driver.state.data.pop_front() {
                Some(data) => ReadOutcome::Data(data),
                None => ReadOutcome::TimedOut,
            },
            Wait::TimedOut => ReadOutcome::TimedOut,
            Wait::Interrupted => ReadOutcome::Interrupted,
        })
    }

    /// Write `chunk` and block until the backend confirms the flush.
    ///
    /// Writes made before the transport is connected wait for the
    /// connection. An interrupt does not cancel a write.
    pub fn write(&self, chunk: Vec<u8>) -> Result<()> {
        match self.driver.try_lock() {
            Ok(mut driver) => self.write_locked(&mut driver, chunk),
            Err(TryLockError::Poisoned(poisoned)) => {
                self.write_locked(&mut poisoned.into_inner(), chunk)
            }
            Err(TryLockError::WouldBlock) => self.write_handoff(chunk),
        }
    }

    fn write_locked(&self, driver: &mut Driver, chunk: Vec<u8>) -> Result<()> {
        driver.state.take_error()?;
        self.run_until(driver, None, false, |s| s.connected)?;
        debug!("Writing {} bytes", chunk.len());
        let seq = driver.backend.send(chunk);
        self.run_until(driver, None, false, |s| s.flushed >= seq)?;
        Ok(())
    }

    fn write_handoff(&self, chunk: Vec<u8>) -> Result<()> {
        let (done, result) = mpsc::channel();
        debug!("Handing {} bytes to the driving thread", chunk.len());
        self.lock_outbox().push_back(QueuedWrite { data: chunk, done });
        self.handle.wake();

        loop {
            match result.recv_timeout(HANDOFF_POLL_INTERVAL) {
                Ok(result) => return result,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    // The driver may have returned without flushing our chunk.
                    if let Ok(mut driver) = self.driver.try_lock() {
                        self.forward_outbox(&mut driver);
                        let _ = self.run_until(&mut driver, None, false, |s| {
                            s.relayed.is_empty()
                        });
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(RpcError::Closed("write was dropped".to_string()))
                }
            }
        }
    }

    /// Make the current or next `read` return [`ReadOutcome::Interrupted`].
    /// Safe to call from any thread.
    pub fn interrupt(&self) {
        if !self.handle.interrupt() {
            warn!("Interrupt posted to a closed event loop");
        }
    }

    /// Run `callback` on the driving thread after `delay`, optionally
    /// repeating. Timers only fire while some thread drives the loop.
    pub fn schedule(&self, delay: Duration, repeat: bool, callback: TimerCallback) {
        if !self.handle.schedule(delay, repeat, callback) {
            warn!("Timer posted to a closed event loop");
        }
    }

    /// Replace the handler for child stderr chunks.
    pub fn set_stderr_handler(&self, handler: StderrHandler) {
        self.lock_driver().state.stderr = handler;
    }

    pub fn setup_signal_handlers(&self, signals: &[i32]) -> Result<()> {
        self.lock_driver().backend.setup_signal_handlers(signals)
    }

    pub fn teardown_signal_handlers(&self) {
        let mut driver = self.lock_driver();
        driver.backend.teardown_signal_handlers();
        driver.state.signal = None;
    }

    /// Terminal error, if the transport is dead.
    pub fn terminal_error(&self) -> Option<RpcError> {
        self.lock_driver().state.terminal.clone()
    }

    #[cfg(test)]
    pub(crate) fn deliver_signal(&self, signal: i32) {
        self.lock_driver().state.on_signal(signal);
    }

    /// Single non-blocking iteration; unmet means timed out.
    fn run_nowait(&self, driver: &mut Driver) -> Result<Wait> {
        driver.state.take_error()?;
        self.forward_outbox(driver);
        driver.backend.run(RunMode::NoWait, &mut driver.state);
        driver.state.timed_out = false;
        driver.state.take_error()?;
        if let Some(signal) = driver.state.signal.take() {
            return Err(RpcError::Signal(signal));
        }
        if !driver.state.data.is_empty() {
            Ok(Wait::Ready)
        } else if std::mem::take(&mut driver.state.interrupted) {
            Ok(Wait::Interrupted)
        } else {
            Ok(Wait::TimedOut)
        }
    }

    /// Drive the loop until `done` holds, an error is recorded, the deadline
    /// passes, or (for reads) the stream is interrupted.
    fn run_until(
        &self,
        driver: &mut Driver,
        deadline: Option<Instant>,
        read: bool,
        mut done: impl FnMut(&StreamState) -> bool,
    ) -> Result<Wait> {
        // Errors recorded before this call are raised without driving.
        driver.state.take_error()?;
        driver.state.timed_out = false;

        loop {
            self.forward_outbox(driver);
            let state = &mut driver.state;

            if let Some(err) = state.errors.pop_front() {
                return Err(err);
            }
            if done(state) {
                return Ok(Wait::Ready);
            }
            if read {
                if let Some(signal) = state.signal.take() {
                    return Err(RpcError::Signal(signal));
                }
                if std::mem::take(&mut state.interrupted) {
                    // Queue anything already readable for the next read.
                    driver.backend.run(RunMode::NoWait, &mut driver.state);
                    driver.state.timed_out = false;
                    return Ok(Wait::Interrupted);
                }
            }
            if std::mem::take(&mut state.timed_out) {
                return Ok(Wait::TimedOut);
            }

            driver
                .backend
                .run(RunMode::Once { deadline }, &mut driver.state);
        }
    }

    /// Move writes handed over by other threads into the backend.
    fn forward_outbox(&self, driver: &mut Driver) {
        let queued: Vec<QueuedWrite> = self.lock_outbox().drain(..).collect();
        for QueuedWrite { data, done } in queued {
            if let Some(err) = &driver.state.terminal {
                let _ = done.send(Err(err.clone()));
                continue;
            }
            let seq = driver.backend.send(data);
            driver.state.relayed.push_back((seq, done));
        }
    }

    fn lock_driver(&self) -> MutexGuard<'_, Driver> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outbox(&self) -> MutexGuard<'_, VecDeque<QueuedWrite>> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn log_stderr(data: &[u8]) {
    let text = String::from_utf8_lossy(data);
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        warn!(target: "nvim_rpc::stderr", "{}", line);
    }
}
