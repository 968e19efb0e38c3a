//! Tokio backend.
//!
//! A current-thread runtime is entered with `block_on` for a single
//! iteration at a time. Whichever thread holds the bridge drives it; no
//! background task runs between iterations.

use std::collections::VecDeque;
use std::future::{pending, Future};
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, Command};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{
    CommandSink, EventLoop, LoopCallbacks, LoopCommand, LoopHandle, RunMode, TimerCallback,
};
use crate::config::{TransportKind, TransportTarget};
use crate::error::{Result, RpcError};

type BoxReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxWriter = Box<dyn AsyncWrite + Unpin + Send>;
type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<Endpoint>> + Send>>;

/// Auxiliary stream read size.
const AUX_BUFFER_SIZE: usize = 4096;

/// Polls of `try_wait` before a child is killed on drop.
const CHILD_EXIT_POLLS: u32 = 10;
const CHILD_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Open transport.
struct Endpoint {
    reader: BoxReader,
    writer: BoxWriter,
    aux: Option<ChildStderr>,
    child: Option<Child>,
}

enum State {
    Idle,
    Connecting {
        target: String,
        future: ConnectFuture,
    },
    Connected(Endpoint),
    Failed,
}

struct PendingWrite {
    seq: u64,
    data: Vec<u8>,
    offset: usize,
}

struct Timer {
    due: Instant,
    interval: Option<Duration>,
    callback: TimerCallback,
}

/// Outcome of one loop iteration, handled outside the runtime.
enum Event {
    Connected(Endpoint),
    ConnectFailed(io::Error),
    Command(LoopCommand),
    Signal(i32),
    Wrote(usize),
    Flushed,
    WriteFailed(io::Error),
    Data(usize),
    ReadFailed(io::Error),
    Stderr(usize),
    StderrClosed,
    TimerDue,
    Deadline,
}

struct Sink(mpsc::UnboundedSender<LoopCommand>);

impl CommandSink for Sink {
    fn post(&self, command: LoopCommand) -> bool {
        self.0.send(command).is_ok()
    }
}

/// Mutable loop state, kept apart from the runtime so both can be borrowed
/// during `block_on`.
struct Inner {
    state: State,
    kind: Option<TransportKind>,
    reading: bool,
    read_buf: Vec<u8>,
    aux_buf: Vec<u8>,
    writes: VecDeque<PendingWrite>,
    next_seq: u64,
    commands: mpsc::UnboundedReceiver<LoopCommand>,
    timers: Vec<Timer>,
    signals: Option<signals::SignalSet>,
}

/// [`EventLoop`] backed by a current-thread tokio runtime.
pub struct TokioEventLoop {
    runtime: Runtime,
    inner: Inner,
    handle: LoopHandle,
}

impl TokioEventLoop {
    /// Create an idle loop; `read_buffer_size` bounds each primary read.
    pub fn new(read_buffer_size: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            runtime,
            inner: Inner {
                state: State::Idle,
                kind: None,
                reading: false,
                read_buf: vec![0u8; read_buffer_size.max(1)],
                aux_buf: vec![0u8; AUX_BUFFER_SIZE],
                writes: VecDeque::new(),
                next_seq: 0,
                commands: rx,
                timers: Vec::new(),
                signals: None,
            },
            handle: LoopHandle::new(Arc::new(Sink(tx))),
        })
    }
}

fn connect_future(target: &TransportTarget) -> ConnectFuture {
    match target.clone() {
        TransportTarget::Tcp { host, port } => Box::pin(async move {
            let stream = tokio::net::TcpStream::connect((host.as_str(), port)).await?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok(Endpoint {
                reader: Box::new(reader),
                writer: Box::new(writer),
                aux: None,
                child: None,
            })
        }),
        TransportTarget::Socket { path } => Box::pin(async move { connect_socket(path).await }),
        TransportTarget::Stdio => Box::pin(async {
            Ok(Endpoint {
                reader: Box::new(tokio::io::stdin()),
                writer: Box::new(tokio::io::stdout()),
                aux: None,
                child: None,
            })
        }),
        TransportTarget::Spawn { argv } => Box::pin(async move {
            let (program, args) = argv.split_first().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "empty spawn argv")
            })?;
            let mut child = Command::new(program)
                .args(args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            info!("Spawned {} (pid {:?})", program, child.id());

            let missing = || io::Error::new(io::ErrorKind::BrokenPipe, "child pipe missing");
            let writer = child.stdin.take().ok_or_else(missing)?;
            let reader = child.stdout.take().ok_or_else(missing)?;
            let aux = child.stderr.take();
            Ok(Endpoint {
                reader: Box::new(reader),
                writer: Box::new(writer),
                aux,
                child: Some(child),
            })
        }),
    }
}

#[cfg(unix)]
async fn connect_socket(path: std::path::PathBuf) -> io::Result<Endpoint> {
    let stream = tokio::net::UnixStream::connect(&path).await?;
    let (reader, writer) = stream.into_split();
    Ok(Endpoint {
        reader: Box::new(reader),
        writer: Box::new(writer),
        aux: None,
        child: None,
    })
}

#[cfg(windows)]
async fn connect_socket(path: std::path::PathBuf) -> io::Result<Endpoint> {
    let pipe = tokio::net::windows::named_pipe::ClientOptions::new().open(&path)?;
    let (reader, writer) = tokio::io::split(pipe);
    Ok(Endpoint {
        reader: Box::new(reader),
        writer: Box::new(writer),
        aux: None,
        child: None,
    })
}

async fn recv_command(rx: &mut mpsc::UnboundedReceiver<LoopCommand>) -> LoopCommand {
    match rx.recv().await {
        Some(command) => command,
        None => pending().await,
    }
}

async fn connecting(future: Option<&mut ConnectFuture>) -> io::Result<Endpoint> {
    match future {
        Some(future) => future.await,
        None => pending().await,
    }
}

enum WriteStep {
    Wrote(usize),
    Flushed,
}

async fn write_front(
    writer: Option<&mut BoxWriter>,
    front: Option<&PendingWrite>,
) -> io::Result<WriteStep> {
    match (writer, front) {
        (Some(writer), Some(front)) if front.offset < front.data.len() => {
            match writer.write(&front.data[front.offset..]).await? {
                0 => Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                n => Ok(WriteStep::Wrote(n)),
            }
        }
        (Some(writer), Some(_)) => {
            writer.flush().await?;
            Ok(WriteStep::Flushed)
        }
        _ => pending().await,
    }
}

async fn read_some<R: AsyncRead + Unpin + ?Sized>(
    reader: Option<&mut R>,
    buf: &mut [u8],
) -> io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => pending().await,
    }
}

impl Inner {
    /// Wait for the next event. Every branch is cancel safe.
    async fn next_event(&mut self, mode: RunMode) -> Event {
        let (nowait, deadline) = match mode {
            RunMode::NoWait => (true, None),
            RunMode::Once { deadline } => (false, deadline),
        };
        let next_timer = self.timers.iter().map(|t| t.due).min();

        let (connect, endpoint) = match &mut self.state {
            State::Connecting { future, .. } => (Some(future), None),
            State::Connected(endpoint) => (None, Some(endpoint)),
            State::Idle | State::Failed => (None, None),
        };
        let (reader, writer, aux) = match endpoint {
            Some(Endpoint {
                reader,
                writer,
                aux,
                ..
            }) => (
                self.reading.then_some(reader),
                Some(writer),
                aux.as_mut(),
            ),
            None => (None, None, None),
        };
        let front = self.writes.front();

        tokio::select! {
            biased;

            command = recv_command(&mut self.commands) => Event::Command(command),
            result = connecting(connect) => match result {
                Ok(endpoint) => Event::Connected(endpoint),
                Err(e) => Event::ConnectFailed(e),
            },
            signal = signals::recv(self.signals.as_mut()) => Event::Signal(signal),
            result = write_front(writer, front) => match result {
                Ok(WriteStep::Wrote(n)) => Event::Wrote(n),
                Ok(WriteStep::Flushed) => Event::Flushed,
                Err(e) => Event::WriteFailed(e),
            },
            result = read_some(reader, &mut self.read_buf) => match result {
                Ok(n) => Event::Data(n),
                Err(e) => Event::ReadFailed(e),
            },
            result = read_some(aux, &mut self.aux_buf) => match result {
                Ok(0) | Err(_) => Event::StderrClosed,
                Ok(n) => Event::Stderr(n),
            },
            _ = sleep_until(next_timer) => Event::TimerDue,
            _ = sleep_until(deadline) => Event::Deadline,
            _ = std::future::ready(()), if nowait => Event::Deadline,
        }
    }

    fn handle_event(&mut self, event: Event, callbacks: &mut dyn LoopCallbacks) {
        match event {
            Event::Connected(endpoint) => {
                debug!("Transport connected");
                self.state = State::Connected(endpoint);
                callbacks.on_connect();
            }
            Event::ConnectFailed(e) => {
                let target = match std::mem::replace(&mut self.state, State::Failed) {
                    State::Connecting { target, .. } => target,
                    _ => String::new(),
                };
                error!("Failed to connect to {}: {}", target, e);
                callbacks.on_error(RpcError::Connection {
                    target,
                    source: Arc::new(e),
                });
            }
            Event::Command(command) => self.handle_command(command, callbacks),
            Event::Signal(signal) => {
                debug!("Received signal {}", signal);
                callbacks.on_signal(signal);
            }
            Event::Wrote(n) => {
                if let Some(front) = self.writes.front_mut() {
                    front.offset += n;
                }
            }
            Event::Flushed => {
                if let Some(done) = self.writes.pop_front() {
                    debug!("Wrote {} bytes (seq {})", done.data.len(), done.seq);
                    callbacks.on_written(done.seq);
                }
            }
            Event::WriteFailed(e) => self.fail("write", e, callbacks),
            Event::Data(0) => {
                warn!("Connection was closed by the remote host");
                self.close();
                callbacks.on_error(RpcError::Eof);
            }
            Event::Data(n) => {
                debug!("Read {} bytes", n);
                callbacks.on_data(self.read_buf[..n].to_vec());
            }
            Event::ReadFailed(e) => self.fail("read", e, callbacks),
            Event::Stderr(n) => callbacks.on_stderr(self.aux_buf[..n].to_vec()),
            Event::StderrClosed => {
                if let State::Connected(endpoint) = &mut self.state {
                    endpoint.aux = None;
                }
            }
            Event::TimerDue => self.fire_timers(),
            Event::Deadline => callbacks.on_timeout(),
        }
    }

    fn handle_command(&mut self, command: LoopCommand, callbacks: &mut dyn LoopCallbacks) {
        match command {
            LoopCommand::Interrupt => {
                debug!("Loop interrupted");
                callbacks.on_interrupt();
            }
            LoopCommand::Wake => callbacks.on_wake(),
            LoopCommand::Schedule {
                delay,
                repeat,
                callback,
            } => self.add_timer(delay, repeat, callback),
        }
    }

    fn add_timer(&mut self, delay: Duration, repeat: bool, callback: TimerCallback) {
        self.timers.push(Timer {
            due: Instant::now() + delay,
            interval: repeat.then_some(delay),
            callback,
        });
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        let (due, rest): (Vec<Timer>, Vec<Timer>) =
            self.timers.drain(..).partition(|t| t.due <= now);
        self.timers = rest;

        for mut timer in due {
            (timer.callback)();
            if let Some(interval) = timer.interval {
                // Skip missed ticks rather than bursting.
                timer.due = (timer.due + interval).max(now);
                self.timers.push(timer);
            }
        }
    }

    fn fail(&mut self, op: &str, e: io::Error, callbacks: &mut dyn LoopCallbacks) {
        error!("Transport {} failed: {}", op, e);
        self.close();
        callbacks.on_error(RpcError::from(e));
    }

    fn close(&mut self) {
        let previous = std::mem::replace(&mut self.state, State::Failed);
        self.writes.clear();
        if let State::Connected(endpoint) = previous {
            reap(endpoint);
        }
    }
}

/// Close the child's stdin, give it a moment to exit, then kill it.
fn reap(endpoint: Endpoint) {
    let Endpoint { writer, child, .. } = endpoint;
    drop(writer);

    let Some(mut child) = child else {
        return;
    };
    for _ in 0..CHILD_EXIT_POLLS {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Child process exited: {}", status);
                return;
            }
            Ok(None) => thread::sleep(CHILD_EXIT_POLL_INTERVAL),
            Err(e) => {
                warn!("Error waiting for child process: {}", e);
                return;
            }
        }
    }

    warn!("Child process didn't exit gracefully, killing");
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill child process: {}", e);
    }
}

impl EventLoop for TokioEventLoop {
    fn connect(&mut self, target: &TransportTarget) {
        if !matches!(self.inner.state, State::Idle) {
            warn!("connect({}) ignored: transport already selected", target);
            return;
        }
        info!("Connecting to {}", target);
        self.inner.kind = Some(target.kind());
        self.inner.state = State::Connecting {
            target: target.to_string(),
            future: connect_future(target),
        };
    }

    fn start_reading(&mut self) {
        self.inner.reading = true;
    }

    fn send(&mut self, data: Vec<u8>) -> u64 {
        self.inner.next_seq += 1;
        let seq = self.inner.next_seq;
        if matches!(self.inner.state, State::Failed) {
            debug!("Dropping {} bytes written after failure", data.len());
        } else {
            self.inner.writes.push_back(PendingWrite {
                seq,
                data,
                offset: 0,
            });
        }
        seq
    }

    fn run(&mut self, mode: RunMode, callbacks: &mut dyn LoopCallbacks) {
        if matches!(self.inner.state, State::Failed) {
            return;
        }
        let inner = &mut self.inner;
        let event = self.runtime.block_on(inner.next_event(mode));
        // Spawned children and signal streams need the runtime context.
        let _guard = self.runtime.enter();
        inner.handle_event(event, callbacks);
    }

    fn schedule(&mut self, delay: Duration, repeat: bool, callback: TimerCallback) {
        self.inner.add_timer(delay, repeat, callback);
    }

    fn setup_signal_handlers(&mut self, signals: &[i32]) -> Result<()> {
        let _guard = self.runtime.enter();
        self.inner.signals = Some(signals::SignalSet::new(signals)?);
        debug!("Intercepting signals {:?}", signals);
        Ok(())
    }

    fn teardown_signal_handlers(&mut self) {
        if self.inner.signals.take().is_some() {
            debug!("Signal handlers removed");
        }
    }

    fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    fn transport_kind(&self) -> Option<TransportKind> {
        self.inner.kind
    }
}

impl Drop for TokioEventLoop {
    fn drop(&mut self) {
        let _guard = self.runtime.enter();
        if let State::Connected(endpoint) = std::mem::replace(&mut self.inner.state, State::Failed)
        {
            reap(endpoint);
        }
    }
}

#[cfg(unix)]
mod signals {
    use std::future::poll_fn;
    use std::task::Poll;

    use tokio::signal::unix::{signal, Signal, SignalKind};

    use crate::error::Result;

    pub(super) struct SignalSet {
        streams: Vec<(i32, Signal)>,
    }

    impl SignalSet {
        pub(super) fn new(signals: &[i32]) -> Result<Self> {
            let streams = signals
                .iter()
                .map(|&num| -> Result<(i32, Signal)> {
                    Ok((num, signal(SignalKind::from_raw(num))?))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Self { streams })
        }
    }

    pub(super) async fn recv(set: Option<&mut SignalSet>) -> i32 {
        let Some(set) = set else {
            return std::future::pending().await;
        };
        poll_fn(|cx| {
            for (num, stream) in set.streams.iter_mut() {
                if let Poll::Ready(Some(())) = stream.poll_recv(cx) {
                    return Poll::Ready(*num);
                }
            }
            Poll::Pending
        })
        .await
    }
}

#[cfg(not(unix))]
mod signals {
    use crate::error::Result;

    pub(super) struct SignalSet;

    impl SignalSet {
        pub(super) fn new(signals: &[i32]) -> Result<Self> {
            tracing::debug!("Signal interception unsupported here, ignoring {:?}", signals);
            Ok(Self)
        }
    }

    pub(super) async fn recv(_set: Option<&mut SignalSet>) -> i32 {
        std::future::pending().await
    }
}
