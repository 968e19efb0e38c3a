//! Request/response correlation and message dispatch.
//!
//! A [`Session`] pairs each outgoing request with an id, blocks the caller
//! until the matching response arrives, and routes unsolicited requests and
//! notifications to a [`Dispatcher`].
//!
//! # Driving
//!
//! While [`Session::run`] is active, the thread that called it is the only
//! reader. Callers on other threads (including handler threads) write
//! through the bridge handoff and wait on their pending slot.
//!
//! Without an active `run`, [`Session::request`] reads the transport itself.
//! Requests and notifications that arrive meanwhile are queued and
//! dispatched, in arrival order, once `run` starts.
//!
//! # Usage
//!
//! ```ignore
//! use nvim_rpc::{socket_session, Value};
//!
//! let session = socket_session("/tmp/nvim.sock")?;
//! let channel = session.handshake()?;
//! let line = session.request("nvim_get_current_line", vec![])?;
//! ```

mod workers;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::codec::{Codec, FunctionRef, Message, TypeTable, Value};
use crate::config::{SessionConfig, TransportTarget};
use crate::error::{Result, RpcError};
use crate::event_loop::{SIGINT, SIGTERM};
use crate::rpc_stream::{MessageStream, Pump};
use crate::stream::{BlockingStream, StderrHandler};

use workers::{panic_message, Job, WorkerPool};

/// Method returning `[channel_id, api_metadata]`.
pub const API_INFO_METHOD: &str = "nvim_get_api_info";

/// Longest single wait while polling for a response.
const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Reply a request handler sends back: `Err` carries the error payload.
pub type Reply = std::result::Result<Value, Value>;

/// Handler for a callable registered with [`Session::register_function`].
pub type FunctionHandler = dyn Fn(&Session, Vec<Value>) -> Reply + Send + Sync;

/// Receives requests and notifications from the remote host.
///
/// Implementations are shared across worker threads and may call back into
/// the session, including blocking requests.
pub trait Dispatcher: Send + Sync {
    /// Handle a request; the return value is sent back as the response.
    fn on_request(&self, session: &Session, method: &str, args: Vec<Value>) -> Reply;

    /// Handle a notification. Called in arrival order.
    fn on_notification(&self, session: &Session, method: &str, args: Vec<Value>);

    /// Called once on a worker thread when `run` starts.
    fn on_setup(&self, _session: &Session) {}
}

type RequestFn = dyn Fn(&Session, &str, Vec<Value>) -> Reply + Send + Sync;
type NotificationFn = dyn Fn(&Session, &str, Vec<Value>) + Send + Sync;
/// One-shot callback run when [`Session::run_with`] starts.
pub type SetupFn = Box<dyn FnOnce(&Session) + Send>;

/// [`Dispatcher`] built from closures, used by [`Session::run_with`].
struct FnDispatcher {
    on_request: Box<RequestFn>,
    on_notification: Box<NotificationFn>,
    on_setup: Mutex<Option<SetupFn>>,
}

impl Dispatcher for FnDispatcher {
    fn on_request(&self, session: &Session, method: &str, args: Vec<Value>) -> Reply {
        (self.on_request)(session, method, args)
    }

    fn on_notification(&self, session: &Session, method: &str, args: Vec<Value>) {
        (self.on_notification)(session, method, args)
    }

    fn on_setup(&self, session: &Session) {
        let setup = self
            .on_setup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(setup) = setup {
            setup(session);
        }
    }
}

/// Worker lanes and the dispatcher of an active `run`.
struct Runner {
    dispatcher: Arc<dyn Dispatcher>,
    pool: WorkerPool,
    ordered: WorkerPool,
}

impl Runner {
    fn shutdown(self, grace: Duration) {
        self.ordered.shutdown(grace);
        self.pool.shutdown(grace);
    }
}

type Scheduled = Arc<Mutex<Box<dyn FnMut(&Session) + Send>>>;

struct SessionInner {
    stream: MessageStream,
    config: SessionConfig,
    pending: Mutex<HashMap<u32, SyncSender<Result<Value>>>>,
    next_id: AtomicU32,
    queued: Mutex<VecDeque<Message>>,
    running: AtomicBool,
    runner: Mutex<Option<Runner>>,
    functions: Mutex<HashMap<String, Arc<FunctionHandler>>>,
}

/// Handle to one RPC session. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Wrap a connected (or connecting) stream.
    pub fn new(stream: BlockingStream, config: SessionConfig) -> Self {
        let codec = Arc::new(Codec::new());
        Self {
            inner: Arc::new(SessionInner {
                stream: MessageStream::new(stream, codec),
                config,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU32::new(1),
                queued: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
                runner: Mutex::new(None),
                functions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Open a session to `target`.
    pub fn connect(target: TransportTarget, config: SessionConfig) -> Result<Self> {
        let stream = BlockingStream::connect(target, &config)?;
        Ok(Self::new(stream, config))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn target(&self) -> &TransportTarget {
        self.inner.stream.stream().target()
    }

    pub fn codec(&self) -> &Arc<Codec> {
        self.inner.stream.codec()
    }

    /// Whether `run` is active.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Send a request and block until its response arrives.
    ///
    /// Uses the configured request timeout, if any.
    ///
    /// # Errors
    ///
    /// - `RpcError::Remote` if the host answered with an error payload
    /// - `RpcError::Timeout` if the timeout elapsed (the session stays usable)
    /// - transport errors, or `RpcError::Closed` if the session died while
    ///   the request was pending
    pub fn request(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.request_timeout(method, args, self.inner.config.request_timeout())
    }

    /// [`request`](Self::request) with an explicit timeout.
    pub fn request_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let (id, slot) = self.inner.register_pending();
        debug!("Request {} -> {}", id, method);

        if let Err(err) = self.inner.stream.send(&Message::request(id, method, args)) {
            self.inner.remove_pending(id);
            if err.is_fatal() {
                self.inner.fail_pending(&err);
            }
            return Err(err);
        }

        let result = self.wait_response(id, &slot, timeout);
        if let Err(RpcError::Timeout(_)) = &result {
            self.inner.remove_pending(id);
            warn!("Request {} ({}) timed out", id, method);
        }
        result
    }

    fn wait_response(
        &self,
        id: u32,
        slot: &Receiver<Result<Value>>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            match slot.try_recv() {
                Ok(result) => return result,
                Err(TryRecvError::Disconnected) => {
                    return Err(RpcError::Closed(format!("request {} was dropped", id)))
                }
                Err(TryRecvError::Empty) => {}
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(RpcError::Timeout(timeout.unwrap_or_default()));
                    }
                    (deadline - now).min(RESPONSE_POLL_INTERVAL)
                }
                None => RESPONSE_POLL_INTERVAL,
            };

            if !self.is_running() {
                let pumped = self
                    .inner
                    .stream
                    .try_pump(Some(wait), &mut |message| self.inner.route(self, message));
                match pumped {
                    // An interrupt unblocks the read but does not abort the request.
                    Some(Ok(Pump::Interrupted)) => {
                        debug!("Read interrupted while waiting for request {}", id);
                        continue;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        if err.is_fatal() {
                            self.inner.fail_pending(&err);
                        }
                        return Err(err);
                    }
                    // Another thread is reading and routes our response.
                    None => {}
                }
            }

            if let Some(result) = wait_slot(slot, wait) {
                return result;
            }
        }
    }

    /// Send a notification. Blocks only until the bytes are flushed.
    pub fn notify(&self, method: &str, args: Vec<Value>) -> Result<()> {
        debug!("Notify -> {}", method);
        self.inner.stream.send(&Message::notification(method, args))
    }

    /// Serve requests and notifications until [`stop`](Self::stop), a fatal
    /// error, or an intercepted signal.
    ///
    /// Messages queued by earlier out-of-loop requests are dispatched first.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the loop: a transport error, or
    /// `RpcError::Signal` for SIGINT/SIGTERM (SIGINT is ignored on the stdio
    /// transport).
    pub fn run(&self, dispatcher: Arc<dyn Dispatcher>) -> Result<()> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(RpcError::AlreadyRunning);
        }
        // Setup may stop the loop before it starts reading.
        inner.stream.loop_reset();
        info!("Session loop starting on {}", self.target());

        let signals = inner.config.handle_signals;
        if signals {
            if let Err(e) = inner
                .stream
                .stream()
                .setup_signal_handlers(&[SIGINT, SIGTERM])
            {
                warn!("Failed to intercept signals: {}", e);
            }
        }

        let runner = Runner {
            dispatcher: Arc::clone(&dispatcher),
            pool: WorkerPool::spawn("rpc-request", inner.config.workers()),
            ordered: WorkerPool::spawn("rpc-notify", 1),
        };
        {
            let mut slot = inner.lock_runner();
            let session = self.clone();
            runner.pool.submit(Box::new(move || dispatcher.on_setup(&session)));

            let queued: Vec<Message> = inner.lock_queued().drain(..).collect();
            if !queued.is_empty() {
                debug!("Dispatching {} queued message(s)", queued.len());
            }
            for message in queued {
                inner.dispatch(self, &runner, message);
            }
            *slot = Some(runner);
        }

        let mut failure = None;
        inner.stream.loop_start(
            &mut |message| inner.route(self, message),
            &mut |err| {
                if err.is_fatal() {
                    error!("Session loop failed: {}", err);
                    inner.fail_pending(&err);
                } else {
                    info!("Session loop stopped: {}", err);
                }
                failure = Some(err);
            },
        );

        inner.running.store(false, Ordering::SeqCst);
        if signals {
            inner.stream.stream().teardown_signal_handlers();
        }
        let runner = inner.lock_runner().take();
        if let Some(runner) = runner {
            runner.shutdown(inner.config.shutdown_grace());
        }
        info!("Session loop exited");

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// [`run`](Self::run) with closures instead of a [`Dispatcher`].
    pub fn run_with<R, N>(
        &self,
        on_request: R,
        on_notification: N,
        on_setup: Option<SetupFn>,
    ) -> Result<()>
    where
        R: Fn(&Session, &str, Vec<Value>) -> Reply + Send + Sync + 'static,
        N: Fn(&Session, &str, Vec<Value>) + Send + Sync + 'static,
    {
        self.run(Arc::new(FnDispatcher {
            on_request: Box::new(on_request),
            on_notification: Box::new(on_notification),
            on_setup: Mutex::new(on_setup),
        }))
    }

    /// Make `run` return. Safe to call from any thread, including handlers.
    pub fn stop(&self) {
        debug!("Stopping session loop");
        self.inner.stream.loop_stop();
    }

    /// Interrupt whichever thread is blocked reading the transport.
    pub fn interrupt(&self) {
        self.inner.stream.interrupt();
    }

    /// Call `callback` after `delay`, and every `delay` after that if
    /// `repeat` is set.
    ///
    /// Callbacks run on the notification lane, so they are serialized with
    /// notifications. Ticks only fire while `run` is active.
    pub fn schedule<F>(&self, delay: Duration, repeat: bool, callback: F)
    where
        F: FnMut(&Session) + Send + 'static,
    {
        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let boxed: Box<dyn FnMut(&Session) + Send> = Box::new(callback);
        let callback: Scheduled = Arc::new(Mutex::new(boxed));

        self.inner.stream.stream().schedule(
            delay,
            repeat,
            Box::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let session = Session { inner };
                let callback = Arc::clone(&callback);
                let runner = session.inner.lock_runner();
                let Some(runner) = runner.as_ref() else {
                    debug!("Scheduled callback skipped: session not running");
                    return;
                };
                let job_session = session.clone();
                runner.ordered.submit(Box::new(move || {
                    let mut callback = callback.lock().unwrap_or_else(PoisonError::into_inner);
                    (*callback)(&job_session);
                }));
            }),
        );
    }

    /// Install the extension type table from host metadata.
    ///
    /// Accepts the full API metadata map or just its `types` entry.
    pub fn configure(&self, metadata: &Value) -> Result<()> {
        let table = TypeTable::from_metadata(metadata)?;
        debug!("Configured {} extension type(s)", table.len());
        self.codec().configure(table);
        Ok(())
    }

    /// Fetch the host's API metadata, configure the type table from it and
    /// return this client's channel id.
    pub fn handshake(&self) -> Result<i64> {
        let info = self.request(API_INFO_METHOD, vec![])?;
        let (channel, metadata) = match info.as_array() {
            Some([channel, metadata]) => (channel.as_i64(), metadata),
            _ => (None, &info),
        };
        let channel = channel.ok_or_else(|| {
            RpcError::Decode(format!("unexpected {} reply: {}", API_INFO_METHOD, info))
        })?;
        self.configure(metadata)?;
        info!("Attached as channel {}", channel);
        Ok(channel)
    }

    /// Register a local callable the host can invoke by name.
    ///
    /// The returned reference encodes as a `Function` extension value. When
    /// the host sends a request or notification whose method is that name,
    /// `handler` is called instead of the dispatcher.
    pub fn register_function<F>(&self, handler: F) -> FunctionRef
    where
        F: Fn(&Session, Vec<Value>) -> Reply + Send + Sync + 'static,
    {
        static NEXT_FUNCTION: AtomicU64 = AtomicU64::new(1);
        let name = format!(
            "rpc_fn_{}_{}",
            std::process::id(),
            NEXT_FUNCTION.fetch_add(1, Ordering::Relaxed)
        );
        self.inner
            .lock_functions()
            .insert(name.clone(), Arc::new(handler));
        debug!("Registered function {}", name);
        FunctionRef::new(name)
    }

    /// Forget a registered callable.
    pub fn unregister_function(&self, function: &FunctionRef) -> bool {
        self.inner
            .lock_functions()
            .remove(function.name())
            .is_some()
    }

    /// Route child stderr chunks to `handler` instead of the log.
    pub fn set_stderr_handler(&self, handler: StderrHandler) {
        self.inner.stream.stream().set_stderr_handler(handler);
    }
}

impl SessionInner {
    fn register_pending(&self) -> (u32, Receiver<Result<Value>>) {
        let (tx, rx) = mpsc::sync_channel(1);
        let mut pending = self.lock_pending();
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !pending.contains_key(&id) {
                pending.insert(id, tx);
                return (id, rx);
            }
        }
    }

    fn remove_pending(&self, id: u32) {
        self.lock_pending().remove(&id);
    }

    /// Resume every pending caller with a closed-session failure.
    fn fail_pending(&self, cause: &RpcError) {
        let drained: Vec<_> = self.lock_pending().drain().collect();
        if !drained.is_empty() {
            warn!("Failing {} pending request(s): {}", drained.len(), cause);
        }
        for (_, slot) in drained {
            let _ = slot.try_send(Err(RpcError::Closed(cause.to_string())));
        }
    }

    /// Handle one decoded message from the transport.
    fn route(&self, session: &Session, message: Message) {
        match message {
            Message::Response { id, result } => {
                match self.lock_pending().remove(&id) {
                    Some(slot) => {
                        let _ = slot.try_send(result.map_err(RpcError::remote));
                    }
                    None => warn!("Received response for unknown request id {}", id),
                }
            }
            other => {
                let runner = self.lock_runner();
                match runner.as_ref() {
                    Some(runner) => self.dispatch(session, runner, other),
                    None => {
                        debug!("Queueing {} until the session runs", other.kind());
                        self.lock_queued().push_back(other);
                    }
                }
            }
        }
    }

    /// Hand a request or notification to its worker lane.
    fn dispatch(&self, session: &Session, runner: &Runner, message: Message) {
        let job_session = session.clone();
        let dispatcher = Arc::clone(&runner.dispatcher);

        let (job, lane): (Job, &WorkerPool) = match message {
            Message::Request { id, method, args } => {
                let function = self.lock_functions().get(&method).cloned();
                let job: Job = Box::new(move || {
                    let reply = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        match function {
                            Some(function) => function(&job_session, args),
                            None => dispatcher.on_request(&job_session, &method, args),
                        }
                    }))
                    .unwrap_or_else(|panic_info| {
                        let message = panic_message(&*panic_info);
                        error!("Request handler for {} panicked: {}", method, message);
                        Err(Value::from(format!("handler for {} panicked: {}", method, message)))
                    });

                    let response = Message::Response { id, result: reply };
                    if let Err(e) = job_session.inner.stream.send(&response) {
                        warn!("Failed to send response {}: {}", id, e);
                    }
                });
                (job, &runner.pool)
            }
            Message::Notification { method, args } => {
                let function = self.lock_functions().get(&method).cloned();
                let job: Job = Box::new(move || match function {
                    Some(function) => {
                        if let Err(e) = function(&job_session, args) {
                            warn!("Function {} failed on notification: {}", method, e);
                        }
                    }
                    None => dispatcher.on_notification(&job_session, &method, args),
                });
                (job, &runner.ordered)
            }
            Message::Response { id, .. } => {
                warn!("Response {} reached the dispatcher", id);
                return;
            }
        };

        if !lane.submit(job) {
            error!("Worker lane is gone, dropping message");
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u32, SyncSender<Result<Value>>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_queued(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.queued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_runner(&self) -> MutexGuard<'_, Option<Runner>> {
        self.runner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_functions(&self) -> MutexGuard<'_, HashMap<String, Arc<FunctionHandler>>> {
        self.functions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wait up to `wait` for a response. `None` means keep waiting.
fn wait_slot(slot: &Receiver<Result<Value>>, wait: Duration) -> Option<Result<Value>> {
    match slot.recv_timeout(wait) {
        Ok(result) => Some(result),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => Some(Err(RpcError::Closed(
            "pending request was dropped".to_string(),
        ))),
    }
}

/// Open a session with the default configuration.
pub fn attach(target: TransportTarget) -> Result<Session> {
    Session::connect(target, SessionConfig::default())
}

/// Connect to a host listening on TCP.
pub fn tcp_session(host: &str, port: u16) -> Result<Session> {
    attach(TransportTarget::Tcp {
        host: host.to_string(),
        port,
    })
}

/// Connect to a Unix domain socket, or a named pipe on Windows.
pub fn socket_session(path: impl Into<PathBuf>) -> Result<Session> {
    attach(TransportTarget::Socket { path: path.into() })
}

/// Talk to the host over this process's stdin/stdout.
///
/// Logging must not go to stdout while this session is alive.
pub fn stdio_session() -> Result<Session> {
    attach(TransportTarget::Stdio)
}

/// Spawn `argv` (e.g. `["nvim", "--embed"]`) and talk over its pipes.
///
/// The child's stderr is logged at `warn` unless a handler is set with
/// [`Session::set_stderr_handler`]. Dropping the last session handle closes
/// the child's stdin and kills it if it does not exit promptly.
/// Handlers still busy when `run` gives up waiting for them keep their
/// session handle, so the child lives until they return.
pub fn child_session<I, S>(argv: I) -> Result<Session>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    attach(TransportTarget::Spawn {
        argv: argv.into_iter().map(Into::into).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;

    /// Session whose transport is never driven; the listener keeps the
    /// port reserved.
    fn idle_session() -> (Session, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let session = tcp_session("127.0.0.1", port).unwrap();
        (session, listener)
    }

    /// Session that does not intercept real signals.
    fn quiet_session(shutdown_grace_ms: u64) -> (Session, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = SessionConfig {
            handle_signals: false,
            shutdown_grace_ms,
            ..Default::default()
        };
        let target = TransportTarget::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        };
        (Session::connect(target, config).unwrap(), listener)
    }

    #[test]
    fn test_signal_ends_run_without_failing_pending() {
        let (session, _listener) = quiet_session(2000);
        let (_, slot) = session.inner.register_pending();

        session.inner.stream.stream().deliver_signal(SIGTERM);
        let outcome = session.run_with(
            |_: &Session, _: &str, _: Vec<Value>| Ok(Value::Nil),
            |_: &Session, _: &str, _: Vec<Value>| {},
            None,
        );
        assert!(
            matches!(outcome, Err(RpcError::Signal(SIGTERM))),
            "{:?}",
            outcome
        );
        assert!(!session.is_running());
        assert!(matches!(slot.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_busy_handler_outlives_run() {
        let (session, _listener) = quiet_session(50);
        let setup: SetupFn = Box::new(|_: &Session| {
            std::thread::sleep(Duration::from_millis(400));
        });

        session.inner.stream.stream().deliver_signal(SIGTERM);
        let start = Instant::now();
        let outcome = session.run_with(
            |_: &Session, _: &str, _: Vec<Value>| Ok(Value::Nil),
            |_: &Session, _: &str, _: Vec<Value>| {},
            Some(setup),
        );
        assert!(matches!(outcome, Err(RpcError::Signal(_))));
        assert!(start.elapsed() < Duration::from_millis(400));
        // The detached setup job still holds a clone.
        assert!(Arc::strong_count(&session.inner) > 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while Arc::strong_count(&session.inner) > 1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(Arc::strong_count(&session.inner), 1);
    }

    #[test]
    fn test_pending_ids_skip_in_use() {
        let (session, _listener) = idle_session();
        let inner = &session.inner;

        let (first, _a) = inner.register_pending();
        inner.next_id.store(first, Ordering::Relaxed);
        let (second, _b) = inner.register_pending();
        assert_ne!(first, second);

        inner.remove_pending(first);
        inner.next_id.store(first, Ordering::Relaxed);
        let (reused, _c) = inner.register_pending();
        assert_eq!(reused, first);
    }

    #[test]
    fn test_fail_pending_resumes_callers() {
        let (session, _listener) = idle_session();
        let (_, slot) = session.inner.register_pending();
        session.inner.fail_pending(&RpcError::Eof);

        let result = slot.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(result, Err(RpcError::Closed(_))), "{:?}", result);
        assert!(session.inner.lock_pending().is_empty());
    }

    #[test]
    fn test_unsolicited_messages_queue_until_run() {
        let (session, _listener) = idle_session();
        session
            .inner
            .route(&session, Message::notification("first", vec![]));
        session
            .inner
            .route(&session, Message::request(4, "second", vec![]));

        let queued: Vec<_> = session
            .inner
            .lock_queued()
            .iter()
            .map(|m| m.method().unwrap_or_default().to_string())
            .collect();
        assert_eq!(queued, vec!["first", "second"]);
    }

    #[test]
    fn test_response_routed_to_slot() {
        let (session, _listener) = idle_session();
        let (id, slot) = session.inner.register_pending();
        session.inner.route(
            &session,
            Message::Response {
                id,
                result: Err(Value::Array(vec![Value::from(1), Value::from("bad")])),
            },
        );
        match slot.recv_timeout(Duration::from_secs(1)).unwrap() {
            Err(RpcError::Remote { message, .. }) => assert_eq!(message, "bad"),
            other => panic!("Expected remote error, got {:?}", other),
        }
    }

    #[test]
    fn test_register_function_names_unique() {
        let (session, _listener) = idle_session();
        let a = session.register_function(|_, _| Ok(Value::Nil));
        let b = session.register_function(|_, _| Ok(Value::Nil));
        assert_ne!(a.name(), b.name());
        assert!(session.unregister_function(&a));
        assert!(!session.unregister_function(&a));
    }

    #[test]
    fn test_setup_closure_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let setup: SetupFn = Box::new(move |_: &Session| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let dispatcher = FnDispatcher {
            on_request: Box::new(|_: &Session, _: &str, _: Vec<Value>| Ok(Value::Nil)),
            on_notification: Box::new(|_: &Session, _: &str, _: Vec<Value>| {}),
            on_setup: Mutex::new(Some(setup)),
        };

        let (session, _listener) = idle_session();
        dispatcher.on_setup(&session);
        dispatcher.on_setup(&session);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_configure_from_metadata() {
        let (session, _listener) = idle_session();
        let metadata = Value::Map(vec![(
            Value::from("types"),
            Value::Map(vec![(
                Value::from("Buffer"),
                Value::Map(vec![(Value::from("id"), Value::from(0))]),
            )]),
        )]);
        session.configure(&metadata).unwrap();
        assert!(session.codec().is_configured());
        assert!(session.configure(&Value::from("nope")).is_err());
    }
}
