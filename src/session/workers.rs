//! Handler threads used while a session runs.
//!
//! Requests run on a pool so a handler can block in a nested request while
//! another worker serves the host's next call. Notifications and scheduled
//! callbacks run on a single-thread lane so they keep arrival order.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

/// Unit of work executed on a worker thread.
pub(crate) type Job = Box<dyn FnOnce() + Send>;

enum Task {
    Run(Job),
    Shutdown,
}

/// Fixed set of threads pulling jobs from one unbounded queue.
///
/// The queue is unbounded so that the loop-driving thread never blocks on
/// a submission while a worker waits for that thread to flush a write.
pub(crate) struct WorkerPool {
    name: &'static str,
    tx: Sender<Task>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(name: &'static str, threads: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..threads.max(1))
            .filter_map(|index| {
                let rx = Arc::clone(&rx);
                thread::Builder::new()
                    .name(format!("{}-{}", name, index))
                    .spawn(move || worker_loop(name, &rx))
                    .map_err(|e| error!("Failed to spawn {} worker: {}", name, e))
                    .ok()
            })
            .collect();

        Self { name, tx, handles }
    }

    /// Queue a job. Returns `false` if every worker is gone.
    pub(crate) fn submit(&self, job: Job) -> bool {
        self.tx.send(Task::Run(job)).is_ok()
    }

    /// Stop accepting work and wait up to `grace` for the workers.
    ///
    /// Workers still busy after `grace` are detached; they finish their
    /// current job in the background.
    pub(crate) fn shutdown(self, grace: Duration) {
        const QUICK_CHECK_INTERVAL: Duration = Duration::from_millis(10);

        for _ in &self.handles {
            let _ = self.tx.send(Task::Shutdown);
        }

        let deadline = Instant::now() + grace;
        let mut remaining = self.handles;
        while !remaining.is_empty() && Instant::now() < deadline {
            let (finished, running): (Vec<_>, Vec<_>) =
                remaining.into_iter().partition(|h| h.is_finished());
            for handle in finished {
                if handle.join().is_err() {
                    warn!("{} worker panicked during shutdown", self.name);
                }
            }
            remaining = running;
            if !remaining.is_empty() {
                thread::sleep(QUICK_CHECK_INTERVAL);
            }
        }

        if remaining.is_empty() {
            debug!("{} workers shut down gracefully", self.name);
        } else {
            debug!(
                "{} {} worker(s) still busy after {}ms - detaching",
                remaining.len(),
                self.name,
                grace.as_millis()
            );
        }
    }
}

fn worker_loop(name: &str, rx: &Mutex<Receiver<Task>>) {
    loop {
        let task = {
            let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv()
        };
        match task {
            Ok(Task::Run(job)) => {
                // A panicking handler must not take the worker down with it.
                if let Err(panic_info) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    error!("{} worker caught panic: {}", name, panic_message(&*panic_info));
                }
            }
            Ok(Task::Shutdown) | Err(_) => break,
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic in handler".to_string()
    }
}
