//! Background worker.
//!
//! One named thread runs a fixed list of [`Task`]s. Each pass executes every
//! task; if none of them did any work the thread sleeps until woken or until
//! the configured sleep elapses.
//!
//! The task list is produced by a startup closure that runs *on the worker
//! thread*, so slow setup (reading persisted state, loading the device id)
//! never delays the thread that starts the pipeline.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const THREAD_NAME: &str = "perfspan-worker";

/// A unit of background work.
pub trait Task: Send {
    /// Called once on the worker thread before the first `execute`.
    fn on_attach(&mut self, _worker: &WorkerHandle) {}

    /// Runs one step. Returns `true` if it did useful work, in which case the
    /// worker runs another pass straight away.
    fn execute(&mut self) -> bool;

    /// Called once on the worker thread as it shuts down.
    fn on_detach(&mut self) {}
}

type Startup = Box<dyn FnOnce() -> Vec<Box<dyn Task>> + Send>;

// =============================================================================
// WAKE SIGNAL
// =============================================================================

/// Condition variable with a pending-wake flag, so a `wake` that lands while
/// the worker is busy is not lost.
#[derive(Debug, Default)]
struct WakeSignal {
    woken: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    fn wake(&self) {
        *self.woken.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }

    /// Waits up to `timeout` for a wake. Returns immediately if one is
    /// already pending. Consumes the pending wake.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.woken.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut woken, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |woken| !*woken)
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *woken, false)
    }
}

#[derive(Debug, Default)]
struct Shared {
    signal: WakeSignal,
    running: AtomicBool,
}

/// Cloneable handle used to wake a [`Worker`] from any thread.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
}

impl WorkerHandle {
    pub fn wake(&self) {
        self.shared.signal.wake();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

// =============================================================================
// WORKER
// =============================================================================

pub struct Worker {
    shared: Arc<Shared>,
    sleep: Duration,
    startup: Mutex<Option<Startup>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Creates a stopped worker. `startup` runs on the worker thread and
    /// returns the tasks to run; `sleep` is the idle wait between passes.
    pub fn new<F>(startup: F, sleep: Duration) -> Self
    where
        F: FnOnce() -> Vec<Box<dyn Task>> + Send + 'static,
    {
        Self {
            shared: Arc::new(Shared::default()),
            sleep,
            startup: Mutex::new(Some(Box::new(startup))),
            thread: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Spawns the worker thread. Calling it again, or after `stop`, does nothing.
    pub fn start(&self) -> std::io::Result<()> {
        let Some(startup) = self
            .startup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        self.shared.running.store(true, Ordering::Release);
        let handle = self.handle();
        let sleep = self.sleep;
        let spawned = thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || run(&handle, startup, sleep));

        match spawned {
            Ok(join) => {
                *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(join);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    pub fn wake(&self) {
        self.shared.signal.wake();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stops the loop and waits for the thread to detach its tasks and exit.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.signal.wake();

        let join = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join {
            // A task stopping its own worker cannot join itself
            if join.thread().id() == thread::current().id() {
                return;
            }
            if join.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("running", &self.is_running())
            .field("sleep", &self.sleep)
            .finish_non_exhaustive()
    }
}

fn run(handle: &WorkerHandle, startup: Startup, sleep: Duration) {
    let mut tasks = match catch_unwind(AssertUnwindSafe(startup)) {
        Ok(tasks) => tasks,
        Err(_) => {
            warn!("worker startup panicked; no tasks will run");
            Vec::new()
        }
    };
    debug!(tasks = tasks.len(), "worker started");

    for task in &mut tasks {
        if catch_unwind(AssertUnwindSafe(|| task.on_attach(handle))).is_err() {
            warn!("task panicked while attaching");
        }
    }

    while handle.is_running() {
        let mut did_work = false;
        for task in &mut tasks {
            match catch_unwind(AssertUnwindSafe(|| task.execute())) {
                Ok(worked) => did_work |= worked,
                Err(_) => warn!("task panicked; continuing"),
            }
        }
        if !did_work && handle.is_running() {
            handle.shared.signal.wait(sleep);
        }
    }

    for task in &mut tasks {
        if catch_unwind(AssertUnwindSafe(|| task.on_detach())).is_err() {
            warn!("task panicked while detaching");
        }
    }
    debug!("worker stopped");
}
