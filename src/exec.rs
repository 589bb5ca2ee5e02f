//! Cooperative single-thread execution context.
//!
//! Each queue owns one worker thread that lives exactly as long as the
//! context. The worker follows the contract:
//!
//! ```text
//! if worker.wait_for_start() {
//!     while !worker.is_stopping() {
//!         if !poll() { worker.wait_for_signal() }
//!     }
//! }
//! ```
//!
//! Signals coalesce: any number of `signal()` calls before the worker wakes
//! produce a single wake.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::errors::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EcState {
    Stopped,
    Started,
    Stopping,
    Terminated,
}

struct Inner {
    state: EcState,
    signaled: bool,
    exited: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Condvar,
    wakes: AtomicU64,
}

impl Shared {
    fn signal(&self) {
        let mut inner = self.inner.lock();
        if !inner.signaled {
            inner.signaled = true;
            self.wake.notify_all();
        }
    }
}

/// Marks the worker as exited even if the entry routine unwinds.
struct ExitGuard(Arc<Shared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.inner.lock().exited = true;
        self.0.wake.notify_all();
    }
}

pub struct ExecutionContext {
    name: String,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl ExecutionContext {
    /// Spawns the worker thread. It runs `entry` and must obey the
    /// cooperative loop contract.
    pub fn initialize<F>(name: impl Into<String>, entry: F) -> Result<Self>
    where
        F: FnOnce(EcWorker) + Send + 'static,
    {
        let name = name.into();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: EcState::Stopped,
                signaled: false,
                exited: false,
            }),
            wake: Condvar::new(),
            wakes: AtomicU64::new(0),
        });
        let worker = EcWorker {
            shared: shared.clone(),
        };
        let guard = ExitGuard(shared.clone());
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _guard = guard;
                entry(worker);
            })
            .map_err(|e| Error::Spawn(e.to_string()))?;
        debug!("{name}: execution context initialized");
        Ok(Self {
            name,
            shared,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> EcState {
        self.shared.inner.lock().state
    }

    pub fn start(&self) {
        let mut inner = self.shared.inner.lock();
        assert_eq!(inner.state, EcState::Stopped, "{}: start from {:?}", self.name, inner.state);
        inner.state = EcState::Started;
        self.shared.wake.notify_all();
        debug!("{}: started", self.name);
    }

    pub fn signal(&self) {
        self.shared.signal();
    }

    pub fn notifier(&self) -> QueueNotifier {
        QueueNotifier {
            shared: self.shared.clone(),
        }
    }

    /// Asks the worker to leave its loop. Calling it twice is a bug.
    pub fn cancel(&self) {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            EcState::Stopping | EcState::Terminated => {
                panic!("{}: cancel called twice", self.name)
            }
            _ => {}
        }
        inner.state = EcState::Stopping;
        inner.signaled = true;
        self.shared.wake.notify_all();
        debug!("{}: stopping", self.name);
    }

    /// Blocks until the entry routine has returned.
    pub fn wait_for_stopped(&self) {
        let mut inner = self.shared.inner.lock();
        while !inner.exited {
            self.shared.wake.wait(&mut inner);
        }
    }

    /// Joins the worker. Legal before start or after cancel.
    pub fn terminate(&mut self) {
        {
            let mut inner = self.shared.inner.lock();
            assert!(
                matches!(inner.state, EcState::Stopped | EcState::Stopping | EcState::Terminated),
                "{}: terminate while started",
                self.name
            );
            inner.state = EcState::Terminated;
            self.shared.wake.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            debug!("{}: terminated", self.name);
        }
    }

    /// Number of signal-driven wakes the worker has observed.
    pub fn wake_count(&self) -> u64 {
        self.shared.wakes.load(Ordering::Relaxed)
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if self.thread.is_none() {
            return;
        }
        {
            let mut inner = self.shared.inner.lock();
            if inner.state == EcState::Started {
                inner.state = EcState::Stopping;
                inner.signaled = true;
            }
        }
        self.terminate();
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// The worker's view of its context.
pub struct EcWorker {
    shared: Arc<Shared>,
}

impl EcWorker {
    /// Blocks until started. Returns `false` if the context is torn down
    /// without ever starting.
    pub fn wait_for_start(&self) -> bool {
        let mut inner = self.shared.inner.lock();
        while inner.state == EcState::Stopped {
            self.shared.wake.wait(&mut inner);
        }
        inner.state == EcState::Started
    }

    /// Blocks until signaled, then resets the signal.
    pub fn wait_for_signal(&self) {
        let mut inner = self.shared.inner.lock();
        while !inner.signaled && inner.state == EcState::Started {
            self.shared.wake.wait(&mut inner);
        }
        if inner.state == EcState::Started {
            inner.signaled = false;
            self.shared.wakes.fetch_add(1, Ordering::Relaxed);
            trace!("worker woke");
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.inner.lock().state != EcState::Started
    }

    pub fn notifier(&self) -> QueueNotifier {
        QueueNotifier {
            shared: self.shared.clone(),
        }
    }
}

/// Cloneable handle that wakes a queue's worker.
#[derive(Clone)]
pub struct QueueNotifier {
    shared: Arc<Shared>,
}

impl QueueNotifier {
    pub fn notify(&self) {
        self.shared.signal();
    }
}

impl std::fmt::Debug for QueueNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueNotifier").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn spin_until(mut f: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if f() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("condition never held");
    }

    fn looping_context(polls: Arc<AtomicUsize>) -> ExecutionContext {
        ExecutionContext::initialize("ec-test", move |worker| {
            if worker.wait_for_start() {
                while !worker.is_stopping() {
                    polls.fetch_add(1, Ordering::Relaxed);
                    worker.wait_for_signal();
                }
            }
        })
        .unwrap()
    }

    #[test]
    fn signals_before_wake_coalesce() {
        let polls = Arc::new(AtomicUsize::new(0));
        let mut ec = looping_context(polls.clone());
        for _ in 0..5 {
            ec.signal();
        }
        ec.start();
        spin_until(|| ec.wake_count() == 1);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ec.wake_count(), 1);
        ec.cancel();
        ec.wait_for_stopped();
        ec.terminate();
        assert_eq!(ec.state(), EcState::Terminated);
        assert_eq!(ec.wake_count(), 1);
    }

    #[test]
    fn notifier_wakes_worker() {
        let polls = Arc::new(AtomicUsize::new(0));
        let mut ec = looping_context(polls.clone());
        ec.start();
        spin_until(|| polls.load(Ordering::Relaxed) == 1);
        let notifier = ec.notifier();
        notifier.notify();
        spin_until(|| polls.load(Ordering::Relaxed) == 2);
        ec.cancel();
        ec.terminate();
    }

    #[test]
    fn terminate_before_start() {
        let ran = Arc::new(AtomicUsize::new(0));
        let observed = ran.clone();
        let mut ec = ExecutionContext::initialize("ec-never", move |worker| {
            if worker.wait_for_start() {
                observed.fetch_add(1, Ordering::Relaxed);
            }
        })
        .unwrap();
        ec.terminate();
        assert_eq!(ran.load(Ordering::Relaxed), 0);
    }

    #[test]
    #[should_panic]
    fn cancel_twice_is_fatal() {
        let ec = looping_context(Arc::new(AtomicUsize::new(0)));
        ec.start();
        ec.cancel();
        ec.cancel();
    }
}
