//! Synchronized start and stop across every queue of an adapter.
//!
//! Requests collapse into one pending pass of a single work item. A pass
//! applies the current target to each registered queue, then re-checks the
//! target and runs again if it moved meanwhile. Callers of the
//! `synchronize_*` functions block until every queue reports the target
//! state on the shared [`StatusBoard`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::errors::{Error, Result};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    Stopped = 0,
    Started = 1,
    Stopping = 2,
}

impl QueueState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => QueueState::Started,
            2 => QueueState::Stopping,
            _ => QueueState::Stopped,
        }
    }
}

/// Where queues publish state changes for waiters.
#[derive(Default)]
pub struct StatusBoard {
    lock: Mutex<()>,
    changed: Condvar,
}

impl StatusBoard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn wait_until(&self, mut done: impl FnMut() -> bool) {
        let mut guard = self.lock.lock();
        while !done() {
            self.changed.wait(&mut guard);
        }
    }
}

pub struct QueueStatus {
    state: AtomicU8,
    board: Arc<StatusBoard>,
}

impl QueueStatus {
    pub fn new(board: Arc<StatusBoard>) -> Self {
        Self {
            state: AtomicU8::new(QueueState::Stopped as u8),
            board,
        }
    }

    pub fn get(&self) -> QueueState {
        QueueState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set(&self, state: QueueState) {
        let _guard = self.board.lock.lock();
        self.state.store(state as u8, Ordering::Release);
        self.board.changed.notify_all();
    }
}

impl std::fmt::Debug for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("QueueStatus").field(&self.get()).finish()
    }
}

/// A queue the control pass can drive.
pub trait ControlledQueue: Send + Sync {
    fn status(&self) -> &QueueStatus;

    /// Starts the queue if it has never run. Idempotent.
    fn start(&self);

    /// Asks a running queue to stop. Idempotent.
    fn request_stop(&self);
}

struct WorkState {
    target: QueueState,
    pending: bool,
    running: bool,
    shutdown: bool,
}

struct ControlShared {
    board: Arc<StatusBoard>,
    queues: Mutex<Vec<Arc<dyn ControlledQueue>>>,
    work: Mutex<WorkState>,
    work_changed: Condvar,
    passes: AtomicU64,
}

impl ControlShared {
    fn run_work_item(&self) {
        loop {
            let target = {
                let mut work = self.work.lock();
                while !work.pending && !work.shutdown {
                    self.work_changed.wait(&mut work);
                }
                if work.shutdown {
                    return;
                }
                work.pending = false;
                work.running = true;
                work.target
            };

            let queues = self.queues.lock().clone();
            trace!("control pass towards {target:?} over {} queues", queues.len());
            for queue in &queues {
                match target {
                    QueueState::Started => queue.start(),
                    _ => queue.request_stop(),
                }
            }
            self.passes.fetch_add(1, Ordering::Relaxed);

            let mut work = self.work.lock();
            work.running = false;
            if work.target != target {
                work.pending = true;
            }
            self.work_changed.notify_all();
        }
    }
}

pub struct QueueControl {
    shared: Arc<ControlShared>,
    worker: Option<JoinHandle<()>>,
}

impl QueueControl {
    pub fn new(name: &str) -> Result<Self> {
        let shared = Arc::new(ControlShared {
            board: StatusBoard::new(),
            queues: Mutex::new(Vec::new()),
            work: Mutex::new(WorkState {
                target: QueueState::Stopped,
                pending: false,
                running: false,
                shutdown: false,
            }),
            work_changed: Condvar::new(),
            passes: AtomicU64::new(0),
        });
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("{name}-control"))
                .spawn(move || shared.run_work_item())
                .map_err(|e| Error::Spawn(e.to_string()))?
        };
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub fn board(&self) -> Arc<StatusBoard> {
        self.shared.board.clone()
    }

    /// Adds a queue. It is brought to the current target by the next pass.
    pub fn register(&self, queue: Arc<dyn ControlledQueue>) {
        self.shared.queues.lock().push(queue);
        if self.target() == QueueState::Started {
            self.request_synchronization();
        }
    }

    pub fn queue_count(&self) -> usize {
        self.shared.queues.lock().len()
    }

    pub fn target(&self) -> QueueState {
        self.shared.work.lock().target
    }

    /// Schedules a pass; requests made before it runs share it.
    pub fn request_synchronization(&self) {
        let mut work = self.shared.work.lock();
        work.pending = true;
        self.shared.work_changed.notify_all();
    }

    pub fn synchronize_datapath_start(&self) {
        self.synchronize(QueueState::Started);
    }

    pub fn synchronize_datapath_stop(&self) {
        self.synchronize(QueueState::Stopped);
    }

    fn synchronize(&self, target: QueueState) {
        debug!("synchronizing datapath to {target:?}");
        {
            let mut work = self.shared.work.lock();
            work.target = target;
            work.pending = true;
            self.shared.work_changed.notify_all();
            while work.pending || work.running {
                self.shared.work_changed.wait(&mut work);
                if work.target != target {
                    // Superseded by a later request.
                    return;
                }
            }
        }
        let queues = self.shared.queues.lock().clone();
        self.shared
            .board
            .wait_until(|| queues.iter().all(|q| q.status().get() == target));
        debug!("datapath reached {target:?}");
    }

    /// Passes run so far.
    pub fn pass_count(&self) -> u64 {
        self.shared.passes.load(Ordering::Relaxed)
    }
}

impl Drop for QueueControl {
    fn drop(&mut self) {
        {
            let mut work = self.shared.work.lock();
            work.shutdown = true;
            self.shared.work_changed.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// Transitions on a helper thread, the way a queue worker would.
    struct FakeQueue {
        status: Arc<QueueStatus>,
        starts: AtomicUsize,
        stop_requested: AtomicBool,
    }

    impl ControlledQueue for FakeQueue {
        fn status(&self) -> &QueueStatus {
            &self.status
        }

        fn start(&self) {
            if self.status.get() == QueueState::Stopped
                && !self.stop_requested.load(Ordering::Relaxed)
            {
                self.starts.fetch_add(1, Ordering::Relaxed);
                let status = self.status.clone();
                thread::spawn(move || status.set(QueueState::Started));
            }
        }

        fn request_stop(&self) {
            if !self.stop_requested.swap(true, Ordering::Relaxed) {
                let status = self.status.clone();
                thread::spawn(move || {
                    status.set(QueueState::Stopping);
                    status.set(QueueState::Stopped);
                });
            }
        }
    }

    fn fake(control: &QueueControl) -> Arc<FakeQueue> {
        let queue = Arc::new(FakeQueue {
            status: Arc::new(QueueStatus::new(control.board())),
            starts: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
        });
        control.register(queue.clone());
        queue
    }

    #[test]
    fn start_and_stop_wait_for_every_queue() {
        let control = QueueControl::new("test").unwrap();
        let queues: Vec<_> = (0..4).map(|_| fake(&control)).collect();
        control.synchronize_datapath_start();
        assert!(queues.iter().all(|q| q.status.get() == QueueState::Started));
        control.synchronize_datapath_stop();
        assert!(queues.iter().all(|q| q.status.get() == QueueState::Stopped));
        assert!(queues.iter().all(|q| q.starts.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn late_registration_catches_up() {
        let control = QueueControl::new("late").unwrap();
        let first = fake(&control);
        control.synchronize_datapath_start();
        let second = fake(&control);
        control.synchronize_datapath_start();
        assert_eq!(first.status.get(), QueueState::Started);
        assert_eq!(second.status.get(), QueueState::Started);
        control.synchronize_datapath_stop();
    }

    /// Blocks inside the control pass until the gate opens.
    struct GatedQueue {
        status: QueueStatus,
        entered: AtomicUsize,
        open: Mutex<bool>,
        opened: Condvar,
    }

    impl ControlledQueue for GatedQueue {
        fn status(&self) -> &QueueStatus {
            &self.status
        }

        fn start(&self) {}

        fn request_stop(&self) {
            self.entered.fetch_add(1, Ordering::SeqCst);
            let mut open = self.open.lock();
            while !*open {
                self.opened.wait(&mut open);
            }
        }
    }

    #[test]
    fn requests_during_a_pass_coalesce_into_one() {
        let control = QueueControl::new("coalesce").unwrap();
        let queue = Arc::new(GatedQueue {
            status: QueueStatus::new(control.board()),
            entered: AtomicUsize::new(0),
            open: Mutex::new(false),
            opened: Condvar::new(),
        });
        control.register(queue.clone());
        control.request_synchronization();
        while queue.entered.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        for _ in 0..10 {
            control.request_synchronization();
        }
        *queue.open.lock() = true;
        queue.opened.notify_all();
        while control.pass_count() < 2 {
            thread::yield_now();
        }
        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(control.pass_count(), 2);
        assert_eq!(queue.entered.load(Ordering::SeqCst), 2);
    }
}
