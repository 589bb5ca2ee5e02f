//! The OS network stack as the translator sees it.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::nbl::{ExecutionLevel, NblChain};

pub trait OsNetStack: Send + Sync {
    /// Hands back lists the stack sent, each tagged with its status.
    fn complete_send(&self, chain: NblChain, level: ExecutionLevel);

    /// Delivers received lists. The stack owns them until it passes them
    /// back through `Adapter::return_net_buffer_lists`.
    fn indicate_receive(&self, chain: NblChain, level: ExecutionLevel);
}

#[derive(Default)]
struct Recorded {
    completed: NblChain,
    received: NblChain,
}

/// A stack that keeps everything it is given.
#[derive(Default)]
pub struct RecordingStack {
    recorded: Mutex<Recorded>,
    changed: Condvar,
}

impl RecordingStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_completed(&self) -> NblChain {
        std::mem::take(&mut self.recorded.lock().completed)
    }

    pub fn take_received(&self) -> NblChain {
        std::mem::take(&mut self.recorded.lock().received)
    }

    /// Waits until at least `count` completed lists are held, or `timeout`.
    pub fn wait_completed(&self, count: usize, timeout: Duration) -> bool {
        self.wait_for(timeout, |r| r.completed.len() >= count)
    }

    /// Waits until at least `count` received lists are held, or `timeout`.
    pub fn wait_received(&self, count: usize, timeout: Duration) -> bool {
        self.wait_for(timeout, |r| r.received.len() >= count)
    }

    fn wait_for(&self, timeout: Duration, done: impl Fn(&Recorded) -> bool) -> bool {
        let mut recorded = self.recorded.lock();
        let deadline = std::time::Instant::now() + timeout;
        while !done(&recorded) {
            if self.changed.wait_until(&mut recorded, deadline).timed_out() {
                return done(&recorded);
            }
        }
        true
    }
}

impl OsNetStack for RecordingStack {
    fn complete_send(&self, mut chain: NblChain, _level: ExecutionLevel) {
        self.recorded.lock().completed.append(&mut chain);
        self.changed.notify_all();
    }

    fn indicate_receive(&self, mut chain: NblChain, _level: ExecutionLevel) {
        self.recorded.lock().received.append(&mut chain);
        self.changed.notify_all();
    }
}
