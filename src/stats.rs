use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Per-queue counters, bumped by the queue's worker only.
#[derive(Default)]
pub struct QueueStats {
    packets: CachePadded<AtomicU64>,
    bytes: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
    invalid: CachePadded<AtomicU64>,
    deferred: CachePadded<AtomicU64>,
    bounced: CachePadded<AtomicU64>,
}

impl QueueStats {
    pub(crate) fn packet(&self, bytes: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn invalid(&self) {
        self.invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bounced(&self) {
        self.bounced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueStat {
        QueueStat {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            bounced: self.bounced.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStat {
    pub packets: u64,
    pub bytes: u64,
    pub dropped: u64,
    pub invalid: u64,
    /// Times a packet waited for ring slots or bounce buffers.
    pub deferred: u64,
    pub bounced: u64,
}

impl std::ops::AddAssign for QueueStat {
    fn add_assign(&mut self, other: Self) {
        self.packets += other.packets;
        self.bytes += other.bytes;
        self.dropped += other.dropped;
        self.invalid += other.invalid;
        self.deferred += other.deferred;
        self.bounced += other.bounced;
    }
}

/// Totals over every queue of an adapter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub tx: QueueStat,
    pub rx: QueueStat,
}
