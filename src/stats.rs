use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct EngineStats {
    pub samples_accepted: AtomicU64,
    pub samples_ignored: AtomicU64,
    pub samples_invalid: AtomicU64,
    pub impulses: AtomicU64,
    pub impulses_rejected: AtomicU64,
    pub queue_depth: AtomicU64,
    pub snapshots_published: AtomicU64,
    pub snapshots_failed: AtomicU64,
    pub snapshots_dropped: AtomicU64,
    pub poll_failures: AtomicU64,
    pub bus_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub samples_accepted: u64,
    pub samples_ignored: u64,
    pub samples_invalid: u64,
    pub impulses: u64,
    pub impulses_rejected: u64,
    pub queue_depth: u64,
    pub snapshots_published: u64,
    pub snapshots_failed: u64,
    pub snapshots_dropped: u64,
    pub poll_failures: u64,
    pub bus_connected: bool,
    pub last_error: Option<String>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bus_connected(&self, connected: bool) {
        self.bus_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn report(&self) -> StatsReport {
        let last_error = self.last_error.lock().ok().and_then(|guard| guard.clone());
        StatsReport {
            samples_accepted: self.samples_accepted.load(Ordering::Relaxed),
            samples_ignored: self.samples_ignored.load(Ordering::Relaxed),
            samples_invalid: self.samples_invalid.load(Ordering::Relaxed),
            impulses: self.impulses.load(Ordering::Relaxed),
            impulses_rejected: self.impulses_rejected.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            snapshots_published: self.snapshots_published.load(Ordering::Relaxed),
            snapshots_failed: self.snapshots_failed.load(Ordering::Relaxed),
            snapshots_dropped: self.snapshots_dropped.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            bus_connected: self.bus_connected.load(Ordering::Relaxed),
            last_error,
        }
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
