//! Hands aggregator snapshots to the persistence collaborator.
//!
//! A snapshot whose write fails stays pending (latest per kind) and is
//! retried ahead of later publishes until it is acknowledged or the attempt
//! bound is reached. A newer snapshot of the same kind supersedes a pending
//! one, so files never move backwards.

use crate::error::{EngineError, EngineResult};
use crate::snapshot::{MetricSnapshot, SnapshotKind};
use crate::stats::{bump, EngineStats};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub trait SnapshotSink: Send + Sync + 'static {
    fn persist(
        &self,
        kind: SnapshotKind,
        snapshot: &MetricSnapshot,
        requires_backup: bool,
    ) -> Result<(), EngineError>;
}

#[derive(Debug)]
struct Pending {
    snapshot: MetricSnapshot,
    attempts: u32,
}

pub struct SnapshotPublisher {
    sink: Arc<dyn SnapshotSink>,
    max_attempts: u32,
    stats: Arc<EngineStats>,
    pending: Mutex<BTreeMap<&'static str, Pending>>,
}

impl SnapshotPublisher {
    pub fn new(sink: Arc<dyn SnapshotSink>, max_attempts: u32, stats: Arc<EngineStats>) -> Self {
        Self {
            sink,
            max_attempts: max_attempts.max(1),
            stats,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Persists `snapshot`, retrying older pending kinds first.
    pub async fn publish(&self, snapshot: MetricSnapshot) -> EngineResult<()> {
        let mut pending = self.pending.lock().await;
        let kind = snapshot.kind;
        if pending.remove(kind.as_str()).is_some() {
            tracing::debug!(kind = %kind, "pending snapshot superseded");
        }
        self.retry_locked(&mut pending).await;

        match self.persist(snapshot.clone()).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.keep_pending(&mut pending, snapshot, 1, &err);
                Err(err)
            }
        }
    }

    /// One more attempt for every pending snapshot.
    pub async fn retry_pending(&self) {
        let mut pending = self.pending.lock().await;
        self.retry_locked(&mut pending).await;
    }

    pub async fn pending_kinds(&self) -> Vec<SnapshotKind> {
        let pending = self.pending.lock().await;
        pending.values().map(|entry| entry.snapshot.kind).collect()
    }

    async fn retry_locked(&self, pending: &mut BTreeMap<&'static str, Pending>) {
        let entries = std::mem::take(pending);
        for (_, entry) in entries {
            let attempts = entry.attempts + 1;
            match self.persist(entry.snapshot.clone()).await {
                Ok(()) => {
                    tracing::info!(kind = %entry.snapshot.kind, attempts, "pending snapshot persisted");
                }
                Err(err) => self.keep_pending(pending, entry.snapshot, attempts, &err),
            }
        }
    }

    fn keep_pending(
        &self,
        pending: &mut BTreeMap<&'static str, Pending>,
        snapshot: MetricSnapshot,
        attempts: u32,
        err: &EngineError,
    ) {
        let kind = snapshot.kind;
        if attempts >= self.max_attempts {
            bump(&self.stats.snapshots_dropped);
            tracing::error!(kind = %kind, attempts, error = %err, "dropping snapshot after repeated persistence failures");
            return;
        }
        tracing::warn!(kind = %kind, attempts, error = %err, "snapshot kept pending");
        pending.insert(kind.as_str(), Pending { snapshot, attempts });
    }

    async fn persist(&self, snapshot: MetricSnapshot) -> EngineResult<()> {
        let sink = self.sink.clone();
        let kind = snapshot.kind;
        let result = tokio::task::spawn_blocking(move || {
            sink.persist(kind, &snapshot, kind.requires_backup())
        })
        .await
        .unwrap_or_else(|err| {
            Err(EngineError::PersistenceFailure {
                kind: kind.to_string(),
                reason: err.to_string(),
            })
        });

        match &result {
            Ok(()) => {
                bump(&self.stats.snapshots_published);
                tracing::trace!(kind = %kind, "snapshot persisted");
            }
            Err(err) => {
                bump(&self.stats.snapshots_failed);
                self.stats.record_error(err.to_string());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::LineState;
    use crate::snapshot::{MeterTotals, SnapshotBody};
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemorySink {
        failing: AtomicBool,
        written: StdMutex<Vec<(SnapshotKind, u64, bool)>>,
    }

    impl SnapshotSink for MemorySink {
        fn persist(
            &self,
            kind: SnapshotKind,
            snapshot: &MetricSnapshot,
            requires_backup: bool,
        ) -> Result<(), EngineError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(EngineError::PersistenceFailure {
                    kind: kind.to_string(),
                    reason: "disk full".to_string(),
                });
            }
            let impulses = match &snapshot.body {
                SnapshotBody::Meters(body) => body.impulses,
                _ => 0,
            };
            self.written
                .lock()
                .unwrap()
                .push((kind, impulses, requires_backup));
            Ok(())
        }
    }

    fn snapshot(kind: SnapshotKind, impulses: u64) -> MetricSnapshot {
        MetricSnapshot::new(
            kind,
            Utc::now(),
            Vec::new(),
            Vec::new(),
            SnapshotBody::Meters(MeterTotals {
                meters: Vec::new(),
                impulses,
                rotations: 0.0,
                cycles_closed: 0,
                state: LineState::Idle,
            }),
        )
    }

    fn publisher(sink: Arc<MemorySink>, attempts: u32) -> (SnapshotPublisher, Arc<EngineStats>) {
        let stats = Arc::new(EngineStats::new());
        (SnapshotPublisher::new(sink, attempts, stats.clone()), stats)
    }

    #[tokio::test]
    async fn backup_flag_follows_kind_table() {
        let sink = Arc::new(MemorySink::default());
        let (publisher, _) = publisher(sink.clone(), 3);
        publisher.publish(snapshot(SnapshotKind::Oee, 1)).await.unwrap();
        publisher.publish(snapshot(SnapshotKind::Meters, 2)).await.unwrap();
        let written = sink.written.lock().unwrap().clone();
        assert_eq!(
            written,
            vec![(SnapshotKind::Oee, 1, true), (SnapshotKind::Meters, 2, false)]
        );
    }

    #[tokio::test]
    async fn failed_snapshot_is_retried_on_next_publish() {
        let sink = Arc::new(MemorySink::default());
        let (publisher, stats) = publisher(sink.clone(), 3);
        sink.failing.store(true, Ordering::SeqCst);
        let err = publisher
            .publish(snapshot(SnapshotKind::OeeSummary, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PersistenceFailure { .. }));
        assert_eq!(publisher.pending_kinds().await, vec![SnapshotKind::OeeSummary]);

        sink.failing.store(false, Ordering::SeqCst);
        publisher.publish(snapshot(SnapshotKind::Flow, 0)).await.unwrap();
        assert!(publisher.pending_kinds().await.is_empty());
        let written = sink.written.lock().unwrap().clone();
        assert_eq!(written[0], (SnapshotKind::OeeSummary, 5, true));
        assert_eq!(written[1].0, SnapshotKind::Flow);
        assert_eq!(stats.snapshots_failed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.snapshots_published.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn snapshot_dropped_after_bounded_attempts() {
        let sink = Arc::new(MemorySink::default());
        let (publisher, stats) = publisher(sink.clone(), 2);
        sink.failing.store(true, Ordering::SeqCst);
        let _ = publisher.publish(snapshot(SnapshotKind::Meters, 1)).await;
        assert_eq!(publisher.pending_kinds().await.len(), 1);
        publisher.retry_pending().await;
        assert!(publisher.pending_kinds().await.is_empty());
        assert_eq!(stats.snapshots_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn newer_snapshot_supersedes_pending_one() {
        let sink = Arc::new(MemorySink::default());
        let (publisher, _) = publisher(sink.clone(), 5);
        sink.failing.store(true, Ordering::SeqCst);
        let _ = publisher.publish(snapshot(SnapshotKind::Meters, 1)).await;
        sink.failing.store(false, Ordering::SeqCst);
        publisher.publish(snapshot(SnapshotKind::Meters, 2)).await.unwrap();
        let written = sink.written.lock().unwrap().clone();
        assert_eq!(written, vec![(SnapshotKind::Meters, 2, false)]);
    }
}
