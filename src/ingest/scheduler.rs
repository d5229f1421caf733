use super::payload::decode_payload;
use super::state::IngestState;
use super::worker::{self, LineCommand, WorkerHandle};
use super::{AnalyzerSource, LineEngine};
use crate::aggregate::{build_aggregators, Aggregator, TickInput};
use crate::config::{analyzer_channel_id, ChannelRole, ChannelSpec, EngineConfig};
use crate::conversion::Conversions;
use crate::cycle::{CycleStateMachine, CycleSummary};
use crate::error::{EngineError, EngineResult};
use crate::fusion::{FusionBuffer, FusionSnapshot, Sample, UpdateOutcome};
use crate::publisher::{SnapshotPublisher, SnapshotSink};
use crate::snapshot::{MetricSnapshot, SnapshotBody, SnapshotKind};
use crate::stats::{bump, EngineStats};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

impl LineEngine {
    pub fn new(
        config: EngineConfig,
        sink: Arc<dyn SnapshotSink>,
        scheduled_since: DateTime<Utc>,
    ) -> Self {
        let stats = Arc::new(EngineStats::new());
        let buffer = FusionBuffer::new(
            config.idle_timeout,
            config
                .channels
                .iter()
                .map(|spec| (spec.id.clone(), spec.kind, spec.stale_policy)),
        );
        let machine = CycleStateMachine::new(
            config.cycle_table.clone(),
            config.idle_timeout,
            config.max_changeover,
            config.element_window,
            scheduled_since,
        );
        let (handle, line_worker) = worker::channel(
            machine,
            config.queue_capacity,
            config.state_tick_interval,
            stats.clone(),
            scheduled_since,
        );
        let publisher = SnapshotPublisher::new(sink, config.max_publish_attempts, stats.clone());

        Self {
            config: Arc::new(config),
            buffer: Arc::new(buffer),
            worker: handle,
            pending_worker: Arc::new(Mutex::new(Some(line_worker))),
            state: Arc::new(Mutex::new(IngestState::new())),
            publisher: Arc::new(publisher),
            stats,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    pub fn channel_snapshot(&self, now: DateTime<Utc>) -> FusionSnapshot {
        self.buffer.snapshot(now)
    }

    /// Latest summary published by the state machine worker.
    pub fn cycle_summary(&self) -> CycleSummary {
        self.worker.summary()
    }

    /// Spawns the state machine worker, one ticker per aggregator and one
    /// poll loop per analyzer. Calling it a second time is a no-op.
    pub fn start(
        &self,
        analyzers: Vec<Arc<dyn AnalyzerSource>>,
        cancel: CancellationToken,
    ) -> EngineTasks {
        let mut handles = Vec::new();
        match lock(&self.pending_worker).take() {
            Some(line_worker) => handles.push(line_worker.spawn(cancel.clone())),
            None => {
                tracing::warn!("engine already started");
                return EngineTasks {
                    handles,
                    cancel,
                    drain_timeout: self.config.drain_timeout,
                    publisher: self.publisher.clone(),
                };
            }
        }

        for aggregator in build_aggregators(&self.config) {
            handles.push(self.spawn_aggregator(aggregator, cancel.clone()));
        }
        handles.push(self.spawn_system_report(cancel.clone()));
        for source in analyzers {
            handles.push(self.spawn_poller(source, cancel.clone()));
        }
        tracing::info!(tasks = handles.len(), "line engine started");

        EngineTasks {
            handles,
            cancel,
            drain_timeout: self.config.drain_timeout,
            publisher: self.publisher.clone(),
        }
    }

    /// Push path: one bus message for `channel_id`.
    pub async fn on_message(
        &self,
        channel_id: &str,
        payload: Bytes,
        received_at: DateTime<Utc>,
    ) -> EngineResult<UpdateOutcome> {
        let spec = self
            .config
            .channel(channel_id)
            .ok_or_else(|| EngineError::UnknownChannel(channel_id.to_string()))?;
        if self.worker.is_stopped() {
            return Err(EngineError::EngineStopped);
        }

        let mut raw = payload.to_vec();
        let decoded = match decode_payload(&mut raw) {
            Ok(decoded) => decoded,
            Err(reason) => {
                bump(&self.stats.samples_invalid);
                return Err(EngineError::invalid_sample(channel_id, reason));
            }
        };
        let timestamp = decoded.timestamp.unwrap_or(received_at);
        let sample = Sample::new(spec.kind, decoded.values, timestamp);
        if let Err(err) = validate_for_role(spec, &sample) {
            bump(&self.stats.samples_invalid);
            return Err(err);
        }

        let (outcome, commands) = {
            let mut state = lock(&self.state);
            let outcome = self.buffer.update(channel_id, sample.clone())?;
            let commands = match outcome {
                UpdateOutcome::Accepted => {
                    state.unavailable_sources.remove(channel_id);
                    commands_for(spec, &sample, &mut state, &self.config.conversions)
                }
                UpdateOutcome::Ignored => Vec::new(),
            };
            (outcome, commands)
        };

        match outcome {
            UpdateOutcome::Accepted => bump(&self.stats.samples_accepted),
            UpdateOutcome::Ignored => {
                bump(&self.stats.samples_ignored);
                tracing::trace!(channel = channel_id, ts = %timestamp, "duplicate or out-of-order sample ignored");
            }
        }
        for command in commands {
            self.worker.enqueue(command).await?;
        }
        Ok(outcome)
    }

    /// Pull path: the outcome of one analyzer poll. A failed poll marks the
    /// analyzer's channel stale and is reported as `SourceUnavailable`.
    pub async fn on_poll_result(
        &self,
        analyzer_id: &str,
        result: Result<Bytes, String>,
        at: DateTime<Utc>,
    ) -> EngineResult<UpdateOutcome> {
        let channel_id = analyzer_channel_id(analyzer_id);
        match result {
            Ok(payload) => self.on_message(&channel_id, payload, at).await,
            Err(_) if self.worker.is_stopped() => Err(EngineError::EngineStopped),
            Err(reason) => {
                bump(&self.stats.poll_failures);
                self.buffer.mark_unavailable(&channel_id, reason.clone())?;
                let first_failure = lock(&self.state)
                    .unavailable_sources
                    .insert(channel_id.clone(), at)
                    .is_none();
                if first_failure {
                    tracing::warn!(analyzer = analyzer_id, reason = %reason, "analyzer unavailable");
                }
                Err(EngineError::source_unavailable(analyzer_id, reason))
            }
        }
    }

    /// Applies silence-driven transitions up to `at`.
    pub async fn advance_to(&self, at: DateTime<Utc>) -> EngineResult<()> {
        self.worker.enqueue(LineCommand::Advance(at)).await
    }

    /// Waits for all queued line commands and returns the resulting summary.
    pub async fn flush(&self) -> EngineResult<CycleSummary> {
        self.worker.flush().await
    }

    /// One aggregator tick against the current shared state.
    pub async fn run_tick(
        &self,
        aggregator: &mut dyn Aggregator,
        now: DateTime<Utc>,
    ) -> Vec<MetricSnapshot> {
        let channels = self.buffer.snapshot(now);
        let cycle = self.worker.summary();
        let snapshots = aggregator.tick(&TickInput {
            now,
            channels: &channels,
            cycle: &cycle,
        });
        for snapshot in &snapshots {
            if let Err(err) = self.publisher.publish(snapshot.clone()).await {
                tracing::warn!(
                    aggregator = aggregator.name(),
                    kind = %snapshot.kind,
                    error = %err,
                    "snapshot publish failed"
                );
            }
        }
        snapshots
    }

    /// Writes the engine statistics as the `system_report` snapshot.
    pub async fn publish_system_report(&self, now: DateTime<Utc>) -> MetricSnapshot {
        let report = self.stats.report();
        let mut degraded = Vec::new();
        if !report.bus_connected {
            degraded.push("bus_connected".to_string());
        }
        let mut stale_channels: Vec<String> = lock(&self.state)
            .unavailable_sources
            .keys()
            .cloned()
            .collect();
        stale_channels.sort();
        let snapshot = MetricSnapshot::new(
            SnapshotKind::SystemReport,
            now,
            degraded,
            stale_channels,
            SnapshotBody::SystemReport(report),
        );
        if let Err(err) = self.publisher.publish(snapshot.clone()).await {
            tracing::warn!(error = %err, "system report publish failed");
        }
        snapshot
    }

    fn spawn_system_report(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let period = self.config.report_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        engine.publish_system_report(Utc::now()).await;
                    }
                }
            }
            tracing::debug!("system report stopped");
        })
    }

    fn spawn_aggregator(
        &self,
        mut aggregator: Box<dyn Aggregator>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(aggregator.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        engine.run_tick(aggregator.as_mut(), Utc::now()).await;
                    }
                }
            }
            tracing::debug!(aggregator = aggregator.name(), "aggregator stopped");
        })
    }

    fn spawn_poller(
        &self,
        source: Arc<dyn AnalyzerSource>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        let poll_interval = self.config.poll_interval;
        let poll_timeout = self.config.poll_timeout;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let result = match tokio::time::timeout(poll_timeout, source.poll()).await {
                            Ok(Ok(payload)) => Ok(payload),
                            Ok(Err(err)) => Err(format!("{err:#}")),
                            Err(_) => Err(format!("no response within {} ms", poll_timeout.as_millis())),
                        };
                        match engine.on_poll_result(source.id(), result, Utc::now()).await {
                            Ok(_) | Err(EngineError::SourceUnavailable { .. }) => {}
                            Err(err) => {
                                tracing::debug!(analyzer = source.id(), error = %err, "analyzer sample dropped");
                            }
                        }
                    }
                }
            }
            tracing::debug!(analyzer = source.id(), "analyzer poller stopped");
        })
    }
}

fn validate_for_role(spec: &ChannelSpec, sample: &Sample) -> EngineResult<()> {
    match spec.role {
        ChannelRole::ImpulseCounter => match sample.primary() {
            Some(value) if value >= 0.0 => Ok(()),
            _ => Err(EngineError::invalid_sample(
                &spec.id,
                "impulse counter must be a non-negative number",
            )),
        },
        ChannelRole::Dimensions => {
            if sample.values.len() >= 2 && sample.values[..2].iter().all(|v| *v >= 0.0) {
                Ok(())
            } else {
                Err(EngineError::invalid_sample(
                    &spec.id,
                    "dimensions must be [length, width] with non-negative values",
                ))
            }
        }
        ChannelRole::Value => Ok(()),
    }
}

fn commands_for(
    spec: &ChannelSpec,
    sample: &Sample,
    state: &mut IngestState,
    conversions: &Conversions,
) -> Vec<LineCommand> {
    let mut commands = Vec::new();
    match spec.role {
        ChannelRole::ImpulseCounter => {
            let value = sample.primary().unwrap_or(0.0).round() as u64;
            if let Some(step) = state.counter_step(&spec.id, value, sample.timestamp, conversions) {
                commands.push(LineCommand::Impulse {
                    at: sample.timestamp,
                    impulses: step.impulses,
                    rotation_completed: step.rotation_completed,
                });
            }
        }
        ChannelRole::Dimensions => commands.push(LineCommand::Dimensions {
            at: sample.timestamp,
            length: sample.values[0],
            width: sample.values[1],
        }),
        ChannelRole::Value => {}
    }
    if let (Some(limits), Some(value)) = (spec.limits, sample.primary()) {
        commands.push(LineCommand::Inspection {
            passed: limits.contains(value),
        });
    }
    commands
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Handles of every task spawned by [`LineEngine::start`].
pub struct EngineTasks {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    drain_timeout: Duration,
    publisher: Arc<SnapshotPublisher>,
}

impl EngineTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signals every task and waits, up to the drain timeout, for in-flight
    /// ticks to finish. Pending snapshots get one last write attempt.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let count = self.handles.len();
        let handles = self.handles;
        let aborters: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        match tokio::time::timeout(self.drain_timeout, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(err) = result {
                        tracing::warn!(error = %err, "engine task ended abnormally");
                    }
                }
                tracing::info!(tasks = count, "line engine drained");
            }
            Err(_) => {
                for aborter in aborters {
                    aborter.abort();
                }
                tracing::warn!(
                    timeout_ms = self.drain_timeout.as_millis() as u64,
                    "drain timeout elapsed; aborting remaining tasks"
                );
            }
        }
        self.publisher.retry_pending().await;
    }
}
