use crate::cycle::{CycleStateMachine, CycleSummary, ImpulseOutcome, Transition};
use crate::error::{EngineError, EngineResult};
use crate::stats::{bump, EngineStats};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum LineCommand {
    Impulse {
        at: DateTime<Utc>,
        impulses: u64,
        rotation_completed: bool,
    },
    Dimensions { at: DateTime<Utc>, length: f64, width: f64 },
    Inspection { passed: bool },
    Advance(DateTime<Utc>),
    Flush(oneshot::Sender<CycleSummary>),
}

/// Sending side of the state machine worker. Every mutation of the cycle
/// state goes through this queue, so events are applied one at a time in
/// arrival order.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<LineCommand>,
    summary: watch::Receiver<CycleSummary>,
    stats: Arc<EngineStats>,
}

impl WorkerHandle {
    pub fn summary(&self) -> CycleSummary {
        self.summary.borrow().clone()
    }

    pub async fn enqueue(&self, command: LineCommand) -> EngineResult<()> {
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, ?command, "queued line command");
        if self.tx.send(command).await.is_err() {
            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(EngineError::EngineStopped);
        }
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }

    /// Waits until every command queued before this call has been applied.
    pub async fn flush(&self) -> EngineResult<CycleSummary> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(LineCommand::Flush(tx)).await?;
        rx.await.map_err(|_| EngineError::EngineStopped)
    }
}

/// Time base of the state machine. Event timestamps come from the devices,
/// so silence is measured from the newest event time plus the wall-clock
/// time elapsed since that event was applied.
#[derive(Debug, Clone, Copy)]
struct LineClock {
    event_at: DateTime<Utc>,
    applied_at: Instant,
}

impl LineClock {
    fn new(event_at: DateTime<Utc>) -> Self {
        Self {
            event_at,
            applied_at: Instant::now(),
        }
    }

    fn observe(&mut self, event_at: DateTime<Utc>) {
        *self = Self::new(event_at);
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = ChronoDuration::from_std(self.applied_at.elapsed())
            .unwrap_or_else(|_| ChronoDuration::zero());
        self.event_at + elapsed
    }
}

pub struct LineWorker {
    machine: CycleStateMachine,
    clock: LineClock,
    rx: mpsc::Receiver<LineCommand>,
    summary: watch::Sender<CycleSummary>,
    stats: Arc<EngineStats>,
    tick_interval: Duration,
}

pub fn channel(
    machine: CycleStateMachine,
    capacity: usize,
    tick_interval: Duration,
    stats: Arc<EngineStats>,
    now: DateTime<Utc>,
) -> (WorkerHandle, LineWorker) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (summary_tx, summary_rx) = watch::channel(machine.summary(now));
    let handle = WorkerHandle {
        tx,
        summary: summary_rx,
        stats: stats.clone(),
    };
    let worker = LineWorker {
        machine,
        clock: LineClock::new(now),
        rx,
        summary: summary_tx,
        stats,
        tick_interval,
    };
    (handle, worker)
}

impl LineWorker {
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.tick_interval.max(Duration::from_millis(1));
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.drain();
                        break;
                    }
                    _ = ticker.tick() => {
                        let now = self.clock.now();
                        self.advance(now);
                    }
                    cmd = self.rx.recv() => {
                        match cmd {
                            Some(cmd) => self.apply(cmd),
                            None => break,
                        }
                    }
                }
            }
            tracing::debug!(state = self.machine.state().as_str(), "line worker stopped");
        })
    }

    fn drain(&mut self) {
        self.rx.close();
        let mut drained = 0usize;
        while let Ok(cmd) = self.rx.try_recv() {
            self.apply(cmd);
            drained += 1;
        }
        if drained > 0 {
            tracing::debug!(drained, "applied queued line commands during shutdown");
        }
    }

    fn apply(&mut self, command: LineCommand) {
        self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
        match command {
            LineCommand::Impulse {
                at,
                impulses,
                rotation_completed,
            } => match self.on_impulse(at, impulses, rotation_completed) {
                ImpulseOutcome::Applied(transitions) => {
                    self.clock.observe(at);
                    self.stats.impulses.fetch_add(impulses, Ordering::Relaxed);
                    log_transitions(&transitions);
                    self.publish(at);
                }
                ImpulseOutcome::Rejected => {
                    bump(&self.stats.impulses_rejected);
                    tracing::debug!(at = %at, impulses, "out-of-order impulse rejected");
                }
            },
            LineCommand::Dimensions { at, length, width } => {
                if self.machine.set_dimensions(at, length, width) {
                    let target = self.machine.next_target();
                    tracing::debug!(length, width, cycle_lpm = target.cycle_lpm, "product dimensions updated");
                    self.publish(at);
                } else {
                    tracing::debug!(at = %at, length, width, "product dimensions ignored");
                }
            }
            LineCommand::Inspection { passed } => {
                self.machine.record_inspection(passed);
                let now = self.summary.borrow().as_of;
                self.publish(now);
            }
            LineCommand::Advance(at) => {
                self.clock.observe(at);
                self.advance(at);
            }
            LineCommand::Flush(done) => {
                let _ = done.send(self.summary.borrow().clone());
            }
        }
    }

    fn on_impulse(
        &mut self,
        at: DateTime<Utc>,
        impulses: u64,
        rotation_completed: bool,
    ) -> ImpulseOutcome {
        if rotation_completed {
            self.machine.on_impulse(at, impulses)
        } else {
            self.machine.on_partial_rotation(at, impulses)
        }
    }

    fn advance(&mut self, now: DateTime<Utc>) {
        let transitions = self.machine.advance(now);
        log_transitions(&transitions);
        self.publish(now);
    }

    fn publish(&self, as_of: DateTime<Utc>) {
        self.summary.send_replace(self.machine.summary(as_of));
    }
}

fn log_transitions(transitions: &[Transition]) {
    for transition in transitions {
        match transition {
            Transition::Started => tracing::info!("line started"),
            Transition::CycleClosed(cycle) => tracing::debug!(
                duration_secs = cycle.duration_secs,
                cycle_lpm = cycle.target.cycle_lpm,
                impulses = cycle.impulses,
                "cycle closed"
            ),
            Transition::WentIdle { silent_since } => {
                tracing::info!(silent_since = %silent_since, "line idle")
            }
            Transition::ChangeoverDetected { silent_since } => {
                tracing::info!(silent_since = %silent_since, "changeover detected")
            }
            Transition::Resumed(event) => tracing::info!(
                kind = ?event.kind,
                duration_secs = event.duration_secs,
                "line resumed"
            ),
        }
    }
}
