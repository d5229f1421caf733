use super::types::{
    seconds, ClosedCycle, CycleSummary, CycleTotals, DowntimeEvent, DowntimeKind, ImpulseOutcome,
    LineState, ProductionCycle, Transition,
};
use super::window::ElementWindow;
use crate::classifier::{Classification, CycleTable};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;

const RECENT_DOWNTIME: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Dimensions {
    length: f64,
    width: f64,
    at: DateTime<Utc>,
}

/// Tracks line state from impulse events.
///
/// Silence is measured from the last applied impulse. A silence longer than
/// the idle timeout puts the line in `Idle` and abandons the open cycle; a
/// silence longer than the maximum changeover duration escalates to
/// `Changeover`. The next impulse resolves the stall into a downtime event
/// of the matching kind and opens a fresh cycle. Event timestamps must be
/// strictly increasing; anything else is rejected.
#[derive(Debug)]
pub struct CycleStateMachine {
    table: CycleTable,
    idle_timeout: ChronoDuration,
    max_changeover: ChronoDuration,
    scheduled_since: DateTime<Utc>,
    state: LineState,
    last_event_at: Option<DateTime<Utc>>,
    current: Option<ProductionCycle>,
    dimensions: Option<Dimensions>,
    window: ElementWindow,
    totals: CycleTotals,
    recent_downtime: VecDeque<DowntimeEvent>,
}

impl CycleStateMachine {
    pub fn new(
        table: CycleTable,
        idle_timeout: std::time::Duration,
        max_changeover: std::time::Duration,
        window_size: usize,
        scheduled_since: DateTime<Utc>,
    ) -> Self {
        let idle_timeout =
            ChronoDuration::from_std(idle_timeout).unwrap_or_else(|_| ChronoDuration::seconds(5));
        let max_changeover = ChronoDuration::from_std(max_changeover)
            .unwrap_or_else(|_| ChronoDuration::seconds(600));
        Self {
            table,
            idle_timeout,
            max_changeover: max_changeover.max(idle_timeout),
            scheduled_since,
            state: LineState::Idle,
            last_event_at: None,
            current: None,
            dimensions: None,
            window: ElementWindow::new(window_size),
            totals: CycleTotals::default(),
            recent_downtime: VecDeque::with_capacity(RECENT_DOWNTIME),
        }
    }

    pub fn state(&self) -> LineState {
        self.state
    }

    pub fn window(&self) -> &ElementWindow {
        &self.window
    }

    pub fn totals(&self) -> &CycleTotals {
        &self.totals
    }

    pub fn current_cycle(&self) -> Option<&ProductionCycle> {
        self.current.as_ref()
    }

    pub fn recent_downtime(&self) -> impl Iterator<Item = &DowntimeEvent> {
        self.recent_downtime.iter()
    }

    /// Target a cycle opened now would get.
    pub fn next_target(&self) -> Classification {
        self.table
            .classify_dimensions(self.dimensions.map(|dims| (dims.length, dims.width)))
    }

    /// Applies silence-driven transitions up to `now`.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Vec<Transition> {
        let mut transitions = Vec::new();
        let Some(last) = self.last_event_at else {
            return transitions;
        };
        let silence = now - last;

        if self.state == LineState::Running && silence > self.idle_timeout {
            self.state = LineState::Idle;
            if let Some(abandoned) = self.current.take() {
                tracing::debug!(
                    started_at = %abandoned.started_at,
                    impulses = abandoned.impulses,
                    "open cycle abandoned on idle"
                );
            }
            transitions.push(Transition::WentIdle { silent_since: last });
        }

        if self.state == LineState::Idle && silence > self.max_changeover {
            self.state = LineState::Changeover;
            // A changeover means the product switched; old dimensions no longer apply.
            self.dimensions = None;
            transitions.push(Transition::ChangeoverDetected { silent_since: last });
        }

        transitions
    }

    /// Impulses that complete a rotation: the cycle boundary.
    pub fn on_impulse(&mut self, at: DateTime<Utc>, impulses: u64) -> ImpulseOutcome {
        self.apply_impulses(at, impulses, true)
    }

    /// Impulses that do not complete a rotation. They keep the line running
    /// and count towards the open cycle without closing it.
    pub fn on_partial_rotation(&mut self, at: DateTime<Utc>, impulses: u64) -> ImpulseOutcome {
        self.apply_impulses(at, impulses, false)
    }

    fn apply_impulses(
        &mut self,
        at: DateTime<Utc>,
        impulses: u64,
        boundary: bool,
    ) -> ImpulseOutcome {
        if let Some(last) = self.last_event_at {
            if at <= last {
                return ImpulseOutcome::Rejected;
            }
        }

        let mut transitions = self.advance(at);
        self.totals.impulses = self.totals.impulses.saturating_add(impulses);

        match (self.state, self.last_event_at) {
            (LineState::Running, _) => {
                if boundary {
                    if let Some(closed) = self.close_current(at) {
                        transitions.push(Transition::CycleClosed(closed));
                    }
                }
            }
            (LineState::Idle, None) => {
                if at - self.scheduled_since > self.idle_timeout {
                    self.record_downtime(DowntimeKind::Idle, self.scheduled_since, at);
                }
                transitions.push(Transition::Started);
            }
            (LineState::Idle, Some(last)) => {
                let event = self.record_downtime(DowntimeKind::Idle, last, at);
                transitions.push(Transition::Resumed(event));
            }
            (LineState::Changeover, Some(last)) => {
                let event = self.record_downtime(DowntimeKind::Changeover, last, at);
                transitions.push(Transition::Resumed(event));
            }
            (LineState::Changeover, None) => {
                transitions.push(Transition::Started);
            }
        }

        self.state = LineState::Running;
        self.last_event_at = Some(at);
        if boundary {
            self.current = Some(ProductionCycle {
                started_at: at,
                impulses,
                target: self.next_target(),
            });
        } else if let Some(cycle) = self.current.as_mut() {
            cycle.impulses = cycle.impulses.saturating_add(impulses);
        }

        ImpulseOutcome::Applied(transitions)
    }

    /// New product dimensions take effect from the next cycle boundary.
    pub fn set_dimensions(&mut self, at: DateTime<Utc>, length: f64, width: f64) -> bool {
        if !length.is_finite() || !width.is_finite() || length < 0.0 || width < 0.0 {
            return false;
        }
        if let Some(current) = self.dimensions {
            if at <= current.at {
                return false;
            }
        }
        self.dimensions = Some(Dimensions { length, width, at });
        true
    }

    pub fn record_inspection(&mut self, passed: bool) {
        self.totals.inspected = self.totals.inspected.saturating_add(1);
        if passed {
            self.totals.passed = self.totals.passed.saturating_add(1);
        }
    }

    pub fn summary(&self, now: DateTime<Utc>) -> CycleSummary {
        CycleSummary {
            as_of: now,
            scheduled_since: self.scheduled_since,
            idle_timeout_secs: seconds(self.idle_timeout),
            state: self.state,
            last_event_at: self.last_event_at,
            current_target: self
                .current
                .as_ref()
                .map(|cycle| cycle.target)
                .unwrap_or_else(|| self.next_target()),
            current_cycle: self.current.clone(),
            totals: self.totals.clone(),
            window_len: self.window.len(),
            window_mean_secs: self.window.mean_duration_secs(),
            window_median_secs: self.window.median_duration_secs(),
            actual_rate_lpm: self.window.actual_rate_lpm(),
            performance: self.window.performance(),
            recent_cycles: self.window.iter().cloned().collect(),
            recent_downtime: self.recent_downtime.iter().cloned().collect(),
        }
    }

    fn close_current(&mut self, at: DateTime<Utc>) -> Option<ClosedCycle> {
        let cycle = self.current.take()?;
        let closed = ClosedCycle {
            started_at: cycle.started_at,
            ended_at: at,
            duration_secs: seconds(at - cycle.started_at),
            impulses: cycle.impulses,
            target: cycle.target,
        };
        self.totals.cycles_closed = self.totals.cycles_closed.saturating_add(1);
        self.window.push(closed.clone());
        Some(closed)
    }

    fn record_downtime(
        &mut self,
        kind: DowntimeKind,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> DowntimeEvent {
        let duration_secs = seconds(ended_at - started_at);
        match kind {
            DowntimeKind::Idle => {
                self.totals.idle_stops = self.totals.idle_stops.saturating_add(1);
                self.totals.idle_secs += duration_secs;
            }
            DowntimeKind::Changeover => {
                self.totals.changeovers = self.totals.changeovers.saturating_add(1);
                self.totals.changeover_secs += duration_secs;
            }
        }
        let event = DowntimeEvent {
            kind,
            started_at,
            ended_at,
            duration_secs,
        };
        if self.recent_downtime.len() == RECENT_DOWNTIME {
            self.recent_downtime.pop_front();
        }
        self.recent_downtime.push_back(event.clone());
        event
    }
}
