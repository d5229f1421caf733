use crate::classifier::Classification;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineState {
    Idle,
    Running,
    Changeover,
}

impl LineState {
    pub fn as_str(self) -> &'static str {
        match self {
            LineState::Idle => "idle",
            LineState::Running => "running",
            LineState::Changeover => "changeover",
        }
    }
}

/// Cycle currently being timed. Its target is fixed when it opens.
#[derive(Debug, Clone, Serialize)]
pub struct ProductionCycle {
    pub started_at: DateTime<Utc>,
    pub impulses: u64,
    pub target: Classification,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedCycle {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub impulses: u64,
    pub target: Classification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DowntimeKind {
    Idle,
    Changeover,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DowntimeEvent {
    pub kind: DowntimeKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Started,
    CycleClosed(ClosedCycle),
    WentIdle { silent_since: DateTime<Utc> },
    ChangeoverDetected { silent_since: DateTime<Utc> },
    Resumed(DowntimeEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImpulseOutcome {
    Applied(Vec<Transition>),
    /// Timestamp not newer than the last applied event.
    Rejected,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleTotals {
    pub cycles_closed: u64,
    pub impulses: u64,
    pub idle_stops: u64,
    pub changeovers: u64,
    pub idle_secs: f64,
    pub changeover_secs: f64,
    pub inspected: u64,
    pub passed: u64,
}

/// Point-in-time view of the state machine handed to the aggregators.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub as_of: DateTime<Utc>,
    pub scheduled_since: DateTime<Utc>,
    pub idle_timeout_secs: f64,
    pub state: LineState,
    pub last_event_at: Option<DateTime<Utc>>,
    pub current_target: Classification,
    pub current_cycle: Option<ProductionCycle>,
    pub totals: CycleTotals,
    pub window_len: usize,
    pub window_mean_secs: Option<f64>,
    pub window_median_secs: Option<f64>,
    pub actual_rate_lpm: Option<f64>,
    pub performance: Option<f64>,
    pub recent_cycles: Vec<ClosedCycle>,
    pub recent_downtime: Vec<DowntimeEvent>,
}

impl CycleSummary {
    /// Recorded downtime plus the stall still in progress at `now`.
    pub fn downtime_secs_at(&self, now: DateTime<Utc>) -> f64 {
        let recorded = self.totals.idle_secs + self.totals.changeover_secs;
        let ongoing = match (self.state, self.last_event_at) {
            (LineState::Idle | LineState::Changeover, Some(last)) => {
                seconds(now.max(last) - last)
            }
            // Nothing produced yet; waiting counts once it outlasts the idle timeout.
            (LineState::Idle | LineState::Changeover, None) => {
                let waited = self.scheduled_secs_at(now);
                if waited > self.idle_timeout_secs {
                    waited
                } else {
                    0.0
                }
            }
            (LineState::Running, _) => 0.0,
        };
        recorded + ongoing
    }

    pub fn scheduled_secs_at(&self, now: DateTime<Utc>) -> f64 {
        seconds(now.max(self.scheduled_since) - self.scheduled_since)
    }
}

pub(crate) fn seconds(duration: ChronoDuration) -> f64 {
    duration.num_milliseconds() as f64 / 1000.0
}
