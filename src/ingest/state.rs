use crate::conversion::Conversions;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

const ROTATION_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
pub(in crate::ingest) struct CounterReading {
    pub(in crate::ingest) value: u64,
    pub(in crate::ingest) at: DateTime<Utc>,
}

/// Counter progress towards the next full rotation.
#[derive(Debug, Clone, Copy, Default)]
pub(in crate::ingest) struct RotationProgress {
    pub(in crate::ingest) rotations: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(in crate::ingest) struct CounterStep {
    pub(in crate::ingest) impulses: u64,
    pub(in crate::ingest) rotation_completed: bool,
}

#[derive(Debug, Default)]
pub(in crate::ingest) struct IngestState {
    pub(in crate::ingest) counters: HashMap<String, CounterReading>,
    pub(in crate::ingest) rotations: HashMap<String, RotationProgress>,
    pub(in crate::ingest) unavailable_sources: HashMap<String, DateTime<Utc>>,
}

impl IngestState {
    pub(in crate::ingest) fn new() -> Self {
        Self::default()
    }

    /// Impulses since the previous reading of a cumulative counter.
    ///
    /// The first reading only sets the baseline. A decrease means the
    /// device counter was reset, so the new value is the delta.
    pub(in crate::ingest) fn counter_delta(
        &mut self,
        channel: &str,
        value: u64,
        at: DateTime<Utc>,
    ) -> Option<u64> {
        let previous = self
            .counters
            .insert(channel.to_string(), CounterReading { value, at });
        let previous = previous?;
        if at <= previous.at {
            self.counters.insert(channel.to_string(), previous);
            return None;
        }
        let delta = if value >= previous.value {
            value - previous.value
        } else {
            tracing::info!(channel, previous = previous.value, value, "impulse counter reset");
            value
        };
        (delta > 0).then_some(delta)
    }

    /// Counter delta converted to rotations. A step is a cycle boundary only
    /// when it completes at least one rotation; the fraction left over is
    /// carried into the next step.
    pub(in crate::ingest) fn counter_step(
        &mut self,
        channel: &str,
        value: u64,
        at: DateTime<Utc>,
        conversions: &Conversions,
    ) -> Option<CounterStep> {
        let impulses = self.counter_delta(channel, value, at)?;
        let progress = self.rotations.entry(channel.to_string()).or_default();
        progress.rotations += conversions.rotations(impulses);
        let whole = (progress.rotations + ROTATION_EPSILON).floor();
        let rotation_completed = whole >= 1.0;
        if rotation_completed {
            progress.rotations = (progress.rotations - whole).max(0.0);
        }
        Some(CounterStep {
            impulses,
            rotation_completed,
        })
    }
}
