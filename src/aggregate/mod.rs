//! Periodic aggregators. Each one owns its accumulator state and is driven by
//! its own ticker; a tick reads a point-in-time view of the fusion buffer and
//! the cycle summary and returns the snapshots to publish.

mod flow;
mod measurement;
mod meters;
mod oee;

pub use flow::FlowAggregator;
pub use measurement::MeasurementAggregator;
pub use meters::MetersAggregator;
pub use oee::OeeAggregator;

use crate::config::EngineConfig;
use crate::cycle::CycleSummary;
use crate::fusion::FusionSnapshot;
use crate::snapshot::MetricSnapshot;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub struct TickInput<'a> {
    pub now: DateTime<Utc>,
    pub channels: &'a FusionSnapshot,
    pub cycle: &'a CycleSummary,
}

pub trait Aggregator: Send {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    fn tick(&mut self, input: &TickInput<'_>) -> Vec<MetricSnapshot>;
}

pub fn build_aggregators(config: &EngineConfig) -> Vec<Box<dyn Aggregator>> {
    vec![
        Box::new(FlowAggregator::new(config)),
        Box::new(MeasurementAggregator::new(config)),
        Box::new(MetersAggregator::new(config)),
        Box::new(OeeAggregator::new(config)),
    ]
}

/// Maps NaN to 0 and clamps into [0, 1].
pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::classifier::CycleTable;
    use crate::cycle::{CycleStateMachine, CycleSummary};
    use crate::fusion::{FusionBuffer, Sample};
    use crate::config::EngineConfig;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

    pub fn t(secs: f64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap()
            + ChronoDuration::milliseconds((secs * 1000.0) as i64)
    }

    pub fn buffer(config: &EngineConfig) -> FusionBuffer {
        FusionBuffer::new(
            config.idle_timeout,
            config
                .channels
                .iter()
                .map(|spec| (spec.id.clone(), spec.kind, spec.stale_policy)),
        )
    }

    pub fn put(buffer: &FusionBuffer, config: &EngineConfig, channel: &str, values: Vec<f64>, at: f64) {
        let kind = config.channel(channel).unwrap().kind;
        buffer.update(channel, Sample::new(kind, values, t(at))).unwrap();
    }

    pub fn machine(config: &EngineConfig) -> CycleStateMachine {
        CycleStateMachine::new(
            CycleTable::default(),
            config.idle_timeout,
            config.max_changeover,
            config.element_window,
            t(0.0),
        )
    }

    pub fn idle_summary(config: &EngineConfig, at: f64) -> CycleSummary {
        machine(config).summary(t(at))
    }
}
