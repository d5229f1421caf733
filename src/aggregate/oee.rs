use super::{clamp_unit, Aggregator, TickInput};
use crate::config::EngineConfig;
use crate::conversion::Conversions;
use crate::snapshot::{
    MetricSnapshot, OeeDetail, OeeMetrics, ProductionSummary, SnapshotBody, SnapshotKind,
};
use std::time::Duration;

/// Derives availability, performance and quality from the cycle summary.
///
/// Each factor that cannot be computed falls back to the neutral value 1.0
/// and is listed in the snapshot's `degraded` fields:
/// * availability, when no scheduled time has elapsed yet;
/// * performance, when the element window holds no closed cycle;
/// * quality, when nothing has been inspected.
///
/// One tick emits the headline metrics, the production summary and the
/// cycle detail.
pub struct OeeAggregator {
    interval: Duration,
    conversions: Conversions,
}

impl OeeAggregator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            interval: config.oee_interval,
            conversions: config.conversions.clone(),
        }
    }
}

impl Aggregator for OeeAggregator {
    fn name(&self) -> &'static str {
        "oee"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn tick(&mut self, input: &TickInput<'_>) -> Vec<MetricSnapshot> {
        let cycle = input.cycle;
        let now = input.now;
        let mut degraded = Vec::new();

        let scheduled_secs = cycle.scheduled_secs_at(now);
        let downtime_secs = cycle.downtime_secs_at(now).min(scheduled_secs);
        let availability = if scheduled_secs > 0.0 {
            clamp_unit((scheduled_secs - downtime_secs) / scheduled_secs)
        } else {
            degraded.push("availability".to_string());
            1.0
        };

        let performance = match cycle.performance {
            Some(value) => clamp_unit(value),
            None => {
                degraded.push("performance".to_string());
                1.0
            }
        };

        let quality = if cycle.totals.inspected > 0 {
            clamp_unit(cycle.totals.passed as f64 / cycle.totals.inspected as f64)
        } else {
            degraded.push("quality".to_string());
            1.0
        };

        if cycle.current_target.fallback {
            degraded.push("target_lpm".to_string());
        }

        let oee = clamp_unit(availability * performance * quality);
        tracing::debug!(
            availability,
            performance,
            quality,
            oee,
            state = cycle.state.as_str(),
            "oee tick"
        );

        let stale_channels = input.channels.stale_channels();
        let metrics = MetricSnapshot::new(
            SnapshotKind::Oee,
            now,
            degraded.clone(),
            stale_channels.clone(),
            SnapshotBody::Oee(OeeMetrics {
                availability,
                performance,
                quality,
                oee,
                oee_percent: oee * 100.0,
                state: cycle.state,
                target_lpm: cycle.current_target.cycle_lpm,
                actual_rate_lpm: cycle.actual_rate_lpm,
                scheduled_secs,
                downtime_secs,
            }),
        );

        let totals = &cycle.totals;
        let summary = MetricSnapshot::new(
            SnapshotKind::OeeSummary,
            now,
            degraded.clone(),
            stale_channels.clone(),
            SnapshotBody::OeeSummary(ProductionSummary {
                state: cycle.state,
                last_event_at: cycle.last_event_at,
                cycles_closed: totals.cycles_closed,
                impulses: totals.impulses,
                rotations: self.conversions.rotations(totals.impulses),
                idle_stops: totals.idle_stops,
                changeovers: totals.changeovers,
                idle_secs: totals.idle_secs,
                changeover_secs: totals.changeover_secs,
                inspected: totals.inspected,
                passed: totals.passed,
                target_lpm: cycle.current_target.cycle_lpm,
                classification_fallback: cycle.current_target.fallback,
            }),
        );

        let detail = MetricSnapshot::new(
            SnapshotKind::OeeDetail,
            now,
            degraded,
            stale_channels,
            SnapshotBody::OeeDetail(OeeDetail {
                current_cycle: cycle.current_cycle.clone(),
                window_len: cycle.window_len,
                window_mean_secs: cycle.window_mean_secs,
                window_median_secs: cycle.window_median_secs,
                recent_cycles: cycle.recent_cycles.clone(),
                recent_downtime: cycle.recent_downtime.clone(),
            }),
        );

        vec![metrics, summary, detail]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_support::{buffer, idle_summary, machine, t};
    use crate::cycle::LineState;

    fn metrics(snapshots: &[MetricSnapshot]) -> &OeeMetrics {
        snapshots
            .iter()
            .find_map(|snapshot| match &snapshot.body {
                SnapshotBody::Oee(body) => Some(body),
                _ => None,
            })
            .expect("oee metrics snapshot")
    }

    #[test]
    fn emits_metrics_summary_and_detail() {
        let config = EngineConfig::default();
        let buf = buffer(&config);
        let summary = idle_summary(&config, 10.0);
        let snap = buf.snapshot(t(10.0));
        let mut agg = OeeAggregator::new(&config);

        let out = agg.tick(&TickInput { now: t(10.0), channels: &snap, cycle: &summary });
        let kinds: Vec<SnapshotKind> = out.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![SnapshotKind::Oee, SnapshotKind::OeeSummary, SnapshotKind::OeeDetail]
        );
    }

    #[test]
    fn steady_run_at_target_is_fully_effective() {
        let config = EngineConfig::default();
        let mut sm = machine(&config);
        // No dimensions: the 14 cycles/min fallback gives an ideal of 60/14 s.
        let ideal = 60.0 / 14.0;
        for i in 0..5 {
            sm.on_impulse(t(i as f64 * ideal), 8);
        }
        sm.record_inspection(true);
        sm.record_inspection(true);
        let now = t(4.0 * ideal + 0.5);
        let summary = sm.summary(now);
        let snap = buffer(&config).snapshot(now);
        let mut agg = OeeAggregator::new(&config);

        let out = agg.tick(&TickInput { now, channels: &snap, cycle: &summary });
        let body = metrics(&out);
        assert_eq!(body.availability, 1.0);
        assert!((body.performance - 1.0).abs() < 1e-2);
        assert_eq!(body.quality, 1.0);
        assert_eq!(body.state, LineState::Running);
        assert!(out[0].degraded.contains(&"target_lpm".to_string()));
        assert!(!out[0].degraded.contains(&"performance".to_string()));
    }

    #[test]
    fn missing_inputs_degrade_to_neutral_values() {
        let config = EngineConfig::default();
        let summary = idle_summary(&config, 0.0);
        let snap = buffer(&config).snapshot(t(0.0));
        let mut agg = OeeAggregator::new(&config);

        let out = agg.tick(&TickInput { now: t(0.0), channels: &snap, cycle: &summary });
        let body = metrics(&out);
        assert_eq!(body.availability, 1.0);
        assert_eq!(body.performance, 1.0);
        assert_eq!(body.quality, 1.0);
        for field in ["availability", "performance", "quality"] {
            assert!(out[0].degraded.contains(&field.to_string()), "{field}");
        }
    }

    #[test]
    fn factors_stay_within_unit_interval() {
        let config = EngineConfig::default();
        let mut sm = machine(&config);
        // Cycles far faster than target push raw performance above 1.
        for i in 0..4 {
            sm.on_impulse(t(i as f64), 8);
        }
        sm.record_inspection(false);
        let now = t(3.5);
        let summary = sm.summary(now);
        let snap = buffer(&config).snapshot(now);
        let mut agg = OeeAggregator::new(&config);

        let out = agg.tick(&TickInput { now, channels: &snap, cycle: &summary });
        let body = metrics(&out);
        assert_eq!(body.performance, 1.0);
        assert_eq!(body.quality, 0.0);
        assert_eq!(body.oee, 0.0);
        assert!((0.0..=1.0).contains(&body.availability));
    }

    #[test]
    fn idle_gap_reduces_availability() {
        let config = EngineConfig::default();
        let mut sm = machine(&config);
        sm.on_impulse(t(0.0), 8);
        sm.on_impulse(t(4.0), 8);
        sm.advance(t(20.0));
        sm.on_impulse(t(24.0), 8);
        let now = t(40.0);
        sm.advance(now);
        let summary = sm.summary(now);
        let snap = buffer(&config).snapshot(now);
        let mut agg = OeeAggregator::new(&config);

        let out = agg.tick(&TickInput { now, channels: &snap, cycle: &summary });
        let body = metrics(&out);
        // 20 s gap (4 → 24) plus the ongoing 16 s stall (24 → 40) out of 40 s.
        assert!((body.downtime_secs - 36.0).abs() < 1e-9);
        assert!((body.availability - 0.1).abs() < 1e-9);
    }
}
