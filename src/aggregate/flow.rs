use super::{Aggregator, TickInput};
use crate::config::EngineConfig;
use crate::conversion::Conversions;
use crate::fusion::ChannelKind;
use crate::snapshot::{FlowPort, FlowTotals, MetricSnapshot, SnapshotBody, SnapshotKind};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// Integrates per-port flow rates (units per minute) into running totals.
pub struct FlowAggregator {
    interval: Duration,
    ports: Vec<String>,
    conversions: Conversions,
    totals: HashMap<String, f64>,
    last_tick: Option<DateTime<Utc>>,
}

impl FlowAggregator {
    pub fn new(config: &EngineConfig) -> Self {
        let ports = config
            .channels_of(ChannelKind::Flow)
            .take(config.flow_device_count)
            .map(|spec| spec.id.clone())
            .collect();
        Self {
            interval: config.flow_interval,
            ports,
            conversions: config.conversions.clone(),
            totals: HashMap::new(),
            last_tick: None,
        }
    }
}

impl Aggregator for FlowAggregator {
    fn name(&self) -> &'static str {
        "flow"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn tick(&mut self, input: &TickInput<'_>) -> Vec<MetricSnapshot> {
        let elapsed_secs = self
            .last_tick
            .map(|last| (input.now - last).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        self.last_tick = Some(input.now);

        let mut ports = Vec::with_capacity(self.ports.len());
        let mut degraded = Vec::new();
        let mut stale_channels = Vec::new();
        for channel in &self.ports {
            let reading = input.channels.get(channel);
            let stale = reading.map(|r| r.stale).unwrap_or(true);
            let raw = reading.and_then(|r| r.primary()).unwrap_or(0.0);
            let rate = if raw.is_finite() {
                self.conversions.flow(raw)
            } else {
                0.0
            };
            if stale {
                degraded.push(format!("{channel}.rate"));
                stale_channels.push(channel.clone());
            }
            let total = self.totals.entry(channel.clone()).or_insert(0.0);
            *total += rate * elapsed_secs / 60.0;
            ports.push(FlowPort {
                channel: channel.clone(),
                rate,
                total: *total,
                stale,
            });
        }

        let total_rate = ports.iter().map(|port| port.rate).sum();
        let total_volume = ports.iter().map(|port| port.total).sum();
        tracing::debug!(total_rate, total_volume, stale = stale_channels.len(), "flow tick");

        vec![MetricSnapshot::new(
            SnapshotKind::Flow,
            input.now,
            degraded,
            stale_channels,
            SnapshotBody::Flow(FlowTotals {
                ports,
                total_rate,
                total_volume,
                elapsed_secs,
            }),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_support::{buffer, idle_summary, put, t};
    use std::sync::Arc;

    fn flow_body(snapshot: &MetricSnapshot) -> &FlowTotals {
        match &snapshot.body {
            SnapshotBody::Flow(body) => body,
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn totals_integrate_rate_over_tick_interval() {
        let config = EngineConfig::default();
        let buf = buffer(&config);
        let mut agg = FlowAggregator::new(&config);
        for port in ["master1/port3", "master1/port4", "master2/port0", "master2/port1", "master2/port2"] {
            put(&buf, &config, port, vec![6.0], 0.0);
        }
        let summary = idle_summary(&config, 0.0);

        let snap = buf.snapshot(t(0.0));
        let first = agg.tick(&TickInput { now: t(0.0), channels: &snap, cycle: &summary });
        assert_eq!(flow_body(&first[0]).total_volume, 0.0);

        for port in ["master1/port3", "master1/port4", "master2/port0", "master2/port1", "master2/port2"] {
            put(&buf, &config, port, vec![6.0], 9.0);
        }
        let snap = buf.snapshot(t(10.0));
        let second = agg.tick(&TickInput { now: t(10.0), channels: &snap, cycle: &summary });
        let body = flow_body(&second[0]);
        assert_eq!(body.elapsed_secs, 10.0);
        assert!((body.ports[0].total - 1.0).abs() < 1e-9);
        assert!((body.total_volume - 5.0).abs() < 1e-9);
        assert_eq!(body.total_rate, 30.0);
        assert!(!second[0].is_degraded());
        assert_eq!(second[0].kind, SnapshotKind::Flow);
    }

    #[test]
    fn stale_port_contributes_zero_and_is_flagged() {
        let config = EngineConfig::default();
        let buf = buffer(&config);
        let mut agg = FlowAggregator::new(&config);
        put(&buf, &config, "master1/port3", vec![12.0], 0.0);
        let summary = idle_summary(&config, 0.0);

        let snap = buf.snapshot(t(0.0));
        agg.tick(&TickInput { now: t(0.0), channels: &snap, cycle: &summary });
        let snap = buf.snapshot(t(10.0));
        let out = agg.tick(&TickInput { now: t(10.0), channels: &snap, cycle: &summary });
        let body = flow_body(&out[0]);
        assert_eq!(body.ports[0].rate, 0.0);
        assert!(body.ports[0].stale);
        assert!(out[0].stale_channels.contains(&"master1/port3".to_string()));
        assert!(out[0].degraded.contains(&"master1/port3.rate".to_string()));
    }

    #[test]
    fn flow_conversion_hook_is_applied() {
        let mut config = EngineConfig::default();
        config.conversions.flow = Arc::new(|value| value * 2.0);
        let buf = buffer(&config);
        let mut agg = FlowAggregator::new(&config);
        put(&buf, &config, "master1/port3", vec![3.0], 0.0);
        let summary = idle_summary(&config, 0.0);
        let snap = buf.snapshot(t(1.0));
        let out = agg.tick(&TickInput { now: t(1.0), channels: &snap, cycle: &summary });
        assert_eq!(flow_body(&out[0]).ports[0].rate, 6.0);
    }
}
