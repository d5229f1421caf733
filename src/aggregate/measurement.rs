use super::{Aggregator, TickInput};
use crate::config::{EngineConfig, ToleranceLimits};
use crate::fusion::ChannelKind;
use crate::snapshot::{DeviceReading, MeasurementReport, MetricSnapshot, SnapshotBody, SnapshotKind};
use std::time::Duration;

struct Device {
    channel: String,
    limits: Option<ToleranceLimits>,
}

/// Reports the latest reading of every measurement device and analyzer.
pub struct MeasurementAggregator {
    interval: Duration,
    devices: Vec<Device>,
}

impl MeasurementAggregator {
    pub fn new(config: &EngineConfig) -> Self {
        let measurement = config
            .channels_of(ChannelKind::Measurement)
            .take(config.measurement_device_count);
        let devices = measurement
            .chain(config.channels_of(ChannelKind::Analyzer))
            .map(|spec| Device {
                channel: spec.id.clone(),
                limits: spec.limits,
            })
            .collect();
        Self {
            interval: config.measurement_interval,
            devices,
        }
    }
}

impl Aggregator for MeasurementAggregator {
    fn name(&self) -> &'static str {
        "measurement"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn tick(&mut self, input: &TickInput<'_>) -> Vec<MetricSnapshot> {
        let mut degraded = Vec::new();
        let mut stale_channels = Vec::new();
        let devices = self
            .devices
            .iter()
            .filter_map(|device| {
                let reading = input.channels.get(&device.channel)?;
                if reading.stale {
                    stale_channels.push(device.channel.clone());
                    degraded.push(format!("{}.values", device.channel));
                }
                let in_tolerance = match (device.limits, reading.primary()) {
                    (Some(limits), Some(value)) => Some(limits.contains(value)),
                    _ => None,
                };
                Some(DeviceReading {
                    channel: device.channel.clone(),
                    kind: reading.kind,
                    values: reading.values.clone(),
                    stale: reading.stale,
                    age_ms: reading.age_ms,
                    in_tolerance,
                })
            })
            .collect();

        vec![MetricSnapshot::new(
            SnapshotKind::Measurement,
            input.now,
            degraded,
            stale_channels,
            SnapshotBody::Measurement(MeasurementReport {
                devices,
                inspected: input.cycle.totals.inspected,
                passed: input.cycle.totals.passed,
            }),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_support::{buffer, idle_summary, put, t};

    fn report(snapshot: &MetricSnapshot) -> &MeasurementReport {
        match &snapshot.body {
            SnapshotBody::Measurement(body) => body,
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn analyzer_readings_carry_tolerance_verdict() {
        let mut config = EngineConfig::default();
        for spec in config.channels.iter_mut() {
            if spec.id == "analyzer/192.168.1.130" {
                spec.limits = Some(ToleranceLimits { min: 18.0, max: 22.0 });
            }
        }
        let buf = buffer(&config);
        put(&buf, &config, "analyzer/192.168.1.130", vec![23.5, 0.2], 0.0);
        put(&buf, &config, "master1/port2", vec![480.0, 300.0], 0.0);
        let mut agg = MeasurementAggregator::new(&config);
        let summary = idle_summary(&config, 1.0);
        let snap = buf.snapshot(t(1.0));

        let out = agg.tick(&TickInput { now: t(1.0), channels: &snap, cycle: &summary });
        let body = report(&out[0]);
        assert_eq!(body.devices.len(), 4);

        let dims = body.devices.iter().find(|d| d.channel == "master1/port2").unwrap();
        assert_eq!(dims.values, vec![480.0, 300.0]);
        assert_eq!(dims.in_tolerance, None);

        let analyzer = body
            .devices
            .iter()
            .find(|d| d.channel == "analyzer/192.168.1.130")
            .unwrap();
        assert_eq!(analyzer.in_tolerance, Some(false));
        assert!(!analyzer.stale);
    }

    #[test]
    fn stale_devices_keep_last_value_and_degrade_the_report() {
        let config = EngineConfig::default();
        let buf = buffer(&config);
        put(&buf, &config, "analyzer/192.168.1.131", vec![19.0], 0.0);
        let mut agg = MeasurementAggregator::new(&config);
        let summary = idle_summary(&config, 30.0);
        let snap = buf.snapshot(t(30.0));

        let out = agg.tick(&TickInput { now: t(30.0), channels: &snap, cycle: &summary });
        let body = report(&out[0]);
        let analyzer = body
            .devices
            .iter()
            .find(|d| d.channel == "analyzer/192.168.1.131")
            .unwrap();
        assert!(analyzer.stale);
        assert_eq!(analyzer.values, vec![19.0]);
        assert_eq!(analyzer.age_ms, Some(30_000));
        assert!(out[0].is_degraded());
        assert!(out[0]
            .stale_channels
            .contains(&"analyzer/192.168.1.131".to_string()));
    }
}
