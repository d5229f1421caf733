use super::{Aggregator, TickInput};
use crate::config::EngineConfig;
use crate::conversion::Conversions;
use crate::fusion::ChannelKind;
use crate::snapshot::{MeterReading, MeterTotals, MetricSnapshot, SnapshotBody, SnapshotKind};
use std::time::Duration;

pub struct MetersAggregator {
    interval: Duration,
    meters: Vec<String>,
    conversions: Conversions,
}

impl MetersAggregator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            interval: config.meters_interval,
            meters: config
                .channels_of(ChannelKind::Meter)
                .map(|spec| spec.id.clone())
                .collect(),
            conversions: config.conversions.clone(),
        }
    }
}

impl Aggregator for MetersAggregator {
    fn name(&self) -> &'static str {
        "meters"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn tick(&mut self, input: &TickInput<'_>) -> Vec<MetricSnapshot> {
        let mut stale_channels = Vec::new();
        let meters = self
            .meters
            .iter()
            .map(|channel| {
                let reading = input.channels.get(channel);
                let stale = reading.map(|r| r.stale).unwrap_or(true);
                if stale {
                    stale_channels.push(channel.clone());
                }
                MeterReading {
                    channel: channel.clone(),
                    value: reading.and_then(|r| r.primary()),
                    stale,
                }
            })
            .collect();

        // A silent impulse counter is the normal idle condition, so it is
        // reported per channel but does not degrade the totals.
        let totals = &input.cycle.totals;
        vec![MetricSnapshot::new(
            SnapshotKind::Meters,
            input.now,
            Vec::new(),
            stale_channels,
            SnapshotBody::Meters(MeterTotals {
                meters,
                impulses: totals.impulses,
                rotations: self.conversions.rotations(totals.impulses),
                cycles_closed: totals.cycles_closed,
                state: input.cycle.state,
            }),
        )]
    }
}
