//! Latest-value store shared by every ingestion source and aggregator.
//!
//! The set of channels is fixed at construction. Writers overwrite the slot
//! of their channel when the incoming sample is strictly newer; readers take
//! either a single reading or a point-in-time snapshot of all slots. Reads
//! never wait for data: a slot that has not been refreshed within the idle
//! timeout is reported stale and substituted according to its policy.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Flow,
    Measurement,
    Meter,
    Analyzer,
}

impl ChannelKind {
    pub fn default_stale_policy(self) -> StalePolicy {
        match self {
            ChannelKind::Flow => StalePolicy::Zero,
            ChannelKind::Measurement | ChannelKind::Meter | ChannelKind::Analyzer => {
                StalePolicy::LastKnownGood
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Flow => "flow",
            ChannelKind::Measurement => "measurement",
            ChannelKind::Meter => "meter",
            ChannelKind::Analyzer => "analyzer",
        }
    }
}

/// What a reader gets in place of a stale value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicy {
    Zero,
    LastKnownGood,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub values: Vec<f64>,
    pub timestamp: DateTime<Utc>,
    pub kind: ChannelKind,
}

impl Sample {
    pub fn new(kind: ChannelKind, values: Vec<f64>, timestamp: DateTime<Utc>) -> Self {
        Self {
            values,
            timestamp,
            kind,
        }
    }

    pub fn primary(&self) -> Option<f64> {
        self.values.first().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Accepted,
    /// The stored sample is as new or newer; nothing changed.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelReading {
    pub channel: String,
    pub kind: ChannelKind,
    /// Values after the stale policy has been applied.
    pub values: Vec<f64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub age_ms: Option<i64>,
    pub stale: bool,
    pub unavailable: bool,
}

impl ChannelReading {
    pub fn primary(&self) -> Option<f64> {
        self.values.first().copied()
    }

    pub fn has_value(&self) -> bool {
        !self.values.is_empty()
    }
}

#[derive(Debug)]
struct ChannelSlot {
    kind: ChannelKind,
    policy: StalePolicy,
    latest: Option<Sample>,
    unavailable: Option<String>,
}

#[derive(Debug)]
pub struct FusionBuffer {
    idle_timeout: ChronoDuration,
    order: Vec<String>,
    channels: RwLock<HashMap<String, ChannelSlot>>,
}

impl FusionBuffer {
    pub fn new<I>(idle_timeout: std::time::Duration, channels: I) -> Self
    where
        I: IntoIterator<Item = (String, ChannelKind, StalePolicy)>,
    {
        let idle_timeout =
            ChronoDuration::from_std(idle_timeout).unwrap_or_else(|_| ChronoDuration::seconds(5));
        let mut order = Vec::new();
        let mut map = HashMap::new();
        for (id, kind, policy) in channels {
            if map.contains_key(&id) {
                continue;
            }
            order.push(id.clone());
            map.insert(
                id,
                ChannelSlot {
                    kind,
                    policy,
                    latest: None,
                    unavailable: None,
                },
            );
        }
        Self {
            idle_timeout,
            order,
            channels: RwLock::new(map),
        }
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.read_guard().contains_key(channel)
    }

    pub fn kind_of(&self, channel: &str) -> Option<ChannelKind> {
        self.read_guard().get(channel).map(|slot| slot.kind)
    }

    /// Stores `sample` if it is strictly newer than what the channel holds.
    pub fn update(&self, channel: &str, sample: Sample) -> EngineResult<UpdateOutcome> {
        let mut channels = self.write_guard();
        let slot = channels
            .get_mut(channel)
            .ok_or_else(|| EngineError::UnknownChannel(channel.to_string()))?;
        if let Some(current) = &slot.latest {
            if sample.timestamp <= current.timestamp {
                return Ok(UpdateOutcome::Ignored);
            }
        }
        slot.latest = Some(sample);
        slot.unavailable = None;
        Ok(UpdateOutcome::Accepted)
    }

    /// Flags a channel stale until its next accepted sample.
    pub fn mark_unavailable(&self, channel: &str, reason: impl Into<String>) -> EngineResult<()> {
        let mut channels = self.write_guard();
        let slot = channels
            .get_mut(channel)
            .ok_or_else(|| EngineError::UnknownChannel(channel.to_string()))?;
        slot.unavailable = Some(reason.into());
        Ok(())
    }

    pub fn read(&self, channel: &str, now: DateTime<Utc>) -> Option<ChannelReading> {
        let channels = self.read_guard();
        channels
            .get(channel)
            .map(|slot| self.reading(channel, slot, now))
    }

    /// Consistent point-in-time view of every channel.
    pub fn snapshot(&self, now: DateTime<Utc>) -> FusionSnapshot {
        let channels = self.read_guard();
        let readings = self
            .order
            .iter()
            .filter_map(|id| {
                channels
                    .get(id)
                    .map(|slot| self.reading(id, slot, now))
            })
            .collect();
        FusionSnapshot {
            taken_at: now,
            readings,
        }
    }

    fn reading(&self, channel: &str, slot: &ChannelSlot, now: DateTime<Utc>) -> ChannelReading {
        let updated_at = slot.latest.as_ref().map(|sample| sample.timestamp);
        let age = updated_at.map(|ts| (now - ts).max(ChronoDuration::zero()));
        let timed_out = age.map(|age| age > self.idle_timeout).unwrap_or(true);
        let stale = timed_out || slot.unavailable.is_some();

        let values = match (&slot.latest, stale, slot.policy) {
            (None, _, _) => Vec::new(),
            (Some(sample), false, _) | (Some(sample), true, StalePolicy::LastKnownGood) => {
                sample.values.clone()
            }
            (Some(sample), true, StalePolicy::Zero) => vec![0.0; sample.values.len().max(1)],
        };

        ChannelReading {
            channel: channel.to_string(),
            kind: slot.kind,
            values,
            updated_at,
            age_ms: age.map(|age| age.num_milliseconds()),
            stale,
            unavailable: slot.unavailable.is_some(),
        }
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, HashMap<String, ChannelSlot>> {
        match self.channels.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, HashMap<String, ChannelSlot>> {
        match self.channels.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FusionSnapshot {
    pub taken_at: DateTime<Utc>,
    readings: Vec<ChannelReading>,
}

impl FusionSnapshot {
    pub fn get(&self, channel: &str) -> Option<&ChannelReading> {
        self.readings.iter().find(|reading| reading.channel == channel)
    }

    pub fn of_kind(&self, kind: ChannelKind) -> impl Iterator<Item = &ChannelReading> {
        self.readings
            .iter()
            .filter(move |reading| reading.kind == kind)
    }

    pub fn stale_channels(&self) -> Vec<String> {
        self.readings
            .iter()
            .filter(|reading| reading.stale)
            .map(|reading| reading.channel.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::time::Duration;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn buffer() -> FusionBuffer {
        FusionBuffer::new(
            Duration::from_secs(5),
            vec![
                ("master1/port3".to_string(), ChannelKind::Flow, StalePolicy::Zero),
                (
                    "analyzer/192.168.1.130".to_string(),
                    ChannelKind::Analyzer,
                    StalePolicy::LastKnownGood,
                ),
            ],
        )
    }

    #[test]
    fn older_or_equal_samples_do_not_overwrite() {
        let buf = buffer();
        let outcome = buf
            .update("master1/port3", Sample::new(ChannelKind::Flow, vec![4.0], t(10)))
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Accepted);

        let outcome = buf
            .update("master1/port3", Sample::new(ChannelKind::Flow, vec![9.0], t(10)))
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Ignored);
        let outcome = buf
            .update("master1/port3", Sample::new(ChannelKind::Flow, vec![9.0], t(8)))
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Ignored);

        let reading = buf.read("master1/port3", t(11)).unwrap();
        assert_eq!(reading.values, vec![4.0]);
        assert!(!reading.stale);
        assert_eq!(reading.age_ms, Some(1000));
    }

    #[test]
    fn staleness_starts_strictly_after_idle_timeout() {
        let buf = buffer();
        buf.update("master1/port3", Sample::new(ChannelKind::Flow, vec![4.0], t(0)))
            .unwrap();

        let at_limit = buf.read("master1/port3", t(5)).unwrap();
        assert!(!at_limit.stale);
        assert_eq!(at_limit.values, vec![4.0]);

        let past = buf
            .read("master1/port3", t(5) + ChronoDuration::milliseconds(1))
            .unwrap();
        assert!(past.stale);
        assert_eq!(past.values, vec![0.0]);
    }

    #[test]
    fn last_known_good_policy_keeps_value_but_flags_stale() {
        let buf = buffer();
        let id = "analyzer/192.168.1.130";
        buf.update(id, Sample::new(ChannelKind::Analyzer, vec![20.9, 0.4], t(0)))
            .unwrap();
        let reading = buf.read(id, t(60)).unwrap();
        assert!(reading.stale);
        assert_eq!(reading.values, vec![20.9, 0.4]);
    }

    #[test]
    fn unavailable_marks_stale_until_next_sample() {
        let buf = buffer();
        let id = "analyzer/192.168.1.130";
        buf.update(id, Sample::new(ChannelKind::Analyzer, vec![1.0], t(0)))
            .unwrap();
        buf.mark_unavailable(id, "connection refused").unwrap();
        let reading = buf.read(id, t(1)).unwrap();
        assert!(reading.stale);
        assert!(reading.unavailable);

        buf.update(id, Sample::new(ChannelKind::Analyzer, vec![2.0], t(2)))
            .unwrap();
        let reading = buf.read(id, t(2)).unwrap();
        assert!(!reading.stale);
        assert!(!reading.unavailable);
    }

    #[test]
    fn never_updated_channel_is_stale_and_empty() {
        let buf = buffer();
        let snapshot = buf.snapshot(t(0));
        let reading = snapshot.get("master1/port3").unwrap();
        assert!(reading.stale);
        assert!(!reading.has_value());
        assert_eq!(snapshot.stale_channels().len(), 2);
    }

    #[test]
    fn unknown_channel_is_rejected() {
        let buf = buffer();
        let err = buf
            .update("master9/port9", Sample::new(ChannelKind::Flow, vec![1.0], t(0)))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownChannel(_)));
        assert!(buf.read("master9/port9", t(0)).is_none());
    }

    #[test]
    fn concurrent_writers_keep_the_newest_sample() {
        let buf = Arc::new(buffer());
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let buf = buf.clone();
                std::thread::spawn(move || {
                    for step in 0..250 {
                        let secs = step * 4 + worker;
                        let _ = buf.update(
                            "master1/port3",
                            Sample::new(ChannelKind::Flow, vec![secs as f64], t(secs)),
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let reading = buf.read("master1/port3", t(999)).unwrap();
        assert_eq!(reading.values, vec![999.0]);
    }
}
