use crate::cycle::{ClosedCycle, DowntimeEvent, LineState, ProductionCycle};
use crate::fusion::ChannelKind;
use crate::stats::StatsReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    OeeSummary,
    Oee,
    OeeDetail,
    Flow,
    Measurement,
    Meters,
    SystemReport,
}

impl SnapshotKind {
    pub const ALL: [SnapshotKind; 7] = [
        SnapshotKind::OeeSummary,
        SnapshotKind::Oee,
        SnapshotKind::OeeDetail,
        SnapshotKind::Flow,
        SnapshotKind::Measurement,
        SnapshotKind::Meters,
        SnapshotKind::SystemReport,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            SnapshotKind::OeeSummary => "summary.json",
            SnapshotKind::Oee => "oee.json",
            SnapshotKind::OeeDetail => "mqttOEE.json",
            SnapshotKind::Flow => "mqttFlow.json",
            SnapshotKind::Measurement => "measurements.json",
            SnapshotKind::Meters => "meters.json",
            SnapshotKind::SystemReport => "system_report.json",
        }
    }

    /// Only the aggregate OEE files are copied aside before being overwritten.
    pub fn requires_backup(self) -> bool {
        matches!(self, SnapshotKind::OeeSummary | SnapshotKind::Oee)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotKind::OeeSummary => "oee_summary",
            SnapshotKind::Oee => "oee",
            SnapshotKind::OeeDetail => "oee_detail",
            SnapshotKind::Flow => "flow",
            SnapshotKind::Measurement => "measurement",
            SnapshotKind::Meters => "meters",
            SnapshotKind::SystemReport => "system_report",
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One aggregator output. Never mutated after construction.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSnapshot {
    pub id: Uuid,
    pub kind: SnapshotKind,
    pub taken_at: DateTime<Utc>,
    pub degraded: Vec<String>,
    pub stale_channels: Vec<String>,
    pub body: SnapshotBody,
}

impl MetricSnapshot {
    pub fn new(
        kind: SnapshotKind,
        taken_at: DateTime<Utc>,
        degraded: Vec<String>,
        stale_channels: Vec<String>,
        body: SnapshotBody,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            taken_at,
            degraded,
            stale_channels,
            body,
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SnapshotBody {
    Oee(OeeMetrics),
    OeeSummary(ProductionSummary),
    OeeDetail(OeeDetail),
    Flow(FlowTotals),
    Measurement(MeasurementReport),
    Meters(MeterTotals),
    SystemReport(StatsReport),
}

#[derive(Debug, Clone, Serialize)]
pub struct OeeMetrics {
    pub availability: f64,
    pub performance: f64,
    pub quality: f64,
    pub oee: f64,
    pub oee_percent: f64,
    pub state: LineState,
    pub target_lpm: f64,
    pub actual_rate_lpm: Option<f64>,
    pub scheduled_secs: f64,
    pub downtime_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductionSummary {
    pub state: LineState,
    pub last_event_at: Option<DateTime<Utc>>,
    pub cycles_closed: u64,
    pub impulses: u64,
    pub rotations: f64,
    pub idle_stops: u64,
    pub changeovers: u64,
    pub idle_secs: f64,
    pub changeover_secs: f64,
    pub inspected: u64,
    pub passed: u64,
    pub target_lpm: f64,
    pub classification_fallback: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OeeDetail {
    pub current_cycle: Option<ProductionCycle>,
    pub window_len: usize,
    pub window_mean_secs: Option<f64>,
    pub window_median_secs: Option<f64>,
    pub recent_cycles: Vec<ClosedCycle>,
    pub recent_downtime: Vec<DowntimeEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowPort {
    pub channel: String,
    pub rate: f64,
    pub total: f64,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowTotals {
    pub ports: Vec<FlowPort>,
    pub total_rate: f64,
    pub total_volume: f64,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceReading {
    pub channel: String,
    pub kind: ChannelKind,
    pub values: Vec<f64>,
    pub stale: bool,
    pub age_ms: Option<i64>,
    pub in_tolerance: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeasurementReport {
    pub devices: Vec<DeviceReading>,
    pub inspected: u64,
    pub passed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeterReading {
    pub channel: String,
    pub value: Option<f64>,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeterTotals {
    pub meters: Vec<MeterReading>,
    pub impulses: u64,
    pub rotations: f64,
    pub cycles_closed: u64,
    pub state: LineState,
}
