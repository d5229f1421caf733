use crate::classifier::{CycleRule, CycleTable, DEFAULT_CYCLE_LPM};
use crate::conversion::{Conversions, DEFAULT_AIR_FACTOR, DEFAULT_IMPULSES_PER_ROTATION};
use crate::fusion::{ChannelKind, StalePolicy};
use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const IDLE_TIMEOUT_SECONDS: u64 = 5;
pub const MAX_CHANGEOVER_SECONDS: u64 = 10 * 60;
pub const FLOW_DEVICE_COUNT: usize = 5;
pub const MEASUREMENT_DEVICE_COUNT: usize = 5;
pub const ELEMENT_WINDOW: usize = 10;

const DEFAULT_MQTT_TOPICS: &[&str] = &[
    "balluff/cmtk/master1/iolink/devices/port1/data/fromdevice",
    "balluff/cmtk/master1/iolink/devices/port2/data/fromdevice",
    "balluff/cmtk/master1/iolink/devices/port3/data/fromdevice",
    "balluff/cmtk/master1/iolink/devices/port4/data/fromdevice",
    "balluff/cmtk/master2/iolink/devices/port0/data/fromdevice",
    "balluff/cmtk/master2/iolink/devices/port1/data/fromdevice",
    "balluff/cmtk/master2/iolink/devices/port2/data/fromdevice",
];

const DEFAULT_FLOW_PORTS: &[&str] = &[
    "master1/port3",
    "master1/port4",
    "master2/port0",
    "master2/port1",
    "master2/port2",
];

const DEFAULT_IMPULSE_CHANNEL: &str = "master1/port1";
const DEFAULT_DIMENSION_CHANNEL: &str = "master1/port2";

const DEFAULT_ANALYZER_IPS: &[(&str, &str)] = &[
    ("ANALYZER_IP01", "192.168.1.130"),
    ("ANALYZER_IP02", "192.168.1.131"),
    ("ANALYZER_IP03", "192.168.1.132"),
];

/// How the scheduler treats samples from a channel beyond storing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Value,
    /// Cumulative impulse counter; positive deltas drive the cycle state machine.
    ImpulseCounter,
    /// `[length, width]` of the product currently on the line.
    Dimensions,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToleranceLimits {
    pub min: f64,
    pub max: f64,
}

impl ToleranceLimits {
    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub id: String,
    pub kind: ChannelKind,
    pub role: ChannelRole,
    pub stale_policy: StalePolicy,
    pub limits: Option<ToleranceLimits>,
}

impl ChannelSpec {
    pub fn new(id: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            id: id.into(),
            kind,
            role: ChannelRole::Value,
            stale_policy: kind.default_stale_policy(),
            limits: None,
        }
    }

    pub fn with_role(mut self, role: ChannelRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_limits(mut self, limits: ToleranceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_stale_policy(mut self, policy: StalePolicy) -> Self {
        self.stale_policy = policy;
        self
    }
}

pub fn analyzer_channel_id(analyzer: &str) -> String {
    format!("analyzer/{}", analyzer.trim())
}

/// Immutable parameters of the aggregation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub idle_timeout: Duration,
    pub max_changeover: Duration,
    pub cycle_table: CycleTable,
    pub element_window: usize,
    pub flow_device_count: usize,
    pub measurement_device_count: usize,
    pub state_tick_interval: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub flow_interval: Duration,
    pub measurement_interval: Duration,
    pub meters_interval: Duration,
    pub oee_interval: Duration,
    pub report_interval: Duration,
    pub conversions: Conversions,
    pub channels: Vec<ChannelSpec>,
    pub analyzers: Vec<String>,
    pub max_publish_attempts: u32,
    pub drain_timeout: Duration,
    pub queue_capacity: usize,
}

impl EngineConfig {
    pub fn plant_channels(
        impulse_channel: &str,
        dimension_channel: &str,
        flow_ports: &[String],
        analyzers: &[String],
    ) -> Vec<ChannelSpec> {
        let mut channels = vec![
            ChannelSpec::new(impulse_channel.trim(), ChannelKind::Meter)
                .with_role(ChannelRole::ImpulseCounter),
            ChannelSpec::new(dimension_channel.trim(), ChannelKind::Measurement)
                .with_role(ChannelRole::Dimensions),
        ];
        channels.extend(
            flow_ports
                .iter()
                .map(|port| ChannelSpec::new(port.trim(), ChannelKind::Flow)),
        );
        channels.extend(
            analyzers
                .iter()
                .map(|ip| ChannelSpec::new(analyzer_channel_id(ip), ChannelKind::Analyzer)),
        );
        channels
    }

    pub fn channel(&self, id: &str) -> Option<&ChannelSpec> {
        self.channels.iter().find(|spec| spec.id == id)
    }

    pub fn channels_of(&self, kind: ChannelKind) -> impl Iterator<Item = &ChannelSpec> {
        self.channels.iter().filter(move |spec| spec.kind == kind)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let flow_ports: Vec<String> = DEFAULT_FLOW_PORTS.iter().map(|p| p.to_string()).collect();
        let analyzers: Vec<String> = DEFAULT_ANALYZER_IPS
            .iter()
            .map(|(_, ip)| ip.to_string())
            .collect();
        Self {
            idle_timeout: Duration::from_secs(IDLE_TIMEOUT_SECONDS),
            max_changeover: Duration::from_secs(MAX_CHANGEOVER_SECONDS),
            cycle_table: CycleTable::default(),
            element_window: ELEMENT_WINDOW,
            flow_device_count: FLOW_DEVICE_COUNT,
            measurement_device_count: MEASUREMENT_DEVICE_COUNT,
            state_tick_interval: Duration::from_millis(50),
            poll_interval: Duration::from_millis(100),
            poll_timeout: Duration::from_secs(2),
            flow_interval: Duration::from_secs(10),
            measurement_interval: Duration::from_secs(10),
            meters_interval: Duration::from_secs(5),
            oee_interval: Duration::from_secs(5),
            report_interval: Duration::from_secs(10),
            conversions: Conversions::default(),
            channels: Self::plant_channels(
                DEFAULT_IMPULSE_CHANNEL,
                DEFAULT_DIMENSION_CHANNEL,
                &flow_ports,
                &analyzers,
            ),
            analyzers,
            max_publish_attempts: 3,
            drain_timeout: Duration::from_secs(3),
            queue_capacity: 1024,
        }
    }
}

/// Process configuration: collaborator settings plus the engine parameters.
#[derive(Clone, Debug)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_topics: Vec<String>,
    pub analyzer_path: String,
    pub log_dir: PathBuf,
    pub otlp_endpoint: Option<String>,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let mqtt_host = env_string("MQTT_BROKER", "192.168.1.153");
        let mqtt_port = env_parse::<u16>("MQTT_PORT", 1883)?;
        let mqtt_username = env_optional("MQTT_USERNAME");
        let mqtt_password = env_optional("MQTT_PASSWORD");
        let mqtt_client_id = env_optional("MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("line-monitor-{}", std::process::id()));
        let mqtt_keepalive_secs = env_parse::<u64>("MQTT_KEEPALIVE_SECS", 30)?;
        let mqtt_topics = env_list("MQTT_TOPICS").unwrap_or_else(|| {
            DEFAULT_MQTT_TOPICS
                .iter()
                .map(|topic| topic.to_string())
                .collect()
        });

        let flow_ports = env_list("FLOW_PORTS")
            .unwrap_or_else(|| DEFAULT_FLOW_PORTS.iter().map(|p| p.to_string()).collect());
        let analyzers: Vec<String> = DEFAULT_ANALYZER_IPS
            .iter()
            .map(|(key, fallback)| env_string(key, fallback))
            .filter(|ip| !ip.is_empty())
            .collect();
        let analyzer_path = env_string("ANALYZER_PATH", "/api/measurement");
        let log_dir = PathBuf::from(env_string("LINE_MONITOR_LOG_DIR", "logs"));
        let otlp_endpoint = env_optional("OTEL_EXPORTER_OTLP_ENDPOINT");

        let defaults = EngineConfig::default();
        let cycle_table = match env_optional("LINE_MONITOR_CYCLE_TABLE_PATH") {
            Some(path) => load_cycle_table(Path::new(&path))?,
            None => defaults.cycle_table.clone(),
        };

        let impulse_channel = env_string("IMPULSE_CHANNEL", DEFAULT_IMPULSE_CHANNEL);
        let dimension_channel = env_string("DIMENSION_CHANNEL", DEFAULT_DIMENSION_CHANNEL);
        let mut channels = EngineConfig::plant_channels(
            &impulse_channel,
            &dimension_channel,
            &flow_ports,
            &analyzers,
        );
        if let Some(raw) = env_optional("LINE_MONITOR_LIMITS") {
            for (channel, limits) in parse_limits(&raw)? {
                match channels.iter_mut().find(|spec| spec.id == channel) {
                    Some(spec) => spec.limits = Some(limits),
                    None => tracing::warn!(channel=%channel, "tolerance limits for unknown channel ignored"),
                }
            }
        }

        let air_factor = env_parse::<f64>("AIR_FACTOR", DEFAULT_AIR_FACTOR)?;
        let impulses_per_rotation =
            env_parse::<u32>("IMPULSES_PER_ROTATION", DEFAULT_IMPULSES_PER_ROTATION)?;

        let engine = EngineConfig {
            idle_timeout: Duration::from_secs(env_parse(
                "IDLE_TIMEOUT_SECONDS",
                IDLE_TIMEOUT_SECONDS,
            )?),
            max_changeover: Duration::from_secs(env_parse(
                "MAX_CHANGEOVER_SECONDS",
                MAX_CHANGEOVER_SECONDS,
            )?),
            cycle_table,
            poll_timeout: Duration::from_millis(env_parse("ANALYZER_TIMEOUT_MS", 2000)?),
            report_interval: Duration::from_secs(env_parse("SYSTEM_REPORT_INTERVAL_SECS", 10)?),
            conversions: Conversions::with_constants(air_factor, impulses_per_rotation),
            channels,
            analyzers,
            ..defaults
        };

        Ok(Self {
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_keepalive_secs,
            mqtt_topics,
            analyzer_path,
            log_dir,
            otlp_endpoint,
            engine,
        })
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }
}

fn load_cycle_table(path: &Path) -> Result<CycleTable> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read cycle table {}", path.display()))?;
    let mut bytes = contents.into_bytes();
    let rules: Vec<CycleRule> = simd_json::serde::from_slice(&mut bytes)
        .with_context(|| format!("failed to parse cycle table {}", path.display()))?;
    let default_lpm = env_parse::<f64>("PRODUCTION_CYCLE_DEFAULT", DEFAULT_CYCLE_LPM)?;
    Ok(CycleTable::new(rules, default_lpm)?)
}

/// Parses `channel=min:max` entries separated by commas.
fn parse_limits(raw: &str) -> Result<Vec<(String, ToleranceLimits)>> {
    let mut parsed = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (channel, range) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid limits entry {entry:?}"))?;
        let (min, max) = range
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid limits range {range:?}"))?;
        let min = min
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid minimum in {entry:?}"))?;
        let max = max
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid maximum in {entry:?}"))?;
        if min > max {
            return Err(anyhow!("minimum above maximum in {entry:?}"));
        }
        parsed.push((channel.trim().to_string(), ToleranceLimits { min, max }));
    }
    Ok(parsed)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|_| default.to_string())
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_optional(key) {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("invalid {key}")),
        None => Ok(default),
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let items: Vec<String> = env_optional(key)?
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}
