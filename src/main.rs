use anyhow::{Context, Result};
use chrono::Utc;
use line_monitor::analyzer::{build_client, HttpAnalyzer};
use line_monitor::config::Config;
use line_monitor::ingest::AnalyzerSource;
use line_monitor::storage::JsonFileSink;
use line_monitor::{mqtt, LineEngine};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const SYSTEM_LOG_FILE: &str = "system.log";

/// Console output, `system.log` in the log directory and, when configured,
/// an OTLP span exporter. Dropping the guard flushes the file writer.
fn init_tracing(config: &Config) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("create log dir {}", config.log_dir.display()))?;
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&config.log_dir, SYSTEM_LOG_FILE));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,line_monitor=info"));
    let console = fmt::layer().with_target(true).with_thread_ids(true);
    let file = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(file_writer);

    let traces_url = config
        .otlp_endpoint
        .as_deref()
        .map(otlp_traces_url)
        .filter(|url| !url.is_empty());
    let otel = match traces_url {
        Some(url) => Some(tracing_opentelemetry::layer().with_tracer(otlp_tracer(&url)?)),
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .with(otel)
        .try_init()?;
    Ok(guard)
}

fn otlp_tracer(url: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace, Resource};

    let resource = Resource::new(vec![KeyValue::new("service.name", env!("CARGO_PKG_NAME"))]);
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().http().with_endpoint(url))
        .with_trace_config(trace::Config::default().with_resource(resource))
        .install_batch(Tokio)?;
    Ok(tracer)
}

/// The HTTP exporter posts to the full traces path.
fn otlp_traces_url(endpoint: &str) -> String {
    let base = endpoint.trim().trim_end_matches('/');
    if base.is_empty() || base.ends_with("/v1/traces") {
        base.to_string()
    } else {
        format!("{base}/v1/traces")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    let _log_guard = init_tracing(&config)?;

    let sink = Arc::new(JsonFileSink::new(&config.log_dir)?);
    let engine = LineEngine::new(config.engine.clone(), sink, Utc::now());

    let client = build_client(config.engine.poll_timeout)?;
    let analyzers: Vec<Arc<dyn AnalyzerSource>> = config
        .engine
        .analyzers
        .iter()
        .map(|ip| {
            Arc::new(HttpAnalyzer::new(client.clone(), ip, &config.analyzer_path))
                as Arc<dyn AnalyzerSource>
        })
        .collect();

    let cancel = CancellationToken::new();
    let tasks = engine.start(analyzers, cancel.clone());
    tracing::info!(
        log_dir = %config.log_dir.display(),
        broker = %config.mqtt_host,
        analyzers = config.engine.analyzers.len(),
        "line monitor running"
    );

    let mut mqtt_handle = tokio::spawn(mqtt::run_listener(
        config.clone(),
        engine.clone(),
        cancel.clone(),
    ));

    tokio::select! {
        res = &mut mqtt_handle => {
            if let Err(err) = res { tracing::error!(error=%err, "MQTT task failed"); }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    cancel.cancel();
    tasks.shutdown().await;
    if !mqtt_handle.is_finished() {
        mqtt_handle.abort();
    }

    engine.publish_system_report(Utc::now()).await;
    let report = engine.stats().report();
    tracing::info!(
        accepted = report.samples_accepted,
        invalid = report.samples_invalid,
        impulses = report.impulses,
        published = report.snapshots_published,
        dropped = report.snapshots_dropped,
        "line monitor stopped"
    );
    Ok(())
}
