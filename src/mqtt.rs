use crate::config::Config;
use crate::error::EngineError;
use crate::ingest::{channel_id_from_topic, LineEngine};
use anyhow::Result;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

/// Push consumer: subscribes to every configured topic and hands each
/// publish to the engine. Reconnects until cancelled.
pub async fn run_listener(config: Config, engine: LineEngine, cancel: CancellationToken) {
    let stats = engine.stats();
    while !cancel.is_cancelled() {
        if let Err(err) = run_once(&config, &engine, cancel.clone()).await {
            stats.set_bus_connected(false);
            stats.record_error(format!("mqtt: {err:#}"));
            tracing::warn!(error = %err, "MQTT connection dropped; reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(Duration::from_secs(2)) => {}
            }
        }
    }
    stats.set_bus_connected(false);
    tracing::debug!("MQTT listener stopped");
}

async fn run_once(config: &Config, engine: &LineEngine, cancel: CancellationToken) -> Result<()> {
    let mut options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    options.set_keep_alive(config.mqtt_keepalive());
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }

    let (client, mut eventloop) = AsyncClient::new(options, 64);
    for topic in &config.mqtt_topics {
        client.subscribe(topic.clone(), QoS::AtLeastOnce).await?;
    }
    let stats = engine.stats();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = client.disconnect().await;
                return Ok(());
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        tracing::info!(
                            host = %config.mqtt_host,
                            topics = config.mqtt_topics.len(),
                            "connected to MQTT broker"
                        );
                        stats.set_bus_connected(true);
                        stats.clear_error();
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let channel = channel_id_from_topic(&publish.topic);
                        match engine.on_message(&channel, publish.payload, Utc::now()).await {
                            Ok(_) => {}
                            Err(EngineError::EngineStopped) => return Ok(()),
                            Err(err @ EngineError::UnknownChannel(_)) => {
                                tracing::debug!(error = %err, topic = %publish.topic, "unmapped topic");
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, topic = %publish.topic, "dropped MQTT sample");
                            }
                        }
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => anyhow::bail!("mqtt disconnected"),
                    Ok(_) => {}
                    Err(err) => anyhow::bail!(err),
                }
            }
        }
    }
}
