//! Broker transport. One task owns the MQTT event loop, re-subscribes on
//! every reconnect and feeds each publish through the pipeline.

pub mod pipeline;

pub use pipeline::{IngestOutcome, IngestionPipeline, PipelineError, Rejection};

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::MqttConfig;
use crate::providers::RouteSource;
use crate::store::RealtimeStore;

/// Connection flags for the readiness probe.
#[derive(Debug, Default)]
pub struct TransportHealth {
    connected: AtomicBool,
    subscribed: AtomicBool,
}

impl TransportHealth {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Relaxed)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
        if !connected {
            self.subscribed.store(false, Ordering::Relaxed);
        }
    }

    fn set_subscribed(&self, subscribed: bool) {
        self.subscribed.store(subscribed, Ordering::Relaxed);
    }
}

/// All fix topics under one prefix: {prefix}/{routeId}/{direction}/{busId}.
fn subscription_topic(prefix: &str) -> String {
    format!("{prefix}/+/+/+")
}

pub struct MqttIngestor<S, R> {
    pipeline: IngestionPipeline<S, R>,
    config: MqttConfig,
    health: Arc<TransportHealth>,
}

impl<S: RealtimeStore, R: RouteSource> MqttIngestor<S, R> {
    pub fn new(pipeline: IngestionPipeline<S, R>, config: MqttConfig) -> Self {
        Self {
            pipeline,
            config,
            health: Arc::new(TransportHealth::default()),
        }
    }

    pub fn health_handle(&self) -> Arc<TransportHealth> {
        self.health.clone()
    }

    /// Drives the connection forever. Poll errors reset the session; the
    /// next poll reconnects and the ConnAck re-subscribes.
    pub async fn run(self) {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs));

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let topic = subscription_topic(&self.config.topic_prefix);
        let reconnect_delay = Duration::from_secs(self.config.reconnect_delay_secs);

        tracing::info!(
            host = %self.config.host,
            port = self.config.port,
            topic = %topic,
            "Starting telemetry ingestion"
        );

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.health.set_connected(true);
                    tracing::info!("Connected to telemetry broker");
                    if let Err(e) = client.subscribe(topic.clone(), QoS::AtMostOnce).await {
                        tracing::error!(error = %e, "Subscribe request failed");
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    self.health.set_subscribed(true);
                    tracing::info!(topic = %topic, "Subscribed to telemetry topics");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.dispatch(&publish.topic, &publish.payload).await;
                }
                Ok(_) => {}
                Err(e) => {
                    self.health.set_connected(false);
                    tracing::warn!(error = %e, "Telemetry broker connection lost; retrying");
                    tokio::time::sleep(reconnect_delay).await;
                }
            }
        }
    }

    async fn dispatch(&self, topic: &str, payload: &[u8]) {
        match self.pipeline.handle_message(topic, payload).await {
            Ok(IngestOutcome::Processed(state)) => {
                tracing::debug!(
                    bus_id = %state.bus_id,
                    route_id = %state.route_id,
                    progress = state.progress,
                    trip_status = state.trip_status.as_str(),
                    "Processed fix"
                );
            }
            Ok(IngestOutcome::Rejected(rejection)) => {
                tracing::warn!(
                    topic = %topic,
                    reason = rejection.reason(),
                    detail = %rejection.detail(),
                    "Dropped telemetry message"
                );
            }
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "Failed to commit update");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_topic_covers_three_levels() {
        assert_eq!(subscription_topic("gps"), "gps/+/+/+");
        assert_eq!(subscription_topic("telemetry"), "telemetry/+/+/+");
    }

    #[test]
    fn test_disconnect_clears_subscribed_flag() {
        let health = TransportHealth::default();
        assert!(!health.is_connected());

        health.set_connected(true);
        health.set_subscribed(true);
        assert!(health.is_connected());
        assert!(health.is_subscribed());

        health.set_connected(false);
        assert!(!health.is_connected());
        assert!(!health.is_subscribed());
    }
}
