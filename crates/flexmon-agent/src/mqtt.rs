//! MQTT binding of the engine's bus contract.
//!
//! Streams map to the topic prefix `flexmon/stream/<STREAM>/<subject>`,
//! mailboxes to `flexmon/mailbox/<address>`. Stream payloads are the
//! JSON-encoded sample or asset announcement; mailbox payloads carry an
//! envelope with sender, subject, tracker and frames.

use async_trait::async_trait;
use flexmon_common::types::{Alert, AssetMessage, MetricSample};
use flexmon_common::STREAM_ASSETS;
use flexmon_engine::bus::{BusClient, BusError, BusEvent};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Serialize, Deserialize)]
struct MailboxEnvelope {
    sender: String,
    subject: String,
    #[serde(default)]
    tracker: Option<String>,
    frames: Vec<String>,
}

pub struct MqttBus {
    client: AsyncClient,
    client_id: String,
}

impl MqttBus {
    /// Connects to the broker, subscribes to the asset, metric, sensor and
    /// licensing streams plus our own mailbox, and pumps decoded events
    /// into `events`.
    pub async fn connect(
        endpoint: &str,
        client_id: &str,
        events: mpsc::Sender<BusEvent>,
    ) -> anyhow::Result<MqttBus> {
        let (host, port) = match endpoint.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse::<u16>()?),
            None => (endpoint.to_string(), 1883),
        };

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        for stream in [
            flexmon_common::STREAM_ASSETS,
            flexmon_common::STREAM_METRICS,
            flexmon_common::STREAM_METRICS_SENSOR,
            flexmon_common::STREAM_LICENSING,
        ] {
            client
                .subscribe(format!("flexmon/stream/{stream}/#"), QoS::AtLeastOnce)
                .await?;
        }
        client
            .subscribe(format!("flexmon/mailbox/{client_id}"), QoS::AtLeastOnce)
            .await?;

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("Bus connected");
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match decode(&publish.topic, &publish.payload) {
                            Some(event) => {
                                if events.send(event).await.is_err() {
                                    tracing::info!("Engine gone, stopping bus reader");
                                    break;
                                }
                            }
                            None => {
                                tracing::debug!(topic = %publish.topic, "Unhandled publication");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Bus connection error, retrying");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        Ok(MqttBus {
            client,
            client_id: client_id.to_string(),
        })
    }
}

fn decode(topic: &str, payload: &[u8]) -> Option<BusEvent> {
    let mut parts = topic.splitn(4, '/');
    if parts.next() != Some("flexmon") {
        return None;
    }
    match parts.next() {
        Some("stream") => {
            let stream = parts.next()?;
            if stream == STREAM_ASSETS {
                match serde_json::from_slice::<AssetMessage>(payload) {
                    Ok(asset) => Some(BusEvent::Asset(asset)),
                    Err(e) => {
                        tracing::warn!(topic, error = %e, "Undecodable asset announcement");
                        None
                    }
                }
            } else {
                match serde_json::from_slice::<MetricSample>(payload) {
                    Ok(sample) => Some(BusEvent::Metric {
                        stream: stream.to_string(),
                        sample,
                    }),
                    Err(e) => {
                        tracing::warn!(topic, error = %e, "Undecodable metric");
                        None
                    }
                }
            }
        }
        Some("mailbox") => match serde_json::from_slice::<MailboxEnvelope>(payload) {
            Ok(envelope) => Some(BusEvent::Mailbox {
                sender: envelope.sender,
                subject: envelope.subject,
                tracker: envelope.tracker,
                frames: envelope.frames,
            }),
            Err(e) => {
                tracing::warn!(topic, error = %e, "Undecodable mailbox request");
                None
            }
        },
        _ => None,
    }
}

#[async_trait]
impl BusClient for MqttBus {
    async fn publish_alert(&self, topic: &str, alert: &Alert) -> Result<(), BusError> {
        let payload = serde_json::to_vec(alert).map_err(|e| BusError::Transport(e.to_string()))?;
        let stream_topic = format!("flexmon/stream/{}/{topic}", flexmon_common::STREAM_ALERTS);
        self.client
            .publish(stream_topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }

    async fn sendto(
        &self,
        address: &str,
        subject: &str,
        tracker: Option<&str>,
        frames: Vec<String>,
    ) -> Result<(), BusError> {
        let envelope = MailboxEnvelope {
            sender: self.client_id.clone(),
            subject: subject.to_string(),
            tracker: tracker.map(str::to_string),
            frames,
        };
        let payload =
            serde_json::to_vec(&envelope).map_err(|e| BusError::Transport(e.to_string()))?;
        self.client
            .publish(
                format!("flexmon/mailbox/{address}"),
                QoS::AtLeastOnce,
                false,
                payload,
            )
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_routes_by_topic() {
        let sample = MetricSample::new("ups-1", "status.ups", "64", 10);
        let payload = serde_json::to_vec(&sample).unwrap();
        match decode("flexmon/stream/METRICS/status.ups@ups-1", &payload) {
            Some(BusEvent::Metric { stream, sample }) => {
                assert_eq!(stream, "METRICS");
                assert_eq!(sample.topic(), "status.ups@ups-1");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let envelope = MailboxEnvelope {
            sender: "ui".into(),
            subject: "rules".into(),
            tracker: None,
            frames: vec!["LIST".into(), "all".into(), "".into()],
        };
        let payload = serde_json::to_vec(&envelope).unwrap();
        match decode("flexmon/mailbox/flexmon", &payload) {
            Some(BusEvent::Mailbox { sender, frames, .. }) => {
                assert_eq!(sender, "ui");
                assert_eq!(frames[0], "LIST");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert!(decode("other/topic", b"{}").is_none());
    }
}
