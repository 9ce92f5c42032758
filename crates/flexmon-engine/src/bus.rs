//! Bus contract and the in-process implementation.
//!
//! The engine consumes framed events (asset announcements, metric
//! publications, mailbox requests) from a receiver channel and produces
//! alerts and mailbox messages through a [`BusClient`]. The transport
//! behind that trait is external: the agent binary binds it to MQTT, the
//! tests use [`MemoryBus`].

use async_trait::async_trait;
use flexmon_common::types::{Alert, AssetMessage, MetricSample};
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Bus: peer channel closed")]
    Closed,

    #[error("Bus: send timed out")]
    Timeout,

    #[error("Bus: transport failure: {0}")]
    Transport(String),
}

/// One inbound event, already decoded from the wire.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Asset announcement from the asset stream.
    Asset(AssetMessage),
    /// Metric publication; `stream` names the stream it arrived on
    /// (regular metrics, sensor metrics or licensing announcements).
    Metric { stream: String, sample: MetricSample },
    /// Rule-management request addressed to the engine's mailbox.
    Mailbox {
        sender: String,
        subject: String,
        tracker: Option<String>,
        frames: Vec<String>,
    },
}

/// Outbound side of the bus.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Publishes an alert on the alert stream under the given topic.
    async fn publish_alert(&self, topic: &str, alert: &Alert) -> Result<(), BusError>;

    /// Sends a framed message to a peer mailbox, preserving subject and
    /// tracker.
    async fn sendto(
        &self,
        address: &str,
        subject: &str,
        tracker: Option<&str>,
        frames: Vec<String>,
    ) -> Result<(), BusError>;
}

/// An alert as observed on the in-process bus.
#[derive(Debug, Clone)]
pub struct PublishedAlert {
    pub topic: String,
    pub alert: Alert,
}

/// A mailbox message as observed on the in-process bus.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub address: String,
    pub subject: String,
    pub tracker: Option<String>,
    pub frames: Vec<String>,
}

/// In-process bus: everything the engine sends lands on a pair of
/// unbounded channels the creator holds.
pub struct MemoryBus {
    alerts: mpsc::UnboundedSender<PublishedAlert>,
    sends: mpsc::UnboundedSender<SentMessage>,
}

/// Receiving ends of a [`MemoryBus`].
pub struct MemoryBusOutput {
    pub alerts: mpsc::UnboundedReceiver<PublishedAlert>,
    pub sends: mpsc::UnboundedReceiver<SentMessage>,
}

impl MemoryBus {
    pub fn new() -> (MemoryBus, MemoryBusOutput) {
        let (alerts_tx, alerts_rx) = mpsc::unbounded_channel();
        let (sends_tx, sends_rx) = mpsc::unbounded_channel();
        (
            MemoryBus {
                alerts: alerts_tx,
                sends: sends_tx,
            },
            MemoryBusOutput {
                alerts: alerts_rx,
                sends: sends_rx,
            },
        )
    }
}

#[async_trait]
impl BusClient for MemoryBus {
    async fn publish_alert(&self, topic: &str, alert: &Alert) -> Result<(), BusError> {
        self.alerts
            .send(PublishedAlert {
                topic: topic.to_string(),
                alert: alert.clone(),
            })
            .map_err(|_| BusError::Closed)
    }

    async fn sendto(
        &self,
        address: &str,
        subject: &str,
        tracker: Option<&str>,
        frames: Vec<String>,
    ) -> Result<(), BusError> {
        self.sends
            .send(SentMessage {
                address: address.to_string(),
                subject: subject.to_string(),
                tracker: tracker.map(str::to_string),
                frames,
            })
            .map_err(|_| BusError::Closed)
    }
}
