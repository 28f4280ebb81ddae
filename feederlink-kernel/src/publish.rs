//! Bus-facing side of the coordinator.
//!
//! Outbound: snapshots acquired over the local link are republished to
//! `<base>/status` so other bus consumers see them. Inbound: `{"feed": n}`
//! on `<base>/command` becomes a feed request; anything else is logged and
//! dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::BusError;
use crate::models::{DeviceAddress, DeviceDescriptor, StatusSnapshot};
use crate::mqtt::BusClient;
use crate::transport::{bounded, BusLink};

#[derive(Debug, Deserialize)]
struct InboundCommand {
    feed: i64,
}

/// Demande de distribution reçue sur le bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundFeed {
    pub address: DeviceAddress,
    pub amount: i64,
}

pub struct PublishSink {
    client: Arc<dyn BusClient>,
    bus: Arc<BusLink>,
    descriptors: HashMap<DeviceAddress, DeviceDescriptor>,
    /// topic <base>/command -> adresse
    commands: HashMap<String, DeviceAddress>,
    publish_timeout: Duration,
}

impl PublishSink {
    pub fn new<'a>(
        client: Arc<dyn BusClient>,
        bus: Arc<BusLink>,
        devices: impl IntoIterator<Item = &'a DeviceDescriptor>,
        publish_timeout: Duration,
    ) -> Self {
        let descriptors: HashMap<_, _> = devices
            .into_iter()
            .map(|d| (d.address, d.clone()))
            .collect();
        let commands = descriptors
            .values()
            .map(|d| (d.command_topic(), d.address))
            .collect();
        Self {
            client,
            bus,
            descriptors,
            commands,
            publish_timeout,
        }
    }

    pub async fn publish_status(
        &self,
        address: &DeviceAddress,
        snapshot: &StatusSnapshot,
    ) -> Result<(), BusError> {
        let Some(descriptor) = self.descriptors.get(address) else {
            return Ok(());
        };
        let payload = serde_json::to_vec(snapshot)?;
        bounded(
            "publish",
            self.publish_timeout,
            self.client.publish(&descriptor.status_topic(), payload, true),
        )
        .await?;
        debug!(address = %address, topic = %descriptor.status_topic(), "status published");
        Ok(())
    }

    /// Traduit un message entrant en demande de distribution.
    /// `None` si le topic n'est pas un topic de commande ou si le message est invalide.
    pub fn parse_command(&self, topic: &str, payload: &[u8]) -> Option<InboundFeed> {
        let address = *self.commands.get(topic)?;
        match serde_json::from_slice::<InboundCommand>(payload) {
            Ok(cmd) => Some(InboundFeed {
                address,
                amount: cmd.feed,
            }),
            Err(e) => {
                warn!(
                    topic = %topic,
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "dropping malformed command"
                );
                None
            }
        }
    }

    pub fn is_command_topic(&self, topic: &str) -> bool {
        self.commands.contains_key(topic)
    }

    /// Abonnements commande + état de chaque appareil (à refaire après chaque ConnAck)
    pub async fn subscribe_all(&self) -> Result<(), BusError> {
        for topic in self.commands.keys() {
            self.client.subscribe(topic).await?;
            debug!(topic = %topic, "subscribed to commands");
        }
        self.bus.subscribe_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingBus;
    use time::macros::datetime;

    fn sink() -> (Arc<RecordingBus>, PublishSink, DeviceDescriptor) {
        let client = Arc::new(RecordingBus::default());
        let bus = Arc::new(BusLink::new(client.clone()));
        let desc = DeviceDescriptor::new(
            "AA:BB:CC:DD:EE:20".parse().unwrap(),
            "Entrée",
            Some("home/entry".into()),
        );
        bus.register(&desc);
        let sink = PublishSink::new(client.clone(), bus, [&desc], Duration::from_secs(2));
        (client, sink, desc)
    }

    #[tokio::test]
    async fn test_status_payload() {
        let (client, sink, desc) = sink();
        let snap = StatusSnapshot::online(77, 12, datetime!(2024-05-01 08:30:00 UTC));
        sink.publish_status(&desc.address, &snap).await.unwrap();

        let msgs = client.published_on("home/entry/status");
        assert_eq!(
            msgs,
            vec![serde_json::json!({
                "status": "online",
                "battery": 77,
                "food_level": 12,
                "last_update": "2024-05-01T08:30:00Z",
            })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_broker_publish_times_out() {
        let (client, sink, desc) = sink();
        client.set_stalled(true);
        let snap = StatusSnapshot::online(77, 12, datetime!(2024-05-01 08:30:00 UTC));

        let started = tokio::time::Instant::now();
        let err = sink.publish_status(&desc.address, &snap).await.unwrap_err();
        assert!(matches!(err, BusError::Timeout(_)));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_feed_command() {
        let (_, sink, desc) = sink();
        assert_eq!(
            sink.parse_command("home/entry/command", br#"{"feed": 40}"#),
            Some(InboundFeed {
                address: desc.address,
                amount: 40
            })
        );
    }

    #[test]
    fn test_malformed_commands_dropped() {
        let (_, sink, _) = sink();
        let payloads: [&[u8]; 4] = [b"feed 40", br#"{"feed":"lots"}"#, br#"{"dispense":3}"#, b""];
        for payload in payloads {
            assert_eq!(sink.parse_command("home/entry/command", payload), None);
        }
        assert_eq!(sink.parse_command("home/other/command", br#"{"feed":1}"#), None);
    }

    #[tokio::test]
    async fn test_subscribe_all_covers_commands_and_state() {
        let (client, sink, _) = sink();
        sink.subscribe_all().await.unwrap();
        let subs = client.subscribed.lock().clone();
        assert!(subs.contains(&"home/entry/command".to_string()));
        assert!(subs.contains(&"home/entry/device/state".to_string()));
    }
}
