//! MQTT fallback link.
//!
//! Writes are published to `<base>/device/command`; reads answer from the
//! latest message cached from `<base>/device/state`. A device is reachable
//! on the bus once its descriptor is registered; `connect` never touches
//! the network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{bounded, Transport};
use crate::codec::CommandFrame;
use crate::error::{BusError, ConnectionError, TransportError};
use crate::models::{DeviceAddress, DeviceDescriptor, StatusSnapshot};
use crate::mqtt::BusClient;

/// Commande publiée vers le pont MQTT de l'appareil
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u16>,
    /// Trame binaire complète, en hexadécimal
    pub frame: String,
    pub command_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl DeviceCommand {
    fn from_frame(frame: &CommandFrame) -> Self {
        let amount = frame.feed_amount();
        Self {
            command: if amount.is_some() { "feed" } else { "raw" }.to_string(),
            amount,
            frame: frame.to_hex(),
            command_id: Uuid::new_v4(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// État publié par le pont MQTT de l'appareil
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceStateMessage {
    pub battery: u8,
    pub food_level: u8,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_update: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct BusHandle {
    address: DeviceAddress,
    command_topic: String,
}

impl BusHandle {
    pub fn address(&self) -> DeviceAddress {
        self.address
    }
}

pub struct BusLink {
    client: Arc<dyn BusClient>,
    devices: RwLock<HashMap<DeviceAddress, DeviceDescriptor>>,
    /// topic device/state -> adresse
    state_topics: RwLock<HashMap<String, DeviceAddress>>,
    latest: RwLock<HashMap<DeviceAddress, StatusSnapshot>>,
}

impl BusLink {
    pub fn new(client: Arc<dyn BusClient>) -> Self {
        Self {
            client,
            devices: RwLock::new(HashMap::new()),
            state_topics: RwLock::new(HashMap::new()),
            latest: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, descriptor: &DeviceDescriptor) {
        self.state_topics
            .write()
            .insert(descriptor.device_state_topic(), descriptor.address);
        self.devices
            .write()
            .insert(descriptor.address, descriptor.clone());
    }

    pub fn is_registered(&self, address: &DeviceAddress) -> bool {
        self.devices.read().contains_key(address)
    }

    /// Souscrit aux topics d'état de tous les appareils enregistrés
    pub async fn subscribe_all(&self) -> Result<(), BusError> {
        let topics: Vec<String> = self.state_topics.read().keys().cloned().collect();
        for topic in topics {
            self.client.subscribe(&topic).await?;
            debug!(topic = %topic, "subscribed to device state");
        }
        Ok(())
    }

    /// Met à jour le cache si `topic` est un topic d'état connu.
    /// Retourne `false` quand le topic ne concerne pas ce lien.
    pub fn ingest_state(&self, topic: &str, payload: &[u8]) -> bool {
        let Some(address) = self.state_topics.read().get(topic).copied() else {
            return false;
        };
        match serde_json::from_slice::<DeviceStateMessage>(payload) {
            Ok(msg) => {
                let at = msg.last_update.unwrap_or_else(OffsetDateTime::now_utc);
                let snapshot = StatusSnapshot::online(msg.battery, msg.food_level, at);
                self.latest.write().insert(address, snapshot);
                debug!(address = %address, "bus state cached");
            }
            Err(e) => warn!(topic = %topic, error = %e, "ignoring malformed device state"),
        }
        true
    }

    pub fn latest(&self, address: &DeviceAddress) -> Option<StatusSnapshot> {
        self.latest.read().get(address).cloned()
    }

    /// Oublie l'appareil et se désabonne de son topic d'état
    pub async fn release(&self, address: &DeviceAddress, timeout: Duration) {
        let Some(descriptor) = self.devices.write().remove(address) else {
            return;
        };
        let topic = descriptor.device_state_topic();
        self.state_topics.write().remove(&topic);
        self.latest.write().remove(address);

        let result: Result<(), TransportError> = bounded("unsubscribe", timeout, async {
            self.client
                .unsubscribe(&topic)
                .await
                .map_err(TransportError::from)
        })
        .await;
        if let Err(e) = result {
            warn!(address = %address, error = %e, "bus unsubscribe failed");
        }
    }
}

#[async_trait]
impl Transport for BusLink {
    type Handle = BusHandle;

    fn name(&self) -> &'static str {
        "bus"
    }

    async fn connect(
        &self,
        address: &DeviceAddress,
        _timeout: Duration,
    ) -> Result<BusHandle, ConnectionError> {
        let command_topic = self
            .devices
            .read()
            .get(address)
            .map(DeviceDescriptor::device_command_topic)
            .ok_or(ConnectionError::NotRegistered(*address))?;
        Ok(BusHandle {
            address: *address,
            command_topic,
        })
    }

    async fn disconnect(&self, _handle: BusHandle) {}

    async fn read_status(
        &self,
        handle: &BusHandle,
        _timeout: Duration,
    ) -> Result<StatusSnapshot, TransportError> {
        self.latest(&handle.address).ok_or(TransportError::NoData)
    }

    async fn write_command(
        &self,
        handle: &BusHandle,
        frame: &CommandFrame,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let command = DeviceCommand::from_frame(frame);
        let payload = serde_json::to_vec(&command).map_err(BusError::from)?;
        bounded("publish", timeout, async {
            self.client
                .publish(&handle.command_topic, payload, false)
                .await
                .map_err(TransportError::from)
        })
        .await?;
        debug!(
            address = %handle.address,
            command_id = %command.command_id,
            "command published on bus"
        );
        Ok(())
    }
}
