/*!
Mock MQTT Client pour tests sans broker

Implémente `BusClient` : enregistre chaque publication / abonnement et
permet de simuler la réception de messages via un channel.
*/

use anyhow::Result;
use async_trait::async_trait;
use feederlink::error::BusError;
use feederlink::mqtt::BusClient;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Client bus en mémoire, clonable (état partagé)
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    unsubscriptions: Arc<Mutex<Vec<String>>>,
    message_sender: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
    offline: Arc<AtomicBool>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel recevant les messages simulés (remplace l'eventloop)
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.message_sender.lock() = Some(sender);
        receiver
    }

    /// Broker injoignable : toute opération échoue
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        };
        tracing::debug!(topic = %message.topic, "[mock] simulated incoming");
        match self.message_sender.lock().as_ref() {
            Some(sender) => sender
                .send(message)
                .map_err(|e| anyhow::anyhow!("Send error: {}", e)),
            None => anyhow::bail!("no receiver set up"),
        }
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub fn get_unsubscriptions(&self) -> Vec<String> {
        self.unsubscriptions.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parse le dernier message d'un topic en JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last_msg) => Ok(Some(serde_json::from_slice(&last_msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().clear();
        self.subscriptions.lock().clear();
        self.unsubscriptions.lock().clear();
    }

    fn check_online(&self) -> Result<(), BusError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(BusError::Client("mock broker offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BusClient for MockMqttClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        self.check_online()?;
        tracing::debug!(topic = %topic, bytes = payload.len(), "[mock] published");
        self.published_messages.lock().push(MockMessage {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.check_online()?;
        self.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        self.check_online()?;
        self.unsubscriptions.lock().push(topic.to_string());
        Ok(())
    }
}

/// Messages de test au format des topics feederlink
pub struct FeederMessageBuilder;

impl FeederMessageBuilder {
    /// `<base>/command`
    pub fn feed_command(amount: i64) -> Value {
        json!({ "feed": amount })
    }

    /// `<base>/device/state`
    pub fn device_state(battery: u8, food_level: u8) -> Value {
        json!({ "battery": battery, "food_level": food_level })
    }
}
