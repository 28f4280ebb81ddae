/*!
Test Harness pour feederlink

Assemble un coordinateur complet sans matériel ni broker :
- distributeurs simulés (`SimRadio`)
- bus en mémoire (`MockMqttClient`) dont les messages entrants sont routés
  vers le coordinateur comme le ferait le listener MQTT
- assertions sur les messages publiés
*/

use crate::mqtt_stub::{FeederMessageBuilder, MockMqttClient};
use anyhow::Result;
use feederlink::models::{DeviceAddress, DeviceDescriptor};
use feederlink::transport::{SimFeeder, SimRadio};
use feederlink::{Coordinator, CoordinatorSettings};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
    pub radio: SimRadio,
    pub coordinator: Coordinator,
    devices: Vec<DeviceDescriptor>,
    router: JoinHandle<()>,
}

/// Installe un subscriber `tracing` vers la sortie de test ; sans effet s'il existe déjà.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("feederlink=debug")),
        )
        .with_test_writer()
        .try_init();
}

impl TestHarness {
    /// `count` distributeurs simulés, réglages par défaut
    pub fn new(count: u8) -> Result<Self> {
        Self::with_settings(count, CoordinatorSettings::default())
    }

    pub fn with_settings(count: u8, settings: CoordinatorSettings) -> Result<Self> {
        init_test_logging();

        let radio = SimRadio::new();
        let devices: Vec<DeviceDescriptor> = (1..=count)
            .map(|i| {
                let address = Self::address(i);
                radio.add_feeder(address);
                DeviceDescriptor::new(address, format!("Feeder {i}"), Some(format!("test/feeder{i}")))
            })
            .collect();

        let mqtt_client = MockMqttClient::new();
        let coordinator = Coordinator::new(
            settings,
            devices.clone(),
            Arc::new(radio.clone()),
            Arc::new(mqtt_client.clone()),
        )?;

        let mut incoming = mqtt_client.setup_receiver();
        let routed = coordinator.clone();
        let router = tokio::spawn(async move {
            while let Some(msg) = incoming.recv().await {
                routed.handle_bus_message(&msg.topic, &msg.payload);
            }
        });

        tracing::info!(devices = count, "test harness ready");
        Ok(Self {
            mqtt_client,
            radio,
            coordinator,
            devices,
            router,
        })
    }

    /// Adresse du i-ème distributeur (1-based)
    pub fn address(i: u8) -> DeviceAddress {
        DeviceAddress::new([0xA4, 0xC1, 0x38, 0x00, 0x00, i])
    }

    pub fn descriptor(&self, i: u8) -> &DeviceDescriptor {
        &self.devices[usize::from(i) - 1]
    }

    /// Contrôle du i-ème distributeur (remis à portée s'il avait été retiré)
    pub fn feeder(&self, i: u8) -> Arc<SimFeeder> {
        self.radio.add_feeder(Self::address(i))
    }

    /// Simule `{"feed": amount}` sur `<base>/command`
    pub fn send_feed_command(&self, i: u8, amount: i64) -> Result<()> {
        let payload = serde_json::to_vec(&FeederMessageBuilder::feed_command(amount))?;
        self.mqtt_client
            .simulate_incoming(self.descriptor(i).command_topic(), payload)
    }

    /// Simule un état publié par le pont MQTT de l'appareil
    pub fn send_device_state(&self, i: u8, battery: u8, food_level: u8) -> Result<()> {
        let payload = serde_json::to_vec(&FeederMessageBuilder::device_state(battery, food_level))?;
        self.mqtt_client
            .simulate_incoming(self.descriptor(i).device_state_topic(), payload)
    }

    pub fn send_raw(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.mqtt_client.simulate_incoming(topic, payload.to_vec())
    }

    /// Attend qu'un message soit publié sur `topic`
    pub async fn wait_for_message(&self, topic: &str, timeout_ms: u64) -> Result<Option<Value>> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if let Some(msg) = self.mqtt_client.get_last_json_message::<Value>(topic)? {
                return Ok(Some(msg));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tracing::warn!(topic = %topic, "timeout waiting for message");
        Ok(None)
    }

    /// Attend que `check` soit vrai (bus + simulateur traités de façon asynchrone)
    pub async fn wait_until<F>(&self, timeout_ms: u64, mut check: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        let Some(msg) = self.mqtt_client.get_last_json_message::<Value>(topic)? else {
            anyhow::bail!("no message on {}", topic);
        };
        match get_nested_field(&msg, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!(
                "Field '{}' mismatch: expected {:?}, got {:?}",
                field_path,
                expected,
                actual
            ),
            None => anyhow::bail!("Field '{}' not found in {}", field_path, topic),
        }
    }

    pub fn get_stats(&self) -> TestStats {
        let messages = self.mqtt_client.get_published_messages();
        let mut topic_counts = HashMap::new();
        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }
        TestStats {
            total_messages: messages.len(),
            topic_counts,
            subscriptions: self.mqtt_client.get_subscriptions(),
        }
    }

    /// Arrêt du coordinateur puis du routeur
    pub async fn shutdown(self) {
        self.coordinator.shutdown().await;
        self.router.abort();
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(obj) => obj.get(part),
        _ => None,
    })
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
    pub subscriptions: Vec<String>,
}
