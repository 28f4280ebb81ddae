//! Test doubles shared by the unit tests of this crate.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::BusError;
use crate::mqtt::BusClient;

/// Bus client that records every call and can be switched off.
#[derive(Default)]
pub struct RecordingBus {
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
    pub subscribed: Mutex<Vec<String>>,
    pub unsubscribed: Mutex<Vec<String>>,
    failing: AtomicBool,
    stalled: AtomicBool,
}

impl RecordingBus {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Publications pending forever, like a broker that stopped acking.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn published_on(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .filter_map(|(_, p)| serde_json::from_slice(p).ok())
            .collect()
    }

    fn check(&self) -> Result<(), BusError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(BusError::Client("broker unreachable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BusClient for RecordingBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, _retain: bool) -> Result<(), BusError> {
        self.check()?;
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.published.lock().push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.check()?;
        self.subscribed.lock().push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        self.check()?;
        self.unsubscribed.lock().push(topic.to_string());
        Ok(())
    }
}
