use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{Aggregate, DeviceStatus};
use crate::mqtt::{BusClient, HEALTH_TOPIC};
use crate::transport::bounded;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusStatus {
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetHealth {
    pub uptime_seconds: u64,
    pub mqtt_status: BusStatus,
    pub mqtt_reconnects: u32,
    pub devices_total: usize,
    pub online: usize,
    pub offline: usize,
    pub error: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<BusStatus>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new(BusStatus::Connecting)),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = BusStatus::Connected;
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = BusStatus::Reconnecting;
    }

    pub fn mqtt_status(&self) -> BusStatus {
        *self.mqtt_status.lock()
    }

    pub fn reconnects(&self) -> u32 {
        self.mqtt_reconnects.load(Ordering::Relaxed)
    }

    pub fn fleet_health(&self, aggregate: &Aggregate) -> FleetHealth {
        let count = |status: DeviceStatus| aggregate.values().filter(|s| s.status == status).count();
        FleetHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            mqtt_status: self.mqtt_status(),
            mqtt_reconnects: self.reconnects(),
            devices_total: aggregate.len(),
            online: count(DeviceStatus::Online),
            offline: count(DeviceStatus::Offline),
            error: count(DeviceStatus::Error),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// Publie la santé de la flotte toutes les `every` jusqu'à annulation
    pub fn spawn_health_publisher(
        &self,
        client: Arc<dyn BusClient>,
        aggregate: watch::Receiver<Aggregate>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let health_tracker = self.clone();

        task::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let current = aggregate.borrow().clone();
                        let health = health_tracker.fleet_health(&current);
                        let payload = match serde_json::to_vec(&health) {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(error = %e, "failed to encode fleet health");
                                continue;
                            }
                        };
                        // un broker muet ne retient ni le tick suivant ni l'arrêt
                        let published = tokio::select! {
                            _ = cancel.cancelled() => break,
                            published = bounded("publish", every, client.publish(HEALTH_TOPIC, payload, false)) => published,
                        };
                        match published {
                            Ok(()) => debug!(
                                uptime = health.uptime_seconds,
                                online = health.online,
                                devices = health.devices_total,
                                "fleet health published"
                            ),
                            Err(e) => warn!(error = %e, "failed to publish fleet health"),
                        }
                    }
                }
            }
            info!("health publisher stopped");
        })
    }
}
