use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MqttConf;
use crate::coordinator::Coordinator;
use crate::error::BusError;
use crate::health::HealthTracker;

pub const HEALTH_TOPIC: &str = "feederlink/health";

/// Pause entre deux tentatives de connexion au broker
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Client bus minimal utilisé par BusLink, PublishSink et le health
#[async_trait]
pub trait BusClient: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError>;

    async fn subscribe(&self, topic: &str) -> Result<(), BusError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), BusError>;
}

#[async_trait]
impl BusClient for AsyncClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        AsyncClient::publish(self, topic, QoS::AtLeastOnce, retain, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        AsyncClient::subscribe(self, topic, QoS::AtLeastOnce).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        AsyncClient::unsubscribe(self, topic).await?;
        Ok(())
    }
}

pub fn create_mqtt_client(conf: &MqttConf) -> (AsyncClient, EventLoop) {
    let client_id = conf
        .client_id
        .clone()
        .unwrap_or_else(|| format!("feederlink-{}", std::process::id()));
    let mut opts = MqttOptions::new(client_id, &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs));
    if let (Some(user), Some(password)) = (&conf.user, &conf.password) {
        opts.set_credentials(user, password);
    }
    AsyncClient::new(opts, 64)
}

/// Boucle d'événements MQTT : réabonnement à chaque ConnAck, routage des
/// publications entrantes vers le coordinateur.
pub fn spawn_bus_listener(
    mut eventloop: EventLoop,
    coordinator: Coordinator,
    health: HealthTracker,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    task::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("bus connected");
                        health.mark_mqtt_connected();
                        // l'eventloop doit continuer de tourner pendant les SUBSCRIBE
                        let coordinator = coordinator.clone();
                        task::spawn(async move {
                            if let Err(e) = coordinator.subscribe_all().await {
                                warn!(error = %e, "bus subscribe failed");
                            }
                        });
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        debug!(topic = %p.topic, bytes = p.payload.len(), "bus message");
                        coordinator.handle_bus_message(&p.topic, &p.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "bus connection error");
                        health.increment_reconnects();
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                        }
                    }
                }
            }
        }
        info!("bus listener stopped");
    })
}
