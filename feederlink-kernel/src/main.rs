/**
 * FEEDERLINK - Point d'entrée du service
 *
 * RÔLE : Charge la config, choisit le radio BLE (matériel, simulé ou aucun),
 * crée le client MQTT, démarre coordinateur + listener bus + health.
 *
 * USAGE : feederlink [--simulate]   (FEEDERLINK_CONFIG, RUST_LOG)
 *
 * ARRÊT : Ctrl-C -> arrêt borné du coordinateur, puis des tâches bus.
 */

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use feederlink::config::{self, FeederConfig};
use feederlink::health::HealthTracker;
use feederlink::mqtt::{self, BusClient};
use feederlink::transport::{DisabledRadio, Radio, SimRadio};
use feederlink::Coordinator;

async fn build_radio(config: &FeederConfig) -> Result<Arc<dyn Radio>> {
    #[cfg(feature = "ble")]
    {
        if !config.simulate {
            let radio = feederlink::transport::btle::BtleRadio::first_adapter()
                .await
                .context("Failed to open BLE adapter")?;
            info!("using BLE adapter");
            return Ok(Arc::new(radio));
        }
    }

    if config.simulate {
        let radio = SimRadio::new();
        for descriptor in config.descriptors()? {
            radio.add_feeder(descriptor.address);
        }
        info!(devices = config.devices.len(), "using simulated feeders");
        return Ok(Arc::new(radio));
    }

    warn!("no BLE support compiled in, devices are reached over MQTT only");
    Ok(Arc::new(DisabledRadio))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("feederlink=info")),
        )
        .init();

    let mut config = config::load_config()
        .await
        .context("Failed to load configuration")?;
    if std::env::args().skip(1).any(|arg| arg == "--simulate") {
        config.simulate = true;
    }

    let radio = build_radio(&config).await?;
    let mqtt_conf = config.mqtt.clone().unwrap_or_default();
    let (client, eventloop) = mqtt::create_mqtt_client(&mqtt_conf);
    let client: Arc<dyn BusClient> = Arc::new(client);

    let coordinator = Coordinator::from_config(&config, radio, client.clone())
        .context("Invalid device configuration")?;
    let health = HealthTracker::new();
    let cancel = CancellationToken::new();

    let listener = mqtt::spawn_bus_listener(eventloop, coordinator.clone(), health.clone(), cancel.clone());
    let health_task = health.spawn_health_publisher(
        client,
        coordinator.subscribe(),
        config.health_interval(),
        cancel.clone(),
    );
    coordinator.start();
    info!(
        broker = %mqtt_conf.host,
        devices = coordinator.devices().len(),
        "feederlink running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutting down");

    coordinator.shutdown().await;
    cancel.cancel();
    let (listener, health_task) = tokio::join!(listener, health_task);
    listener.context("Bus listener panicked")?;
    health_task.context("Health publisher panicked")?;
    Ok(())
}
