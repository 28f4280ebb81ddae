//! btleplug-backed BLE central (`ble` feature).
//!
//! Scanning starts once when the adapter is opened; `connect` waits for the
//! peripheral to show up in the scan results. The caller's connect timeout
//! bounds that wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{BDAddr, Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tracing::{debug, info};
use uuid::Uuid;

use super::radio::{Radio, RadioLink, DEVICE_SERVICE_UUID};
use crate::error::RadioError;
use crate::models::DeviceAddress;

const SCAN_POLL: Duration = Duration::from_millis(250);

fn io(e: btleplug::Error) -> RadioError {
    RadioError::Io(e.to_string())
}

pub struct BtleRadio {
    adapter: Adapter,
}

impl BtleRadio {
    pub async fn first_adapter() -> Result<Self, RadioError> {
        let manager = Manager::new().await.map_err(io)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(io)?
            .into_iter()
            .next()
            .ok_or_else(|| RadioError::Unavailable("no Bluetooth adapter found".into()))?;
        adapter
            .start_scan(ScanFilter {
                services: vec![DEVICE_SERVICE_UUID],
            })
            .await
            .map_err(io)?;
        info!("BLE scan started");
        Ok(Self { adapter })
    }

    async fn find(&self, address: &DeviceAddress) -> Result<Peripheral, RadioError> {
        let wanted = BDAddr::from(address.bytes());
        loop {
            let found = self
                .adapter
                .peripherals()
                .await
                .map_err(io)?
                .into_iter()
                .find(|p| p.address() == wanted);
            if let Some(peripheral) = found {
                return Ok(peripheral);
            }
            tokio::time::sleep(SCAN_POLL).await;
        }
    }
}

#[async_trait]
impl Radio for BtleRadio {
    async fn connect(&self, address: &DeviceAddress) -> Result<Box<dyn RadioLink>, RadioError> {
        let peripheral = self.find(address).await?;
        peripheral.connect().await.map_err(io)?;
        peripheral.discover_services().await.map_err(io)?;
        debug!(address = %address, "GATT services discovered");
        Ok(Box::new(BtleLink {
            peripheral,
            connected: AtomicBool::new(true),
        }))
    }
}

struct BtleLink {
    peripheral: Peripheral,
    connected: AtomicBool,
}

impl BtleLink {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, RadioError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(RadioError::MissingCharacteristic(uuid))
    }

    fn lost(&self, e: btleplug::Error) -> RadioError {
        self.connected.store(false, Ordering::SeqCst);
        io(e)
    }
}

#[async_trait]
impl RadioLink for BtleLink {
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, RadioError> {
        let c = self.characteristic(characteristic)?;
        self.peripheral.read(&c).await.map_err(|e| self.lost(e))
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), RadioError> {
        let c = self.characteristic(characteristic)?;
        self.peripheral
            .write(&c, data, WriteType::WithResponse)
            .await
            .map_err(|e| self.lost(e))
    }

    async fn disconnect(&self) -> Result<(), RadioError> {
        self.connected.store(false, Ordering::SeqCst);
        self.peripheral.disconnect().await.map_err(io)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
