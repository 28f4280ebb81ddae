//! BLE central seam driven by the local link.
//!
//! `Radio` connects to a peripheral by address; the returned `RadioLink`
//! reads and writes GATT characteristics. The simulated radio, the disabled
//! radio and the btleplug-backed radio all sit behind these two traits.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::RadioError;
use crate::models::DeviceAddress;

/// Feeder GATT service.
pub const DEVICE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
/// Status characteristic (read).
pub const STATUS_CHAR_UUID: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);
/// Feed command characteristic (write with response).
pub const FEED_CHAR_UUID: Uuid = Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);

/// An established link to one peripheral.
#[async_trait]
pub trait RadioLink: Send + Sync {
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, RadioError>;

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), RadioError>;

    async fn disconnect(&self) -> Result<(), RadioError>;

    fn is_connected(&self) -> bool;
}

/// BLE central role.
#[async_trait]
pub trait Radio: Send + Sync {
    async fn connect(&self, address: &DeviceAddress) -> Result<Box<dyn RadioLink>, RadioError>;
}

/// Radio used when no BLE adapter is available: every connect fails and
/// sessions fall back to the bus.
#[derive(Debug, Default, Clone)]
pub struct DisabledRadio;

#[async_trait]
impl Radio for DisabledRadio {
    async fn connect(&self, _address: &DeviceAddress) -> Result<Box<dyn RadioLink>, RadioError> {
        Err(RadioError::Unavailable("no BLE adapter configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_radio_never_connects() {
        let addr: DeviceAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let result = DisabledRadio.connect(&addr).await;
        assert!(matches!(result, Err(RadioError::Unavailable(_))));
    }

    #[test]
    fn test_characteristic_uuids() {
        assert_eq!(
            STATUS_CHAR_UUID.to_string(),
            "0000fff1-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            FEED_CHAR_UUID.to_string(),
            "0000fff2-0000-1000-8000-00805f9b34fb"
        );
    }
}
