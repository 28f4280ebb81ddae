/**
 * FEEDERLINK - Surveillance et commande d'une flotte de distributeurs de croquettes
 *
 * RÔLE : Sessions appareil (BLE local + repli MQTT), codec de trames binaires,
 * coordinateur de polling isolé par appareil, republication sur le bus.
 *
 * ARCHITECTURE : codec -> transport -> session -> coordinator -> publish / switch.
 * Le binaire `feederlink` câble le tout avec la config YAML et un client rumqttc.
 */

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod models;
pub mod mqtt;
pub mod publish;
pub mod session;
pub mod switch;
pub mod transport;

#[cfg(test)]
mod testing;

pub use coordinator::{Coordinator, CoordinatorSettings};
pub use error::{CodecError, ConfigError, ConnectionError, FeedError, TransportError};
pub use models::{Aggregate, DeviceAddress, DeviceDescriptor, DeviceStatus, StatusSnapshot};
pub use session::{DeviceSession, SessionTimeouts};
pub use switch::{AutoReset, FeedSwitch};
