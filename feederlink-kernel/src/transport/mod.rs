/**
 * TRANSPORTS - Capacité commune aux deux chemins vers un distributeur
 *
 * RÔLE :
 * Le trait `Transport` expose {connect, disconnect, read_status, write_command}.
 * Deux variantes concrètes :
 * - LocalLink : BLE point-à-point, un handle exclusif par adresse
 * - BusLink   : MQTT publish/subscribe, utilisé en repli
 *
 * FONCTIONNEMENT :
 * Chaque point de suspension est borné par un timeout explicite ; un
 * dépassement devient `TimeoutError`. Le choix et l'ordre de repli entre
 * les deux variantes appartiennent à `DeviceSession`, pas aux transports.
 */

pub mod bus;
pub mod local;
pub mod radio;
pub mod sim;

#[cfg(feature = "ble")]
pub mod btle;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::codec::CommandFrame;
use crate::error::{ConnectionError, TimeoutError, TransportError};
use crate::models::{DeviceAddress, StatusSnapshot};

pub use bus::{BusHandle, BusLink};
pub use local::{LocalHandle, LocalLink};
pub use radio::{DisabledRadio, Radio, RadioLink};
pub use sim::{SimBehavior, SimFeeder, SimRadio};

#[async_trait]
pub trait Transport: Send + Sync {
    type Handle: Send + Sync;

    fn name(&self) -> &'static str;

    async fn connect(
        &self,
        address: &DeviceAddress,
        timeout: Duration,
    ) -> Result<Self::Handle, ConnectionError>;

    /// Idempotent ; n'échoue jamais côté appelant
    async fn disconnect(&self, handle: Self::Handle);

    async fn read_status(
        &self,
        handle: &Self::Handle,
        timeout: Duration,
    ) -> Result<StatusSnapshot, TransportError>;

    async fn write_command(
        &self,
        handle: &Self::Handle,
        frame: &CommandFrame,
        timeout: Duration,
    ) -> Result<(), TransportError>;
}

/// Borne une opération ; l'expiration est convertie dans l'erreur de l'appelant
pub(crate) async fn bounded<T, E, F>(operation: &'static str, limit: Duration, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<TimeoutError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TimeoutError::new(operation, limit).into()),
    }
}
