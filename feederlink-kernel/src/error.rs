/**
 * ERREURS FEEDERLINK - Taxonomie typée des échecs appareil / transport
 *
 * RÔLE : Une enum `thiserror` par préoccupation. Les erreurs transport et
 * connexion restent confinées à la frontière session/coordinateur ; seules
 * `InvalidAmount` et `UnknownDevice` remontent à l'appelant de `feed_device`.
 */

use std::time::Duration;

use crate::models::DeviceAddress;

/// Une opération bornée a dépassé son délai
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} timed out after {}ms", after.as_millis())]
pub struct TimeoutError {
    pub operation: &'static str,
    pub after: Duration,
}

impl TimeoutError {
    pub fn new(operation: &'static str, after: Duration) -> Self {
        Self { operation, after }
    }
}

/// Erreurs d'encodage / décodage de trames
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("feed amount {0}g outside 1..=500")]
    InvalidAmount(i64),
    #[error("corrupt frame: {0}")]
    FrameCorrupt(String),
}

/// Erreurs du radio BLE sous-jacent (adaptateur bas niveau)
#[derive(Debug, Clone, thiserror::Error)]
pub enum RadioError {
    #[error("device {0} not reachable")]
    Unreachable(DeviceAddress),
    #[error("characteristic {0} not found")]
    MissingCharacteristic(uuid::Uuid),
    #[error("peer disconnected")]
    Disconnected,
    #[error("radio unavailable: {0}")]
    Unavailable(String),
    #[error("radio I/O failed: {0}")]
    Io(String),
}

/// Erreurs du client bus (MQTT)
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("bus client error: {0}")]
    Client(String),
    #[error("bus payload encoding failed: {0}")]
    Encoding(String),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

impl From<rumqttc::ClientError> for BusError {
    fn from(e: rumqttc::ClientError) -> Self {
        Self::Client(e.to_string())
    }
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encoding(e.to_string())
    }
}

/// Échec d'établissement de lien
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("link to {address} failed: {source}")]
    Failed {
        address: DeviceAddress,
        #[source]
        source: RadioError,
    },
    #[error("link to {0} already held by another session")]
    Busy(DeviceAddress),
    #[error("device {0} has no bus topic registered")]
    NotRegistered(DeviceAddress),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

impl ConnectionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Échec de lecture / écriture sur un lien établi
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("link I/O failed: {0}")]
    Radio(#[from] RadioError),
    #[error("bus publish failed: {0}")]
    Bus(#[from] BusError),
    #[error("no status received yet")]
    NoData,
    #[error(transparent)]
    Corrupt(#[from] CodecError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Erreurs retournées par `feed` / `feed_device`
#[derive(Debug, Clone, thiserror::Error)]
pub enum FeedError {
    #[error("feed amount {0}g outside 1..=500")]
    InvalidAmount(i64),
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceAddress),
    #[error("feed to {address} not delivered (local: {local}; bus: {bus})")]
    Undelivered {
        address: DeviceAddress,
        local: String,
        bus: String,
    },
    #[error("session for {0} is shut down")]
    SessionClosed(DeviceAddress),
}

impl FeedError {
    /// Erreurs d'entrée appelant (à remonter), par opposition aux échecs de livraison
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::InvalidAmount(_) | Self::UnknownDevice(_))
    }
}

/// Erreurs de chargement / validation de configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid device address {0:?}")]
    InvalidAddress(String),
    #[error("duplicate device address {0}")]
    DuplicateDevice(DeviceAddress),
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
