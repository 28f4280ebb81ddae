use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::codec::{MAX_FEED_GRAMS, MIN_FEED_GRAMS};
use crate::error::{CodecError, ConfigError};

/// Adresse 48 bits d'un appareil, affichée `AA:BB:CC:DD:EE:FF`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }

    /// Forme compacte sans séparateurs (ex: "AABBCCDDEEFF"), utilisée pour les topics par défaut
    pub fn compact(&self) -> String {
        self.0.iter().map(|b| format!("{b:02X}")).collect()
    }
}

/// Six paires hexa séparées par ':' ; casse indifférente en entrée.
fn parse_address(text: &str) -> Result<[u8; 6], ConfigError> {
    let bad = || ConfigError::InvalidAddress(text.to_string());
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 6 {
        return Err(bad());
    }
    let mut out = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(bad());
        }
        out[i] = u8::from_str_radix(part, 16).map_err(|_| bad())?;
    }
    Ok(out)
}

impl FromStr for DeviceAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_address(s.trim()).map(Self)
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceAddress> for String {
    fn from(addr: DeviceAddress) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Appareil enregistré : immuable après enregistrement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub address: DeviceAddress,
    pub name: String,
    /// Base des topics MQTT (ex: "petkit/w5/AABBCCDDEEFF")
    pub topic: String,
}

impl DeviceDescriptor {
    pub fn new(address: DeviceAddress, name: impl Into<String>, topic: Option<String>) -> Self {
        let topic = topic
            .filter(|t| !t.trim().is_empty())
            .map(|t| t.trim_end_matches('/').to_string())
            .unwrap_or_else(|| default_topic(&address));
        Self {
            address,
            name: name.into(),
            topic,
        }
    }

    pub fn status_topic(&self) -> String {
        format!("{}/status", self.topic)
    }

    pub fn command_topic(&self) -> String {
        format!("{}/command", self.topic)
    }

    pub fn device_command_topic(&self) -> String {
        format!("{}/device/command", self.topic)
    }

    pub fn device_state_topic(&self) -> String {
        format!("{}/device/state", self.topic)
    }
}

pub fn default_topic(address: &DeviceAddress) -> String {
    format!("petkit/w5/{}", address.compact())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Error,
}

/// Dernier état connu d'un appareil. Les niveaux sont présents ssi `status == online`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub food_level: Option<u8>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusSnapshot {
    pub fn online(battery: u8, food_level: u8, at: OffsetDateTime) -> Self {
        Self {
            status: DeviceStatus::Online,
            battery: Some(battery.min(100)),
            food_level: Some(food_level.min(100)),
            last_update: at,
            error: None,
        }
    }

    pub fn offline() -> Self {
        Self {
            status: DeviceStatus::Offline,
            battery: None,
            food_level: None,
            last_update: OffsetDateTime::now_utc(),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: DeviceStatus::Error,
            battery: None,
            food_level: None,
            last_update: OffsetDateTime::now_utc(),
            error: Some(message.into()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == DeviceStatus::Online
    }
}

/// Provenance d'un snapshot acquis par une session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Local,
    Bus,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquisition {
    pub snapshot: StatusSnapshot,
    pub source: Source,
}

/// Chemin par lequel une commande de distribution est partie
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedDelivery {
    /// Écrite sur le lien local et acquittée
    Local,
    /// Publiée sur le bus : envoyée, confirmation au prochain poll
    Bus,
}

/// Demande de distribution validée (1..=500 g)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRequest {
    pub address: DeviceAddress,
    pub amount: u16,
}

impl FeedRequest {
    pub fn new(address: DeviceAddress, amount: i64) -> Result<Self, CodecError> {
        let in_range = (i64::from(MIN_FEED_GRAMS)..=i64::from(MAX_FEED_GRAMS)).contains(&amount);
        if !in_range {
            return Err(CodecError::InvalidAmount(amount));
        }
        Ok(Self {
            address,
            amount: amount as u16,
        })
    }
}

/// Agrégat complet d'un cycle : remplacé en bloc, jamais muté sur place
pub type Aggregate = Arc<HashMap<DeviceAddress, StatusSnapshot>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_validation() {
        let addr: DeviceAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(addr.bytes(), [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert!("AA:BB:CC:DD:EE".parse::<DeviceAddress>().is_err());
        assert!("GG:BB:CC:DD:EE:FF".parse::<DeviceAddress>().is_err());
        assert!("AA:BB:CC:DD:EE:FF:00".parse::<DeviceAddress>().is_err());
        assert!("AABB:CC:DD:EE:FF".parse::<DeviceAddress>().is_err());
        assert!("A:BB:CC:DD:EE:FFF".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn test_address_canonical_uppercase() {
        let addr: DeviceAddress = "aa:bb:cc:0d:ee:ff".parse().unwrap();
        assert_eq!(addr.to_string(), "AA:BB:CC:0D:EE:FF");
        assert_eq!(addr.compact(), "AABBCC0DEEFF");
    }

    #[test]
    fn test_address_serde_as_string() {
        let addr: DeviceAddress = "01:02:03:04:05:06".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"01:02:03:04:05:06\"");
        let back: DeviceAddress = serde_json::from_str("\"01:02:03:04:05:06\"").unwrap();
        assert_eq!(back, addr);
        assert!(serde_json::from_str::<DeviceAddress>("\"nope\"").is_err());
    }

    #[test]
    fn test_descriptor_default_topic() {
        let addr: DeviceAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let d = DeviceDescriptor::new(addr, "Kitchen", None);
        assert_eq!(d.topic, "petkit/w5/AABBCCDDEEFF");
        assert_eq!(d.status_topic(), "petkit/w5/AABBCCDDEEFF/status");
        assert_eq!(d.command_topic(), "petkit/w5/AABBCCDDEEFF/command");

        let d = DeviceDescriptor::new(addr, "Hall", Some("home/feeder/".into()));
        assert_eq!(d.device_state_topic(), "home/feeder/device/state");
    }

    #[test]
    fn test_snapshot_wire_format() {
        let at = time::macros::datetime!(2024-05-01 12:00:00 UTC);
        let snap = StatusSnapshot::online(95, 80, at);
        let v = serde_json::to_value(&snap).unwrap();
        assert_eq!(v["status"], "online");
        assert_eq!(v["battery"], 95);
        assert_eq!(v["food_level"], 80);
        assert_eq!(v["last_update"], "2024-05-01T12:00:00Z");
        assert!(v.get("error").is_none());

        let off = serde_json::to_value(StatusSnapshot::offline()).unwrap();
        assert_eq!(off["status"], "offline");
        assert!(off.get("battery").is_none());
    }

    #[test]
    fn test_feed_request_range() {
        let addr: DeviceAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert!(FeedRequest::new(addr, 1).is_ok());
        assert!(FeedRequest::new(addr, 500).is_ok());
        assert_eq!(FeedRequest::new(addr, 0), Err(CodecError::InvalidAmount(0)));
        assert_eq!(FeedRequest::new(addr, 501), Err(CodecError::InvalidAmount(501)));
        assert_eq!(FeedRequest::new(addr, -3), Err(CodecError::InvalidAmount(-3)));
        assert_eq!(
            FeedRequest::new(addr, 70_000),
            Err(CodecError::InvalidAmount(70_000))
        );
    }
}
