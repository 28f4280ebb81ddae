/*!
# FeederLink DevKit - Mocks et harness de test

- `MockMqttClient` : implémentation en mémoire de `BusClient`
- `TestHarness` : coordinateur complet sur distributeurs simulés
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{FeederMessageBuilder, MockMessage, MockMqttClient};
pub use test_utils::{init_test_logging, TestHarness, TestStats};
