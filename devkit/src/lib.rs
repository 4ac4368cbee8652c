/*!
# RelayWatch DevKit - Stubs et Utilitaires de Test

Bibliothèque facilitant les tests de l'agent sans backend ni automate réel:
- Stub du backend HTTP (enregistre lectures et résultats de test)
- Stub du bus Modbus (réponses scriptées, latence simulée)
- Collecteur de notifications pour assertions
*/

pub mod backend_stub;
pub mod bus_stub;
pub mod test_utils;

pub use backend_stub::StubBackend;
pub use bus_stub::StubBus;
pub use test_utils::{device, NotificationCollector};
