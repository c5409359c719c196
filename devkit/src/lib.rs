/*!
# Realmwatch DevKit - Utilitaires de test du kernel

Bibliothèque facilitant les tests d'intégration du kernel avec:
- Sink d'événements enregistreur (assertions sur les notifications)
- Builders de realms, hosts, services et changements d'état
- Harness câblant un kernel complet sur un store en mémoire
*/

pub mod event_recorder;
pub mod fixtures;
pub mod test_utils;

pub use event_recorder::RecordingSink;
pub use fixtures::{HostBuilder, RealmBuilder, ServiceBuilder, StateChangeBuilder};
pub use test_utils::TestHarness;
