/*!
Test Harness du kernel Realmwatch

Facilite l'écriture de tests d'intégration avec:
- Un kernel complet câblé sur un store en mémoire et un `RecordingSink`
- Des raccourcis pour créer realms, hosts, services et changer d'état
- Des assertions sur la cohérence des compteurs de synthèse
*/

use anyhow::Result;
use realmwatch_kernel::config::RetentionConfig;
use realmwatch_kernel::livestate::{LiveStateEntry, LiveStateKey, StateChange};
use realmwatch_kernel::models::{Host, RealmId, Service};
use realmwatch_kernel::realm::Realm;
use realmwatch_kernel::store::Store;
use realmwatch_kernel::synthesis::SynthesisSnapshot;
use realmwatch_kernel::Kernel;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::event_recorder::RecordingSink;
use crate::fixtures::{HostBuilder, RealmBuilder, ServiceBuilder};

/// Harness de test complet pour le kernel
pub struct TestHarness {
    pub kernel: Kernel,
    pub sink: Arc<RecordingSink>,
}

impl TestHarness {
    /// Kernel sur un store vide, realm par défaut "All" créé
    pub fn new() -> Self {
        Self::with_retention(RetentionConfig::default())
    }

    pub fn with_retention(retention: RetentionConfig) -> Self {
        let harness = Self::from_store(Store::new(), retention);
        if let Err(e) = harness.kernel.start() {
            panic!("kernel startup failed: {e}");
        }
        harness
    }

    /// Kernel sur un store existant, sans démarrage automatique
    pub fn from_store(store: Store, retention: RetentionConfig) -> Self {
        init_tracing();
        let sink = Arc::new(RecordingSink::new());
        let kernel = Kernel::new(Arc::new(store), retention, sink.clone());
        Self { kernel, sink }
    }

    pub fn default_realm(&self) -> Realm {
        let tree = self.kernel.store.realms.read();
        match tree.default_realm() {
            Some(realm) => realm.clone(),
            None => panic!("no default realm in the store"),
        }
    }

    /// Tous les realms : vue d'un administrateur
    pub fn all_realms(&self) -> BTreeSet<RealmId> {
        self.kernel.store.realms.read().ordered_ids().into_iter().collect()
    }

    pub fn realm(&self, name: &str, parent: Option<&str>) -> Result<Realm> {
        let mut builder = RealmBuilder::new(name);
        if let Some(parent) = parent {
            builder = builder.parent(parent);
        }
        Ok(self.kernel.realms.create_realm(builder.build())?)
    }

    pub fn host(&self, name: &str, realm: &str) -> Result<Host> {
        Ok(self.kernel.objects.create_host(HostBuilder::new(name).realm(realm).build())?)
    }

    pub fn service(&self, host: &str, name: &str) -> Result<Service> {
        Ok(self.kernel.objects.create_service(ServiceBuilder::new(host, name).build())?)
    }

    /// Entrée live state d'un host (service = None) ou d'un service
    pub fn entry(&self, host: &str, service: Option<&str>) -> Result<LiveStateEntry> {
        let key = LiveStateKey { host: host.to_string(), service: service.map(str::to_string) };
        self.kernel
            .store
            .livestate
            .read()
            .find(&key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no live state entry for {host}/{service:?}"))
    }

    pub fn set_state(&self, host: &str, service: Option<&str>, change: StateChange) -> Result<LiveStateEntry> {
        let entry = self.entry(host, service)?;
        Ok(self.kernel.livestate.apply_state_change(&entry.id, change, Some(&entry.etag))?)
    }

    pub fn synthesis(&self, realm: &str, concatenate: bool) -> Result<SynthesisSnapshot> {
        Ok(self.kernel.synthesis.get_synthesis(realm, concatenate, &self.all_realms())?)
    }

    /// Vérifie hosts_total == Σ buckets hosts (idem services) pour chaque realm
    pub fn assert_counter_consistency(&self) -> Result<()> {
        for snapshot in self.kernel.store.synthesis.read().values() {
            if !snapshot.counters.is_consistent() {
                anyhow::bail!("inconsistent counters for realm {}: {:?}", snapshot.realm, snapshot.counters);
            }
        }
        Ok(())
    }

    /// Vérifie que chaque snapshot live correspond à un recomptage complet
    pub fn assert_synthesis_matches_livestate(&self) -> Result<()> {
        let ids = self.kernel.store.realms.read().ordered_ids();
        for realm in ids {
            let stored = self.synthesis(&realm, false)?.counters;
            let recounted = {
                let table = self.kernel.store.livestate.read();
                realmwatch_kernel::synthesis::SynthesisCounters::from_entries(table.entries_in_realm(&realm))
            };
            if stored != recounted {
                anyhow::bail!("stale synthesis for realm {realm}: stored {stored:?}, recounted {recounted:?}");
            }
        }
        Ok(())
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::StateChangeBuilder;

    #[test]
    fn test_harness_starts_with_default_realm() {
        let harness = TestHarness::new();
        let all = harness.default_realm();
        assert_eq!(all.name, "All");
        assert!(all.default);
        assert!(harness.sink.count_matching(|e| e.realm() == Some(all.id.as_str())) >= 1);
    }

    #[test]
    fn test_harness_state_change_keeps_counters_consistent() {
        let harness = TestHarness::new();
        let all = harness.default_realm();
        let host = harness.host("srv-01", &all.id).unwrap();
        harness.set_state(&host.id, None, StateChangeBuilder::new("DOWN").build()).unwrap();

        harness.assert_counter_consistency().unwrap();
        harness.assert_synthesis_matches_livestate().unwrap();
        assert_eq!(harness.synthesis(&all.id, false).unwrap().counters.hosts_down_hard, 1);
    }
}
