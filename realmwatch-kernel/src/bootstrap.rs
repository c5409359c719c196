/**
 * BOOTSTRAP - Recalcul à froid du live state
 *
 * RÔLE : Au démarrage, si la table live state est vide alors que des objets
 * existent (import direct, fichier restauré sans live state), recrée une
 * entrée par host puis par service non-template et recalcule chaque realm
 * touché. Ne fait rien si la table contient déjà une entrée.
 */

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

use crate::error::KernelResult;
use crate::livestate::{LiveStateStore, MonitoredObject};
use crate::models::RealmId;
use crate::store::Store;
use crate::synthesis::SynthesisAggregator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    pub ran: bool,
    pub hosts: usize,
    pub services: usize,
    pub realms: usize,
}

pub struct RecalculationBootstrap {
    store: Arc<Store>,
    livestate: Arc<LiveStateStore>,
    aggregator: Arc<SynthesisAggregator>,
}

impl RecalculationBootstrap {
    pub fn new(store: Arc<Store>, livestate: Arc<LiveStateStore>, aggregator: Arc<SynthesisAggregator>) -> Self {
        Self { store, livestate, aggregator }
    }

    pub fn recalculate_if_empty(&self) -> KernelResult<BootstrapReport> {
        if !self.livestate.is_empty() {
            return Ok(BootstrapReport::default());
        }

        let hosts: Vec<_> = self.store.hosts.read().values().filter(|h| !h.is_template).cloned().collect();
        let services: Vec<_> = self.store.services.read().values().filter(|s| !s.is_template).cloned().collect();

        let mut report = BootstrapReport { ran: true, ..BootstrapReport::default() };
        let mut touched: BTreeSet<RealmId> = BTreeSet::new();

        for host in &hosts {
            self.livestate.upsert_from_object_creation(MonitoredObject::Host(host))?;
            touched.insert(host.realm.clone());
            report.hosts += 1;
        }
        for service in &services {
            // services rattachés à un host template ou disparu : pas d'entrée
            let Some(host) = hosts.iter().find(|h| h.id == service.host) else { continue };
            self.livestate.upsert_from_object_creation(MonitoredObject::Service { service, host })?;
            report.services += 1;
        }

        for realm in &touched {
            self.aggregator.recompute_realm(realm)?;
        }
        report.realms = touched.len();

        info!(
            "[bootstrap] live state rebuilt: {} host(s), {} service(s) over {} realm(s)",
            report.hosts, report.services, report.realms
        );
        Ok(report)
    }
}
