/**
 * REALMWATCH KERNEL - Cœur du backend de supervision par realms
 *
 * RÔLE : Arbre des realms, live state des hosts/services, synthèse par realm,
 * rétention historique et recalcul à froid, exposés via une API REST.
 *
 * ARCHITECTURE : un `Store` partagé (Arc + un RwLock par table) injecté dans
 * chaque composant ; les notifications passent par un `EventSink` explicite.
 */

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod http;
pub mod livestate;
pub mod models;
pub mod objects;
pub mod realm;
pub mod retention;
pub mod state;
pub mod store;
pub mod synthesis;
pub mod visibility;

use std::sync::Arc;

use crate::bootstrap::{BootstrapReport, RecalculationBootstrap};
use crate::config::RetentionConfig;
use crate::error::KernelResult;
use crate::events::EventSink;
use crate::livestate::LiveStateStore;
use crate::objects::ObjectStore;
use crate::realm::RealmRegistry;
use crate::retention::RetentionLog;
use crate::store::Store;
use crate::synthesis::SynthesisAggregator;

/// Ensemble des composants câblés sur un même store
#[derive(Clone)]
pub struct Kernel {
    pub store: Arc<Store>,
    pub events: Arc<dyn EventSink>,
    pub realms: Arc<RealmRegistry>,
    pub synthesis: Arc<SynthesisAggregator>,
    pub livestate: Arc<LiveStateStore>,
    pub objects: Arc<ObjectStore>,
    pub retention: Arc<RetentionLog>,
    pub bootstrap: Arc<RecalculationBootstrap>,
}

impl Kernel {
    pub fn new(store: Arc<Store>, retention: RetentionConfig, events: Arc<dyn EventSink>) -> Self {
        let realms = Arc::new(RealmRegistry::new(store.clone(), events.clone()));
        let synthesis = Arc::new(SynthesisAggregator::new(store.clone(), events.clone()));
        let livestate = Arc::new(LiveStateStore::new(store.clone(), synthesis.clone(), events.clone()));
        let objects = Arc::new(ObjectStore::new(store.clone(), livestate.clone(), synthesis.clone()));
        let retention = Arc::new(RetentionLog::new(store.clone(), retention, events.clone()));
        let bootstrap = Arc::new(RecalculationBootstrap::new(store.clone(), livestate.clone(), synthesis.clone()));

        Self { store, events, realms, synthesis, livestate, objects, retention, bootstrap }
    }

    /// Realm par défaut si besoin, puis recalcul à froid du live state
    pub fn start(&self) -> KernelResult<BootstrapReport> {
        if let Some(realm) = self.realms.ensure_default_realm()? {
            tracing::info!("[kernel] created default realm {} ({})", realm.name, realm.id);
        }
        self.bootstrap.recalculate_if_empty()
    }
}
