/**
 * STORE - Tables partagées du kernel et leur persistance JSON
 *
 * RÔLE :
 * Un seul `Store` derrière un `Arc`, injecté dans chaque composant. Chaque
 * table a son propre `RwLock` ; toute acquisition multiple respecte l'ordre
 * realms → hosts → services → livestate → synthesis → retention.
 *
 * PERSISTANCE :
 * Snapshot JSON complet (`StoreDump`) chargé au démarrage, écrit
 * périodiquement et à l'arrêt. L'écriture passe par un fichier temporaire
 * puis un rename pour ne jamais laisser un fichier tronqué.
 */

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{info, warn};

use crate::error::KernelResult;
use crate::livestate::{LiveStateEntry, LiveStateTable};
use crate::models::{Host, HostId, RealmId, Service, ServiceId};
use crate::realm::{Realm, RealmTree};
use crate::retention::{RetainedSnapshot, RetentionTable};
use crate::synthesis::SynthesisSnapshot;

const DUMP_VERSION: u32 = 1;

#[derive(Debug, Default)]
pub struct Store {
    pub realms: RwLock<RealmTree>,
    pub hosts: RwLock<BTreeMap<HostId, Host>>,
    pub services: RwLock<BTreeMap<ServiceId, Service>>,
    pub livestate: RwLock<LiveStateTable>,
    pub synthesis: RwLock<HashMap<RealmId, SynthesisSnapshot>>,
    pub retention: RwLock<RetentionTable>,
}

/// Format du fichier de données
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreDump {
    pub version: u32,
    pub realms: BTreeMap<RealmId, Realm>,
    pub hosts: Vec<Host>,
    pub services: Vec<Service>,
    pub livestate: Vec<LiveStateEntry>,
    pub synthesis: BTreeMap<RealmId, SynthesisSnapshot>,
    pub retention: Vec<RetainedSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub realms: usize,
    pub hosts: usize,
    pub services: usize,
    pub livestate: usize,
    pub retention_rows: usize,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstruit les tables ; chaque realm retrouve une ligne de synthèse
    pub fn from_dump(dump: StoreDump) -> Self {
        let tree = RealmTree::from_realms(dump.realms.into_values().collect());

        let mut synthesis: HashMap<RealmId, SynthesisSnapshot> = dump
            .synthesis
            .into_iter()
            .filter(|(id, _)| tree.contains(id))
            .collect();
        for id in tree.ordered_ids() {
            synthesis.entry(id.clone()).or_insert_with(|| SynthesisSnapshot::empty(&id));
        }

        let retention = dump.retention.into_iter().filter(|r| tree.contains(&r.realm)).collect();

        Self {
            realms: RwLock::new(tree),
            hosts: RwLock::new(dump.hosts.into_iter().map(|h| (h.id.clone(), h)).collect()),
            services: RwLock::new(dump.services.into_iter().map(|s| (s.id.clone(), s)).collect()),
            livestate: RwLock::new(LiveStateTable::from_entries(dump.livestate)),
            synthesis: RwLock::new(synthesis),
            retention: RwLock::new(RetentionTable::from_rows(retention)),
        }
    }

    pub fn dump(&self) -> StoreDump {
        let realms = self.realms.read();
        let hosts = self.hosts.read();
        let services = self.services.read();
        let livestate = self.livestate.read();
        let synthesis = self.synthesis.read();
        let retention = self.retention.read();

        StoreDump {
            version: DUMP_VERSION,
            realms: realms.ordered().into_iter().map(|r| (r.id.clone(), r.clone())).collect(),
            hosts: hosts.values().cloned().collect(),
            services: services.values().cloned().collect(),
            livestate: livestate.entries().cloned().collect(),
            synthesis: synthesis.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            retention: retention.rows().cloned().collect(),
        }
    }

    pub fn counts(&self) -> StoreCounts {
        StoreCounts {
            realms: self.realms.read().len(),
            hosts: self.hosts.read().len(),
            services: self.services.read().len(),
            livestate: self.livestate.read().len(),
            retention_rows: self.retention.read().len(),
        }
    }

    /// Charge le fichier de données, store vide s'il n'existe pas encore
    pub async fn load_from(path: &Path) -> KernelResult<Self> {
        if !path.exists() {
            info!("[store] no data file at {}, starting fresh", path.display());
            return Ok(Self::new());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let dump: StoreDump = serde_json::from_str(&content)?;
        if dump.version > DUMP_VERSION {
            warn!("[store] data file version {} is newer than {}", dump.version, DUMP_VERSION);
        }
        let store = Self::from_dump(dump);

        let counts = store.counts();
        info!(
            "[store] loaded {} realm(s), {} host(s), {} service(s), {} live state(s) from {}",
            counts.realms,
            counts.hosts,
            counts.services,
            counts.livestate,
            path.display()
        );
        Ok(store)
    }

    pub async fn save_to(&self, path: &Path) -> KernelResult<()> {
        let content = serde_json::to_string_pretty(&self.dump())?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
