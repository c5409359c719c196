/**
 * LIVE STATE - État courant de chaque host et service supervisé
 *
 * RÔLE :
 * Une entrée par host non-template et une par service non-template. C'est la
 * source de vérité des compteurs de synthèse : chaque changement d'état passe
 * par `apply_state_change`, qui déclenche le recalcul du realm concerné.
 *
 * FONCTIONNEMENT :
 * - Table indexée par id, par clé (host, service|null) et par realm
 * - Etat initial dérivé du code `initial_state` de l'objet (un caractère)
 * - Mise à jour d'un host = propagation du nom d'affichage / impact métier
 *   vers son entrée et celles de ses services, déplacement si le realm change
 */

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::error::{check_etag, KernelError, KernelResult};
use crate::events::{EventSink, KernelEvent};
use crate::models::{Host, HostId, RealmId, Service, ServiceId};
use crate::state::{new_etag, new_id, now};
use crate::store::Store;
use crate::synthesis::SynthesisAggregator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostState {
    Up,
    Down,
    Unreachable,
}

impl HostState {
    /// 'd' → DOWN, 'u' → UNREACHABLE, tout le reste → UP
    pub fn from_initial_code(code: &str) -> Self {
        match code {
            "d" => HostState::Down,
            "u" => HostState::Unreachable,
            _ => HostState::Up,
        }
    }

    pub fn id(self) -> u8 {
        match self {
            HostState::Up => 0,
            HostState::Down => 1,
            HostState::Unreachable => 2,
        }
    }
}

impl FromStr for HostState {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UP" => Ok(HostState::Up),
            "DOWN" => Ok(HostState::Down),
            "UNREACHABLE" => Ok(HostState::Unreachable),
            other => Err(KernelError::Validation(format!("'{other}' is not a host state"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceState {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl ServiceState {
    /// 'w' → WARNING, 'c' → CRITICAL, 'u' → UNKNOWN, tout le reste → OK
    pub fn from_initial_code(code: &str) -> Self {
        match code {
            "w" => ServiceState::Warning,
            "c" => ServiceState::Critical,
            "u" => ServiceState::Unknown,
            _ => ServiceState::Ok,
        }
    }

    pub fn id(self) -> u8 {
        match self {
            ServiceState::Ok => 0,
            ServiceState::Warning => 1,
            ServiceState::Critical => 2,
            ServiceState::Unknown => 3,
        }
    }
}

impl FromStr for ServiceState {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OK" => Ok(ServiceState::Ok),
            "WARNING" => Ok(ServiceState::Warning),
            "CRITICAL" => Ok(ServiceState::Critical),
            "UNKNOWN" => Ok(ServiceState::Unknown),
            other => Err(KernelError::Validation(format!("'{other}' is not a service state"))),
        }
    }
}

/// Etat d'une entrée ; les deux jeux de valeurs sont disjoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckState {
    Host(HostState),
    Service(ServiceState),
}

impl CheckState {
    pub fn id(self) -> u8 {
        match self {
            CheckState::Host(s) => s.id(),
            CheckState::Service(s) => s.id(),
        }
    }
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckState::Host(HostState::Up) => "UP",
            CheckState::Host(HostState::Down) => "DOWN",
            CheckState::Host(HostState::Unreachable) => "UNREACHABLE",
            CheckState::Service(ServiceState::Ok) => "OK",
            CheckState::Service(ServiceState::Warning) => "WARNING",
            CheckState::Service(ServiceState::Critical) => "CRITICAL",
            CheckState::Service(ServiceState::Unknown) => "UNKNOWN",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StateType {
    Hard,
    Soft,
}

impl FromStr for StateType {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HARD" => Ok(StateType::Hard),
            "SOFT" => Ok(StateType::Soft),
            other => Err(KernelError::Validation(format!("'{other}' is not a state type"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LiveStateKey {
    pub host: HostId,
    pub service: Option<ServiceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveStateEntry {
    #[serde(rename = "_id")]
    pub id: String,
    pub host: HostId,
    pub service: Option<ServiceId>,
    pub realm: RealmId,
    pub state: CheckState,
    pub state_type: StateType,
    pub state_id: u8,
    pub acknowledged: bool,
    pub downtimed: bool,
    pub flapping: bool,
    pub display_name_host: String,
    pub display_name_service: String,
    pub business_impact: u8,
    pub output: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_check: Option<OffsetDateTime>,
    pub last_state: CheckState,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_state_changed: Option<OffsetDateTime>,
    #[serde(rename = "_etag")]
    pub etag: String,
}

impl LiveStateEntry {
    pub fn key(&self) -> LiveStateKey {
        LiveStateKey { host: self.host.clone(), service: self.service.clone() }
    }

    pub fn is_host(&self) -> bool {
        self.service.is_none()
    }

    fn parse_state(&self, raw: &str) -> KernelResult<CheckState> {
        if self.is_host() {
            Ok(CheckState::Host(raw.parse()?))
        } else {
            Ok(CheckState::Service(raw.parse()?))
        }
    }
}

/// Objet à l'origine d'une entrée live state
#[derive(Debug, Clone, Copy)]
pub enum MonitoredObject<'a> {
    Host(&'a Host),
    Service { service: &'a Service, host: &'a Host },
}

impl MonitoredObject<'_> {
    fn is_template(&self) -> bool {
        match self {
            MonitoredObject::Host(host) => host.is_template,
            MonitoredObject::Service { service, host } => service.is_template || host.is_template,
        }
    }

    fn key(&self) -> LiveStateKey {
        match self {
            MonitoredObject::Host(host) => LiveStateKey { host: host.id.clone(), service: None },
            MonitoredObject::Service { service, host } => LiveStateKey {
                host: host.id.clone(),
                service: Some(service.id.clone()),
            },
        }
    }

    fn initial_entry(&self, id: String) -> LiveStateEntry {
        let (state, display_name_service, business_impact) = match self {
            MonitoredObject::Host(host) => (
                CheckState::Host(HostState::from_initial_code(&host.initial_state)),
                String::new(),
                host.business_impact,
            ),
            MonitoredObject::Service { service, .. } => (
                CheckState::Service(ServiceState::from_initial_code(&service.initial_state)),
                service.display_name().to_string(),
                service.business_impact,
            ),
        };
        let host = match self {
            MonitoredObject::Host(host) | MonitoredObject::Service { host, .. } => *host,
        };
        let key = self.key();
        LiveStateEntry {
            id,
            host: key.host,
            service: key.service,
            realm: host.realm.clone(),
            state,
            state_type: StateType::Hard,
            state_id: state.id(),
            acknowledged: false,
            downtimed: false,
            flapping: false,
            display_name_host: host.display_name().to_string(),
            display_name_service,
            business_impact,
            output: String::new(),
            last_check: None,
            last_state: state,
            last_state_changed: None,
            etag: new_etag(),
        }
    }
}

/// Changement d'état reçu d'un résultat de check ou d'une action
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StateChange {
    pub state: String,
    pub state_type: String,
    pub acknowledged: Option<bool>,
    pub downtimed: Option<bool>,
    pub flapping: Option<bool>,
    pub output: Option<String>,
}

/// Table live state et ses index
#[derive(Debug, Clone, Default)]
pub struct LiveStateTable {
    entries: HashMap<String, LiveStateEntry>,
    by_key: HashMap<LiveStateKey, String>,
    by_realm: HashMap<RealmId, BTreeSet<String>>,
}

impl LiveStateTable {
    pub fn from_entries(entries: Vec<LiveStateEntry>) -> Self {
        let mut table = Self::default();
        for entry in entries {
            table.insert(entry);
        }
        table
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&LiveStateEntry> {
        self.entries.get(id)
    }

    pub fn find(&self, key: &LiveStateKey) -> Option<&LiveStateEntry> {
        self.by_key.get(key).and_then(|id| self.entries.get(id))
    }

    pub fn entries(&self) -> impl Iterator<Item = &LiveStateEntry> {
        self.entries.values()
    }

    pub fn entries_in_realm<'a>(&'a self, realm: &str) -> impl Iterator<Item = &'a LiveStateEntry> + 'a {
        self.by_realm
            .get(realm)
            .into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(id))
    }

    pub fn ids_for_host(&self, host: &str) -> Vec<String> {
        self.entries.values().filter(|e| e.host == host).map(|e| e.id.clone()).collect()
    }

    /// Insère ou remplace (même id ou même clé host/service)
    pub fn insert(&mut self, entry: LiveStateEntry) {
        if let Some(previous) = self.by_key.get(&entry.key()).cloned() {
            self.remove(&previous);
        }
        self.remove(&entry.id);
        self.by_key.insert(entry.key(), entry.id.clone());
        self.by_realm.entry(entry.realm.clone()).or_default().insert(entry.id.clone());
        self.entries.insert(entry.id.clone(), entry);
    }

    pub fn remove(&mut self, id: &str) -> Option<LiveStateEntry> {
        let entry = self.entries.remove(id)?;
        self.by_key.remove(&entry.key());
        if let Some(ids) = self.by_realm.get_mut(&entry.realm) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_realm.remove(&entry.realm);
            }
        }
        Some(entry)
    }

    /// Modifie une entrée sans toucher à son realm ni à sa clé
    fn update<F: FnOnce(&mut LiveStateEntry)>(&mut self, id: &str, f: F) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    fn move_realm(&mut self, id: &str, realm: &str) {
        if let Some(mut entry) = self.remove(id) {
            entry.realm = realm.to_string();
            entry.etag = new_etag();
            self.insert(entry);
        }
    }
}

pub struct LiveStateStore {
    store: Arc<Store>,
    aggregator: Arc<SynthesisAggregator>,
    events: Arc<dyn EventSink>,
}

impl LiveStateStore {
    pub fn new(store: Arc<Store>, aggregator: Arc<SynthesisAggregator>, events: Arc<dyn EventSink>) -> Self {
        Self { store, aggregator, events }
    }

    /// Crée (ou réinitialise) l'entrée d'un host/service fraîchement créé.
    /// Ne recalcule pas la synthèse : l'appelant le fait pour le realm touché.
    pub fn upsert_from_object_creation(&self, object: MonitoredObject<'_>) -> KernelResult<LiveStateEntry> {
        if object.is_template() {
            return Err(KernelError::Validation("templates do not get a live state".into()));
        }
        let mut table = self.store.livestate.write();
        let id = table.find(&object.key()).map(|e| e.id.clone()).unwrap_or_else(new_id);
        let entry = object.initial_entry(id);
        table.insert(entry.clone());
        debug!("[livestate] upserted entry {} ({} {})", entry.id, entry.display_name_host, entry.display_name_service);
        Ok(entry)
    }

    /// Seul chemin de mutation d'état ; recalcule la synthèse du realm
    pub fn apply_state_change(&self, id: &str, change: StateChange, if_match: Option<&str>) -> KernelResult<LiveStateEntry> {
        let entry = {
            let mut table = self.store.livestate.write();
            let current = table.get(id).ok_or_else(|| KernelError::not_found("livestate", id))?;
            check_etag("livestate", id, &current.etag, if_match)?;
            let state = current.parse_state(&change.state)?;
            let state_type: StateType = change.state_type.parse()?;

            let at = now();
            table.update(id, |entry| {
                entry.last_state = entry.state;
                if entry.state != state {
                    entry.last_state_changed = Some(at);
                }
                entry.state = state;
                entry.state_id = state.id();
                entry.state_type = state_type;
                if let Some(flag) = change.acknowledged {
                    entry.acknowledged = flag;
                }
                if let Some(flag) = change.downtimed {
                    entry.downtimed = flag;
                }
                if let Some(flag) = change.flapping {
                    entry.flapping = flag;
                }
                if let Some(output) = change.output {
                    entry.output = output;
                }
                entry.last_check = Some(at);
                entry.etag = new_etag();
            });
            table.get(id).cloned().ok_or_else(|| KernelError::not_found("livestate", id))?
        };

        debug!("[livestate] {} {} is now {} {:?}", entry.display_name_host, entry.display_name_service, entry.state, entry.state_type);
        self.aggregator.recompute_after_commit(&entry.realm);
        self.events.publish(&KernelEvent::LiveStateChanged {
            realm: entry.realm.clone(),
            entry: entry.id.clone(),
        });
        Ok(entry)
    }

    /// Propagation d'une mise à jour de host vers ses entrées
    pub fn on_host_updated(&self, old: &Host, new: &Host) -> KernelResult<()> {
        if self.propagate_host_update(old, new) {
            self.recompute_moved(old, new);
        }
        Ok(())
    }

    /// Partie table de `on_host_updated`, sans recalcul : appelée par l'object
    /// store sous le verrou des hosts. Renvoie true si le host a changé de realm.
    pub(crate) fn propagate_host_update(&self, old: &Host, new: &Host) -> bool {
        let renamed = old.display_name() != new.display_name();
        let impact_changed = old.business_impact != new.business_impact;
        let moved = old.realm != new.realm;
        if !renamed && !impact_changed && !moved {
            return false;
        }

        let mut table = self.store.livestate.write();
        for id in table.ids_for_host(&new.id) {
            // l'impact ne concerne que l'entrée du host ; le nom s'affiche partout
            let is_host = table.get(&id).is_some_and(LiveStateEntry::is_host);
            if renamed || (impact_changed && is_host) {
                table.update(&id, |entry| {
                    entry.display_name_host = new.display_name().to_string();
                    if entry.is_host() {
                        entry.business_impact = new.business_impact;
                    }
                    entry.etag = new_etag();
                });
            }
            if moved {
                table.move_realm(&id, &new.realm);
            }
        }
        moved
    }

    pub(crate) fn recompute_moved(&self, old: &Host, new: &Host) {
        info!("[livestate] host {} moved from realm {} to {}", new.name, old.realm, new.realm);
        self.aggregator.recompute_after_commit(&old.realm);
        self.aggregator.recompute_after_commit(&new.realm);
    }

    pub fn on_service_updated(&self, old: &Service, new: &Service) -> KernelResult<()> {
        if old.display_name() == new.display_name() && old.business_impact == new.business_impact {
            return Ok(());
        }
        let mut table = self.store.livestate.write();
        let key = LiveStateKey { host: new.host.clone(), service: Some(new.id.clone()) };
        if let Some(id) = table.find(&key).map(|e| e.id.clone()) {
            table.update(&id, |entry| {
                entry.display_name_service = new.display_name().to_string();
                entry.business_impact = new.business_impact;
                entry.etag = new_etag();
            });
        }
        Ok(())
    }

    /// Suppression des entrées d'un host (et de ses services)
    pub fn remove_for_host(&self, host: &str) -> KernelResult<usize> {
        let removed: Vec<LiveStateEntry> = {
            let mut table = self.store.livestate.write();
            table.ids_for_host(host).iter().filter_map(|id| table.remove(id)).collect()
        };
        self.recompute_after_removal(&removed);
        Ok(removed.len())
    }

    pub fn remove_for_service(&self, host: &str, service: &str) -> KernelResult<usize> {
        let removed: Vec<LiveStateEntry> = {
            let mut table = self.store.livestate.write();
            let key = LiveStateKey { host: host.to_string(), service: Some(service.to_string()) };
            let id = table.find(&key).map(|e| e.id.clone());
            id.and_then(|id| table.remove(&id)).into_iter().collect()
        };
        self.recompute_after_removal(&removed);
        Ok(removed.len())
    }

    fn recompute_after_removal(&self, removed: &[LiveStateEntry]) {
        let realms: BTreeSet<&RealmId> = removed.iter().map(|e| &e.realm).collect();
        for realm in realms {
            self.aggregator.recompute_after_commit(realm);
        }
    }

    pub fn get(&self, id: &str) -> KernelResult<LiveStateEntry> {
        self.store
            .livestate
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| KernelError::not_found("livestate", id))
    }

    /// Entrées des realms visibles, triées par nom d'affichage
    pub fn list(&self, visible: &BTreeSet<RealmId>) -> Vec<LiveStateEntry> {
        let table = self.store.livestate.read();
        let mut entries: Vec<LiveStateEntry> = visible
            .iter()
            .flat_map(|realm| table.entries_in_realm(realm))
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            (&a.display_name_host, &a.display_name_service, &a.id)
                .cmp(&(&b.display_name_host, &b.display_name_service, &b.id))
        });
        entries
    }

    pub fn count(&self) -> usize {
        self.store.livestate.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.livestate.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_codes() {
        assert_eq!(HostState::from_initial_code("d"), HostState::Down);
        assert_eq!(HostState::from_initial_code("u"), HostState::Unreachable);
        assert_eq!(HostState::from_initial_code("o"), HostState::Up);
        assert_eq!(HostState::from_initial_code(""), HostState::Up);
        assert_eq!(ServiceState::from_initial_code("w"), ServiceState::Warning);
        assert_eq!(ServiceState::from_initial_code("c"), ServiceState::Critical);
        assert_eq!(ServiceState::from_initial_code("u"), ServiceState::Unknown);
        assert_eq!(ServiceState::from_initial_code("x"), ServiceState::Ok);
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!("down".parse::<HostState>().unwrap(), HostState::Down);
        assert!("WARNING".parse::<HostState>().is_err());
        assert_eq!("Critical".parse::<ServiceState>().unwrap(), ServiceState::Critical);
        assert!("SOFTISH".parse::<StateType>().is_err());
    }

    #[test]
    fn test_check_state_serde_is_flat() {
        let json = serde_json::to_string(&CheckState::Service(ServiceState::Unknown)).unwrap();
        assert_eq!(json, "\"UNKNOWN\"");
        let back: CheckState = serde_json::from_str("\"UNREACHABLE\"").unwrap();
        assert_eq!(back, CheckState::Host(HostState::Unreachable));
    }

    fn entry(id: &str, host: &str, service: Option<&str>, realm: &str) -> LiveStateEntry {
        let state = if service.is_some() {
            CheckState::Service(ServiceState::Ok)
        } else {
            CheckState::Host(HostState::Up)
        };
        LiveStateEntry {
            id: id.into(),
            host: host.into(),
            service: service.map(str::to_string),
            realm: realm.into(),
            state,
            state_type: StateType::Hard,
            state_id: 0,
            acknowledged: false,
            downtimed: false,
            flapping: false,
            display_name_host: host.into(),
            display_name_service: service.unwrap_or_default().into(),
            business_impact: 2,
            output: String::new(),
            last_check: None,
            last_state: state,
            last_state_changed: None,
            etag: "e".into(),
        }
    }

    #[test]
    fn test_table_indexes() {
        let mut table = LiveStateTable::default();
        table.insert(entry("1", "h1", None, "r1"));
        table.insert(entry("2", "h1", Some("s1"), "r1"));
        table.insert(entry("3", "h2", None, "r2"));
        assert_eq!(table.entries_in_realm("r1").count(), 2);
        assert_eq!(table.ids_for_host("h1").len(), 2);

        // même clé host/service : remplacement, pas de doublon
        table.insert(entry("4", "h1", Some("s1"), "r1"));
        assert_eq!(table.len(), 3);
        assert!(table.get("2").is_none());

        table.move_realm("3", "r1");
        assert_eq!(table.entries_in_realm("r1").count(), 3);
        assert_eq!(table.entries_in_realm("r2").count(), 0);

        table.remove("1");
        assert!(table.find(&LiveStateKey { host: "h1".into(), service: None }).is_none());
        assert_eq!(table.entries_in_realm("r1").count(), 2);
    }
}
