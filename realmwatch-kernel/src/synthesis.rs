/**
 * SYNTHESE LIVE - Compteurs d'états agrégés par realm
 *
 * RÔLE :
 * Pour chaque realm, un snapshot "live" compte ses hosts/services par état et
 * type d'état (HARD/SOFT) ainsi que les acquittés, en downtime et en flapping.
 * Il est remplacé (pas fusionné) à chaque recalcul.
 *
 * FONCTIONNEMENT :
 * - `recompute_realm` ne lit que les entrées du realm (index par realm)
 * - Au plus un recalcul en cours par realm : un déclenchement reçu pendant un
 *   recalcul marque le realm "sale" et le recalcul en cours reboucle
 * - La concaténation (sous-arbre) n'est payée qu'au moment de la lecture
 */

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::AddAssign;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::{KernelError, KernelResult};
use crate::events::{EventSink, KernelEvent};
use crate::livestate::{CheckState, HostState, LiveStateEntry, ServiceState, StateType};
use crate::models::RealmId;
use crate::realm::RealmTree;
use crate::state::{new_etag, now};
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisCounters {
    pub hosts_total: u64,
    pub hosts_up_hard: u64,
    pub hosts_up_soft: u64,
    pub hosts_down_hard: u64,
    pub hosts_down_soft: u64,
    pub hosts_unreachable_hard: u64,
    pub hosts_unreachable_soft: u64,
    pub hosts_acknowledged: u64,
    pub hosts_in_downtime: u64,
    pub hosts_flapping: u64,
    pub services_total: u64,
    pub services_ok_hard: u64,
    pub services_ok_soft: u64,
    pub services_warning_hard: u64,
    pub services_warning_soft: u64,
    pub services_critical_hard: u64,
    pub services_critical_soft: u64,
    pub services_unknown_hard: u64,
    pub services_unknown_soft: u64,
    pub services_acknowledged: u64,
    pub services_in_downtime: u64,
    pub services_flapping: u64,
}

/// `count / total`, 0.0 quand le total est nul
pub fn ratio(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

impl SynthesisCounters {
    /// Compte une entrée dans exactement un bucket d'état + les compteurs de flags
    pub fn record(&mut self, entry: &LiveStateEntry) {
        let hard = entry.state_type == StateType::Hard;
        match entry.state {
            CheckState::Host(state) => {
                self.hosts_total += 1;
                let bucket = match (state, hard) {
                    (HostState::Up, true) => &mut self.hosts_up_hard,
                    (HostState::Up, false) => &mut self.hosts_up_soft,
                    (HostState::Down, true) => &mut self.hosts_down_hard,
                    (HostState::Down, false) => &mut self.hosts_down_soft,
                    (HostState::Unreachable, true) => &mut self.hosts_unreachable_hard,
                    (HostState::Unreachable, false) => &mut self.hosts_unreachable_soft,
                };
                *bucket += 1;
                self.hosts_acknowledged += u64::from(entry.acknowledged);
                self.hosts_in_downtime += u64::from(entry.downtimed);
                self.hosts_flapping += u64::from(entry.flapping);
            }
            CheckState::Service(state) => {
                self.services_total += 1;
                let bucket = match (state, hard) {
                    (ServiceState::Ok, true) => &mut self.services_ok_hard,
                    (ServiceState::Ok, false) => &mut self.services_ok_soft,
                    (ServiceState::Warning, true) => &mut self.services_warning_hard,
                    (ServiceState::Warning, false) => &mut self.services_warning_soft,
                    (ServiceState::Critical, true) => &mut self.services_critical_hard,
                    (ServiceState::Critical, false) => &mut self.services_critical_soft,
                    (ServiceState::Unknown, true) => &mut self.services_unknown_hard,
                    (ServiceState::Unknown, false) => &mut self.services_unknown_soft,
                };
                *bucket += 1;
                self.services_acknowledged += u64::from(entry.acknowledged);
                self.services_in_downtime += u64::from(entry.downtimed);
                self.services_flapping += u64::from(entry.flapping);
            }
        }
    }

    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LiveStateEntry>) -> Self {
        let mut counters = Self::default();
        for entry in entries {
            counters.record(entry);
        }
        counters
    }

    fn host_buckets(&self) -> [(&'static str, u64); 6] {
        [
            ("hosts_up_hard", self.hosts_up_hard),
            ("hosts_up_soft", self.hosts_up_soft),
            ("hosts_down_hard", self.hosts_down_hard),
            ("hosts_down_soft", self.hosts_down_soft),
            ("hosts_unreachable_hard", self.hosts_unreachable_hard),
            ("hosts_unreachable_soft", self.hosts_unreachable_soft),
        ]
    }

    fn service_buckets(&self) -> [(&'static str, u64); 8] {
        [
            ("services_ok_hard", self.services_ok_hard),
            ("services_ok_soft", self.services_ok_soft),
            ("services_warning_hard", self.services_warning_hard),
            ("services_warning_soft", self.services_warning_soft),
            ("services_critical_hard", self.services_critical_hard),
            ("services_critical_soft", self.services_critical_soft),
            ("services_unknown_hard", self.services_unknown_hard),
            ("services_unknown_soft", self.services_unknown_soft),
        ]
    }

    /// total == somme des buckets HARD + SOFT, pour hosts et services
    pub fn is_consistent(&self) -> bool {
        let hosts: u64 = self.host_buckets().iter().map(|(_, v)| v).sum();
        let services: u64 = self.service_buckets().iter().map(|(_, v)| v).sum();
        hosts == self.hosts_total && services == self.services_total
    }

    pub fn percentages(&self) -> BTreeMap<&'static str, f64> {
        let mut out = BTreeMap::new();
        for (name, count) in self.host_buckets() {
            out.insert(name, ratio(count, self.hosts_total));
        }
        out.insert("hosts_acknowledged", ratio(self.hosts_acknowledged, self.hosts_total));
        out.insert("hosts_in_downtime", ratio(self.hosts_in_downtime, self.hosts_total));
        out.insert("hosts_flapping", ratio(self.hosts_flapping, self.hosts_total));
        for (name, count) in self.service_buckets() {
            out.insert(name, ratio(count, self.services_total));
        }
        out.insert("services_acknowledged", ratio(self.services_acknowledged, self.services_total));
        out.insert("services_in_downtime", ratio(self.services_in_downtime, self.services_total));
        out.insert("services_flapping", ratio(self.services_flapping, self.services_total));
        out
    }
}

impl AddAssign<&SynthesisCounters> for SynthesisCounters {
    fn add_assign(&mut self, other: &SynthesisCounters) {
        self.hosts_total += other.hosts_total;
        self.hosts_up_hard += other.hosts_up_hard;
        self.hosts_up_soft += other.hosts_up_soft;
        self.hosts_down_hard += other.hosts_down_hard;
        self.hosts_down_soft += other.hosts_down_soft;
        self.hosts_unreachable_hard += other.hosts_unreachable_hard;
        self.hosts_unreachable_soft += other.hosts_unreachable_soft;
        self.hosts_acknowledged += other.hosts_acknowledged;
        self.hosts_in_downtime += other.hosts_in_downtime;
        self.hosts_flapping += other.hosts_flapping;
        self.services_total += other.services_total;
        self.services_ok_hard += other.services_ok_hard;
        self.services_ok_soft += other.services_ok_soft;
        self.services_warning_hard += other.services_warning_hard;
        self.services_warning_soft += other.services_warning_soft;
        self.services_critical_hard += other.services_critical_hard;
        self.services_critical_soft += other.services_critical_soft;
        self.services_unknown_hard += other.services_unknown_hard;
        self.services_unknown_soft += other.services_unknown_soft;
        self.services_acknowledged += other.services_acknowledged;
        self.services_in_downtime += other.services_in_downtime;
        self.services_flapping += other.services_flapping;
    }
}

/// Snapshot live d'un realm (une ligne par realm)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisSnapshot {
    pub realm: RealmId,
    #[serde(flatten)]
    pub counters: SynthesisCounters,
    #[serde(rename = "_etag")]
    pub etag: String,
    #[serde(rename = "_updated", with = "time::serde::rfc3339")]
    pub updated: OffsetDateTime,
}

impl SynthesisSnapshot {
    pub fn empty(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            counters: SynthesisCounters::default(),
            etag: new_etag(),
            updated: now(),
        }
    }
}

/// Realms à additionner pour une requête, calculés une seule fois.
/// Le realm demandé doit être visible ; les descendants invisibles sont exclus.
pub fn resolve_members(
    tree: &RealmTree,
    realm: &str,
    concatenate: bool,
    visible: &BTreeSet<RealmId>,
) -> KernelResult<Vec<RealmId>> {
    let target = tree.get(realm).ok_or_else(|| KernelError::not_found("realm", realm))?;
    if !visible.contains(realm) {
        return Err(KernelError::PermissionDenied(realm.to_string()));
    }
    if !concatenate {
        return Ok(vec![target.id.clone()]);
    }
    Ok(tree.subtree(realm).into_iter().filter(|id| visible.contains(id)).collect())
}

#[derive(Debug, Default)]
struct RecomputeSlot {
    running: bool,
    pending: bool,
}

pub struct SynthesisAggregator {
    store: Arc<Store>,
    events: Arc<dyn EventSink>,
    slots: Mutex<HashMap<RealmId, RecomputeSlot>>,
}

impl SynthesisAggregator {
    pub fn new(store: Arc<Store>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events, slots: Mutex::new(HashMap::new()) }
    }

    /// Recompte les entrées du realm et remplace son snapshot live.
    /// Un appel concurrent sur le même realm est fusionné dans le recalcul en cours.
    pub fn recompute_realm(&self, realm: &str) -> KernelResult<()> {
        {
            let mut slots = self.slots.lock();
            let slot = slots.entry(realm.to_string()).or_default();
            if slot.running {
                slot.pending = true;
                debug!("[synthesis] recompute of realm {} coalesced", realm);
                return Ok(());
            }
            slot.running = true;
        }

        loop {
            let result = self.recompute_once(realm);
            let mut slots = self.slots.lock();
            let rerun = match slots.get_mut(realm) {
                Some(slot) if slot.pending && result.is_ok() => {
                    slot.pending = false;
                    true
                }
                _ => false,
            };
            if !rerun {
                slots.remove(realm);
                return result;
            }
        }
    }

    /// Recalcul déclenché après une écriture déjà validée : l'écriture reste
    /// acquise même si le realm a disparu entre-temps
    pub fn recompute_after_commit(&self, realm: &str) {
        if let Err(e) = self.recompute_realm(realm) {
            warn!("[synthesis] recompute of realm {} after commit skipped: {e}", realm);
        }
    }

    fn recompute_once(&self, realm: &str) -> KernelResult<()> {
        if !self.store.realms.read().contains(realm) {
            return Err(KernelError::not_found("realm", realm));
        }
        let counters = SynthesisCounters::from_entries(self.store.livestate.read().entries_in_realm(realm));

        let changed = {
            let mut synthesis = self.store.synthesis.write();
            let snapshot = synthesis
                .entry(realm.to_string())
                .or_insert_with(|| SynthesisSnapshot::empty(realm));
            if snapshot.counters == counters {
                false
            } else {
                snapshot.counters = counters;
                snapshot.etag = new_etag();
                snapshot.updated = now();
                true
            }
        };

        if changed {
            debug!(
                "[synthesis] realm {} recomputed: {} hosts, {} services",
                realm, counters.hosts_total, counters.services_total
            );
            self.events.publish(&KernelEvent::SynthesisUpdated { realm: realm.to_string() });
        }
        Ok(())
    }

    pub fn get_synthesis(
        &self,
        realm: &str,
        concatenate: bool,
        visible: &BTreeSet<RealmId>,
    ) -> KernelResult<SynthesisSnapshot> {
        let members = resolve_members(&self.store.realms.read(), realm, concatenate, visible)?;
        let synthesis = self.store.synthesis.read();

        let mut result = synthesis
            .get(realm)
            .cloned()
            .unwrap_or_else(|| SynthesisSnapshot::empty(realm));
        if concatenate {
            result.counters = SynthesisCounters::default();
            for member in &members {
                if let Some(snapshot) = synthesis.get(member) {
                    result.counters += &snapshot.counters;
                    result.updated = result.updated.max(snapshot.updated);
                }
            }
        }
        Ok(result)
    }

    /// Snapshots live de tous les realms visibles, dans l'ordre de l'arbre
    pub fn list_synthesis(&self, visible: &BTreeSet<RealmId>) -> Vec<SynthesisSnapshot> {
        let order = self.store.realms.read().ordered_ids();
        let synthesis = self.store.synthesis.read();
        order
            .iter()
            .filter(|id| visible.contains(*id))
            .map(|id| synthesis.get(id).cloned().unwrap_or_else(|| SynthesisSnapshot::empty(id)))
            .collect()
    }
}
