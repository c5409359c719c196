/**
 * RETENTION - Historique des synthèses par realm
 *
 * RÔLE :
 * Journal append-only de copies immuables des snapshots live, horodatées à la
 * capture. Un job périodique (cron HTTP ou tâche interne) capture tous les
 * realms au même instant puis purge par nombre et par âge.
 *
 * CONCATENATION :
 * L'historique d'un sous-arbre est regroupé par instant de capture : une
 * ligne rejoint le bucket courant si elle est à moins de `bucket_tolerance`
 * de la première ligne du bucket et qu'aucune ligne du même realm n'y est
 * déjà ; sinon elle ouvre un nouveau bucket.
 */

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::config::{HistoryOrder, RetentionConfig};
use crate::error::{KernelError, KernelResult};
use crate::events::{EventSink, KernelEvent};
use crate::models::RealmId;
use crate::state::now;
use crate::store::Store;
use crate::synthesis::{resolve_members, SynthesisCounters};

/// Ligne de rétention, clé (realm, captured_at)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetainedSnapshot {
    pub realm: RealmId,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
    #[serde(flatten)]
    pub counters: SynthesisCounters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub realms: usize,
    pub written: u64,
    pub evicted: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RetentionTable {
    rows: BTreeMap<RealmId, Vec<RetainedSnapshot>>,
    last_captured: Option<OffsetDateTime>,
}

impl RetentionTable {
    pub fn from_rows(rows: Vec<RetainedSnapshot>) -> Self {
        let mut table = Self::default();
        for row in rows {
            table.last_captured = Some(table.last_captured.map_or(row.captured_at, |t| t.max(row.captured_at)));
            table.rows.entry(row.realm.clone()).or_default().push(row);
        }
        for rows in table.rows.values_mut() {
            rows.sort_by_key(|r| r.captured_at);
            rows.dedup_by_key(|r| r.captured_at);
        }
        table
    }

    pub fn rows(&self) -> impl Iterator<Item = &RetainedSnapshot> {
        self.rows.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn for_realm(&self, realm: &str) -> &[RetainedSnapshot] {
        self.rows.get(realm).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Instant de capture strictement croissant, même pour deux appels
    /// dans la même microseconde
    pub fn next_instant(&mut self, at: OffsetDateTime) -> OffsetDateTime {
        let instant = match self.last_captured {
            Some(last) if at <= last => last + Duration::microseconds(1),
            _ => at,
        };
        self.last_captured = Some(instant);
        instant
    }

    fn append(&mut self, row: RetainedSnapshot) {
        self.rows.entry(row.realm.clone()).or_default().push(row);
    }

    pub fn remove_realm(&mut self, realm: &str) -> usize {
        self.rows.remove(realm).map_or(0, |rows| rows.len())
    }

    /// Garde les `max_count` plus récentes (0 = illimité) et plus récentes que `cutoff`
    fn evict(&mut self, realm: &str, max_count: usize, cutoff: Option<OffsetDateTime>) -> u64 {
        let Some(rows) = self.rows.get_mut(realm) else { return 0 };
        let before = rows.len();
        if let Some(cutoff) = cutoff {
            rows.retain(|r| r.captured_at >= cutoff);
        }
        if max_count > 0 && rows.len() > max_count {
            let excess = rows.len() - max_count;
            rows.drain(..excess);
        }
        (before - rows.len()) as u64
    }
}

/// Regroupe des lignes de plusieurs realms par instant de capture et somme chaque bucket
pub fn bucketize(target: &str, mut rows: Vec<RetainedSnapshot>, tolerance: Duration) -> Vec<RetainedSnapshot> {
    rows.sort_by(|a, b| (a.captured_at, &a.realm).cmp(&(b.captured_at, &b.realm)));

    let mut buckets: Vec<RetainedSnapshot> = Vec::new();
    let mut members: BTreeSet<RealmId> = BTreeSet::new();
    for row in rows {
        let joins = buckets
            .last()
            .is_some_and(|b| row.captured_at - b.captured_at <= tolerance && !members.contains(&row.realm));
        if let Some(bucket) = buckets.last_mut().filter(|_| joins) {
            bucket.counters += &row.counters;
            members.insert(row.realm);
        } else {
            members.clear();
            members.insert(row.realm.clone());
            buckets.push(RetainedSnapshot {
                realm: target.to_string(),
                captured_at: row.captured_at,
                counters: row.counters,
            });
        }
    }
    buckets
}

pub struct RetentionLog {
    store: Arc<Store>,
    config: RetentionConfig,
    events: Arc<dyn EventSink>,
}

impl RetentionLog {
    pub fn new(store: Arc<Store>, config: RetentionConfig, events: Arc<dyn EventSink>) -> Self {
        Self { store, config, events }
    }

    /// Copie immuable du snapshot live du realm
    pub fn snapshot(&self, realm: &str) -> KernelResult<RetainedSnapshot> {
        if !self.store.realms.read().contains(realm) {
            return Err(KernelError::not_found("realm", realm));
        }
        let counters = self
            .store
            .synthesis
            .read()
            .get(realm)
            .map(|s| s.counters)
            .unwrap_or_default();

        let mut retention = self.store.retention.write();
        let row = RetainedSnapshot {
            realm: realm.to_string(),
            captured_at: retention.next_instant(now()),
            counters,
        };
        retention.append(row.clone());
        debug!("[retention] captured realm {} at {}", realm, row.captured_at);
        Ok(row)
    }

    /// Historique fini, recalculé à chaque appel depuis les lignes stockées
    pub fn history(
        &self,
        realm: &str,
        concatenate: bool,
        visible: &BTreeSet<RealmId>,
    ) -> KernelResult<Vec<RetainedSnapshot>> {
        let members = resolve_members(&self.store.realms.read(), realm, concatenate, visible)?;
        let retention = self.store.retention.read();

        let mut history = if concatenate {
            let rows: Vec<RetainedSnapshot> = members
                .iter()
                .flat_map(|m| retention.for_realm(m).iter().cloned())
                .collect();
            bucketize(realm, rows, self.config.bucket_tolerance())
        } else {
            retention.for_realm(realm).to_vec()
        };

        if self.config.order == HistoryOrder::NewestFirst {
            history.reverse();
        }
        Ok(history)
    }

    /// Job planifié : capture de tous les realms au même instant puis purge
    pub fn run_job(&self) -> KernelResult<JobReport> {
        let realms = self.store.realms.read().ordered_ids();
        let snapshots: Vec<(RealmId, SynthesisCounters)> = {
            let synthesis = self.store.synthesis.read();
            realms
                .iter()
                .map(|id| (id.clone(), synthesis.get(id).map(|s| s.counters).unwrap_or_default()))
                .collect()
        };

        let mut report = JobReport { realms: realms.len(), written: 0, evicted: 0 };
        {
            let mut retention = self.store.retention.write();
            let captured_at = retention.next_instant(now());
            let cutoff = self.config.max_age().map(|age| captured_at - age);
            for (realm, counters) in snapshots {
                retention.append(RetainedSnapshot { realm: realm.clone(), captured_at, counters });
                report.written += 1;
                report.evicted += retention.evict(&realm, self.config.max_snapshots, cutoff);
            }
        }

        info!(
            "[retention] job done: {} snapshot(s) written, {} evicted over {} realm(s)",
            report.written, report.evicted, report.realms
        );
        self.events.publish(&KernelEvent::RetentionWritten {
            written: report.written,
            evicted: report.evicted,
        });
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn row(realm: &str, at: OffsetDateTime, hosts: u64) -> RetainedSnapshot {
        RetainedSnapshot {
            realm: realm.into(),
            captured_at: at,
            counters: SynthesisCounters { hosts_total: hosts, hosts_up_hard: hosts, ..SynthesisCounters::default() },
        }
    }

    #[test]
    fn test_next_instant_is_strictly_increasing() {
        let mut table = RetentionTable::default();
        let at = datetime!(2024-05-01 10:00:00 UTC);
        let first = table.next_instant(at);
        let second = table.next_instant(at);
        let third = table.next_instant(at - Duration::seconds(5));
        assert_eq!(first, at);
        assert!(second > first);
        assert!(third > second);
    }

    #[test]
    fn test_evict_by_count_and_age() {
        let t0 = datetime!(2024-05-01 10:00:00 UTC);
        let mut table = RetentionTable::from_rows((0..5).map(|i| row("r", t0 + Duration::minutes(i), 1)).collect());
        assert_eq!(table.evict("r", 3, None), 2);
        assert_eq!(table.for_realm("r")[0].captured_at, t0 + Duration::minutes(2));
        assert_eq!(table.evict("r", 0, Some(t0 + Duration::minutes(4))), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.evict("unknown", 1, None), 0);
    }

    #[test]
    fn test_bucketize_exact_alignment() {
        let t0 = datetime!(2024-05-01 10:00:00 UTC);
        let t1 = t0 + Duration::minutes(5);
        let rows = vec![row("a", t0, 1), row("b", t0, 2), row("a", t1, 3), row("b", t1, 4)];
        let buckets = bucketize("root", rows, Duration::ZERO);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].captured_at, t0);
        assert_eq!(buckets[0].counters.hosts_total, 3);
        assert_eq!(buckets[1].counters.hosts_total, 7);
        assert!(buckets.iter().all(|b| b.realm == "root" && b.counters.is_consistent()));
    }

    #[test]
    fn test_bucketize_tolerance_and_same_realm_split() {
        let t0 = datetime!(2024-05-01 10:00:00 UTC);
        let rows = vec![
            row("a", t0, 1),
            row("b", t0 + Duration::seconds(2), 1),
            // même realm dans la fenêtre : bucket séparé
            row("a", t0 + Duration::seconds(3), 1),
            row("b", t0 + Duration::seconds(30), 1),
        ];
        let strict = bucketize("root", rows.clone(), Duration::ZERO);
        assert_eq!(strict.len(), 4);

        let tolerant = bucketize("root", rows, Duration::seconds(5));
        let totals: Vec<u64> = tolerant.iter().map(|b| b.counters.hosts_total).collect();
        assert_eq!(totals, vec![2, 1, 1]);
    }
}
