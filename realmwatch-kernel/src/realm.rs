/**
 * ARBRE DES REALMS - Hiérarchie administrative/visibilité des ressources
 *
 * RÔLE :
 * Chaque host appartient à un realm. Les realms forment une forêt ; le kernel
 * maintient pour chacun les champs dérivés `_level`, `_tree_parents` (ancêtres
 * de la racine au parent direct), `_children` (enfants directs) et
 * `_tree_children` (tous les descendants, parent avant enfant).
 *
 * FONCTIONNEMENT :
 * - `RealmTree` = structure pure : insertion, suppression, reparentage et
 *   recalcul des fermetures. Aucun verrou ici.
 * - `RealmRegistry` = opérations sur le store : on clone l'arbre, on applique
 *   la mutation sur la copie puis on remplace l'arbre d'un coup sous le verrou
 *   d'écriture. Les lecteurs voient l'ancienne ou la nouvelle fermeture,
 *   jamais un état intermédiaire.
 * - Les champs dérivés ne sont jamais écrits par un client (412).
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::error::{check_etag, KernelError, KernelResult};
use crate::events::{EventSink, KernelEvent};
use crate::models::{validate_name, RealmId};
use crate::state::{new_etag, new_id, now};
use crate::store::Store;
use crate::synthesis::SynthesisSnapshot;

/// Champs calculés par le kernel, refusés en écriture
pub const DERIVED_FIELDS: [&str; 4] = ["_level", "_tree_parents", "_children", "_tree_children"];

/// Nom du realm racine créé quand le store est vide
pub const DEFAULT_REALM_NAME: &str = "All";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Realm {
    #[serde(rename = "_id")]
    pub id: RealmId,
    pub name: String,
    pub alias: String,
    #[serde(rename = "_parent")]
    pub parent: Option<RealmId>,
    pub default: bool,
    #[serde(rename = "_level")]
    pub level: u32,
    #[serde(rename = "_tree_parents")]
    pub tree_parents: Vec<RealmId>,
    #[serde(rename = "_children")]
    pub children: Vec<RealmId>,
    #[serde(rename = "_tree_children")]
    pub tree_children: Vec<RealmId>,
    #[serde(rename = "_etag")]
    pub etag: String,
    #[serde(rename = "_created", with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(rename = "_updated", with = "time::serde::rfc3339")]
    pub updated: OffsetDateTime,
}

impl Realm {
    fn touch(&mut self, at: OffsetDateTime) {
        self.etag = new_etag();
        self.updated = at;
    }
}

/// Payload de création (POST /realm)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NewRealm {
    pub name: String,
    #[serde(default)]
    pub alias: String,
    #[serde(rename = "_parent", alias = "parent", default)]
    pub parent: Option<RealmId>,
    #[serde(default)]
    pub default: bool,
}

impl NewRealm {
    pub fn from_json(value: &Value) -> KernelResult<Self> {
        reject_derived_fields(value)?;
        serde_json::from_value(value.clone()).map_err(|e| KernelError::Validation(e.to_string()))
    }
}

/// Modification partielle (PATCH /realm/{id})
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RealmPatch {
    pub name: Option<String>,
    pub alias: Option<String>,
    pub default: Option<bool>,
    /// Some(None) = devenir racine
    pub parent: Option<Option<RealmId>>,
}

impl RealmPatch {
    pub fn from_json(value: &Value) -> KernelResult<Self> {
        reject_derived_fields(value)?;
        let Some(fields) = value.as_object() else {
            return Err(KernelError::Validation("realm patch must be a JSON object".into()));
        };

        let mut patch = RealmPatch::default();
        for (key, field) in fields {
            match key.as_str() {
                "name" => patch.name = Some(expect_string(key, field)?),
                "alias" => patch.alias = Some(expect_string(key, field)?),
                "default" => {
                    let flag = field
                        .as_bool()
                        .ok_or_else(|| KernelError::Validation("'default' must be a boolean".into()))?;
                    patch.default = Some(flag);
                }
                "_parent" | "parent" => {
                    let parent = match field {
                        Value::Null => None,
                        other => Some(expect_string(key, other)?),
                    };
                    patch.parent = Some(parent);
                }
                other => {
                    return Err(KernelError::Validation(format!("unknown or read-only realm field '{other}'")));
                }
            }
        }
        Ok(patch)
    }
}

fn expect_string(key: &str, value: &Value) -> KernelResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| KernelError::Validation(format!("'{key}' must be a string")))
}

fn reject_derived_fields(value: &Value) -> KernelResult<()> {
    if let Some(fields) = value.as_object() {
        if let Some(field) = DERIVED_FIELDS.iter().find(|f| fields.contains_key(**f)) {
            return Err(KernelError::ForbiddenFieldUpdate(field.to_string()));
        }
    }
    Ok(())
}

/// Forêt des realms et de leurs fermetures
#[derive(Debug, Clone, Default)]
pub struct RealmTree {
    realms: HashMap<RealmId, Realm>,
}

impl RealmTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstruit l'arbre depuis des enregistrements persistés ; les champs
    /// dérivés stockés sont ignorés et recalculés.
    pub fn from_realms(realms: Vec<Realm>) -> Self {
        let mut tree = Self {
            realms: realms.into_iter().map(|r| (r.id.clone(), r)).collect(),
        };
        tree.rebuild();
        tree
    }

    pub fn len(&self) -> usize {
        self.realms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.realms.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.realms.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Realm> {
        self.realms.get(id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Realm> {
        self.realms.values().find(|r| r.name == name)
    }

    pub fn default_realm(&self) -> Option<&Realm> {
        self.realms.values().find(|r| r.default)
    }

    /// Le realm et tous ses descendants
    pub fn subtree(&self, id: &str) -> Vec<RealmId> {
        match self.realms.get(id) {
            Some(realm) => std::iter::once(realm.id.clone())
                .chain(realm.tree_children.iter().cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Ordre total parent-avant-enfant (racines triées par nom)
    pub fn ordered_ids(&self) -> Vec<RealmId> {
        let mut ordered = Vec::with_capacity(self.realms.len());
        for root in self.sorted_roots() {
            ordered.push(root.clone());
            if let Some(realm) = self.realms.get(&root) {
                ordered.extend(realm.tree_children.iter().cloned());
            }
        }
        ordered
    }

    pub fn ordered(&self) -> Vec<&Realm> {
        self.ordered_ids().iter().filter_map(|id| self.realms.get(id)).collect()
    }

    pub fn insert(&mut self, new: NewRealm) -> KernelResult<RealmId> {
        validate_name("realm", &new.name)?;
        if self.find_by_name(&new.name).is_some() {
            return Err(KernelError::DuplicateName { entity: "realm", name: new.name });
        }
        if let Some(parent) = &new.parent {
            if !self.realms.contains_key(parent) {
                return Err(KernelError::ParentNotFound(parent.clone()));
            }
        }

        let at = now();
        let id = new_id();
        if new.default {
            self.clear_default(at);
        }
        self.realms.insert(
            id.clone(),
            Realm {
                id: id.clone(),
                name: new.name,
                alias: new.alias,
                parent: new.parent.clone(),
                default: new.default,
                level: 0,
                tree_parents: Vec::new(),
                children: Vec::new(),
                tree_children: Vec::new(),
                etag: new_etag(),
                created: at,
                updated: at,
            },
        );

        if let Some(parent) = new.parent {
            self.attach_child(&parent, &id, at);
        }
        self.refresh_subtree(&id, at);
        let ancestors = self.realms[&id].tree_parents.clone();
        self.refresh_descendants_of(&ancestors, at);
        Ok(id)
    }

    pub fn remove(&mut self, id: &str) -> KernelResult<Realm> {
        let realm = self.realms.get(id).ok_or_else(|| KernelError::not_found("realm", id))?;
        if !realm.tree_children.is_empty() {
            return Err(KernelError::Conflict(format!(
                "realm '{}' still has {} sub-realm(s), delete them first",
                realm.name,
                realm.tree_children.len()
            )));
        }
        if realm.default {
            return Err(KernelError::Conflict(format!("realm '{}' is the default realm", realm.name)));
        }

        let at = now();
        let removed = self.realms.remove(id).ok_or_else(|| KernelError::not_found("realm", id))?;
        if let Some(parent) = &removed.parent {
            self.detach_child(parent, id, at);
        }
        self.refresh_descendants_of(&removed.tree_parents, at);
        Ok(removed)
    }

    pub fn reparent(&mut self, id: &str, new_parent: Option<RealmId>) -> KernelResult<()> {
        let realm = self.realms.get(id).ok_or_else(|| KernelError::not_found("realm", id))?;
        if realm.parent == new_parent {
            return Ok(());
        }
        if let Some(parent) = &new_parent {
            if !self.realms.contains_key(parent) {
                return Err(KernelError::ParentNotFound(parent.clone()));
            }
            if parent == id || realm.tree_children.contains(parent) {
                return Err(KernelError::WouldCreateCycle { realm: id.to_string(), parent: parent.clone() });
            }
        }

        let at = now();
        let old_ancestors = realm.tree_parents.clone();
        let old_parent = realm.parent.clone();
        if let Some(old) = &old_parent {
            self.detach_child(old, id, at);
        }
        if let Some(realm) = self.realms.get_mut(id) {
            realm.parent = new_parent.clone();
            realm.touch(at);
        }
        if let Some(parent) = &new_parent {
            self.attach_child(parent, id, at);
        }

        self.refresh_subtree(id, at);
        let mut ancestors: Vec<RealmId> = old_ancestors;
        ancestors.extend(self.realms[id].tree_parents.iter().cloned());
        self.refresh_descendants_of(&ancestors, at);
        Ok(())
    }

    pub fn apply_patch(&mut self, id: &str, patch: RealmPatch) -> KernelResult<()> {
        let realm = self.realms.get(id).ok_or_else(|| KernelError::not_found("realm", id))?;
        if let Some(name) = &patch.name {
            validate_name("realm", name)?;
            if self.realms.values().any(|r| r.id != id && &r.name == name) {
                return Err(KernelError::DuplicateName { entity: "realm", name: name.clone() });
            }
        }
        if patch.default == Some(false) && realm.default {
            return Err(KernelError::Validation(
                "one realm must stay default, mark another realm as default instead".into(),
            ));
        }

        if let Some(parent) = patch.parent.clone() {
            self.reparent(id, parent)?;
        }

        let at = now();
        if patch.default == Some(true) {
            self.clear_default(at);
        }
        let renamed = patch.name.is_some();
        if let Some(realm) = self.realms.get_mut(id) {
            if let Some(name) = patch.name {
                realm.name = name;
            }
            if let Some(alias) = patch.alias {
                realm.alias = alias;
            }
            if let Some(flag) = patch.default {
                realm.default = flag;
            }
            realm.touch(at);
        }

        // l'ordre des enfants dépend des noms
        if renamed {
            if let Some(parent) = self.realms[id].parent.clone() {
                self.sort_children(&parent, at);
            }
            let ancestors = self.realms[id].tree_parents.clone();
            self.refresh_descendants_of(&ancestors, at);
        }
        Ok(())
    }

    /// Recalcule toutes les fermetures depuis les seuls liens `_parent`.
    /// Un parent inconnu ou un cycle fait du realm concerné une racine.
    pub fn rebuild(&mut self) {
        let at = now();
        let dangling: Vec<RealmId> = self
            .realms
            .values()
            .filter(|r| r.parent.as_ref().is_some_and(|p| !self.realms.contains_key(p)))
            .map(|r| r.id.clone())
            .collect();
        for id in dangling {
            warn!("[realms] realm {} references an unknown parent, promoting it to root", id);
            if let Some(realm) = self.realms.get_mut(&id) {
                realm.parent = None;
            }
        }

        loop {
            let mut children: HashMap<RealmId, Vec<RealmId>> = HashMap::new();
            for realm in self.realms.values() {
                if let Some(parent) = &realm.parent {
                    children.entry(parent.clone()).or_default().push(realm.id.clone());
                }
            }
            let ids: Vec<RealmId> = self.realms.keys().cloned().collect();
            for id in ids {
                let mut list = children.remove(&id).unwrap_or_default();
                list.sort_by(|a, b| self.sort_key(a).cmp(&self.sort_key(b)));
                if let Some(realm) = self.realms.get_mut(&id) {
                    realm.children = list;
                }
            }

            let mut reached = BTreeSet::new();
            for root in self.sorted_roots() {
                reached.insert(root.clone());
                reached.extend(self.walk_descendants(&root));
            }
            if reached.len() == self.realms.len() {
                break;
            }
            // realms hors d'atteinte depuis une racine = cycle
            let mut orphans: Vec<RealmId> = self.realms.keys().filter(|id| !reached.contains(*id)).cloned().collect();
            orphans.sort();
            warn!("[realms] cycle detected around realm {}, promoting it to root", orphans[0]);
            if let Some(realm) = self.realms.get_mut(&orphans[0]) {
                realm.parent = None;
            }
        }

        for root in self.sorted_roots() {
            self.refresh_subtree(&root, at);
        }
        let all: Vec<RealmId> = self.realms.keys().cloned().collect();
        self.refresh_descendants_of(&all, at);
    }

    fn sort_key(&self, id: &str) -> (String, String) {
        let name = self.realms.get(id).map(|r| r.name.clone()).unwrap_or_default();
        (name, id.to_string())
    }

    fn sorted_roots(&self) -> Vec<RealmId> {
        let mut roots: Vec<RealmId> = self
            .realms
            .values()
            .filter(|r| r.parent.is_none())
            .map(|r| r.id.clone())
            .collect();
        roots.sort_by(|a, b| self.sort_key(a).cmp(&self.sort_key(b)));
        roots
    }

    fn clear_default(&mut self, at: OffsetDateTime) {
        for realm in self.realms.values_mut().filter(|r| r.default) {
            realm.default = false;
            realm.touch(at);
        }
    }

    fn attach_child(&mut self, parent: &str, child: &str, at: OffsetDateTime) {
        if let Some(realm) = self.realms.get_mut(parent) {
            if !realm.children.iter().any(|c| c == child) {
                realm.children.push(child.to_string());
                realm.touch(at);
            }
        }
        self.sort_children(parent, at);
    }

    fn detach_child(&mut self, parent: &str, child: &str, at: OffsetDateTime) {
        if let Some(realm) = self.realms.get_mut(parent) {
            realm.children.retain(|c| c != child);
            realm.touch(at);
        }
    }

    fn sort_children(&mut self, parent: &str, at: OffsetDateTime) {
        let Some(realm) = self.realms.get(parent) else { return };
        let mut sorted = realm.children.clone();
        sorted.sort_by(|a, b| self.sort_key(a).cmp(&self.sort_key(b)));
        if let Some(realm) = self.realms.get_mut(parent) {
            if realm.children != sorted {
                realm.children = sorted;
                realm.touch(at);
            }
        }
    }

    /// Descendants en largeur, parent avant enfant
    fn walk_descendants(&self, id: &str) -> Vec<RealmId> {
        let mut out = Vec::new();
        let mut queue: VecDeque<RealmId> = self
            .realms
            .get(id)
            .map(|r| r.children.iter().cloned().collect())
            .unwrap_or_default();
        let mut seen = BTreeSet::new();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(realm) = self.realms.get(&next) {
                queue.extend(realm.children.iter().cloned());
            }
            out.push(next);
        }
        out
    }

    /// `_level` et `_tree_parents` de haut en bas à partir de `id`
    fn refresh_subtree(&mut self, id: &str, at: OffsetDateTime) {
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            let Some(realm) = self.realms.get(&current) else { continue };
            let (level, tree_parents) = match realm.parent.as_ref().and_then(|p| self.realms.get(p)) {
                Some(parent) => {
                    let mut path = parent.tree_parents.clone();
                    path.push(parent.id.clone());
                    (parent.level + 1, path)
                }
                None => (0, Vec::new()),
            };
            let children = realm.children.clone();
            if let Some(realm) = self.realms.get_mut(&current) {
                if realm.level != level || realm.tree_parents != tree_parents {
                    realm.level = level;
                    realm.tree_parents = tree_parents;
                    realm.touch(at);
                }
            }
            queue.extend(children);
        }
    }

    fn refresh_descendants_of(&mut self, ids: &[RealmId], at: OffsetDateTime) {
        let unique: BTreeSet<&RealmId> = ids.iter().collect();
        for id in unique {
            let descendants = self.walk_descendants(id);
            if let Some(realm) = self.realms.get_mut(id) {
                if realm.tree_children != descendants {
                    realm.tree_children = descendants;
                    realm.touch(at);
                }
            }
        }
    }
}

/// Opérations realms sur le store partagé
pub struct RealmRegistry {
    store: Arc<Store>,
    events: Arc<dyn EventSink>,
}

impl RealmRegistry {
    pub fn new(store: Arc<Store>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    /// Crée le realm racine par défaut si le store n'en a aucun
    pub fn ensure_default_realm(&self) -> KernelResult<Option<Realm>> {
        if !self.store.realms.read().is_empty() {
            return Ok(None);
        }
        let realm = self.create_realm(NewRealm {
            name: DEFAULT_REALM_NAME.to_string(),
            alias: "All realms".to_string(),
            parent: None,
            default: true,
        })?;
        Ok(Some(realm))
    }

    pub fn create_realm(&self, new: NewRealm) -> KernelResult<Realm> {
        let mut realms = self.store.realms.write();
        let mut draft = realms.clone();
        let mut new = new;
        // le premier realm créé est forcément le défaut
        if draft.is_empty() {
            new.default = true;
        }
        let id = draft.insert(new)?;
        let realm = draft.get(&id).cloned().ok_or_else(|| KernelError::not_found("realm", &id))?;

        *realms = draft;
        self.store
            .synthesis
            .write()
            .insert(id.clone(), SynthesisSnapshot::empty(&id));
        drop(realms);

        info!("[realms] created realm {} ({}) at level {}", realm.name, realm.id, realm.level);
        self.events.publish(&KernelEvent::RealmCreated { realm: id });
        Ok(realm)
    }

    pub fn patch_realm(&self, id: &str, patch: &Value, if_match: Option<&str>) -> KernelResult<Realm> {
        self.update_realm(id, RealmPatch::from_json(patch)?, if_match)
    }

    pub fn reparent(&self, id: &str, new_parent: Option<RealmId>, if_match: Option<&str>) -> KernelResult<Realm> {
        self.update_realm(id, RealmPatch { parent: Some(new_parent), ..RealmPatch::default() }, if_match)
    }

    /// Patch déjà validé, appliqué sur une copie de l'arbre puis échangé
    pub fn update_realm(&self, id: &str, patch: RealmPatch, if_match: Option<&str>) -> KernelResult<Realm> {
        let moved = patch.parent.is_some();
        let mut realms = self.store.realms.write();
        let current = realms.get(id).ok_or_else(|| KernelError::not_found("realm", id))?;
        check_etag("realm", id, &current.etag, if_match)?;

        let mut draft = realms.clone();
        draft.apply_patch(id, patch)?;
        let realm = draft.get(id).cloned().ok_or_else(|| KernelError::not_found("realm", id))?;
        *realms = draft;
        drop(realms);

        if moved {
            info!("[realms] moved realm {} under {:?}", realm.name, realm.parent);
        } else {
            info!("[realms] updated realm {} ({})", realm.name, realm.id);
        }
        self.events.publish(&KernelEvent::RealmUpdated { realm: id.to_string() });
        Ok(realm)
    }

    pub fn delete_realm(&self, id: &str, if_match: Option<&str>) -> KernelResult<()> {
        let mut realms = self.store.realms.write();
        let current = realms.get(id).ok_or_else(|| KernelError::not_found("realm", id))?;
        check_etag("realm", id, &current.etag, if_match)?;

        let attached = self.store.hosts.read().values().filter(|h| h.realm == id).count();
        if attached > 0 {
            return Err(KernelError::Conflict(format!(
                "realm '{}' still holds {} host(s)",
                current.name, attached
            )));
        }

        let mut draft = realms.clone();
        let removed = draft.remove(id)?;
        *realms = draft;
        self.store.synthesis.write().remove(id);
        self.store.retention.write().remove_realm(id);
        drop(realms);

        info!("[realms] deleted realm {} ({})", removed.name, removed.id);
        self.events.publish(&KernelEvent::RealmDeleted { realm: id.to_string() });
        Ok(())
    }

    pub fn get(&self, id: &str) -> KernelResult<Realm> {
        self.store
            .realms
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| KernelError::not_found("realm", id))
    }

    /// Realms visibles, dans l'ordre de l'arbre
    pub fn list(&self, visible: &BTreeSet<RealmId>) -> Vec<Realm> {
        self.store
            .realms
            .read()
            .ordered()
            .into_iter()
            .filter(|r| visible.contains(&r.id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_realm(name: &str, parent: Option<&str>) -> NewRealm {
        NewRealm {
            name: name.to_string(),
            alias: String::new(),
            parent: parent.map(str::to_string),
            default: false,
        }
    }

    /// All -> (All A -> All A.1), All B
    fn sample_tree() -> (RealmTree, [RealmId; 4]) {
        let mut tree = RealmTree::new();
        let all = tree.insert(NewRealm { default: true, ..new_realm("All", None) }).unwrap();
        let a = tree.insert(new_realm("All A", Some(&all))).unwrap();
        let b = tree.insert(new_realm("All B", Some(&all))).unwrap();
        let a1 = tree.insert(new_realm("All A.1", Some(&a))).unwrap();
        (tree, [all, a, b, a1])
    }

    fn assert_closures(tree: &RealmTree) {
        for realm in tree.ordered() {
            let mut path = Vec::new();
            let mut cursor = realm.parent.clone();
            while let Some(parent) = cursor {
                path.insert(0, parent.clone());
                cursor = tree.get(&parent).unwrap().parent.clone();
            }
            assert_eq!(realm.tree_parents, path, "tree_parents of {}", realm.name);
            assert_eq!(realm.level as usize, path.len());
            for ancestor in &realm.tree_parents {
                assert!(tree.get(ancestor).unwrap().tree_children.contains(&realm.id));
            }
        }
    }

    #[test]
    fn test_insert_computes_closures() {
        let (tree, [all, a, b, a1]) = sample_tree();
        assert_eq!(tree.get(&a1).unwrap().tree_parents, vec![all.clone(), a.clone()]);
        assert_eq!(tree.get(&a1).unwrap().level, 2);
        assert_eq!(tree.get(&all).unwrap().children, vec![a.clone(), b.clone()]);
        assert_eq!(tree.get(&all).unwrap().tree_children, vec![a.clone(), b.clone(), a1.clone()]);
        assert_eq!(tree.get(&a).unwrap().tree_children, vec![a1.clone()]);
        assert_eq!(tree.ordered_ids(), vec![all, a, b, a1]);
        assert_closures(&tree);
    }

    #[test]
    fn test_insert_rejects_duplicates_and_missing_parent() {
        let (mut tree, _) = sample_tree();
        assert!(matches!(tree.insert(new_realm("All B", None)), Err(KernelError::DuplicateName { .. })));
        assert!(matches!(tree.insert(new_realm("X", Some("nope"))), Err(KernelError::ParentNotFound(_))));
        assert!(matches!(tree.insert(new_realm("  ", None)), Err(KernelError::Validation(_))));
    }

    #[test]
    fn test_delete_scenario() {
        let (mut tree, [all, a, _b, a1]) = sample_tree();
        assert!(matches!(tree.remove(&a), Err(KernelError::Conflict(_))));
        tree.remove(&a1).unwrap();
        assert!(!tree.get(&all).unwrap().tree_children.contains(&a1));
        assert!(tree.get(&a).unwrap().children.is_empty());
        tree.remove(&a).unwrap();
        assert_eq!(tree.len(), 2);
        assert_closures(&tree);
    }

    #[test]
    fn test_default_realm_cannot_be_deleted() {
        let mut tree = RealmTree::new();
        let all = tree.insert(NewRealm { default: true, ..new_realm("All", None) }).unwrap();
        assert!(matches!(tree.remove(&all), Err(KernelError::Conflict(_))));
    }

    #[test]
    fn test_reparent_moves_whole_subtree() {
        let (mut tree, [all, a, b, a1]) = sample_tree();
        tree.reparent(&a, Some(b.clone())).unwrap();
        assert_eq!(tree.get(&a1).unwrap().tree_parents, vec![all.clone(), b.clone(), a.clone()]);
        assert_eq!(tree.get(&a1).unwrap().level, 3);
        assert_eq!(tree.get(&b).unwrap().tree_children, vec![a.clone(), a1.clone()]);
        assert_eq!(tree.get(&all).unwrap().children, vec![b.clone()]);
        assert_closures(&tree);

        tree.reparent(&a, None).unwrap();
        assert_eq!(tree.get(&a).unwrap().level, 0);
        assert!(tree.get(&all).unwrap().tree_children.iter().all(|id| id != &a && id != &a1));
        assert_closures(&tree);
    }

    #[test]
    fn test_reparent_rejects_cycles() {
        let (mut tree, [all, a, _b, a1]) = sample_tree();
        assert!(matches!(tree.reparent(&all, Some(a1.clone())), Err(KernelError::WouldCreateCycle { .. })));
        assert!(matches!(tree.reparent(&a, Some(a.clone())), Err(KernelError::WouldCreateCycle { .. })));
        assert!(matches!(tree.reparent(&a, Some("ghost".into())), Err(KernelError::ParentNotFound(_))));
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let (mut tree, _) = sample_tree();
        let before: Vec<Realm> = tree.ordered().into_iter().cloned().collect();
        tree.rebuild();
        tree.rebuild();
        let after: Vec<Realm> = tree.ordered().into_iter().cloned().collect();
        let strip = |r: &Realm| (r.id.clone(), r.level, r.tree_parents.clone(), r.children.clone(), r.tree_children.clone());
        assert_eq!(before.iter().map(strip).collect::<Vec<_>>(), after.iter().map(strip).collect::<Vec<_>>());
    }

    #[test]
    fn test_from_realms_ignores_stored_closures() {
        let (tree, [all, _a, _b, a1]) = sample_tree();
        let mut stored: Vec<Realm> = tree.ordered().into_iter().cloned().collect();
        for realm in stored.iter_mut() {
            realm.tree_children.clear();
            realm.tree_parents = vec!["bogus".into()];
            realm.level = 42;
        }
        let rebuilt = RealmTree::from_realms(stored);
        assert_eq!(rebuilt.get(&all).unwrap().tree_children.len(), 3);
        assert_eq!(rebuilt.get(&a1).unwrap().level, 2);
        assert_closures(&rebuilt);
    }

    #[test]
    fn test_rebuild_breaks_cycles() {
        let (tree, [_all, a, b, _a1]) = sample_tree();
        let mut stored: Vec<Realm> = tree.ordered().into_iter().cloned().collect();
        for realm in stored.iter_mut() {
            if realm.id == a {
                realm.parent = Some(b.clone());
            }
            if realm.id == b {
                realm.parent = Some(a.clone());
            }
        }
        let rebuilt = RealmTree::from_realms(stored);
        assert_eq!(rebuilt.ordered_ids().len(), 4);
        assert_closures(&rebuilt);
    }

    #[test]
    fn test_patch_parsing() {
        assert!(matches!(
            RealmPatch::from_json(&json!({"_tree_parents": []})),
            Err(KernelError::ForbiddenFieldUpdate(f)) if f == "_tree_parents"
        ));
        assert!(matches!(RealmPatch::from_json(&json!({"_etag": "x"})), Err(KernelError::Validation(_))));
        let patch = RealmPatch::from_json(&json!({"alias": "Paris", "_parent": null})).unwrap();
        assert_eq!(patch.alias.as_deref(), Some("Paris"));
        assert_eq!(patch.parent, Some(None));
        assert!(matches!(NewRealm::from_json(&json!({"name": "x", "_level": 3})), Err(KernelError::ForbiddenFieldUpdate(_))));
        assert_eq!(NewRealm::from_json(&json!({"name": "x", "parent": "p"})).unwrap().parent.as_deref(), Some("p"));
    }

    #[test]
    fn test_patch_default_and_rename() {
        let (mut tree, [all, a, b, _a1]) = sample_tree();
        tree.apply_patch(&b, RealmPatch { default: Some(true), ..RealmPatch::default() }).unwrap();
        assert!(!tree.get(&all).unwrap().default);
        assert_eq!(tree.default_realm().unwrap().id, b);
        assert!(tree.apply_patch(&b, RealmPatch { default: Some(false), ..RealmPatch::default() }).is_err());

        tree.apply_patch(&b, RealmPatch { name: Some("All 0".into()), ..RealmPatch::default() }).unwrap();
        assert_eq!(tree.get(&all).unwrap().children, vec![b.clone(), a.clone()]);
        assert!(matches!(
            tree.apply_patch(&a, RealmPatch { name: Some("All 0".into()), ..RealmPatch::default() }),
            Err(KernelError::DuplicateName { .. })
        ));
    }
}
