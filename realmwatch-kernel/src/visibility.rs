/**
 * VISIBILITE - Appelant → ensemble des realms visibles
 *
 * RÔLE : Associe une clé API à un profil (configuration `users[]` ou clé
 * admin d'environnement) et calcule les realms que ce profil peut lire.
 * Admin : tous les realms. Sinon : son realm, plus tout son sous-arbre
 * si `sub_realm` est vrai.
 */

use std::collections::{BTreeSet, HashMap};

use crate::config::UserConf;
use crate::error::{KernelError, KernelResult};
use crate::models::RealmId;
use crate::realm::RealmTree;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub name: String,
    pub admin: bool,
    /// Id ou nom du realm de rattachement
    pub realm: Option<String>,
    pub sub_realm: bool,
}

impl Caller {
    pub fn admin(name: impl Into<String>) -> Self {
        Self { name: name.into(), admin: true, realm: None, sub_realm: true }
    }

    pub fn scoped(name: impl Into<String>, realm: impl Into<String>, sub_realm: bool) -> Self {
        Self { name: name.into(), admin: false, realm: Some(realm.into()), sub_realm }
    }

    pub fn visible_realms(&self, tree: &RealmTree) -> BTreeSet<RealmId> {
        if self.admin {
            return tree.ordered_ids().into_iter().collect();
        }
        let Some(realm) = self
            .realm
            .as_deref()
            .and_then(|r| tree.get(r).or_else(|| tree.find_by_name(r)))
        else {
            return BTreeSet::new();
        };

        let mut visible = BTreeSet::from([realm.id.clone()]);
        if self.sub_realm {
            visible.extend(realm.tree_children.iter().cloned());
        }
        visible
    }

    pub fn require_admin(&self) -> KernelResult<()> {
        if self.admin {
            Ok(())
        } else {
            Err(KernelError::PermissionDenied(format!("caller '{}' is not an administrator", self.name)))
        }
    }
}

/// Annuaire des clés API connues
#[derive(Debug, Clone, Default)]
pub struct CallerDirectory {
    by_key: HashMap<String, Caller>,
}

impl CallerDirectory {
    pub fn new(users: &[UserConf], admin_key: Option<String>) -> Self {
        let mut by_key: HashMap<String, Caller> = users
            .iter()
            .filter(|u| !u.api_key.is_empty())
            .map(|u| {
                let caller = Caller {
                    name: u.name.clone(),
                    admin: u.admin,
                    realm: u.realm.clone(),
                    sub_realm: u.sub_realm,
                };
                (u.api_key.clone(), caller)
            })
            .collect();
        if let Some(key) = admin_key.filter(|k| !k.is_empty()) {
            by_key.insert(key, Caller::admin("admin"));
        }
        Self { by_key }
    }

    /// Lit la clé admin dans `REALMWATCH_API_KEY`
    pub fn from_env(users: &[UserConf]) -> Self {
        Self::new(users, std::env::var("REALMWATCH_API_KEY").ok())
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn resolve(&self, api_key: &str) -> Option<&Caller> {
        self.by_key.get(api_key)
    }
}
