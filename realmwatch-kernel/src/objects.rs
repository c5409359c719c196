/**
 * OBJECT STORE - Hosts et services supervisés
 *
 * RÔLE :
 * Stockage typé minimal des objets dont dépend le live state. Chaque mutation
 * appelle explicitement le `LiveStateStore` (création → entrée + recalcul,
 * mise à jour → propagation, suppression → retrait + recalcul).
 *
 * FONCTIONNEMENT :
 * - Un host sans realm rejoint le realm par défaut
 * - Les templates n'ont pas d'entrée live state
 * - Supprimer un host supprime ses services
 */

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

use crate::error::{check_etag, KernelError, KernelResult};
use crate::livestate::{LiveStateStore, MonitoredObject};
use crate::models::{
    validate_business_impact, validate_customs, validate_initial_state, validate_name, Host, HostUpdate, NewHost,
    NewService, RealmId, Service, ServiceUpdate,
};
use crate::state::{new_etag, new_id, now};
use crate::store::Store;
use crate::synthesis::SynthesisAggregator;

pub struct ObjectStore {
    store: Arc<Store>,
    livestate: Arc<LiveStateStore>,
    aggregator: Arc<SynthesisAggregator>,
}

impl ObjectStore {
    pub fn new(store: Arc<Store>, livestate: Arc<LiveStateStore>, aggregator: Arc<SynthesisAggregator>) -> Self {
        Self { store, livestate, aggregator }
    }

    pub fn create_host(&self, new: NewHost) -> KernelResult<Host> {
        validate_name("host", &new.name)?;
        validate_business_impact(new.business_impact)?;
        validate_initial_state(&new.initial_state)?;
        let customs = validate_customs(new.customs)?;

        let host = {
            // realms gardé en lecture : le realm ne peut pas disparaître avant l'insertion
            let realms = self.store.realms.read();
            let realm = match new.realm {
                Some(realm) if realms.contains(&realm) => realm,
                Some(realm) => return Err(KernelError::not_found("realm", realm)),
                None => realms
                    .default_realm()
                    .map(|r| r.id.clone())
                    .ok_or_else(|| KernelError::Validation("no default realm to attach the host to".into()))?,
            };

            let mut hosts = self.store.hosts.write();
            if hosts.values().any(|h| h.name == new.name) {
                return Err(KernelError::DuplicateName { entity: "host", name: new.name });
            }
            let at = now();
            let host = Host {
                id: new_id(),
                name: new.name,
                alias: new.alias,
                realm,
                business_impact: new.business_impact,
                initial_state: new.initial_state,
                is_template: new.is_template,
                customs,
                etag: new_etag(),
                created: at,
                updated: at,
            };
            // entrée live state écrite avant de rendre le verrou des hosts :
            // un update ou delete concurrent la voit forcément
            if !host.is_template {
                self.livestate.upsert_from_object_creation(MonitoredObject::Host(&host))?;
            }
            hosts.insert(host.id.clone(), host.clone());
            host
        };

        info!("[objects] created host {} ({}) in realm {}", host.name, host.id, host.realm);
        if !host.is_template {
            self.aggregator.recompute_after_commit(&host.realm);
        }
        Ok(host)
    }

    pub fn update_host(&self, id: &str, update: HostUpdate, if_match: Option<&str>) -> KernelResult<Host> {
        if let Some(impact) = update.business_impact {
            validate_business_impact(impact)?;
        }
        let customs = update.customs.map(validate_customs).transpose()?;

        let (old, new, moved) = {
            let realms = self.store.realms.read();
            if let Some(realm) = &update.realm {
                if !realms.contains(realm) {
                    return Err(KernelError::not_found("realm", realm.clone()));
                }
            }

            let mut hosts = self.store.hosts.write();
            let current = hosts.get(id).ok_or_else(|| KernelError::not_found("host", id))?;
            check_etag("host", id, &current.etag, if_match)?;

            let old = current.clone();
            let mut new = old.clone();
            if let Some(alias) = update.alias {
                new.alias = alias;
            }
            if let Some(realm) = update.realm {
                new.realm = realm;
            }
            if let Some(impact) = update.business_impact {
                new.business_impact = impact;
            }
            if let Some(customs) = customs {
                new.customs = customs;
            }
            new.etag = new_etag();
            new.updated = now();
            let moved = !new.is_template && self.livestate.propagate_host_update(&old, &new);
            hosts.insert(new.id.clone(), new.clone());
            (old, new, moved)
        };

        if moved {
            self.livestate.recompute_moved(&old, &new);
        }
        Ok(new)
    }

    pub fn delete_host(&self, id: &str, if_match: Option<&str>) -> KernelResult<Host> {
        let (host, services) = {
            let mut hosts = self.store.hosts.write();
            let current = hosts.get(id).ok_or_else(|| KernelError::not_found("host", id))?;
            check_etag("host", id, &current.etag, if_match)?;
            let host = hosts.remove(id).ok_or_else(|| KernelError::not_found("host", id))?;

            let mut services = self.store.services.write();
            let before = services.len();
            services.retain(|_, s| s.host != id);
            (host, before - services.len())
        };

        let entries = self.livestate.remove_for_host(id)?;
        info!(
            "[objects] deleted host {} ({} service(s), {} live state entrie(s))",
            host.name, services, entries
        );
        Ok(host)
    }

    pub fn create_service(&self, new: NewService) -> KernelResult<Service> {
        validate_name("service", &new.name)?;
        validate_business_impact(new.business_impact)?;
        validate_initial_state(&new.initial_state)?;
        let customs = validate_customs(new.customs)?;

        let (service, host, monitored) = {
            let hosts = self.store.hosts.read();
            let host = hosts
                .get(&new.host)
                .cloned()
                .ok_or_else(|| KernelError::not_found("host", new.host.clone()))?;

            let mut services = self.store.services.write();
            if services.values().any(|s| s.host == host.id && s.name == new.name) {
                return Err(KernelError::DuplicateName { entity: "service", name: new.name });
            }
            let at = now();
            let service = Service {
                id: new_id(),
                host: host.id.clone(),
                name: new.name,
                alias: new.alias,
                business_impact: new.business_impact,
                initial_state: new.initial_state,
                is_template: new.is_template,
                customs,
                etag: new_etag(),
                created: at,
                updated: at,
            };
            let monitored = !service.is_template && !host.is_template;
            if monitored {
                self.livestate
                    .upsert_from_object_creation(MonitoredObject::Service { service: &service, host: &host })?;
            }
            services.insert(service.id.clone(), service.clone());
            (service, host, monitored)
        };

        info!("[objects] created service {} on host {}", service.name, host.name);
        if monitored {
            self.aggregator.recompute_after_commit(&host.realm);
        }
        Ok(service)
    }

    pub fn update_service(&self, id: &str, update: ServiceUpdate, if_match: Option<&str>) -> KernelResult<Service> {
        if let Some(impact) = update.business_impact {
            validate_business_impact(impact)?;
        }
        let customs = update.customs.map(validate_customs).transpose()?;

        let mut services = self.store.services.write();
        let current = services.get(id).ok_or_else(|| KernelError::not_found("service", id))?;
        check_etag("service", id, &current.etag, if_match)?;

        let old = current.clone();
        let mut new = old.clone();
        if let Some(alias) = update.alias {
            new.alias = alias;
        }
        if let Some(impact) = update.business_impact {
            new.business_impact = impact;
        }
        if let Some(customs) = customs {
            new.customs = customs;
        }
        new.etag = new_etag();
        new.updated = now();
        // propagation sous le verrou des services : deux mises à jour ne se croisent pas
        self.livestate.on_service_updated(&old, &new)?;
        services.insert(new.id.clone(), new.clone());
        Ok(new)
    }

    pub fn delete_service(&self, id: &str, if_match: Option<&str>) -> KernelResult<Service> {
        let service = {
            let mut services = self.store.services.write();
            let current = services.get(id).ok_or_else(|| KernelError::not_found("service", id))?;
            check_etag("service", id, &current.etag, if_match)?;
            services.remove(id).ok_or_else(|| KernelError::not_found("service", id))?
        };

        self.livestate.remove_for_service(&service.host, &service.id)?;
        info!("[objects] deleted service {} ({})", service.name, service.id);
        Ok(service)
    }

    pub fn get_host(&self, id: &str) -> KernelResult<Host> {
        self.store
            .hosts
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| KernelError::not_found("host", id))
    }

    pub fn get_service(&self, id: &str) -> KernelResult<Service> {
        self.store
            .services
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| KernelError::not_found("service", id))
    }

    /// Hosts des realms visibles
    pub fn list_hosts(&self, visible: &BTreeSet<RealmId>) -> Vec<Host> {
        self.store
            .hosts
            .read()
            .values()
            .filter(|h| visible.contains(&h.realm))
            .cloned()
            .collect()
    }

    /// Services dont le host est visible, éventuellement filtrés par host
    pub fn list_services(&self, host: Option<&str>, visible: &BTreeSet<RealmId>) -> Vec<Service> {
        let hosts = self.store.hosts.read();
        self.store
            .services
            .read()
            .values()
            .filter(|s| host.map_or(true, |h| s.host == h))
            .filter(|s| hosts.get(&s.host).is_some_and(|h| visible.contains(&h.realm)))
            .cloned()
            .collect()
    }

    /// Realm d'un host, pour les contrôles de visibilité
    pub fn realm_of_host(&self, host: &str) -> KernelResult<RealmId> {
        self.store
            .hosts
            .read()
            .get(host)
            .map(|h| h.realm.clone())
            .ok_or_else(|| KernelError::not_found("host", host))
    }
}
