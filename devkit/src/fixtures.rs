/*!
Builders de fixtures

Construisent les payloads de création (realms, hosts, services) et les
changements d'état avec des valeurs par défaut raisonnables.
*/

use realmwatch_kernel::livestate::StateChange;
use realmwatch_kernel::models::{NewHost, NewService, DEFAULT_BUSINESS_IMPACT};
use realmwatch_kernel::realm::NewRealm;
use serde_json::{json, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct RealmBuilder {
    realm: NewRealm,
}

impl RealmBuilder {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { realm: NewRealm { name: name.into(), ..NewRealm::default() } }
    }

    pub fn parent<S: Into<String>>(mut self, parent: S) -> Self {
        self.realm.parent = Some(parent.into());
        self
    }

    pub fn alias<S: Into<String>>(mut self, alias: S) -> Self {
        self.realm.alias = alias.into();
        self
    }

    pub fn default_realm(mut self) -> Self {
        self.realm.default = true;
        self
    }

    pub fn build(self) -> NewRealm {
        self.realm
    }

    /// Payload JSON tel qu'envoyé à POST /realm
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.realm.name,
            "alias": self.realm.alias,
            "_parent": self.realm.parent,
            "default": self.realm.default,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HostBuilder {
    host: NewHost,
}

impl HostBuilder {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            host: NewHost {
                name: name.into(),
                alias: String::new(),
                realm: None,
                business_impact: DEFAULT_BUSINESS_IMPACT,
                initial_state: String::new(),
                is_template: false,
                customs: BTreeMap::new(),
            },
        }
    }

    pub fn realm<S: Into<String>>(mut self, realm: S) -> Self {
        self.host.realm = Some(realm.into());
        self
    }

    pub fn alias<S: Into<String>>(mut self, alias: S) -> Self {
        self.host.alias = alias.into();
        self
    }

    /// Code d'état initial : "d", "u" ou vide (UP)
    pub fn initial_state<S: Into<String>>(mut self, code: S) -> Self {
        self.host.initial_state = code.into();
        self
    }

    pub fn business_impact(mut self, impact: u8) -> Self {
        self.host.business_impact = impact;
        self
    }

    pub fn template(mut self) -> Self {
        self.host.is_template = true;
        self
    }

    pub fn custom<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.host.customs.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> NewHost {
        self.host
    }
}

#[derive(Debug, Clone)]
pub struct ServiceBuilder {
    service: NewService,
}

impl ServiceBuilder {
    pub fn new<H: Into<String>, S: Into<String>>(host: H, name: S) -> Self {
        Self {
            service: NewService {
                host: host.into(),
                name: name.into(),
                alias: String::new(),
                business_impact: DEFAULT_BUSINESS_IMPACT,
                initial_state: String::new(),
                is_template: false,
                customs: BTreeMap::new(),
            },
        }
    }

    pub fn alias<S: Into<String>>(mut self, alias: S) -> Self {
        self.service.alias = alias.into();
        self
    }

    /// Code d'état initial : "w", "c", "u" ou vide (OK)
    pub fn initial_state<S: Into<String>>(mut self, code: S) -> Self {
        self.service.initial_state = code.into();
        self
    }

    pub fn business_impact(mut self, impact: u8) -> Self {
        self.service.business_impact = impact;
        self
    }

    pub fn template(mut self) -> Self {
        self.service.is_template = true;
        self
    }

    pub fn build(self) -> NewService {
        self.service
    }
}

#[derive(Debug, Clone)]
pub struct StateChangeBuilder {
    change: StateChange,
}

impl StateChangeBuilder {
    pub fn new<S: Into<String>>(state: S) -> Self {
        Self {
            change: StateChange { state: state.into(), state_type: "HARD".into(), ..StateChange::default() },
        }
    }

    pub fn soft(mut self) -> Self {
        self.change.state_type = "SOFT".into();
        self
    }

    pub fn acknowledged(mut self) -> Self {
        self.change.acknowledged = Some(true);
        self
    }

    pub fn downtimed(mut self) -> Self {
        self.change.downtimed = Some(true);
        self
    }

    pub fn flapping(mut self) -> Self {
        self.change.flapping = Some(true);
        self
    }

    pub fn output<S: Into<String>>(mut self, output: S) -> Self {
        self.change.output = Some(output.into());
        self
    }

    pub fn build(self) -> StateChange {
        self.change
    }

    /// Payload JSON tel qu'envoyé à PATCH /livestate/{id}
    pub fn to_json(&self) -> Value {
        let mut payload = json!({ "state": self.change.state, "state_type": self.change.state_type });
        if let Value::Object(ref mut obj) = payload {
            if let Some(flag) = self.change.acknowledged {
                obj.insert("acknowledged".into(), Value::Bool(flag));
            }
            if let Some(flag) = self.change.downtimed {
                obj.insert("downtimed".into(), Value::Bool(flag));
            }
            if let Some(flag) = self.change.flapping {
                obj.insert("flapping".into(), Value::Bool(flag));
            }
            if let Some(output) = &self.change.output {
                obj.insert("output".into(), Value::String(output.clone()));
            }
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_builder_defaults() {
        let host = HostBuilder::new("srv-web-01").build();
        assert_eq!(host.business_impact, DEFAULT_BUSINESS_IMPACT);
        assert!(host.realm.is_none());
        assert!(!host.is_template);
    }

    #[test]
    fn test_realm_builder_json() {
        let payload = RealmBuilder::new("Paris").parent("r-1").to_json();
        assert_eq!(payload["name"], "Paris");
        assert_eq!(payload["_parent"], "r-1");
        assert_eq!(payload["default"], false);
    }

    #[test]
    fn test_state_change_json_only_carries_set_flags() {
        let payload = StateChangeBuilder::new("DOWN").soft().acknowledged().to_json();
        assert_eq!(payload["state_type"], "SOFT");
        assert_eq!(payload["acknowledged"], true);
        assert!(payload.get("downtimed").is_none());
    }
}
