/**
 * MODELES OBJETS - Hosts et services tels que fournis par le store d'objets
 *
 * RÔLE : Enregistrements typés des objets supervisés. Le kernel n'en garde que
 * les champs dont le live state et la synthèse ont besoin (realm, impact métier,
 * nom d'affichage, état initial, template).
 *
 * Les variables libres définies par l'administrateur vivent dans `customs`
 * (map String → String), seule partie dynamique, validée par `validate_customs`.
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

use crate::error::{KernelError, KernelResult};

pub type RealmId = String;
pub type HostId = String;
pub type ServiceId = String;

pub const MAX_BUSINESS_IMPACT: u8 = 5;
pub const DEFAULT_BUSINESS_IMPACT: u8 = 2;

fn default_business_impact() -> u8 {
    DEFAULT_BUSINESS_IMPACT
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    #[serde(rename = "_id")]
    pub id: HostId,
    pub name: String,
    pub alias: String,
    pub realm: RealmId,
    pub business_impact: u8,
    pub initial_state: String,
    #[serde(rename = "_is_template")]
    pub is_template: bool,
    #[serde(default)]
    pub customs: BTreeMap<String, String>,
    #[serde(rename = "_etag")]
    pub etag: String,
    #[serde(rename = "_created", with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(rename = "_updated", with = "time::serde::rfc3339")]
    pub updated: OffsetDateTime,
}

impl Host {
    /// Nom affiché dans le live state (alias, sinon nom)
    pub fn display_name(&self) -> &str {
        if self.alias.is_empty() { &self.name } else { &self.alias }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    #[serde(rename = "_id")]
    pub id: ServiceId,
    pub host: HostId,
    pub name: String,
    pub alias: String,
    pub business_impact: u8,
    pub initial_state: String,
    #[serde(rename = "_is_template")]
    pub is_template: bool,
    #[serde(default)]
    pub customs: BTreeMap<String, String>,
    #[serde(rename = "_etag")]
    pub etag: String,
    #[serde(rename = "_created", with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(rename = "_updated", with = "time::serde::rfc3339")]
    pub updated: OffsetDateTime,
}

impl Service {
    pub fn display_name(&self) -> &str {
        if self.alias.is_empty() { &self.name } else { &self.alias }
    }
}

/// Payload de création d'un host (POST /host)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewHost {
    pub name: String,
    #[serde(default)]
    pub alias: String,
    /// Realm par défaut si absent
    pub realm: Option<RealmId>,
    #[serde(default = "default_business_impact")]
    pub business_impact: u8,
    #[serde(default)]
    pub initial_state: String,
    #[serde(rename = "_is_template", default)]
    pub is_template: bool,
    #[serde(default)]
    pub customs: BTreeMap<String, String>,
}

/// Payload de création d'un service (POST /service)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewService {
    pub host: HostId,
    pub name: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default = "default_business_impact")]
    pub business_impact: u8,
    #[serde(default)]
    pub initial_state: String,
    #[serde(rename = "_is_template", default)]
    pub is_template: bool,
    #[serde(default)]
    pub customs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HostUpdate {
    pub alias: Option<String>,
    pub realm: Option<RealmId>,
    pub business_impact: Option<u8>,
    pub customs: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceUpdate {
    pub alias: Option<String>,
    pub business_impact: Option<u8>,
    pub customs: Option<BTreeMap<String, String>>,
}

pub fn validate_name(entity: &str, name: &str) -> KernelResult<()> {
    if name.trim().is_empty() {
        return Err(KernelError::Validation(format!("{entity} name must not be empty")));
    }
    Ok(())
}

pub fn validate_business_impact(value: u8) -> KernelResult<()> {
    if value > MAX_BUSINESS_IMPACT {
        return Err(KernelError::Validation(format!(
            "business_impact must be between 0 and {MAX_BUSINESS_IMPACT}, got {value}"
        )));
    }
    Ok(())
}

/// Code d'état initial sur un caractère (ex: "d", "u", "w", "c")
pub fn validate_initial_state(code: &str) -> KernelResult<()> {
    if code.chars().count() > 1 {
        return Err(KernelError::Validation(format!(
            "initial_state must be a one-character code, got '{code}'"
        )));
    }
    Ok(())
}

/// Les variables custom commencent par '_' et sont stockées en majuscules
pub fn validate_customs(customs: BTreeMap<String, String>) -> KernelResult<BTreeMap<String, String>> {
    let mut normalized = BTreeMap::new();
    for (key, value) in customs {
        let valid = key.len() > 1
            && key.starts_with('_')
            && key[1..].chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(KernelError::Validation(format!("invalid custom variable name '{key}'")));
        }
        let upper = key.to_ascii_uppercase();
        if normalized.contains_key(&upper) {
            return Err(KernelError::Validation(format!("custom variable '{key}' collides with '{upper}'")));
        }
        normalized.insert(upper, value);
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_customs_are_uppercased() {
        let mut customs = BTreeMap::new();
        customs.insert("_os_version".to_string(), "12".to_string());
        let normalized = validate_customs(customs).unwrap();
        assert_eq!(normalized.get("_OS_VERSION").map(String::as_str), Some("12"));
    }

    #[test]
    fn test_customs_reject_bad_names() {
        for bad in ["os", "_", "_with space", "_dash-ed"] {
            let mut customs = BTreeMap::new();
            customs.insert(bad.to_string(), "x".to_string());
            assert!(validate_customs(customs).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_customs_reject_case_collisions() {
        let mut customs = BTreeMap::new();
        customs.insert("_os".to_string(), "linux".to_string());
        customs.insert("_OS".to_string(), "windows".to_string());
        assert!(matches!(validate_customs(customs), Err(KernelError::Validation(_))));
    }

    #[test]
    fn test_initial_state_and_impact() {
        assert!(validate_initial_state("").is_ok());
        assert!(validate_initial_state("d").is_ok());
        assert!(validate_initial_state("down").is_err());
        assert!(validate_business_impact(5).is_ok());
        assert!(validate_business_impact(6).is_err());
    }
}
