use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub http: HttpConf,
    pub store: StoreConf,
    pub retention: RetentionConfig,
    pub users: Vec<UserConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String, // ex: "0.0.0.0:8080"
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConf {
    pub data_file: PathBuf,
    /// 0 = pas de sauvegarde périodique (seulement à l'arrêt)
    pub persist_interval_secs: u64,
}

impl Default for StoreConf {
    fn default() -> Self {
        Self { data_file: PathBuf::from("data/realmwatch.json"), persist_interval_secs: 60 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetentionConfig {
    /// Période du job interne, 0 = uniquement via POST /cron/synthesis-retention
    pub interval_secs: u64,
    /// Lignes gardées par realm, 0 = illimité
    pub max_snapshots: usize,
    /// Âge maximal d'une ligne, 0 = illimité
    pub max_age_secs: u64,
    pub bucket_tolerance_secs: u64,
    pub order: HistoryOrder,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_snapshots: 288,
            max_age_secs: 0,
            bucket_tolerance_secs: 0,
            order: HistoryOrder::NewestFirst,
        }
    }
}

impl RetentionConfig {
    pub fn bucket_tolerance(&self) -> Duration {
        Duration::seconds(self.bucket_tolerance_secs as i64)
    }

    pub fn max_age(&self) -> Option<Duration> {
        (self.max_age_secs > 0).then(|| Duration::seconds(self.max_age_secs as i64))
    }
}

/// Profil appelant associé à une clé API
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserConf {
    pub name: String,
    pub api_key: String,
    /// Realm de rattachement (id ou nom), ignoré pour un admin
    #[serde(default)]
    pub realm: Option<String>,
    #[serde(default)]
    pub sub_realm: bool,
    #[serde(default)]
    pub admin: bool,
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config_from(path: &Path) -> KernelConfig {
    if !path.exists() {
        warn!("[config] pas de {}, usage config par défaut", path.display());
        return KernelConfig::default();
    }
    let txt = match fs::read_to_string(path).await {
        Ok(txt) => txt,
        Err(e) => {
            warn!("[config] lecture impossible de {}: {e}", path.display());
            return KernelConfig::default();
        }
    };
    match parse_config(&txt) {
        Ok(cfg) => {
            info!("[config] chargée depuis {} ({} user(s))", path.display(), cfg.users.len());
            cfg
        }
        Err(e) => {
            warn!("[config] config invalide: {e}");
            KernelConfig::default()
        }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("REALMWATCH_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    load_config_from(Path::new(&path)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        let cfg = parse_config("  \n").unwrap();
        assert_eq!(cfg.http.bind, "0.0.0.0:8080");
        assert_eq!(cfg.retention.order, HistoryOrder::NewestFirst);
        assert!(cfg.users.is_empty());
    }

    #[test]
    fn test_partial_config() {
        let cfg = parse_config(
            r#"
retention:
  max_snapshots: 10
  bucket_tolerance_secs: 5
  order: oldest_first
users:
  - name: paris-ops
    api_key: k1
    realm: Paris
    sub_realm: true
"#,
        )
        .unwrap();
        assert_eq!(cfg.retention.max_snapshots, 10);
        assert_eq!(cfg.retention.interval_secs, 300);
        assert_eq!(cfg.retention.order, HistoryOrder::OldestFirst);
        assert_eq!(cfg.retention.bucket_tolerance(), Duration::seconds(5));
        assert_eq!(cfg.retention.max_age(), None);
        assert!(cfg.users[0].sub_realm);
        assert!(!cfg.users[0].admin);
        assert_eq!(cfg.store.persist_interval_secs, 60);
    }

    #[test]
    fn test_unknown_order_is_rejected() {
        assert!(parse_config("retention:\n  order: random\n").is_err());
    }
}
