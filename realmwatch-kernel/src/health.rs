use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::store::Store;

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub realms: usize,
    pub hosts: usize,
    pub services: usize,
    pub livestate_entries: usize,
    pub retention_rows: usize,
    pub memory_usage_mb: f32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    store: Arc<Store>,
}

impl HealthTracker {
    pub fn new(store: Arc<Store>) -> Self {
        Self { start_time: Instant::now(), store }
    }

    pub fn get_health(&self) -> KernelHealth {
        let counts = self.store.counts();
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            realms: counts.realms,
            hosts: counts.hosts,
            services: counts.services,
            livestate_entries: counts.livestate,
            retention_rows: counts.retention_rows,
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return (kb as f32) / 1024.0; // KB -> MB
            }
        }
    }

    // inconnu hors Linux
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_reports_store_counts() {
        let store = Arc::new(Store::new());
        let health = HealthTracker::new(store).get_health();
        assert_eq!(health.realms, 0);
        assert_eq!(health.livestate_entries, 0);
        assert!(health.memory_usage_mb >= 0.0);
    }
}
