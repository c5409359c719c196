/**
 * REALMWATCH KERNEL - Point d'entrée du serveur
 *
 * RÔLE : Orchestration : config, store persistant, composants, tâches
 * périodiques (rétention, sauvegarde) et API HTTP.
 *
 * ARCHITECTURE : store JSON chargé au démarrage, bootstrap du live state si
 * vide, sauvegarde périodique et à l'arrêt (Ctrl-C).
 */

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use realmwatch_kernel::config::load_config;
use realmwatch_kernel::events::TracingSink;
use realmwatch_kernel::health::HealthTracker;
use realmwatch_kernel::http::{build_router, AppState};
use realmwatch_kernel::store::Store;
use realmwatch_kernel::visibility::CallerDirectory;
use realmwatch_kernel::Kernel;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("realmwatch_kernel=info")),
        )
        .init();

    let cfg = load_config().await;

    let data_file = cfg.store.data_file.clone();
    let store = Arc::new(
        Store::load_from(&data_file)
            .await
            .with_context(|| format!("failed to load store from {}", data_file.display()))?,
    );

    let kernel = Kernel::new(store.clone(), cfg.retention.clone(), Arc::new(TracingSink));
    let report = kernel.start().context("kernel startup failed")?;
    if report.ran {
        info!("[kernel] bootstrap created {} live state entrie(s)", report.hosts + report.services);
    }

    let callers = CallerDirectory::from_env(&cfg.users);
    if callers.is_empty() {
        warn!("[kernel] SECURITY: no REALMWATCH_API_KEY and no users configured - API access denied");
    }

    spawn_retention_job(kernel.clone(), cfg.retention.interval_secs);
    spawn_persistence(store.clone(), data_file.clone(), cfg.store.persist_interval_secs);

    let app_state = AppState {
        health_tracker: HealthTracker::new(store.clone()),
        kernel,
        callers: Arc::new(callers),
    };
    let app = build_router(app_state);

    let listener = TcpListener::bind(cfg.http.bind.as_str())
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.bind))?;
    info!("[kernel] listening on http://{}", cfg.http.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    store
        .save_to(&data_file)
        .await
        .with_context(|| format!("failed to save store to {}", data_file.display()))?;
    info!("[kernel] store saved to {}, bye", data_file.display());
    Ok(())
}

/// Job de rétention interne (0 = désactivé, reste le POST /cron/...)
fn spawn_retention_job(kernel: Kernel, interval_secs: u64) {
    if interval_secs == 0 {
        info!("[retention] internal job disabled");
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        // premier tick immédiat : on l'ignore
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = kernel.retention.run_job() {
                error!("[retention] job failed: {e}");
            }
        }
    });
}

fn spawn_persistence(store: Arc<Store>, data_file: PathBuf, interval_secs: u64) {
    if interval_secs == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = store.save_to(&data_file).await {
                error!("[store] periodic save failed: {e}");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("[kernel] failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("[kernel] shutdown requested");
}
