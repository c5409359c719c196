/**
 * API REST REALMWATCH - Serveur HTTP du kernel
 *
 * RÔLE :
 * Expose realms, objets, live state, synthèse et rétention en JSON.
 *
 * FONCTIONNEMENT :
 * - Middleware clé API : `x-api-key` → profil appelant (extension `Caller`)
 * - Chaque lecture est filtrée par les realms visibles de l'appelant
 * - PATCH/DELETE exigent un header If-Match (jeton `_etag` courant)
 * - Erreurs au format {"_status":"ERR","_error":{code,message}}
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health
 * - Mutations realms/objets et cron réservées aux admins
 */

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::warn;

use crate::error::{KernelError, KernelResult};
use crate::health::{HealthTracker, KernelHealth};
use crate::livestate::{LiveStateEntry, StateChange};
use crate::models::{Host, HostUpdate, NewHost, NewService, RealmId, Service, ServiceUpdate};
use crate::realm::{NewRealm, Realm, RealmPatch};
use crate::retention::{JobReport, RetainedSnapshot};
use crate::synthesis::SynthesisSnapshot;
use crate::visibility::{Caller, CallerDirectory};
use crate::Kernel;

#[derive(Clone)]
pub struct AppState {
    pub kernel: Kernel,
    pub callers: Arc<CallerDirectory>,
    pub health_tracker: HealthTracker,
}

impl AppState {
    fn visible(&self, caller: &Caller) -> BTreeSet<RealmId> {
        caller.visible_realms(&self.kernel.store.realms.read())
    }

    fn ensure_visible(&self, caller: &Caller, realm: &str) -> KernelResult<()> {
        if self.visible(caller).contains(realm) {
            Ok(())
        } else {
            Err(KernelError::PermissionDenied(realm.to_string()))
        }
    }
}

async fn require_api_key(State(app): State<AppState>, mut req: Request, next: Next) -> Result<Response, KernelError> {
    // Health check toujours accessible
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    if app.callers.is_empty() {
        warn!("[http] SECURITY: no API key configured - API access denied");
        return Err(KernelError::Unauthorized);
    }

    let caller = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .and_then(|key| app.callers.resolve(key))
        .cloned();

    let Some(caller) = caller else {
        warn!("[http] rejected request to {} (missing or unknown API key)", req.uri().path());
        return Err(KernelError::Unauthorized);
    };
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/synthesis", get(list_synthesis))
        .route("/synthesis/{realm}", get(get_synthesis))
        .route("/cron/synthesis-retention", post(run_retention))
        .route("/realm", get(list_realms).post(create_realm))
        .route("/realm/{id}", get(get_realm).patch(patch_realm).delete(delete_realm))
        .route("/host", get(list_hosts).post(create_host))
        .route("/host/{id}", get(get_host).patch(patch_host).delete(delete_host))
        .route("/service", get(list_services).post(create_service))
        .route("/service/{id}", get(get_service).patch(patch_service).delete(delete_service))
        .route("/livestate", get(list_livestate))
        .route("/livestate/{id}", get(get_livestate).patch(patch_livestate))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

/// Jeton If-Match obligatoire sur PATCH/DELETE
fn if_match(headers: &HeaderMap) -> KernelResult<String> {
    headers
        .get("if-match")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(KernelError::PreconditionRequired)
}

fn parse_body<T: DeserializeOwned>(body: Value) -> KernelResult<T> {
    serde_json::from_value(body).map_err(|e| KernelError::Validation(e.to_string()))
}

/// "1", "true", "yes" → vrai
fn flag(value: Option<&str>) -> bool {
    matches!(value.map(str::to_ascii_lowercase).as_deref(), Some("1" | "true" | "yes"))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health())
}

// ---------- synthèse ----------

#[derive(Debug, Default, Deserialize)]
struct SynthesisQuery {
    concatenation: Option<String>,
    history: Option<String>,
}

#[derive(Debug, Serialize)]
struct SynthesisView {
    #[serde(flatten)]
    snapshot: SynthesisSnapshot,
    concatenated: bool,
    percentages: BTreeMap<&'static str, f64>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum SynthesisResponse {
    Live(SynthesisView),
    History(Vec<RetainedSnapshot>),
}

// GET /synthesis
async fn list_synthesis(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Json<Vec<SynthesisSnapshot>> {
    let visible = app.visible(&caller);
    Json(app.kernel.synthesis.list_synthesis(&visible))
}

// GET /synthesis/{realm}?concatenation=1&history=1
async fn get_synthesis(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(realm): Path<String>,
    Query(query): Query<SynthesisQuery>,
) -> Result<Json<SynthesisResponse>, KernelError> {
    let visible = app.visible(&caller);
    let concatenate = flag(query.concatenation.as_deref());

    if flag(query.history.as_deref()) {
        let history = app.kernel.retention.history(&realm, concatenate, &visible)?;
        return Ok(Json(SynthesisResponse::History(history)));
    }

    let snapshot = app.kernel.synthesis.get_synthesis(&realm, concatenate, &visible)?;
    let percentages = snapshot.counters.percentages();
    Ok(Json(SynthesisResponse::Live(SynthesisView { snapshot, concatenated: concatenate, percentages })))
}

// POST /cron/synthesis-retention
async fn run_retention(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<JobReport>, KernelError> {
    caller.require_admin()?;
    Ok(Json(app.kernel.retention.run_job()?))
}

// ---------- realms ----------

async fn list_realms(State(app): State<AppState>, Extension(caller): Extension<Caller>) -> Json<Vec<Realm>> {
    let visible = app.visible(&caller);
    Json(app.kernel.realms.list(&visible))
}

async fn get_realm(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<Realm>, KernelError> {
    let realm = app.kernel.realms.get(&id)?;
    app.ensure_visible(&caller, &realm.id)?;
    Ok(Json(realm))
}

async fn create_realm(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Realm>), KernelError> {
    caller.require_admin()?;
    let new = NewRealm::from_json(&body)?;
    Ok((StatusCode::CREATED, Json(app.kernel.realms.create_realm(new)?)))
}

async fn patch_realm(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Realm>, KernelError> {
    caller.require_admin()?;
    // champs dérivés refusés (412) avant même l'If-Match
    let patch = RealmPatch::from_json(&body)?;
    let etag = if_match(&headers)?;
    Ok(Json(app.kernel.realms.update_realm(&id, patch, Some(&etag))?))
}

async fn delete_realm(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, KernelError> {
    caller.require_admin()?;
    let etag = if_match(&headers)?;
    app.kernel.realms.delete_realm(&id, Some(&etag))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------- hosts ----------

async fn list_hosts(State(app): State<AppState>, Extension(caller): Extension<Caller>) -> Json<Vec<Host>> {
    let visible = app.visible(&caller);
    Json(app.kernel.objects.list_hosts(&visible))
}

async fn get_host(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<Host>, KernelError> {
    let host = app.kernel.objects.get_host(&id)?;
    app.ensure_visible(&caller, &host.realm)?;
    Ok(Json(host))
}

async fn create_host(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Host>), KernelError> {
    caller.require_admin()?;
    let new: NewHost = parse_body(body)?;
    Ok((StatusCode::CREATED, Json(app.kernel.objects.create_host(new)?)))
}

async fn patch_host(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Host>, KernelError> {
    caller.require_admin()?;
    let etag = if_match(&headers)?;
    let update: HostUpdate = parse_body(body)?;
    Ok(Json(app.kernel.objects.update_host(&id, update, Some(&etag))?))
}

async fn delete_host(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, KernelError> {
    caller.require_admin()?;
    let etag = if_match(&headers)?;
    app.kernel.objects.delete_host(&id, Some(&etag))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------- services ----------

#[derive(Debug, Default, Deserialize)]
struct ServiceQuery {
    host: Option<String>,
}

async fn list_services(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ServiceQuery>,
) -> Json<Vec<Service>> {
    let visible = app.visible(&caller);
    Json(app.kernel.objects.list_services(query.host.as_deref(), &visible))
}

async fn get_service(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<Service>, KernelError> {
    let service = app.kernel.objects.get_service(&id)?;
    let realm = app.kernel.objects.realm_of_host(&service.host)?;
    app.ensure_visible(&caller, &realm)?;
    Ok(Json(service))
}

async fn create_service(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Service>), KernelError> {
    caller.require_admin()?;
    let new: NewService = parse_body(body)?;
    Ok((StatusCode::CREATED, Json(app.kernel.objects.create_service(new)?)))
}

async fn patch_service(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Service>, KernelError> {
    caller.require_admin()?;
    let etag = if_match(&headers)?;
    let update: ServiceUpdate = parse_body(body)?;
    Ok(Json(app.kernel.objects.update_service(&id, update, Some(&etag))?))
}

async fn delete_service(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, KernelError> {
    caller.require_admin()?;
    let etag = if_match(&headers)?;
    app.kernel.objects.delete_service(&id, Some(&etag))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------- live state ----------

async fn list_livestate(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Json<Vec<LiveStateEntry>> {
    let visible = app.visible(&caller);
    Json(app.kernel.livestate.list(&visible))
}

async fn get_livestate(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<LiveStateEntry>, KernelError> {
    let entry = app.kernel.livestate.get(&id)?;
    app.ensure_visible(&caller, &entry.realm)?;
    Ok(Json(entry))
}

async fn patch_livestate(
    State(app): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<LiveStateEntry>, KernelError> {
    let etag = if_match(&headers)?;
    let entry = app.kernel.livestate.get(&id)?;
    app.ensure_visible(&caller, &entry.realm)?;
    let change: StateChange = parse_body(body)?;
    Ok(Json(app.kernel.livestate.apply_state_change(&id, change, Some(&etag))?))
}
