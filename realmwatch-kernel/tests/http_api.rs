mod common;

use axum::http::StatusCode;
use common::{build_test_context, get, request_json, ADMIN_KEY, SCOPED_KEY};
use realmwatch_devkit::{RealmBuilder, StateChangeBuilder};
use serde_json::json;

#[tokio::test]
async fn health_is_public_and_everything_else_needs_a_key() {
    let ctx = build_test_context();
    let (status, body) = request_json(&ctx.app, "GET", "/health", None, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!("ok"));

    let (status, body) = request_json(&ctx.app, "GET", "/realm", None, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["_status"], "ERR");
    assert_eq!(body["_error"]["code"], 401);

    let (status, _) = get(&ctx.app, "/realm", "wrong-key").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = get(&ctx.app, "/system/health", ADMIN_KEY).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["realms"], 1);
}

#[tokio::test]
async fn realm_lifecycle_over_http() {
    let ctx = build_test_context();
    let all = ctx.harness.default_realm();

    let (status, created) = request_json(
        &ctx.app,
        "POST",
        "/realm",
        Some(ADMIN_KEY),
        None,
        Some(RealmBuilder::new("Europe").parent(&all.id).to_json()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["_level"], 1);
    assert_eq!(created["_tree_parents"], json!([all.id]));
    let id = created["_id"].as_str().unwrap().to_string();
    let etag = created["_etag"].as_str().unwrap().to_string();

    // If-Match manquant
    let uri = format!("/realm/{id}");
    let (status, _) = request_json(&ctx.app, "PATCH", &uri, Some(ADMIN_KEY), None, Some(json!({"alias": "EU"}))).await;
    assert_eq!(status, StatusCode::PRECONDITION_REQUIRED);

    // champ dérivé sans If-Match : 412 quand même
    let (status, _) =
        request_json(&ctx.app, "PATCH", &uri, Some(ADMIN_KEY), None, Some(json!({"_level": 3}))).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);

    // champ dérivé : 412, sans effet
    let (status, body) = request_json(
        &ctx.app,
        "PATCH",
        &uri,
        Some(ADMIN_KEY),
        Some(&etag),
        Some(json!({"alias": "EU", "_tree_children": []})),
    )
    .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["_error"]["code"], 412);
    let (_, unchanged) = get(&ctx.app, &uri, ADMIN_KEY).await;
    assert_eq!(unchanged["alias"], "");
    assert_eq!(unchanged["_etag"], etag.as_str());

    // jeton périmé : 409
    let (status, _) =
        request_json(&ctx.app, "PATCH", &uri, Some(ADMIN_KEY), Some("stale"), Some(json!({"alias": "EU"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, patched) =
        request_json(&ctx.app, "PATCH", &uri, Some(ADMIN_KEY), Some(&etag), Some(json!({"alias": "EU"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(patched["alias"], "EU");
    let etag = patched["_etag"].as_str().unwrap().to_string();

    // le realm par défaut a des enfants : 409
    let all_uri = format!("/realm/{}", all.id);
    let (_, all_now) = get(&ctx.app, &all_uri, ADMIN_KEY).await;
    let all_etag = all_now["_etag"].as_str().unwrap().to_string();
    let (status, _) = request_json(&ctx.app, "DELETE", &all_uri, Some(ADMIN_KEY), Some(&all_etag), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = request_json(&ctx.app, "DELETE", &uri, Some(ADMIN_KEY), Some(&etag), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = get(&ctx.app, &uri, ADMIN_KEY).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn synthesis_routes_follow_visibility() {
    let ctx = build_test_context();
    let all = ctx.harness.default_realm();
    let scoped = ctx.harness.realm("Scoped", Some(&all.id)).unwrap();
    let hidden = ctx.harness.realm("Hidden", Some(&scoped.id)).unwrap();
    ctx.harness.host("scoped-host", &scoped.id).unwrap();
    ctx.harness.host("hidden-host", &hidden.id).unwrap();

    let uri = format!("/synthesis/{}?concatenation=1", scoped.id);
    let (status, admin_view) = get(&ctx.app, &uri, ADMIN_KEY).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(admin_view["hosts_total"], 2);
    assert_eq!(admin_view["concatenated"], true);
    assert_eq!(admin_view["percentages"]["hosts_up_hard"], 1.0);

    let (status, scoped_view) = get(&ctx.app, &uri, SCOPED_KEY).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(scoped_view["hosts_total"], 1);

    let (status, body) = get(&ctx.app, &format!("/synthesis/{}", all.id), SCOPED_KEY).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["_error"]["code"], 403);

    let (status, list) = get(&ctx.app, "/synthesis", SCOPED_KEY).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, realms) = get(&ctx.app, "/realm", SCOPED_KEY).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(realms[0]["name"], "Scoped");

    let (status, _) = get(&ctx.app, "/synthesis/unknown", ADMIN_KEY).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn retention_cron_and_history() {
    let ctx = build_test_context();
    let all = ctx.harness.default_realm();

    let (status, _) = request_json(&ctx.app, "POST", "/cron/synthesis-retention", Some(SCOPED_KEY), None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    for _ in 0..2 {
        let (status, report) =
            request_json(&ctx.app, "POST", "/cron/synthesis-retention", Some(ADMIN_KEY), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["written"], 1);
    }

    let (status, history) = get(&ctx.app, &format!("/synthesis/{}?history=1", all.id), ADMIN_KEY).await;
    assert_eq!(status, StatusCode::OK);
    let rows = history.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r["captured_at"].is_string() && r["hosts_total"] == 0));
}

#[tokio::test]
async fn livestate_patch_drives_synthesis() {
    let ctx = build_test_context();
    let all = ctx.harness.default_realm();

    let (status, host) = request_json(
        &ctx.app,
        "POST",
        "/host",
        Some(ADMIN_KEY),
        None,
        Some(json!({"name": "srv-db", "customs": {"_os": "linux"}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(host["realm"], all.id.as_str());
    assert_eq!(host["customs"]["_OS"], "linux");

    let (status, _) = request_json(
        &ctx.app,
        "POST",
        "/host",
        Some(ADMIN_KEY),
        None,
        Some(json!({"name": "srv-bad", "customs": {"os": "linux"}})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    // _os et _OS donneraient la même clé
    let (status, _) = request_json(
        &ctx.app,
        "POST",
        "/host",
        Some(ADMIN_KEY),
        None,
        Some(json!({"name": "srv-clash", "customs": {"_os": "linux", "_OS": "bsd"}})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (_, entries) = get(&ctx.app, "/livestate", ADMIN_KEY).await;
    let entry = &entries.as_array().unwrap()[0];
    let uri = format!("/livestate/{}", entry["_id"].as_str().unwrap());
    let etag = entry["_etag"].as_str().unwrap().to_string();

    let (status, _) = request_json(
        &ctx.app,
        "PATCH",
        &uri,
        Some(ADMIN_KEY),
        Some(&etag),
        Some(json!({"state": "WARNING", "state_type": "HARD"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, updated) = request_json(
        &ctx.app,
        "PATCH",
        &uri,
        Some(ADMIN_KEY),
        Some(&etag),
        Some(StateChangeBuilder::new("DOWN").soft().downtimed().to_json()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["state"], "DOWN");
    assert_eq!(updated["state_id"], 1);

    let (_, synthesis) = get(&ctx.app, &format!("/synthesis/{}", all.id), ADMIN_KEY).await;
    assert_eq!(synthesis["hosts_down_soft"], 1);
    assert_eq!(synthesis["hosts_in_downtime"], 1);
    assert_eq!(synthesis["hosts_up_hard"], 0);

    // même jeton réutilisé : périmé
    let (status, _) = request_json(
        &ctx.app,
        "PATCH",
        &uri,
        Some(ADMIN_KEY),
        Some(&etag),
        Some(json!({"state": "UP", "state_type": "HARD"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}
