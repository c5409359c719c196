use realmwatch_devkit::{StateChangeBuilder, TestHarness};
use realmwatch_kernel::config::RetentionConfig;
use realmwatch_kernel::store::Store;

#[tokio::test]
async fn store_round_trip_through_data_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("realmwatch.json");

    let h = TestHarness::new();
    let all = h.default_realm();
    let paris = h.realm("Paris", Some(&all.id)).unwrap();
    let host = h.host("srv-paris", &paris.id).unwrap();
    let service = h.service(&host.id, "http").unwrap();
    h.set_state(&host.id, Some(&service.id), StateChangeBuilder::new("CRITICAL").soft().flapping().build())
        .unwrap();
    h.kernel.retention.run_job().unwrap();

    h.kernel.store.save_to(&path).await.unwrap();
    assert!(path.exists());

    let restored = TestHarness::from_store(Store::load_from(&path).await.unwrap(), RetentionConfig::default());
    let report = restored.kernel.start().unwrap();
    assert!(!report.ran, "live state was persisted, bootstrap must not run");

    let tree = restored.kernel.store.realms.read().clone();
    assert_eq!(tree.get(&paris.id).unwrap().tree_parents, vec![all.id.clone()]);
    assert_eq!(tree.get(&all.id).unwrap().tree_children, vec![paris.id.clone()]);
    drop(tree);

    assert_eq!(restored.kernel.objects.get_service(&service.id).unwrap(), service);
    assert_eq!(restored.entry(&host.id, Some(&service.id)).unwrap(), h.entry(&host.id, Some(&service.id)).unwrap());
    assert_eq!(
        restored.synthesis(&paris.id, false).unwrap(),
        h.synthesis(&paris.id, false).unwrap()
    );
    assert_eq!(
        restored.kernel.retention.history(&paris.id, false, &restored.all_realms()).unwrap(),
        h.kernel.retention.history(&paris.id, false, &h.all_realms()).unwrap()
    );
    restored.assert_synthesis_matches_livestate().unwrap();

    // une nouvelle capture reste postérieure aux lignes rechargées
    let before = restored.kernel.retention.history(&paris.id, false, &restored.all_realms()).unwrap();
    restored.kernel.retention.run_job().unwrap();
    let after = restored.kernel.retention.history(&paris.id, false, &restored.all_realms()).unwrap();
    assert_eq!(after.len(), before.len() + 1);
    assert!(after[0].captured_at > before[0].captured_at);
}

#[tokio::test]
async fn missing_data_file_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::load_from(&dir.path().join("absent.json")).await.unwrap();
    let h = TestHarness::from_store(store, RetentionConfig::default());
    h.kernel.start().unwrap();
    assert_eq!(h.default_realm().name, "All");
    assert_eq!(h.kernel.store.counts().realms, 1);
}

#[tokio::test]
async fn corrupt_data_file_is_a_storage_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    tokio::fs::write(&path, "{ not json").await.unwrap();
    let err = Store::load_from(&path).await.unwrap_err();
    assert_eq!(err.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
}
