//! Integration tests for the sync reconciler's three phases.

use std::sync::Arc;

use offline_cache_core::{
    ContentCatalog, DownloadOrchestrator, DownloadStatus, NewDownload, ReconcilerSettings,
    SyncPhase, SyncReconciler, TaskScheduler,
};

mod support;
use support::{FakeCatalog, Harness, USER, UnavailableScheduler, catalog_item};

fn reconciler(h: &Harness, catalog: FakeCatalog, settings: ReconcilerSettings) -> SyncReconciler {
    reconciler_with(h, Arc::clone(&h.orchestrator), catalog, settings)
}

fn reconciler_with(
    h: &Harness,
    orchestrator: Arc<DownloadOrchestrator>,
    catalog: FakeCatalog,
    settings: ReconcilerSettings,
) -> SyncReconciler {
    let catalog: Arc<dyn ContentCatalog> = Arc::new(catalog);
    SyncReconciler::new(
        h.store.clone(),
        catalog,
        orchestrator,
        h.storage.clone(),
        h.session.clone(),
        settings,
    )
}

fn empty_catalog() -> FakeCatalog {
    FakeCatalog::new("http://catalog.invalid/")
}

async fn completed_count(h: &Harness) -> usize {
    h.store
        .completed_downloads_oldest_first()
        .await
        .unwrap()
        .len()
}

// ==================== Phase 2: eviction ====================

#[tokio::test]
async fn test_low_storage_evicts_watched_and_unwatched() {
    let h = Harness::new().await;
    h.add_item("w1", 600, 0.95).await;
    h.add_item("w2", 600, 0.9).await;
    h.add_item("u1", 600, 0.0).await;
    h.complete_item("w1").await;
    h.complete_item("w2").await;
    h.complete_item("u1").await;
    h.storage.set_low(true);

    let report = reconciler(&h, empty_catalog(), ReconcilerSettings::default())
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.evicted, 3);
    assert_eq!(report.queued, 0, "no acquisition under storage pressure");
    assert_eq!(completed_count(&h).await, 0);
    for id in ["w1", "w2", "u1"] {
        let item = h.store.get_media_item(USER, id).await.unwrap().unwrap();
        assert!(!item.is_downloaded);
        assert!(item.local_file_path.is_none());
        assert!(!h.paths.final_path(USER, id).exists());
    }
}

#[tokio::test]
async fn test_eviction_stops_when_storage_pressure_clears() {
    let h = Harness::new().await;
    h.add_item("w1", 600, 0.95).await;
    h.add_item("w2", 600, 0.95).await;
    h.add_item("u1", 600, 0.0).await;
    h.complete_item("w1").await;
    h.complete_item("w2").await;
    h.complete_item("u1").await;
    // Low when the phase starts, cleared after the first deletion.
    h.storage.script_low(&[true, false]);
    h.session.sign_out();

    let report = reconciler(&h, empty_catalog(), ReconcilerSettings::default())
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.evicted, 1);
    assert_eq!(completed_count(&h).await, 2);
}

#[tokio::test]
async fn test_without_pressure_only_watched_items_are_evicted() {
    let h = Harness::new().await;
    h.add_item("w1", 600, 0.92).await;
    h.add_item("w2", 600, 1.0).await;
    h.add_item("u1", 600, 0.5).await;
    h.complete_item("w1").await;
    h.complete_item("w2").await;
    let kept = h.complete_item("u1").await;
    h.session.sign_out();

    let report = reconciler(&h, empty_catalog(), ReconcilerSettings::default())
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.evicted, 2);
    let remaining = h.store.completed_downloads_oldest_first().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, kept);
}

#[tokio::test]
async fn test_download_without_media_item_is_evicted() {
    let h = Harness::new().await;
    h.store
        .insert_download(&NewDownload {
            id: "ghost-download",
            media_item_id: "ghost",
            user_id: "user-2",
            total_bytes: 10,
            wifi_only: true,
        })
        .await
        .unwrap();
    assert!(
        h.store
            .complete_download("ghost-download", "/nonexistent/ghost.mp4", 10)
            .await
            .unwrap()
    );
    h.session.sign_out();

    let report = reconciler(&h, empty_catalog(), ReconcilerSettings::default())
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.evicted, 1);
    assert!(h.store.get_download("ghost-download").await.unwrap().is_none());
}

// ==================== Phase 3: acquisition ====================

#[tokio::test]
async fn test_acquisition_stops_once_target_reached() {
    let h = Harness::new().await;
    h.add_item("have", 5000, 0.0).await;
    h.complete_item("have").await;
    h.add_item_at("c1", 600, 0.0, Some(1_000)).await;
    h.add_item_at("c2", 600, 0.0, Some(3_000)).await;
    h.add_item_at("c3", 600, 0.0, Some(2_000)).await;

    let settings = ReconcilerSettings {
        target_duration_secs: 5400,
        ..ReconcilerSettings::default()
    };
    let report = reconciler(&h, empty_catalog(), settings)
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.queued, 1);
    let newest = h.orchestrator.get_by_media_item("c2").await.unwrap().unwrap();
    assert_eq!(newest.status(), DownloadStatus::Pending);
    assert!(newest.wifi_only);
    assert!(h.orchestrator.get_by_media_item("c1").await.unwrap().is_none());
    assert!(h.orchestrator.get_by_media_item("c3").await.unwrap().is_none());
}

#[tokio::test]
async fn test_watched_downloads_do_not_count_toward_target() {
    let h = Harness::new().await;
    h.add_item("seen", 5000, 0.95).await;
    h.complete_item("seen").await;
    h.add_item_at("c1", 600, 0.0, Some(1_000)).await;
    h.add_item_at("c2", 600, 0.0, Some(2_000)).await;

    let settings = ReconcilerSettings {
        target_duration_secs: 1000,
        ..ReconcilerSettings::default()
    };
    let report = reconciler(&h, empty_catalog(), settings)
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.evicted, 1, "watched item is evicted first");
    assert_eq!(report.queued, 2);
}

#[tokio::test]
async fn test_acquisition_respects_per_run_cap() {
    let h = Harness::new().await;
    for (index, id) in ["a", "b", "c", "d", "e"].into_iter().enumerate() {
        h.add_item_at(id, 600, 0.0, Some(index as i64)).await;
    }

    let settings = ReconcilerSettings {
        target_duration_secs: 100_000,
        max_new_per_run: 2,
        ..ReconcilerSettings::default()
    };
    let report = reconciler(&h, empty_catalog(), settings)
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.queued, 2);
    assert!(h.orchestrator.get_by_media_item("e").await.unwrap().is_some());
    assert!(h.orchestrator.get_by_media_item("d").await.unwrap().is_some());
    assert!(h.orchestrator.get_by_media_item("a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_acquisition_stops_when_space_runs_out() {
    let h = Harness::new().await;
    h.add_item("c1", 600, 0.0).await;
    h.storage.set_free_bytes(1);

    let report = reconciler(&h, empty_catalog(), ReconcilerSettings::default())
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.queued, 0);
    assert!(report.is_clean());
    assert!(h.orchestrator.list_downloads().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_acquisition_skips_started_and_watched_items() {
    let h = Harness::new().await;
    h.add_item("started", 600, 0.0).await;
    h.add_item("half-watched", 600, 0.5).await;
    h.add_item("fresh", 600, 0.05).await;
    let failed = h.orchestrator.start("started", true).await.unwrap();
    assert!(h.store.fail_download(&failed, "HTTP 500").await.unwrap());

    let report = reconciler(&h, empty_catalog(), ReconcilerSettings::default())
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.queued, 1);
    assert!(h.orchestrator.get_by_media_item("fresh").await.unwrap().is_some());
    assert!(
        h.orchestrator
            .get_by_media_item("half-watched")
            .await
            .unwrap()
            .is_none()
    );
    let started = h.orchestrator.get_by_media_item("started").await.unwrap().unwrap();
    assert_eq!(started.id, failed, "failed attempt is left for an explicit retry");
}

#[tokio::test]
async fn test_start_failures_do_not_abort_acquisition() {
    let h = Harness::new().await;
    h.add_item("c1", 600, 0.0).await;
    h.add_item("c2", 600, 0.0).await;
    let broken = Arc::new(h.orchestrator_with(
        Arc::new(UnavailableScheduler) as Arc<dyn TaskScheduler>
    ));

    let report = reconciler_with(&h, broken, empty_catalog(), ReconcilerSettings::default())
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.queued, 0);
    assert!(report.is_clean());
    assert!(h.orchestrator.list_downloads().await.unwrap().is_empty());
}

// ==================== Phase 1: catalog refresh ====================

#[tokio::test]
async fn test_catalog_refresh_follows_cursors() {
    let h = Harness::new().await;
    let catalog = FakeCatalog::new("http://catalog.invalid/").with_pages(vec![
        vec![catalog_item("p1", 600, 0.0), catalog_item("p2", 600, 0.95)],
        vec![catalog_item("p3", 1200, 0.2)],
    ]);

    let settings = ReconcilerSettings {
        max_new_per_run: 0,
        ..ReconcilerSettings::default()
    };
    let report = reconciler(&h, catalog, settings).run_once().await.unwrap();

    assert_eq!(report.refreshed, 3);
    let items = h.store.list_media_items(USER).await.unwrap();
    assert_eq!(items.len(), 3);
    let p3 = h.store.get_media_item(USER, "p3").await.unwrap().unwrap();
    assert_eq!(p3.duration_seconds(), 1200);
    assert!((p3.watched_fraction - 0.2).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_catalog_refresh_updates_watch_position_and_keeps_download() {
    let h = Harness::new().await;
    h.add_item("m1", 600, 0.0).await;
    h.complete_item("m1").await;
    let catalog = FakeCatalog::new("http://catalog.invalid/")
        .with_items(vec![catalog_item("m1", 600, 0.5)]);

    let report = reconciler(&h, catalog, ReconcilerSettings::default())
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.refreshed, 1);
    assert_eq!(report.evicted, 0);
    let item = h.store.get_media_item(USER, "m1").await.unwrap().unwrap();
    assert!((item.watched_fraction - 0.5).abs() < f64::EPSILON);
    assert!(item.is_downloaded, "refresh leaves download state alone");
}

#[tokio::test]
async fn test_refreshed_watch_position_drives_eviction() {
    let h = Harness::new().await;
    h.add_item("m1", 600, 0.0).await;
    h.complete_item("m1").await;
    let catalog = FakeCatalog::new("http://catalog.invalid/")
        .with_items(vec![catalog_item("m1", 600, 0.97)]);

    let report = reconciler(&h, catalog, ReconcilerSettings::default())
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.evicted, 1);
    assert_eq!(completed_count(&h).await, 0);
}

#[tokio::test]
async fn test_catalog_failure_does_not_abort_later_phases() {
    let h = Harness::new().await;
    h.add_item("w1", 600, 0.95).await;
    h.complete_item("w1").await;
    h.add_item("c1", 600, 0.0).await;
    let catalog = FakeCatalog::new("http://catalog.invalid/").failing();

    let report = reconciler(&h, catalog, ReconcilerSettings::default())
        .run_once()
        .await
        .expect("phase failures are reported, not raised");

    assert_eq!(report.phase_errors.len(), 1);
    assert_eq!(report.phase_errors[0].0, SyncPhase::CatalogRefresh);
    assert!(!report.is_clean());
    assert_eq!(report.evicted, 1);
    assert_eq!(report.queued, 1);
}

#[tokio::test]
async fn test_signed_out_run_only_evicts() {
    let h = Harness::new().await;
    h.add_item("w1", 600, 0.95).await;
    h.complete_item("w1").await;
    h.add_item("c1", 600, 0.0).await;
    h.session.sign_out();
    let catalog = Arc::new(empty_catalog());

    let reconciler = SyncReconciler::new(
        h.store.clone(),
        catalog.clone(),
        Arc::clone(&h.orchestrator),
        h.storage.clone(),
        h.session.clone(),
        ReconcilerSettings::default(),
    );
    let report = reconciler.run_once().await.unwrap();

    assert_eq!(catalog.fetches(), 0);
    assert_eq!(report.refreshed, 0);
    assert_eq!(report.evicted, 1);
    assert_eq!(report.queued, 0);
}
