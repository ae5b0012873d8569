//! Integration tests for the download orchestrator.
//!
//! These tests run the orchestrator against a real record store and durable
//! scheduler sharing one SQLite database, with a scripted storage advisor.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use offline_cache_core::orchestrator::{
    DOWNLOAD_TAG, ESTIMATED_BYTES_PER_MINUTE, download_work_key,
};
use offline_cache_core::transfer::TransferPayload;
use offline_cache_core::{
    DownloadStatus, MediaItemUpsert, OrchestratorError, StaticSession, TaskScheduler, WorkHandle,
    WorkState,
};

mod support;
use support::{Harness, USER, UnavailableScheduler, ticks};

// ==================== start ====================

#[tokio::test]
async fn test_start_creates_pending_record_and_work_unit() {
    let h = Harness::new().await;
    h.add_item("m1", 600, 0.0).await;

    let id = h.orchestrator.start("m1", true).await.unwrap();

    let record = h.orchestrator.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status(), DownloadStatus::Pending);
    assert_eq!(record.media_item_id, "m1");
    assert_eq!(record.user_id, USER);
    assert!(record.wifi_only);
    assert_eq!(
        u64::try_from(record.total_bytes).unwrap(),
        10 * ESTIMATED_BYTES_PER_MINUTE
    );

    let work_id = record.scheduler_work_id.expect("work handle stored");
    let unit = h
        .scheduler
        .get(&WorkHandle::from(work_id.as_str()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unit.state(), WorkState::Enqueued);
    assert_eq!(unit.unique_key, download_work_key("m1"));
    assert!(unit.tags().iter().any(|tag| tag == DOWNLOAD_TAG));
    assert!(unit.tags().contains(&download_work_key("m1")));

    let payload: TransferPayload = serde_json::from_value(unit.payload()).unwrap();
    assert_eq!(payload.download_id, id);
    assert_eq!(payload.media_item_id, "m1");
    assert_eq!(payload.user_id, USER);
}

#[tokio::test]
async fn test_start_any_network_relaxes_constraint() {
    let h = Harness::new().await;
    h.add_item("m1", 60, 0.0).await;

    let id = h.orchestrator.start("m1", false).await.unwrap();

    let record = h.orchestrator.get(&id).await.unwrap().unwrap();
    assert!(!record.wifi_only);
    let unit = h
        .scheduler
        .get(&WorkHandle::from(record.scheduler_work_id.unwrap().as_str()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        unit.constraints().network,
        offline_cache_core::NetworkType::Connected
    );
    assert!(unit.constraints().battery_not_low);
    assert!(unit.constraints().storage_not_low);
}

#[tokio::test]
async fn test_start_without_user_is_not_authenticated() {
    let h = Harness::new().await;
    h.add_item("m1", 60, 0.0).await;
    h.session.sign_out();

    let err = h.orchestrator.start("m1", true).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotAuthenticated));
}

#[tokio::test]
async fn test_start_unknown_item_is_not_found() {
    let h = Harness::new().await;

    let err = h.orchestrator.start("missing", true).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
    assert!(h.orchestrator.list_downloads().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_start_with_no_free_space_is_insufficient_storage() {
    let h = Harness::new().await;
    h.add_item("item1", 600, 0.0).await;
    h.storage.set_free_bytes(0);

    let err = h.orchestrator.start("item1", true).await.unwrap_err();

    match err {
        OrchestratorError::InsufficientStorage {
            required_bytes,
            available_bytes,
        } => {
            assert_eq!(available_bytes, 0);
            assert!(required_bytes > 0);
        }
        other => panic!("expected InsufficientStorage, got {other:?}"),
    }
    assert!(h.orchestrator.list_downloads().await.unwrap().is_empty());
    assert!(
        h.scheduler
            .list_in_state(WorkState::Enqueued)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_start_twice_before_completion_is_in_progress() {
    let h = Harness::new().await;
    h.add_item("item1", 600, 0.0).await;

    h.orchestrator.start("item1", true).await.unwrap();
    let err = h.orchestrator.start("item1", true).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::InProgress(ref id) if id == "item1"));
    assert_eq!(h.orchestrator.list_downloads().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_start_after_completion_is_already_downloaded() {
    let h = Harness::new().await;
    h.add_item("m1", 60, 0.0).await;
    h.complete_item("m1").await;

    let err = h.orchestrator.start("m1", true).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyDownloaded(_)));
}

#[tokio::test]
async fn test_start_supersedes_cancelled_attempt() {
    let h = Harness::new().await;
    h.add_item("m1", 60, 0.0).await;

    let first = h.orchestrator.start("m1", true).await.unwrap();
    h.orchestrator.cancel(&first).await.unwrap();
    let second = h.orchestrator.start("m1", true).await.unwrap();

    assert_ne!(first, second);
    assert!(h.orchestrator.get(&first).await.unwrap().is_none());
    let downloads = h.orchestrator.list_downloads().await.unwrap();
    assert_eq!(downloads.len(), 1);
    assert_eq!(downloads[0].id, second);
    assert_eq!(downloads[0].status(), DownloadStatus::Pending);
}

#[tokio::test]
async fn test_start_removes_record_when_scheduler_unavailable() {
    let h = Harness::new().await;
    h.add_item("m1", 60, 0.0).await;
    let orchestrator = h.orchestrator_with(Arc::new(UnavailableScheduler));

    let err = orchestrator.start("m1", true).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::Scheduler(_)));
    assert!(orchestrator.list_downloads().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_starts_admit_exactly_one() {
    let h = Harness::file_backed().await;
    h.add_item("m1", 60, 0.0).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let orchestrator = Arc::clone(&h.orchestrator);
        tasks.push(tokio::spawn(
            async move { orchestrator.start("m1", true).await },
        ));
    }

    let mut admitted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(OrchestratorError::InProgress(_)) => {}
            Err(other) => panic!("unexpected start error: {other:?}"),
        }
    }

    assert_eq!(admitted, 1);
    let active: Vec<_> = h
        .orchestrator
        .list_downloads()
        .await
        .unwrap()
        .into_iter()
        .filter(|record| record.status().is_active())
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(
        h.scheduler
            .list_in_state(WorkState::Enqueued)
            .await
            .unwrap()
            .len(),
        1
    );
}

// ==================== cancel ====================

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let h = Harness::new().await;
    h.add_item("m1", 60, 0.0).await;
    let id = h.orchestrator.start("m1", true).await.unwrap();

    h.orchestrator.cancel(&id).await.unwrap();
    let after_first = h.orchestrator.get(&id).await.unwrap().unwrap();
    assert_eq!(after_first.status(), DownloadStatus::Cancelled);

    h.orchestrator.cancel(&id).await.unwrap();
    let after_second = h.orchestrator.get(&id).await.unwrap().unwrap();
    assert_eq!(after_second.status(), DownloadStatus::Cancelled);
    assert_eq!(after_second.last_modified_at, after_first.last_modified_at);
}

#[tokio::test]
async fn test_cancel_stops_the_work_unit_and_removes_partial_file() {
    let h = Harness::new().await;
    h.add_item("m1", 60, 0.0).await;
    let id = h.orchestrator.start("m1", true).await.unwrap();
    h.paths.ensure_user_dir(USER).await.unwrap();
    let partial = h.paths.partial_path(USER, "m1");
    tokio::fs::write(&partial, b"half").await.unwrap();

    h.orchestrator.cancel(&id).await.unwrap();

    let record = h.orchestrator.get(&id).await.unwrap().unwrap();
    let unit = h
        .scheduler
        .get(&WorkHandle::from(
            record.scheduler_work_id.unwrap().as_str(),
        ))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unit.state(), WorkState::Cancelled);
    assert!(!partial.exists());
}

#[tokio::test]
async fn test_cancel_completed_download_is_noop() {
    let h = Harness::new().await;
    h.add_item("m1", 60, 0.0).await;
    let id = h.complete_item("m1").await;

    h.orchestrator.cancel(&id).await.unwrap();

    let record = h.orchestrator.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status(), DownloadStatus::Completed);
}

#[tokio::test]
async fn test_cancel_unknown_download_is_not_found() {
    let h = Harness::new().await;
    let err = h.orchestrator.cancel("nope").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn test_cancel_other_users_download_is_not_found() {
    let h = Harness::new().await;
    h.add_item("m1", 60, 0.0).await;
    let id = h.orchestrator.start("m1", true).await.unwrap();

    h.session.sign_in("someone-else");
    let err = h.orchestrator.cancel(&id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn test_cancel_by_media_item() {
    let h = Harness::new().await;
    h.add_item("m1", 60, 0.0).await;
    let id = h.orchestrator.start("m1", true).await.unwrap();

    h.orchestrator.cancel_by_media_item("m1").await.unwrap();

    let record = h.orchestrator.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status(), DownloadStatus::Cancelled);

    let err = h
        .orchestrator
        .cancel_by_media_item("never-started")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn test_cancel_all_cancels_every_active_download() {
    let h = Harness::new().await;
    for id in ["m1", "m2", "m3"] {
        h.add_item(id, 60, 0.0).await;
    }
    h.orchestrator.start("m1", true).await.unwrap();
    h.orchestrator.start("m2", true).await.unwrap();
    let done = h.complete_item("m3").await;

    let cancelled = h.orchestrator.cancel_all().await.unwrap();

    assert_eq!(cancelled, 2);
    let stats = h.orchestrator.statistics().await.unwrap();
    assert_eq!(stats.cancelled, 2);
    assert_eq!(stats.active(), 0);
    assert_eq!(stats.completed, 1);
    assert_eq!(
        h.orchestrator.get(&done).await.unwrap().unwrap().status(),
        DownloadStatus::Completed
    );
    assert!(
        h.scheduler
            .list_in_state(WorkState::Enqueued)
            .await
            .unwrap()
            .is_empty()
    );
}

// ==================== retry ====================

#[tokio::test]
async fn test_retry_failed_download_replaces_record() {
    let h = Harness::new().await;
    h.add_item("m1", 60, 0.0).await;
    let old = h.orchestrator.start("m1", false).await.unwrap();
    assert!(h.store.fail_download(&old, "HTTP 404").await.unwrap());

    let new = h.orchestrator.retry(&old).await.unwrap();

    assert_ne!(old, new);
    assert!(h.orchestrator.get(&old).await.unwrap().is_none());
    let record = h.orchestrator.get(&new).await.unwrap().unwrap();
    assert_eq!(record.status(), DownloadStatus::Pending);
    assert_eq!(record.media_item_id, "m1");
    assert!(!record.wifi_only, "retry keeps the network preference");
}

#[tokio::test]
async fn test_retry_requires_failed_state() {
    let h = Harness::new().await;
    h.add_item("m1", 60, 0.0).await;
    let id = h.orchestrator.start("m1", true).await.unwrap();

    let err = h.orchestrator.retry(&id).await.unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::NotInFailedState {
            status: DownloadStatus::Pending,
            ..
        }
    ));
    assert!(h.orchestrator.get(&id).await.unwrap().is_some());
}

// ==================== delete ====================

#[tokio::test]
async fn test_delete_after_completion_clears_everything() {
    let h = Harness::new().await;
    h.add_item("m1", 60, 0.0).await;
    let id = h.complete_item("m1").await;
    let file = h.paths.final_path(USER, "m1");
    assert!(file.exists());
    let item = h.store.get_media_item(USER, "m1").await.unwrap().unwrap();
    assert!(item.is_downloaded);

    h.orchestrator.delete(&id).await.unwrap();

    assert!(h.orchestrator.get(&id).await.unwrap().is_none());
    assert!(!file.exists());
    let item = h.store.get_media_item(USER, "m1").await.unwrap().unwrap();
    assert!(!item.is_downloaded);
    assert!(item.local_file_path.is_none());
}

#[tokio::test]
async fn test_delete_leaves_other_users_copy_in_place() {
    let h = Harness::new().await;
    h.add_item("m1", 60, 0.0).await;
    let first = h.complete_item("m1").await;

    let other = "user-2";
    h.session.sign_in(other);
    h.store
        .upsert_media_item(&MediaItemUpsert {
            user_id: other,
            id: "m1",
            duration_ticks: ticks(60),
            watched_fraction: 0.0,
            added_at: None,
        })
        .await
        .unwrap();
    let second = h.orchestrator.start("m1", true).await.unwrap();
    h.paths.ensure_user_dir(other).await.unwrap();
    let other_file = h.paths.final_path(other, "m1");
    tokio::fs::write(&other_file, b"video").await.unwrap();
    assert!(
        h.store
            .complete_download(&second, &other_file.to_string_lossy(), 5)
            .await
            .unwrap()
    );

    h.orchestrator.delete(&second).await.unwrap();

    assert!(!other_file.exists());
    let kept = h.store.get_download(&first).await.unwrap().unwrap();
    assert_eq!(kept.status(), DownloadStatus::Completed);
    let kept_path = kept.local_file_path.unwrap();
    assert_eq!(Path::new(&kept_path), h.paths.final_path(USER, "m1"));
    assert!(Path::new(&kept_path).exists());
    let item = h.store.get_media_item(USER, "m1").await.unwrap().unwrap();
    assert!(item.is_downloaded);
}

#[tokio::test]
async fn test_delete_active_download_cancels_its_unit() {
    let h = Harness::new().await;
    h.add_item("m1", 60, 0.0).await;
    let id = h.orchestrator.start("m1", true).await.unwrap();
    let work_id = h
        .orchestrator
        .get(&id)
        .await
        .unwrap()
        .unwrap()
        .scheduler_work_id
        .unwrap();

    h.orchestrator.delete(&id).await.unwrap();

    assert!(h.orchestrator.get(&id).await.unwrap().is_none());
    let unit = h
        .scheduler
        .get(&WorkHandle::from(work_id.as_str()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unit.state(), WorkState::Cancelled);
}

// ==================== queries ====================

#[tokio::test]
async fn test_get_by_media_item_is_user_scoped() {
    let h = Harness::new().await;
    h.add_item("m1", 60, 0.0).await;
    let id = h.orchestrator.start("m1", true).await.unwrap();

    let found = h.orchestrator.get_by_media_item("m1").await.unwrap().unwrap();
    assert_eq!(found.id, id);

    h.session.sign_in("someone-else");
    assert!(h.orchestrator.get_by_media_item("m1").await.unwrap().is_none());
    assert!(h.orchestrator.get(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_statistics_counts_and_duration() {
    let h = Harness::new().await;
    h.add_item("m1", 600, 0.0).await;
    h.add_item("m2", 1200, 0.0).await;
    h.add_item("m3", 60, 0.0).await;
    h.complete_item("m1").await;
    h.complete_item("m2").await;
    h.orchestrator.start("m3", true).await.unwrap();

    let stats = h.orchestrator.statistics().await.unwrap();

    assert_eq!(stats.completed, 2);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.total(), 3);
    assert_eq!(stats.completed_bytes, 10);
    assert_eq!(stats.downloaded_duration_secs, 1800);
}

#[tokio::test]
async fn test_watch_active_and_completed_follow_transitions() {
    let h = Harness::new().await;
    h.add_item("m1", 60, 0.0).await;

    let mut active = h.orchestrator.watch_active().await.unwrap();
    let mut completed = h.orchestrator.watch_completed().await.unwrap();
    assert!(active.borrow().is_empty());

    let id = h.orchestrator.start("m1", true).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        active.wait_for(|rows| rows.len() == 1),
    )
    .await
    .expect("active list refreshed")
    .unwrap();

    assert!(
        h.store
            .complete_download(&id, "/tmp/m1.mp4", 10)
            .await
            .unwrap()
    );
    tokio::time::timeout(Duration::from_secs(5), active.wait_for(Vec::is_empty))
        .await
        .expect("active list emptied")
        .unwrap();
    let rows = tokio::time::timeout(
        Duration::from_secs(5),
        completed.wait_for(|rows| rows.len() == 1),
    )
    .await
    .expect("completed list refreshed")
    .unwrap()
    .clone();
    assert_eq!(rows[0].id, id);
}

#[tokio::test]
async fn test_progress_never_decreases_while_downloading() {
    let h = Harness::new().await;
    h.add_item("m1", 60, 0.0).await;
    let id = h.orchestrator.start("m1", true).await.unwrap();

    let mut observed = Vec::new();
    for progress in [0.2, 0.5, 0.3, 0.7, 0.1] {
        let bytes = (progress * 1000.0) as i64;
        assert!(h.store.record_progress(&id, bytes, 1000, progress).await.unwrap());
        let record = h.orchestrator.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status(), DownloadStatus::Downloading);
        observed.push(record.progress);
    }

    assert!(observed.windows(2).all(|pair| pair[1] >= pair[0]));
    let item = h.store.get_media_item(USER, "m1").await.unwrap().unwrap();
    assert!((item.download_progress - 0.7).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_operations_for_signed_out_session_fail() {
    let h = Harness::new().await;
    let orchestrator = offline_cache_core::DownloadOrchestrator::new(
        h.store.clone(),
        Arc::new(h.scheduler.clone()) as Arc<dyn TaskScheduler>,
        h.storage.clone(),
        Arc::new(StaticSession::signed_out()),
        h.paths.clone(),
    );

    assert!(matches!(
        orchestrator.list_downloads().await,
        Err(OrchestratorError::NotAuthenticated)
    ));
    assert!(matches!(
        orchestrator.cancel_all().await,
        Err(OrchestratorError::NotAuthenticated)
    ));
    assert!(matches!(
        orchestrator.statistics().await,
        Err(OrchestratorError::NotAuthenticated)
    ));
}
