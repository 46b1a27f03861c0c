mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::*;
use face_gallery::detection::{DetectionEngine, FaceId};
use face_gallery::events::PhotoId;
use face_gallery::index::InMemoryIndex;
use face_gallery::permission::{self, PermissionGate, PermissionState, SharedPermissionGate};
use face_gallery::state::UiState;
use face_gallery::tasks::loader::ImageLoader;
use face_gallery::tasks::manager::{ScanCursor, ScanManager};
use face_gallery::tasks::pipeline::Pipeline;
use tokio_util::sync::CancellationToken;

fn manager_over(rows: Vec<face_gallery::events::PhotoRef>, batch_size: usize) -> ScanManager {
    ScanManager::new(pipeline(Arc::new(InMemoryIndex::new(rows)), batch_size))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_scan_accumulates_and_advances_cursor() {
    let manager = manager_over(library(25, &[3, 12, 24]), 10);
    assert!(matches!(manager.snapshot(), UiState::Initial));

    manager.scan_images(true, false).unwrap().await.unwrap();

    let state = manager.snapshot();
    assert_eq!(photo_ids(&state), vec![3, 12, 24]);
    assert!(matches!(state, UiState::Success { has_more: false, .. }));
    assert_eq!(
        manager.cursor(),
        ScanCursor {
            current_index: 25,
            is_processing: false
        }
    );
    assert!(!*manager.has_more().borrow());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_faces_anywhere_is_an_explicit_empty_success() {
    let manager = manager_over(library(12, &[]), 5);
    manager.scan_images(true, false).unwrap().await.unwrap();
    assert!(matches!(
        manager.snapshot(),
        UiState::Success { ref images, has_more: false } if images.is_empty()
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scan_request_while_in_flight_is_a_no_op() {
    let engine = Arc::new(DetectionEngine::from_detector(SlowFaces(
        Duration::from_millis(100),
    )));
    let index = Arc::new(InMemoryIndex::new(library(4, &[0, 1, 2, 3])));
    let manager = ScanManager::new(Pipeline::new(index, ImageLoader::default(), engine));

    let first = manager.scan_images(true, false).expect("first scan starts");
    assert!(manager.is_processing());
    assert!(manager.scan_images(true, false).is_none());
    assert!(manager.clone().scan_images(false, true).is_none());
    assert!(manager.retry().is_none());

    first.await.unwrap();
    assert!(!manager.is_processing());
    assert_eq!(photo_ids(&manager.snapshot()), vec![0, 1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn storage_error_keeps_cursor_and_retry_resumes() {
    let broken = Arc::new(AtomicBool::new(true));
    let index = Arc::new(FlakyIndex {
        rows: library(25, &[0, 15]),
        fail_from: 12,
        broken: Arc::clone(&broken),
    });
    let manager = ScanManager::new(pipeline(index, 10));

    manager.scan_images(true, false).unwrap().await.unwrap();
    assert!(matches!(
        manager.snapshot(),
        UiState::Error { ref message } if message.contains("media store revoked")
    ));
    assert_eq!(manager.cursor().current_index, 10);

    broken.store(false, Ordering::SeqCst);
    manager.retry().expect("retry starts").await.unwrap();

    let state = manager.snapshot();
    assert_eq!(photo_ids(&state), vec![0, 15]);
    assert!(matches!(state, UiState::Success { has_more: false, .. }));
    assert_eq!(manager.cursor().current_index, 25);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_restarts_from_the_first_row() {
    let manager = manager_over(library(15, &[2, 11]), 10);
    manager.scan_images(true, false).unwrap().await.unwrap();
    assert_eq!(photo_ids(&manager.snapshot()), vec![2, 11]);

    manager.scan_images(true, false).unwrap().await.unwrap();
    assert_eq!(photo_ids(&manager.snapshot()), vec![2, 11]);
    assert_eq!(manager.cursor().current_index, 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn page_limit_pauses_and_retry_continues() {
    let manager = ScanManager::new(pipeline(
        Arc::new(InMemoryIndex::new(library(25, &[3, 12, 24]))),
        10,
    ))
    .with_pages_per_scan(Some(1));

    manager.scan_images(true, false).unwrap().await.unwrap();
    assert_eq!(photo_ids(&manager.snapshot()), vec![3]);
    assert!(matches!(manager.snapshot(), UiState::Success { has_more: true, .. }));
    assert_eq!(manager.cursor().current_index, 10);

    manager.retry().unwrap().await.unwrap();
    assert_eq!(photo_ids(&manager.snapshot()), vec![3, 12]);
    assert_eq!(manager.cursor().current_index, 20);

    manager.retry().unwrap().await.unwrap();
    assert_eq!(photo_ids(&manager.snapshot()), vec![3, 12, 24]);
    assert!(matches!(manager.snapshot(), UiState::Success { has_more: false, .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn renaming_a_face_updates_only_that_face() {
    let rows = vec![photo(1, png_with_faces(2)), photo(2, png_with_faces(1))];
    let manager = manager_over(rows, 10);
    manager.scan_images(true, false).unwrap().await.unwrap();

    let state = manager.snapshot();
    let target: FaceId = state.images()[0].regions.as_ref().unwrap()[1].id;
    manager.update_face_name(target, "Ada");
    manager.update_face_name(target, "Ada");

    let state = manager.snapshot();
    let names: Vec<(FaceId, String)> = state
        .images()
        .iter()
        .flat_map(|i| i.regions.iter().flatten())
        .map(|r| (r.id, r.name.clone()))
        .collect();
    assert_eq!(names.len(), 3);
    for (id, name) in names {
        if id == target {
            assert_eq!(name, "Ada");
        } else {
            assert!(name.is_empty());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn denied_access_blocks_scans() {
    let gate = Arc::new(SharedPermissionGate::new(PermissionState::Denied));
    let manager = manager_over(library(3, &[0]), 10).with_gate(gate.clone());
    assert!(manager.scan_images(true, false).is_none());
    assert!(matches!(manager.snapshot(), UiState::Initial));

    gate.set(PermissionState::Granted);
    manager.scan_images(true, false).unwrap().await.unwrap();
    assert_eq!(photo_ids(&manager.snapshot()), vec![0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn access_grant_starts_a_selection_scan_once() {
    let rows = library(6, &[0, 1, 2, 3, 4, 5]);
    let index = InMemoryIndex::new(rows).with_selection([PhotoId(1), PhotoId(4)]);
    let gate = Arc::new(SharedPermissionGate::new(PermissionState::Denied));
    let manager = ScanManager::new(pipeline(Arc::new(index), 10))
        .with_gate(gate.clone() as Arc<dyn PermissionGate>);
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(permission::run(
        gate.clone(),
        manager.clone(),
        cancel.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(manager.snapshot(), UiState::Initial));

    gate.set(PermissionState::Partial);
    let state = wait_for_state(&manager, |s| matches!(s, UiState::Success { has_more: false, .. })).await;
    assert_eq!(photo_ids(&state), vec![1, 4]);

    // Widening access does not restart the scan.
    gate.set(PermissionState::Granted);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!manager.is_processing());
    assert_eq!(photo_ids(&manager.snapshot()), vec![1, 4]);

    cancel.cancel();
    watcher.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_cancels_and_closes_once() {
    let engine = Arc::new(DetectionEngine::from_detector(SlowFaces(
        Duration::from_millis(50),
    )));
    let index = Arc::new(InMemoryIndex::new(library(30, &[0, 10, 20])));
    let manager = ScanManager::new(
        Pipeline::new(index, ImageLoader::default(), Arc::clone(&engine)).with_batch_size(5),
    );

    let scan = manager.scan_images(true, false).unwrap();
    manager.shutdown();
    manager.shutdown();
    tokio::time::timeout(Duration::from_secs(5), scan)
        .await
        .expect("scan should stop after shutdown")
        .unwrap();

    assert!(engine.is_closed());
    assert!(!manager.is_processing());
    assert!(manager.scan_images(false, false).is_none());
    assert!(matches!(manager.snapshot(), UiState::Success { has_more: true, .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_after_error_drops_kept_images() {
    let broken = Arc::new(AtomicBool::new(true));
    let index = Arc::new(FlakyIndex {
        rows: library(25, &[0, 15]),
        fail_from: 12,
        broken: Arc::clone(&broken),
    });
    let manager = ScanManager::new(pipeline(index, 10));
    manager.scan_images(true, false).unwrap().await.unwrap();
    assert!(matches!(manager.snapshot(), UiState::Error { .. }));

    broken.store(false, Ordering::SeqCst);
    manager.scan_images(true, false).unwrap().await.unwrap();
    assert_eq!(photo_ids(&manager.snapshot()), vec![0, 15]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_scan_frees_the_manager_for_a_new_scan() {
    let engine = Arc::new(DetectionEngine::from_detector(SlowFaces(
        Duration::from_millis(50),
    )));
    let index = Arc::new(InMemoryIndex::new(library(20, &[0, 1, 2, 3])));
    let manager = ScanManager::new(Pipeline::new(index, ImageLoader::default(), engine));

    let first = manager.scan_images(true, false).unwrap();
    manager.cancel_scan();
    assert!(!manager.is_processing());
    assert!(!manager.snapshot().is_loading());

    let second = manager.scan_images(true, false).expect("scan starts after cancel");
    first.await.unwrap();
    second.await.unwrap();
    assert_eq!(photo_ids(&manager.snapshot()), vec![0, 1, 2, 3]);
    assert_eq!(manager.cursor().current_index, 20);
}

async fn wait_until_idle(manager: &ScanManager) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.is_processing() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("scan should stop");
}

fn slow_selection_manager(gate: Arc<SharedPermissionGate>) -> ScanManager {
    let engine = Arc::new(DetectionEngine::from_detector(SlowFaces(
        Duration::from_millis(80),
    )));
    let with_faces: Vec<u64> = (0..12).collect();
    let rows = library(12, &with_faces);
    let index = Arc::new(InMemoryIndex::new(rows).with_selection([PhotoId(1)]));
    ScanManager::new(Pipeline::new(index, ImageLoader::default(), engine)).with_gate(gate)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn revoke_then_partial_grant_restarts_with_the_selection() {
    let gate = Arc::new(SharedPermissionGate::new(PermissionState::Granted));
    let manager = slow_selection_manager(Arc::clone(&gate));
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(permission::run(
        gate.clone(),
        manager.clone(),
        cancel.clone(),
    ));

    wait_for_state(&manager, |s| s.is_loading() || !s.images().is_empty()).await;
    assert!(manager.is_processing());

    gate.set(PermissionState::Denied);
    wait_until_idle(&manager).await;

    gate.set(PermissionState::Partial);
    let state = wait_for_state(&manager, |s| {
        matches!(s, UiState::Success { has_more: false, .. }) && photo_ids(s) == vec![1]
    })
    .await;
    assert_eq!(photo_ids(&state), vec![1]);
    wait_until_idle(&manager).await;
    assert_eq!(photo_ids(&manager.snapshot()), vec![1]);

    cancel.cancel();
    watcher.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn narrowing_to_partial_mid_scan_restarts_with_the_selection() {
    let gate = Arc::new(SharedPermissionGate::new(PermissionState::Granted));
    let manager = slow_selection_manager(Arc::clone(&gate));
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(permission::run(
        gate.clone(),
        manager.clone(),
        cancel.clone(),
    ));

    wait_for_state(&manager, |s| s.is_loading() || !s.images().is_empty()).await;
    gate.set(PermissionState::Partial);

    wait_for_state(&manager, |s| {
        matches!(s, UiState::Success { has_more: false, .. }) && photo_ids(s) == vec![1]
    })
    .await;
    wait_until_idle(&manager).await;
    assert_eq!(photo_ids(&manager.snapshot()), vec![1]);

    cancel.cancel();
    watcher.await.unwrap();
}
