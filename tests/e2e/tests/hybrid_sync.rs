//! Hybrid engine scenarios: degraded-mode writes, queue drain, eventual
//! consistency, anti-resurrection across tiers, and drift repair.

use keepsake_e2e_tests::{memory, TestHybrid};
use keepsake_core::{MemoryStorage, MemoryUpdates, SyncOp};

#[tokio::test]
async fn scenario_degraded_mode_then_recovery() {
    let t = TestHybrid::new().await;

    // Take the secondary down for one mutating call
    t.secondary.fail_next_operations(1).await;

    // Local store still succeeds immediately
    let m = memory("written during outage", &["ops"]);
    let (ok, _) = t.hybrid.store(&m).await.unwrap();
    assert!(ok);
    assert!(t.hybrid.get_by_hash(&m.content_hash).await.unwrap().is_some());

    // Queue depth rose
    let service = t.hybrid.sync_service().unwrap();
    assert_eq!(service.status().await.queue_size, 1);

    // First drain fails transiently; the op waits in the retry ring
    service.drain_once().await;
    let status = service.status().await;
    assert_eq!(status.operations_processed, 0);
    assert_eq!(status.failed_operations, 1);
    assert!(!status.secondary_available);

    // Outage ends; after the backoff window the retry succeeds
    tokio::time::sleep(std::time::Duration::from_millis(2100)).await;
    service.periodic_sync().await;

    let status = service.status().await;
    assert_eq!(status.operations_processed, 1);
    assert_eq!(status.operations_failed, 0);
    assert!(status.secondary_available);
    assert!(t.secondary.get_by_hash(&m.content_hash).await.unwrap().is_some());

    t.hybrid.close().await;
}

#[tokio::test]
async fn scenario_eventual_consistency_counts() {
    let t = TestHybrid::new().await;
    let service = t.hybrid.sync_service().unwrap();

    let mut hashes = Vec::new();
    for i in 0..10 {
        let m = memory(&format!("consistency subject {i}"), &["bulk"]);
        hashes.push(m.content_hash.clone());
        assert!(t.hybrid.store(&m).await.unwrap().0);
    }
    assert_eq!(service.status().await.queue_size, 10);

    service.drain_once().await;

    let status = service.status().await;
    assert_eq!(status.operations_processed, 10);
    assert_eq!(status.operations_failed, 0);
    assert_eq!(status.queue_size, 0);
    for hash in &hashes {
        assert!(t.secondary.get_by_hash(hash).await.unwrap().is_some());
    }

    t.hybrid.close().await;
}

#[tokio::test]
async fn scenario_anti_resurrection_across_tiers() {
    let t = TestHybrid::new().await;
    let service = t.hybrid.sync_service().unwrap();

    let m = memory("doomed to deletion", &[]);
    t.hybrid.store(&m).await.unwrap();
    service.drain_once().await;
    assert!(t.secondary.get_by_hash(&m.content_hash).await.unwrap().is_some());

    // Delete locally; the tombstone propagates
    t.hybrid.delete(&m.content_hash).await.unwrap();
    service.drain_once().await;
    assert!(t.secondary.get_by_hash(&m.content_hash).await.unwrap().is_none());

    // A stale store sync arriving later is dropped, keeping both tiers clean
    service.enqueue(SyncOp::Store(Box::new(m.clone()))).await;
    service.drain_once().await;
    assert!(t.hybrid.get_by_hash(&m.content_hash).await.unwrap().is_none());
    assert!(t.secondary.get_by_hash(&m.content_hash).await.unwrap().is_none());

    t.hybrid.close().await;
}

#[tokio::test]
async fn scenario_metadata_update_flows_through() {
    let t = TestHybrid::new().await;
    let service = t.hybrid.sync_service().unwrap();

    let m = memory("tracked document", &["draft"]);
    t.hybrid.store(&m).await.unwrap();
    service.drain_once().await;

    let updates = MemoryUpdates {
        tags: Some(vec!["final".to_string()]),
        memory_type: Some("reference".to_string()),
        ..Default::default()
    };
    let (ok, _) = t
        .hybrid
        .update_memory_metadata(&m.content_hash, &updates, true)
        .await
        .unwrap();
    assert!(ok);
    service.drain_once().await;

    let remote = t.secondary.get_by_hash(&m.content_hash).await.unwrap().unwrap();
    assert_eq!(remote.tags, vec!["final"]);
    assert_eq!(remote.memory_type.as_deref(), Some("reference"));
    // Identity and creation time unchanged on both tiers
    assert_eq!(remote.content, m.content);
    assert_eq!(remote.created_at, m.created_at);

    t.hybrid.close().await;
}

#[tokio::test]
async fn scenario_force_sync_reconciles() {
    let t = TestHybrid::new().await;

    for i in 0..6 {
        t.hybrid
            .store(&memory(&format!("force sync {i}"), &[]))
            .await
            .unwrap();
    }

    let report = t.hybrid.force_sync().await.unwrap();
    assert_eq!(report.status, "completed");
    assert_eq!(report.primary_memories, 6);
    assert_eq!(report.synced_to_secondary, 6);
    assert_eq!(report.failed, 0);
    assert_eq!(t.secondary.count_all_memories(None, None).await.unwrap(), 6);

    t.hybrid.close().await;
}

#[tokio::test]
async fn scenario_drift_detected_and_repaired() {
    let t = TestHybrid::new().await;
    let service = t.hybrid.sync_service().unwrap();

    let m = memory("drift subject", &["canonical"]);
    t.hybrid.store(&m).await.unwrap();
    service.drain_once().await;

    // Secondary diverges behind our back
    t.secondary
        .update_memory_metadata(
            &m.content_hash,
            &MemoryUpdates {
                tags: Some(vec!["rogue".to_string()]),
                ..Default::default()
            },
            true,
        )
        .await
        .unwrap();

    // Dry run counts but does not touch
    let report = t.hybrid.detect_drift(true, None, None).await.unwrap();
    assert_eq!(report.drifted, 1);
    assert_eq!(report.applied, 0);

    // Apply restores the primary's view
    let report = t.hybrid.detect_drift(false, None, None).await.unwrap();
    assert_eq!(report.applied, 1);
    let remote = t.secondary.get_by_hash(&m.content_hash).await.unwrap().unwrap();
    assert_eq!(remote.tags, vec!["canonical"]);

    t.hybrid.close().await;
}

#[tokio::test]
async fn scenario_stats_surface_sync_state() {
    let t = TestHybrid::new().await;
    let service = t.hybrid.sync_service().unwrap();

    t.hybrid.store(&memory("observed", &["s"])).await.unwrap();
    service.drain_once().await;
    service.periodic_sync().await;

    let stats = t.hybrid.get_stats().await.unwrap();
    assert!(stats.backend.starts_with("hybrid"));
    let sync = stats.sync_status.unwrap();
    assert!(sync.is_running);
    assert_eq!(sync.operations_processed, 1);
    assert!(stats.secondary_stats.is_some());

    let initial = t.hybrid.get_initial_sync_status();
    assert!(!initial.in_progress);

    t.hybrid.close().await;
}
