//! Consolidation workflow: a weekly run over a populated store, horizon
//! windows, forgetting with archival, and idempotence on re-run.

use std::sync::Arc;

use keepsake_e2e_tests::{aged_memory, TestHybrid};
use keepsake_core::consolidation::AssociationStorageMode;
use keepsake_core::memory::now_timestamp;
use keepsake_core::storage::inmem::InMemoryStorage;
use keepsake_core::{
    ConsolidationConfig, Consolidator, FallbackEmbedder, MemoryStorage, TimeHorizon,
};
use tempfile::TempDir;

fn pipeline_config(dir: &TempDir) -> ConsolidationConfig {
    ConsolidationConfig {
        archive_path: dir.path().join("archive"),
        association_storage_mode: AssociationStorageMode::MemoriesOnly,
        min_cluster_size: 3,
        ..Default::default()
    }
}

async fn populated_store(count: usize) -> Arc<InMemoryStorage> {
    let storage = Arc::new(InMemoryStorage::new());
    for i in 0..count {
        let age = (i % 40) as f64 * 3.0;
        let tags: Vec<&str> = match i % 4 {
            0 => vec!["project", "notes"],
            1 => vec!["reference"],
            2 => vec!["personal"],
            _ => vec!["temporary"],
        };
        let m = aged_memory(
            &format!("workstream entry {i} covering sync health and planning detail"),
            &tags,
            age,
        );
        storage.store(&m).await.unwrap();
    }
    storage
}

#[tokio::test]
async fn scenario_weekly_consolidation_report() {
    let dir = TempDir::new().unwrap();
    let storage = populated_store(300).await;
    let consolidator = Consolidator::new(
        storage.clone() as Arc<dyn MemoryStorage>,
        Arc::new(FallbackEmbedder::new(64)),
        pipeline_config(&dir),
        None,
        None,
    )
    .unwrap();

    let report = consolidator.consolidate(TimeHorizon::Weekly).await.unwrap();
    assert!(report.success, "{:?}", report.errors);
    assert_eq!(report.memories_processed, 300);
    // Forgetting is disabled on the weekly horizon
    assert_eq!(report.memories_archived, 0);
    assert!(report.duration_seconds >= 0.0);

    // Every input memory now carries a fresh relevance score and stamp
    let now = now_timestamp();
    let all = storage.get_all_memories(None, 0, None, None).await.unwrap();
    let organic: Vec<_> = all.iter().filter(|m| m.memory_type.is_none()).collect();
    assert_eq!(organic.len(), 300);
    for memory in organic {
        assert!(memory.metadata.contains_key("relevance_score"));
        let stamp = memory.metadata_f64("last_consolidated_at").unwrap();
        assert!((now - stamp).abs() < 120.0);
    }
}

#[tokio::test]
async fn scenario_rerun_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let storage = populated_store(60).await;
    let consolidator = Consolidator::new(
        storage.clone() as Arc<dyn MemoryStorage>,
        Arc::new(FallbackEmbedder::new(64)),
        pipeline_config(&dir),
        None,
        None,
    )
    .unwrap();

    let first = consolidator.consolidate(TimeHorizon::Weekly).await.unwrap();
    assert!(first.success);

    let second = consolidator.consolidate(TimeHorizon::Weekly).await.unwrap();
    assert!(second.success);
    // Nothing new is derived the second time around
    assert_eq!(second.associations_discovered, 0);
    assert_eq!(second.memories_compressed, 0);
}

#[tokio::test]
async fn scenario_monthly_forgetting_with_archive() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(InMemoryStorage::new());
    let config = ConsolidationConfig {
        relevance_threshold: 0.2,
        access_threshold_days: 30.0,
        ..pipeline_config(&dir)
    };
    let consolidator = Consolidator::new(
        storage.clone() as Arc<dyn MemoryStorage>,
        Arc::new(FallbackEmbedder::new(64)),
        config.clone(),
        None,
        None,
    )
    .unwrap();

    let doomed = aged_memory("stale throwaway scratchpad text", &["temporary"], 500.0);
    let keeper = aged_memory("canonical incident response runbook", &["critical"], 20.0);
    storage.store(&doomed).await.unwrap();
    storage.store(&keeper).await.unwrap();

    let report = consolidator.consolidate(TimeHorizon::Monthly).await.unwrap();
    assert!(report.success, "{:?}", report.errors);
    assert_eq!(report.memories_archived, 1);

    // Forgotten memory is gone from storage but recoverable from the archive
    assert!(storage.get_by_hash(&doomed.content_hash).await.unwrap().is_none());
    assert!(storage.get_by_hash(&keeper.content_hash).await.unwrap().is_some());
    let archived =
        keepsake_core::consolidation::ForgettingEngine::read_archive(&config.archive_path)
            .unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].content_hash, doomed.content_hash);
}

#[tokio::test]
async fn scenario_horizon_windows_select_candidates() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(InMemoryStorage::new());
    storage.store(&aged_memory("hours old", &[], 0.1)).await.unwrap();
    storage.store(&aged_memory("weeks old", &[], 20.0)).await.unwrap();
    storage.store(&aged_memory("months old", &[], 120.0)).await.unwrap();
    storage.store(&aged_memory("years old", &[], 400.0)).await.unwrap();

    let consolidator = Consolidator::new(
        storage.clone() as Arc<dyn MemoryStorage>,
        Arc::new(FallbackEmbedder::new(64)),
        ConsolidationConfig {
            forgetting_enabled: false,
            ..pipeline_config(&dir)
        },
        None,
        None,
    )
    .unwrap();

    // Daily sees only the last two days
    let report = consolidator.consolidate(TimeHorizon::Daily).await.unwrap();
    assert_eq!(report.memories_processed, 1);

    // Quarterly sees memories at least 90 days old
    let report = consolidator.consolidate(TimeHorizon::Quarterly).await.unwrap();
    assert_eq!(report.memories_processed, 2);

    // Yearly sees memories at least 365 days old
    let report = consolidator.consolidate(TimeHorizon::Yearly).await.unwrap();
    assert_eq!(report.memories_processed, 1);

    // Weekly sees everything
    let report = consolidator.consolidate(TimeHorizon::Weekly).await.unwrap();
    assert_eq!(report.memories_processed, 4);
}

#[tokio::test]
async fn scenario_consolidation_pauses_hybrid_sync() {
    let dir = TempDir::new().unwrap();
    let t = TestHybrid::new().await;

    let m = aged_memory("paused during consolidation", &[], 1.0);
    t.hybrid.store(&m).await.unwrap();

    let consolidator = Consolidator::new(
        t.hybrid.clone() as Arc<dyn MemoryStorage>,
        Arc::new(FallbackEmbedder::new(64)),
        pipeline_config(&dir),
        None,
        Some(t.hybrid.clone()),
    )
    .unwrap();

    let service = t.hybrid.sync_service().unwrap();
    assert!(!service.is_paused());
    let report = consolidator.consolidate(TimeHorizon::Weekly).await.unwrap();
    assert!(report.success, "{:?}", report.errors);
    // Resumed on exit even though it paused during the run
    assert!(!service.is_paused());

    t.hybrid.close().await;
}
