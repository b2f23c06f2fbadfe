//! Storage scenarios: store/recall/delete lifecycle, tag + time filtering,
//! oversize auto-split, and the unified search/delete surfaces.

use keepsake_e2e_tests::{aged_memory, memory, TestStore};
use keepsake_core::memory::now_timestamp;
use keepsake_core::{DeleteRequest, MemoryStorage, SearchMode, SearchRequest};

#[tokio::test]
async fn scenario_store_recall_delete_tombstone() {
    let store = TestStore::new();
    let storage = &store.storage;

    let m = memory("meeting notes", &["work", "meeting"]);
    let (ok, message) = storage.store(&m).await.unwrap();
    assert!(ok, "{message}");

    // Recall finds it with solid relevance
    let results = storage.retrieve("meeting", 5).await.unwrap();
    let hit = results
        .iter()
        .find(|r| r.memory.content_hash == m.content_hash)
        .expect("stored memory should be retrievable");
    assert!(hit.relevance_score > 0.4);

    // Delete tombstones it
    let (ok, _) = storage.delete(&m.content_hash).await.unwrap();
    assert!(ok);
    assert!(storage.get_by_hash(&m.content_hash).await.unwrap().is_none());
    assert!(storage.is_deleted(&m.content_hash).await.unwrap());

    // Anti-resurrection: a restore attempt is dropped while tombstoned
    let (ok, msg) = storage.store(&m).await.unwrap();
    assert!(!ok);
    assert!(msg.contains("tombstone"), "{msg}");

    // After purge, the hash is storable again
    storage.purge_deleted(0).await.unwrap();
    let (ok, _) = storage.store(&m).await.unwrap();
    assert!(ok);
}

#[tokio::test]
async fn scenario_tag_time_filter() {
    let store = TestStore::new();
    let storage = &store.storage;
    let now = now_timestamp();

    let m_old = aged_memory("old tagged entry", &["test", "old"], 2.0);
    let m_recent = memory("recent tagged entry", &["test", "recent"]);
    storage.store(&m_old).await.unwrap();
    storage.store(&m_recent).await.unwrap();

    let tags = vec!["test".to_string()];

    // Cutting one day back returns exactly the recent memory
    let hits = storage.search_by_tag(&tags, Some(now - 86_400.0)).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].content_hash, m_recent.content_hash);

    // time_start = 0 returns both; a future start returns none;
    // no filter equals the unfiltered call
    assert_eq!(storage.search_by_tag(&tags, Some(0.0)).await.unwrap().len(), 2);
    assert!(storage
        .search_by_tag(&tags, Some(now + 86_400.0))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(storage.search_by_tag(&tags, None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn scenario_oversize_content_auto_split() {
    let store = TestStore::with_config(|config| keepsake_core::config::SqliteConfig {
        max_content_length: Some(800),
        split_overlap: 50,
        ..config
    });
    let storage = &store.storage;

    // ~2k chars with paragraph breaks
    let sentence = "The storage growth review covered vector counts and sync health in depth. ";
    let content = format!(
        "{}\n\n{}\n\n{}",
        sentence.repeat(10).trim(),
        sentence.repeat(10).trim(),
        sentence.repeat(7).trim()
    );
    assert!(content.len() > 1600);

    let source = memory(&content, &["quarterly", "report"]);
    let (ok, message) = storage.store(&source).await.unwrap();
    assert!(ok, "{message}");
    assert!(message.contains("chunks"));

    let siblings = storage
        .search_by_tag(&["quarterly".to_string()], None)
        .await
        .unwrap();
    assert!(siblings.len() >= 2);

    let chunk_total = siblings[0].metadata_f64("chunk_total").unwrap() as usize;
    assert_eq!(chunk_total, siblings.len());
    for sibling in &siblings {
        assert!(sibling.content.chars().count() <= 800);
        // Sibling group is discoverable via the shared source hash
        assert_eq!(
            sibling.metadata.get("source_hash").and_then(|v| v.as_str()),
            Some(source.content_hash.as_str())
        );
        assert!(sibling.metadata.contains_key("chunk_index"));
    }
}

#[tokio::test]
async fn scenario_unified_search_modes() {
    let store = TestStore::new();
    let storage = &store.storage;

    storage.store(&memory("async runtime configuration notes", &["rust"])).await.unwrap();
    storage.store(&memory("weekend trip itinerary", &["travel"])).await.unwrap();

    // Exact mode matches only the full content string
    let response = storage
        .search_memories(&SearchRequest {
            query: Some("async runtime configuration notes".to_string()),
            mode: SearchMode::Exact,
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(response.total, 1);

    // Semantic mode with tag filter and debug counters
    let response = storage
        .search_memories(&SearchRequest {
            query: Some("runtime configuration".to_string()),
            tags: vec!["rust".to_string()],
            limit: 10,
            include_debug: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(response.error.is_none());
    let debug = response.debug.unwrap();
    assert_eq!(debug.post_filter_count, response.total);
    assert!(response
        .memories
        .iter()
        .all(|r| r.memory.tags.contains(&"rust".to_string())));

    // Hybrid mode fuses lexical and semantic
    let response = storage
        .search_memories(&SearchRequest {
            query: Some("trip itinerary".to_string()),
            mode: SearchMode::Hybrid,
            limit: 5,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(response.total >= 1);
    assert_eq!(response.memories[0].memory.content, "weekend trip itinerary");
}

#[tokio::test]
async fn scenario_unified_delete_safety() {
    let store = TestStore::new();
    let storage = &store.storage;

    storage.store(&memory("delete candidate one", &["x"])).await.unwrap();
    storage.store(&memory("delete candidate two", &["x"])).await.unwrap();
    storage.store(&memory("survivor", &["y"])).await.unwrap();

    // Empty filter refused
    let outcome = storage.delete_memories(&DeleteRequest::default()).await.unwrap();
    assert!(!outcome.success);

    // Dry run reports hashes without mutating
    let outcome = storage
        .delete_memories(&DeleteRequest {
            tags: vec!["x".to_string()],
            dry_run: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.deleted_count, 2);
    assert_eq!(storage.count_all_memories(None, None).await.unwrap(), 3);

    // Real run deletes exactly the tagged pair
    let outcome = storage
        .delete_memories(&DeleteRequest {
            tags: vec!["x".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.deleted_count, 2);
    assert_eq!(storage.count_all_memories(None, None).await.unwrap(), 1);
}

#[tokio::test]
async fn scenario_quality_boost_reranking() {
    let store = TestStore::new();
    let storage = &store.storage;

    let plain = memory("deployment checklist draft version", &[])
        .with_metadata("quality_score", 0.1);
    let refined = memory("deployment checklist reviewed version", &[])
        .with_metadata("quality_score", 0.95);
    storage.store(&plain).await.unwrap();
    storage.store(&refined).await.unwrap();

    // Pure quality ordering puts the refined memory first
    let results = storage
        .retrieve_with_quality_boost("deployment checklist", 2, 1.0)
        .await
        .unwrap();
    assert_eq!(results[0].memory.content_hash, refined.content_hash);
    let debug = results[0].debug_info.as_ref().unwrap();
    assert!(debug.contains_key("original_semantic_score"));

    // Weight zero equals the semantic ordering
    let semantic = storage.retrieve("deployment checklist", 2).await.unwrap();
    let boosted = storage
        .retrieve_with_quality_boost("deployment checklist", 2, 0.0)
        .await
        .unwrap();
    let hashes = |rs: &[keepsake_core::MemoryQueryResult]| {
        rs.iter().map(|r| r.memory.content_hash.clone()).collect::<Vec<_>>()
    };
    assert_eq!(hashes(&semantic), hashes(&boosted));
}

#[tokio::test]
async fn scenario_stats_and_tag_counts() {
    let store = TestStore::new();
    let storage = &store.storage;

    storage.store(&memory("first entry", &["alpha", "beta"])).await.unwrap();
    storage.store(&memory("second entry", &["alpha"])).await.unwrap();

    let stats = storage.get_stats().await.unwrap();
    assert_eq!(stats.total_memories, 2);
    assert_eq!(stats.unique_tags, 2);
    assert_eq!(stats.memories_this_week, 2);
    assert!(stats.size_bytes > 0);

    let counts = storage.get_all_tags_with_counts().await.unwrap();
    assert_eq!(counts[0].tag, "alpha");
    assert_eq!(counts[0].count, 2);
}
