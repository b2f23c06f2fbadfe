//! Integrity monitoring and recovery: startup checks, WAL checkpoint repair
//! with live connections, emergency export, and backup/restore round trips.

use keepsake_e2e_tests::{memory, TestStore};
use keepsake_core::config::{BackupConfig, IntegrityConfig};
use keepsake_core::{BackupService, IntegrityMonitor, MemoryStorage};

#[tokio::test]
async fn scenario_startup_and_periodic_checks_healthy() {
    let store = TestStore::new();
    for i in 0..10 {
        store
            .storage
            .store(&memory(&format!("integrity entry {i}"), &[]))
            .await
            .unwrap();
    }

    let monitor = IntegrityMonitor::new(&store.db_path, IntegrityConfig::default());
    let result = monitor.startup_check().await.unwrap();
    assert!(result.healthy);
    assert!(!result.repaired);
    assert!(!result.exported);

    let status = monitor.status();
    assert_eq!(status.total_checks, 1);
    assert_eq!(status.last_check_healthy, Some(true));
    assert_eq!(status.total_unrecoverable, 0);
}

#[tokio::test]
async fn scenario_wal_checkpoint_preserves_count() {
    let store = TestStore::new();
    for i in 0..25 {
        store
            .storage
            .store(&memory(&format!("wal resident entry {i}"), &[]))
            .await
            .unwrap();
    }

    // With the serving connections still open, the WAL carries recent pages.
    // The checkpoint must flush them without losing a row.
    let monitor = IntegrityMonitor::new(&store.db_path, IntegrityConfig::default());
    let (repaired, detail) = monitor.attempt_wal_repair().await.unwrap();
    assert!(repaired, "{detail}");

    assert_eq!(
        store.storage.count_all_memories(None, None).await.unwrap(),
        25
    );
    let (healthy, _) = monitor.check_integrity().await.unwrap();
    assert!(healthy);
}

#[tokio::test]
async fn scenario_emergency_export_captures_live_rows() {
    let store = TestStore::new();
    for i in 0..8 {
        store
            .storage
            .store(&memory(&format!("export entry {i}"), &["keep"]))
            .await
            .unwrap();
    }
    // A tombstone must not appear in the export
    let doomed = memory("deleted before export", &[]);
    store.storage.store(&doomed).await.unwrap();
    store.storage.delete(&doomed.content_hash).await.unwrap();

    let monitor = IntegrityMonitor::new(&store.db_path, IntegrityConfig::default());
    let export_path = store.temp_dir.path().join("emergency_export_test.json");
    let count = monitor.export_memories(&export_path).await.unwrap();
    assert_eq!(count, 8);

    let raw = std::fs::read_to_string(&export_path).unwrap();
    let rows: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
    assert_eq!(rows.len(), 8);
    assert!(rows.iter().all(|r| r["hash"] != doomed.content_hash));
}

#[tokio::test]
async fn scenario_backup_restore_round_trip() {
    let store = TestStore::new();
    for i in 0..5 {
        store
            .storage
            .store(&memory(&format!("snapshot entry {i}"), &[]))
            .await
            .unwrap();
    }

    let service = BackupService::new(
        &store.db_path,
        BackupConfig {
            enabled: true,
            interval: std::time::Duration::from_secs(3600),
            retention: 3,
            backup_dir: store.temp_dir.path().join("backups"),
        },
    );

    let info = service.create_backup().await.unwrap();
    assert!(info.size_bytes > 0);
    assert_eq!(service.list_backups().unwrap().len(), 1);

    // Write one more, then roll back to the snapshot
    store
        .storage
        .store(&memory("added after snapshot", &[]))
        .await
        .unwrap();
    assert_eq!(store.storage.count_all_memories(None, None).await.unwrap(), 6);
    drop(store.storage);

    service.restore_backup(&info.path).await.unwrap();

    // Reopen and verify the pre-snapshot state
    let conn = rusqlite_open(&store.db_path);
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM memories WHERE deleted_at IS NULL",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(count, 5);
}

fn rusqlite_open(path: &std::path::Path) -> rusqlite::Connection {
    rusqlite::Connection::open(path).unwrap()
}
