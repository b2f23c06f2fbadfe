//! Database migrations
//!
//! Schema migration definitions for the embedded primary backend.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: memories, embeddings, FTS5",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Association graph table",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Access log for decay boosts",
        up: MIGRATION_V3_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_hash TEXT NOT NULL UNIQUE,
    content TEXT NOT NULL,
    memory_type TEXT,
    tags TEXT NOT NULL DEFAULT '',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at REAL NOT NULL,
    created_at_iso TEXT NOT NULL,
    updated_at REAL NOT NULL,
    updated_at_iso TEXT NOT NULL,
    deleted_at REAL
);

CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);
CREATE INDEX IF NOT EXISTS idx_memories_deleted ON memories(deleted_at);
CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(memory_type);

-- Embeddings storage (binary blob, little-endian f32)
CREATE TABLE IF NOT EXISTS memory_embeddings (
    memory_hash TEXT PRIMARY KEY REFERENCES memories(content_hash) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    model TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- FTS5 virtual table for lexical and hybrid search
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content_hash,
    content,
    tags,
    content='memories',
    content_rowid='id',
    tokenize='porter ascii'
);

-- Triggers to keep FTS in sync
CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, content_hash, content, tags)
    VALUES (NEW.id, NEW.content_hash, NEW.content, NEW.tags);
END;

CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content_hash, content, tags)
    VALUES ('delete', OLD.id, OLD.content_hash, OLD.content, OLD.tags);
END;

CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content_hash, content, tags)
    VALUES ('delete', OLD.id, OLD.content_hash, OLD.content, OLD.tags);
    INSERT INTO memories_fts(rowid, content_hash, content, tags)
    VALUES (NEW.id, NEW.content_hash, NEW.content, NEW.tags);
END;

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: Association graph table.
/// Edges are keyed by the two content hashes; traversal is always by hash,
/// never by row pointer, so soft-deleted endpoints degrade gracefully.
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS associations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_hash TEXT NOT NULL,
    target_hash TEXT NOT NULL,
    similarity REAL NOT NULL,
    connection_types TEXT NOT NULL,  -- comma-delimited, closed vocabulary
    discovery_method TEXT,
    discovery_date TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at REAL NOT NULL,
    UNIQUE (source_hash, target_hash)
);

CREATE INDEX IF NOT EXISTS idx_assoc_source ON associations(source_hash);
CREATE INDEX IF NOT EXISTS idx_assoc_target ON associations(target_hash);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// V3: Access log powering consolidation access boosts
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS memory_access_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_hash TEXT NOT NULL,
    access_type TEXT NOT NULL,  -- 'search_hit', 'exact_hit', 'api'
    accessed_at REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_access_log_hash ON memory_access_log(memory_hash);
CREATE INDEX IF NOT EXISTS idx_access_log_time ON memory_access_log(accessed_at);

UPDATE schema_version SET version = 3, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );
            // execute_batch handles multi-statement SQL including triggers
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_and_are_idempotent() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied as usize, MIGRATIONS.len());
        assert_eq!(get_current_version(&conn).unwrap(), 3);
        // Second run applies nothing
        assert_eq!(apply_migrations(&conn).unwrap(), 0);
    }

    #[test]
    fn test_versions_strictly_increasing() {
        let mut last = 0;
        for m in MIGRATIONS {
            assert!(m.version > last);
            last = m.version;
        }
    }
}
