//! Database migrations.
//!
//! Forward-only ladder. Each migration is an idempotent unit: tables,
//! indices, and triggers use `IF NOT EXISTS`; column additions go through
//! [`add_column_if_missing`] because SQLite's `ALTER TABLE` cannot express
//! that itself. Idempotence matters because the integrity check may roll the
//! effective version back and re-apply a suffix of the ladder on a live
//! database.
//!
//! Selected migrations carry an *expected-columns fingerprint*. On open, the
//! effective schema version is the lesser of the recorded max version and
//! the highest version whose fingerprint still verifies; a divergence means
//! a past migration silently failed and everything from that point re-runs.

use rusqlite::Connection;
use std::collections::HashSet;

/// A column added by a migration to a pre-existing table
#[derive(Debug, Clone, Copy)]
pub struct ColumnAdd {
    pub table: &'static str,
    pub column: &'static str,
    pub definition: &'static str,
}

/// Columns a migration is expected to have left behind
#[derive(Debug, Clone, Copy)]
pub struct ExpectedColumns {
    pub table: &'static str,
    pub columns: &'static [&'static str],
}

/// A database migration
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// Idempotent SQL batch, run after `columns`
    pub sql: &'static str,
    /// Columns added to existing tables, applied only when missing
    pub columns: &'static [ColumnAdd],
    /// Integrity fingerprint, empty for uncheckable migrations
    pub expected: &'static [ExpectedColumns],
}

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Base schema: entities, memories, links, version tracking",
        sql: MIGRATION_V1,
        columns: &[],
        expected: &[],
    },
    Migration {
        version: 2,
        description: "Bi-temporal relationships",
        sql: MIGRATION_V2,
        columns: &[],
        expected: &[],
    },
    Migration {
        version: 3,
        description: "Entity aliases",
        sql: MIGRATION_V3,
        columns: &[],
        expected: &[],
    },
    Migration {
        version: 4,
        description: "Embedding vector tables",
        sql: MIGRATION_V4,
        columns: &[],
        expected: &[],
    },
    Migration {
        version: 5,
        description: "Memory verification lifecycle",
        sql: "",
        columns: &[
            ColumnAdd {
                table: "memories",
                column: "verification_status",
                definition: "TEXT NOT NULL DEFAULT 'pending'",
            },
            ColumnAdd {
                table: "memories",
                column: "verified_at",
                definition: "TEXT",
            },
        ],
        expected: &[ExpectedColumns {
            table: "memories",
            columns: &["verification_status", "verified_at"],
        }],
    },
    Migration {
        version: 6,
        description: "Session turn buffer",
        sql: MIGRATION_V6,
        columns: &[],
        expected: &[],
    },
    Migration {
        version: 7,
        description: "Episodes with memory and entity links",
        sql: MIGRATION_V7,
        columns: &[],
        expected: &[],
    },
    Migration {
        version: 8,
        description: "Memory invalidation and merge lineage",
        sql: "",
        columns: &[
            ColumnAdd {
                table: "memories",
                column: "invalidated_at",
                definition: "TEXT",
            },
            ColumnAdd {
                table: "memories",
                column: "superseded_by",
                definition: "INTEGER",
            },
            ColumnAdd {
                table: "memories",
                column: "aggregated_from",
                definition: "TEXT NOT NULL DEFAULT '[]'",
            },
        ],
        expected: &[ExpectedColumns {
            table: "memories",
            columns: &["invalidated_at", "superseded_by", "aggregated_from"],
        }],
    },
    Migration {
        version: 9,
        description: "FTS5 keyword index over memory content",
        sql: MIGRATION_V9,
        columns: &[],
        expected: &[],
    },
    Migration {
        version: 10,
        description: "Derived patterns",
        sql: MIGRATION_V10,
        columns: &[],
        expected: &[ExpectedColumns {
            table: "patterns",
            columns: &[
                "id",
                "pattern_type",
                "name",
                "confidence",
                "first_observed_at",
                "last_confirmed_at",
                "aggregation_count",
                "is_active",
            ],
        }],
    },
    Migration {
        version: 11,
        description: "Filed documents with entity links",
        sql: MIGRATION_V11,
        columns: &[],
        expected: &[],
    },
    Migration {
        version: 12,
        description: "Reflections with slow decay",
        sql: MIGRATION_V12,
        columns: &[],
        expected: &[ExpectedColumns {
            table: "reflections",
            columns: &[
                "id",
                "reflection_type",
                "content",
                "importance",
                "confidence",
                "decay_rate",
                "aggregation_count",
            ],
        }],
    },
    Migration {
        version: 13,
        description: "Relationship direction",
        sql: "",
        columns: &[ColumnAdd {
            table: "relationships",
            column: "direction",
            definition: "TEXT NOT NULL DEFAULT 'outbound'",
        }],
        expected: &[ExpectedColumns {
            table: "relationships",
            columns: &["direction"],
        }],
    },
    Migration {
        version: 14,
        description: "Entity soft delete",
        sql: "",
        columns: &[ColumnAdd {
            table: "entities",
            column: "deleted_at",
            definition: "TEXT",
        }],
        expected: &[ExpectedColumns {
            table: "entities",
            columns: &["deleted_at"],
        }],
    },
];

/// V1: base schema
const MIGRATION_V1: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    type TEXT NOT NULL DEFAULT 'concept',
    description TEXT,
    importance REAL NOT NULL DEFAULT 0.5,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- (type, normalized name) is the canonical identity of an entity
CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_type_name ON entities(type, lower(name));
CREATE INDEX IF NOT EXISTS idx_entities_importance ON entities(importance);

CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY,
    content TEXT NOT NULL,
    type TEXT NOT NULL DEFAULT 'fact',
    importance REAL NOT NULL DEFAULT 0.5,
    confidence REAL NOT NULL DEFAULT 0.8,
    content_hash TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_accessed TEXT NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(type);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);
CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories(importance);

CREATE TABLE IF NOT EXISTS memory_entities (
    memory_id INTEGER NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    relationship TEXT NOT NULL DEFAULT 'about',
    UNIQUE(memory_id, entity_id, relationship)
);

CREATE INDEX IF NOT EXISTS idx_memory_entities_entity ON memory_entities(entity_id);
CREATE INDEX IF NOT EXISTS idx_memory_entities_memory ON memory_entities(memory_id);

CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);
"#;

/// V2: typed, directed, bi-temporal edges between entities
const MIGRATION_V2: &str = r#"
CREATE TABLE IF NOT EXISTS relationships (
    id INTEGER PRIMARY KEY,
    source_entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    target_entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    relationship_type TEXT NOT NULL,
    strength REAL NOT NULL DEFAULT 0.5,
    valid_at TEXT NOT NULL,
    invalid_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- At most one currently-valid edge per (source, target, type)
CREATE UNIQUE INDEX IF NOT EXISTS idx_relationships_current
    ON relationships(source_entity_id, target_entity_id, relationship_type)
    WHERE invalid_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships(source_entity_id);
CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_entity_id);
"#;

/// V3: aliases map many-to-one onto entities
const MIGRATION_V3: &str = r#"
CREATE TABLE IF NOT EXISTS entity_aliases (
    entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    alias TEXT NOT NULL,
    UNIQUE(alias)
);

CREATE INDEX IF NOT EXISTS idx_entity_aliases_entity ON entity_aliases(entity_id);
"#;

/// V4: embedding payloads, one table per embedded kind, cascade on owner delete
const MIGRATION_V4: &str = r#"
CREATE TABLE IF NOT EXISTS memory_embeddings (
    memory_id INTEGER PRIMARY KEY REFERENCES memories(id) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    model TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entity_embeddings (
    entity_id INTEGER PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    model TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// V6: per-session turn buffer
const MIGRATION_V6: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    summarized INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
CREATE INDEX IF NOT EXISTS idx_messages_summarized ON messages(summarized);
"#;

/// V7: session episodes
const MIGRATION_V7: &str = r#"
CREATE TABLE IF NOT EXISTS episodes (
    id INTEGER PRIMARY KEY,
    session_id TEXT NOT NULL UNIQUE,
    narrative TEXT NOT NULL,
    started_at TEXT,
    ended_at TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS episode_memories (
    episode_id INTEGER NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
    memory_id INTEGER NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    UNIQUE(episode_id, memory_id)
);

CREATE TABLE IF NOT EXISTS episode_entities (
    episode_id INTEGER NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
    entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    UNIQUE(episode_id, entity_id)
);

CREATE INDEX IF NOT EXISTS idx_episode_memories_memory ON episode_memories(memory_id);
"#;

/// V9: FTS5 keyword index, porter stemming, kept in sync by triggers
const MIGRATION_V9: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content,
    content='memories',
    content_rowid='id',
    tokenize='porter ascii'
);

INSERT INTO memories_fts(memories_fts) VALUES('rebuild');

CREATE TRIGGER IF NOT EXISTS memories_fts_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, content) VALUES (NEW.id, NEW.content);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content) VALUES ('delete', OLD.id, OLD.content);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_au AFTER UPDATE OF content ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content) VALUES ('delete', OLD.id, OLD.content);
    INSERT INTO memories_fts(rowid, content) VALUES (NEW.id, NEW.content);
END;
"#;

/// V10: patterns detected by consolidation
const MIGRATION_V10: &str = r#"
CREATE TABLE IF NOT EXISTS patterns (
    id INTEGER PRIMARY KEY,
    pattern_type TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    confidence REAL NOT NULL DEFAULT 0.5,
    entity_id INTEGER REFERENCES entities(id) ON DELETE SET NULL,
    first_observed_at TEXT NOT NULL,
    last_confirmed_at TEXT NOT NULL,
    aggregation_count INTEGER NOT NULL DEFAULT 1,
    is_active INTEGER NOT NULL DEFAULT 1,
    UNIQUE(pattern_type, name)
);

CREATE INDEX IF NOT EXISTS idx_patterns_active ON patterns(is_active);
"#;

/// V11: source-of-truth documents
const MIGRATION_V11: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY,
    source_type TEXT NOT NULL,
    filename TEXT,
    content TEXT NOT NULL,
    summary TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entity_documents (
    entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    UNIQUE(entity_id, document_id)
);

CREATE INDEX IF NOT EXISTS idx_entity_documents_document ON entity_documents(document_id);
"#;

/// V12: reflections decay far slower than memories and survive consolidation
const MIGRATION_V12: &str = r#"
CREATE TABLE IF NOT EXISTS reflections (
    id INTEGER PRIMARY KEY,
    reflection_type TEXT NOT NULL DEFAULT 'observation',
    content TEXT NOT NULL,
    about_entity_id INTEGER REFERENCES entities(id) ON DELETE SET NULL,
    importance REAL NOT NULL DEFAULT 0.7,
    confidence REAL NOT NULL DEFAULT 0.8,
    decay_rate REAL NOT NULL DEFAULT 0.999,
    aggregation_count INTEGER NOT NULL DEFAULT 1,
    first_observed_at TEXT NOT NULL,
    last_confirmed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reflections_entity ON reflections(about_entity_id);
"#;

/// Columns currently present on a table. Empty set when the table is missing.
pub fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<HashSet<String>>>()?;
    Ok(columns)
}

/// Max version in `schema_migrations`, 0 when the table does not exist yet.
pub fn recorded_version(conn: &Connection) -> u32 {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

/// Effective schema version: the lesser of the recorded max version and the
/// version just below the first migration whose expected columns are missing.
/// Guards against migrations that silently failed on a previously live
/// database.
pub fn effective_version(conn: &Connection) -> rusqlite::Result<u32> {
    let recorded = recorded_version(conn);

    for migration in MIGRATIONS {
        if migration.version > recorded {
            break;
        }
        for expected in migration.expected {
            let present = table_columns(conn, expected.table)?;
            if let Some(missing) = expected
                .columns
                .iter()
                .find(|column| !present.contains(**column))
            {
                tracing::warn!(
                    version = migration.version,
                    table = expected.table,
                    column = *missing,
                    "schema integrity check failed; rolling effective version back"
                );
                return Ok(migration.version - 1);
            }
        }
    }

    Ok(recorded)
}

fn add_column_if_missing(conn: &Connection, add: &ColumnAdd) -> rusqlite::Result<()> {
    if table_columns(conn, add.table)?.contains(add.column) {
        return Ok(());
    }
    conn.execute_batch(&format!(
        "ALTER TABLE {} ADD COLUMN {} {};",
        add.table, add.column, add.definition
    ))
}

/// Apply every migration above the effective version. Returns the number of
/// migrations applied.
pub fn apply_migrations(conn: &Connection) -> rusqlite::Result<u32> {
    let effective = effective_version(conn)?;
    let recorded = recorded_version(conn);
    if effective < recorded {
        tracing::warn!(
            recorded,
            effective,
            "re-running migrations from divergence point"
        );
    }

    let mut applied = 0;
    for migration in MIGRATIONS {
        if migration.version <= effective {
            continue;
        }
        tracing::info!(
            "Applying migration v{}: {}",
            migration.version,
            migration.description
        );

        for column in migration.columns {
            add_column_if_missing(conn, column)?;
        }
        if !migration.sql.trim().is_empty() {
            conn.execute_batch(migration.sql)?;
        }
        conn.execute(
            "INSERT OR REPLACE INTO schema_migrations (version, applied_at)
             VALUES (?1, datetime('now'))",
            [migration.version],
        )?;
        applied += 1;
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    #[test]
    fn versions_are_dense_and_ordered() {
        for (i, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(migration.version, i as u32 + 1);
        }
        assert_eq!(MIGRATIONS.last().unwrap().version, 14);
    }

    #[test]
    fn apply_from_scratch() {
        let conn = fresh_conn();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied, 14);
        assert_eq!(recorded_version(&conn), 14);
        assert_eq!(effective_version(&conn).unwrap(), 14);
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = fresh_conn();
        apply_migrations(&conn).unwrap();
        let columns_before = table_columns(&conn, "memories").unwrap();

        // Force a full re-run by pretending nothing was recorded
        conn.execute("DELETE FROM schema_migrations", []).unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied, 14);

        assert_eq!(table_columns(&conn, "memories").unwrap(), columns_before);
        assert_eq!(recorded_version(&conn), 14);
    }

    #[test]
    fn integrity_check_detects_dropped_column() {
        let conn = fresh_conn();
        apply_migrations(&conn).unwrap();

        conn.execute_batch("ALTER TABLE memories DROP COLUMN verification_status;")
            .unwrap();

        // v5 expected verification_status, so the ladder rolls back to 4
        assert_eq!(effective_version(&conn).unwrap(), 4);

        // Re-applying restores the column and the recorded version
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied, 10);
        assert!(table_columns(&conn, "memories")
            .unwrap()
            .contains("verification_status"));
        assert_eq!(effective_version(&conn).unwrap(), 14);
    }

    #[test]
    fn integrity_check_reports_first_divergence() {
        let conn = fresh_conn();
        apply_migrations(&conn).unwrap();

        conn.execute_batch(
            "ALTER TABLE memories DROP COLUMN invalidated_at;
             ALTER TABLE entities DROP COLUMN deleted_at;",
        )
        .unwrap();

        // v8 diverges before v14
        assert_eq!(effective_version(&conn).unwrap(), 7);
    }

    #[test]
    fn relationship_current_uniqueness_enforced() {
        let conn = fresh_conn();
        apply_migrations(&conn).unwrap();

        conn.execute_batch(
            "INSERT INTO entities (name, type, created_at, updated_at)
             VALUES ('A', 'person', datetime('now'), datetime('now')),
                    ('B', 'organization', datetime('now'), datetime('now'));",
        )
        .unwrap();

        let insert = "INSERT INTO relationships
             (source_entity_id, target_entity_id, relationship_type, strength,
              valid_at, invalid_at, created_at, updated_at)
             VALUES (1, 2, 'works_at', 0.5, datetime('now'), ?1, datetime('now'), datetime('now'))";

        conn.execute(insert, [Option::<String>::None]).unwrap();
        // Second currently-valid edge for the same triple must fail
        assert!(conn.execute(insert, [Option::<String>::None]).is_err());
        // A closed edge for the same triple is fine
        conn.execute(insert, [Some("2024-01-01T00:00:00Z".to_string())])
            .unwrap();
    }

    #[test]
    fn fts_triggers_follow_memory_rows() {
        let conn = fresh_conn();
        apply_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO memories (content, type, content_hash, created_at, updated_at, last_accessed)
             VALUES ('the quick brown fox', 'fact', 'h1', datetime('now'), datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories_fts WHERE memories_fts MATCH 'fox'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        conn.execute("DELETE FROM memories WHERE id = 1", []).unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories_fts WHERE memories_fts MATCH 'fox'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 0);
    }
}
