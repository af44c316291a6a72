//! SQLite storage layer.
//!
//! Owns the database file and every persistent row. Uses separate
//! reader/writer connections behind mutexes so the store is `Send + Sync`
//! and services can share an `Arc<Store>`. Write-ahead journaling is
//! mandatory: crash safety plus reader/writer concurrency. Foreign-key
//! cascades clean up embeddings and links when an owner row is deleted.

pub mod migrations;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, Transaction};

use crate::error::{MemoryError, Result};

/// Row counts reported by the health endpoint
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct StoreCounts {
    pub memories: i64,
    pub entities: i64,
    pub relationships: i64,
    pub episodes: i64,
    pub patterns: i64,
    pub reflections: i64,
    pub documents: i64,
}

/// Storage handle: one serialized writer, one multiplexed reader.
pub struct Store {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Apply PRAGMAs shared by both connections.
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open or create the database at `path`, run migrations, verify schema
    /// integrity. A migration failure here is fatal to the caller.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
            // Memory contents are private to the user
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
            }
        }

        let writer = Connection::open(path)?;
        Self::configure_connection(&writer)?;

        migrations::apply_migrations(&writer)
            .map_err(|e| MemoryError::MigrationFailure(e.to_string()))?;

        let effective = migrations::effective_version(&writer)
            .map_err(|e| MemoryError::MigrationFailure(e.to_string()))?;
        let latest = migrations::MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
        if effective != latest {
            return Err(MemoryError::MigrationFailure(format!(
                "schema at v{} after migrating, expected v{}",
                effective, latest
            )));
        }

        let reader = Connection::open(path)?;
        Self::configure_connection(&reader)?;

        tracing::info!(path = %path.display(), version = effective, "store opened");

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            path: path.to_path_buf(),
        })
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Effective schema version (recorded max, capped by column integrity).
    pub fn schema_version(&self) -> Result<u32> {
        self.with_read(|conn| {
            migrations::effective_version(conn).map_err(MemoryError::Storage)
        })
    }

    /// Run a read-only closure on the reader connection.
    pub fn with_read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.reader.lock().map_err(|_| MemoryError::lock("reader"))?;
        f(&conn)
    }

    /// Run a closure on the writer connection outside a transaction. Each
    /// statement is still atomic on its own.
    pub fn with_write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.writer.lock().map_err(|_| MemoryError::lock("writer"))?;
        f(&conn)
    }

    /// Run a closure inside one write transaction. Commits on `Ok`, rolls
    /// back on `Err`. This is the unit the `batch` tool composes.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.writer.lock().map_err(|_| MemoryError::lock("writer"))?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Quick liveness probe for health checks.
    pub fn ping(&self) -> Result<()> {
        self.with_read(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }

    /// Row counts across the main tables.
    pub fn counts(&self) -> Result<StoreCounts> {
        self.with_read(|conn| {
            let count = |sql: &str| -> Result<i64> {
                Ok(conn.query_row(sql, [], |row| row.get(0))?)
            };
            Ok(StoreCounts {
                memories: count("SELECT COUNT(*) FROM memories WHERE invalidated_at IS NULL")?,
                entities: count("SELECT COUNT(*) FROM entities WHERE deleted_at IS NULL")?,
                relationships: count("SELECT COUNT(*) FROM relationships WHERE invalid_at IS NULL")?,
                episodes: count("SELECT COUNT(*) FROM episodes")?,
                patterns: count("SELECT COUNT(*) FROM patterns WHERE is_active = 1")?,
                reflections: count("SELECT COUNT(*) FROM reflections")?,
                documents: count("SELECT COUNT(*) FROM documents")?,
            })
        })
    }

    /// Checkpoint the WAL. Best effort: an in-use checkpoint is not an
    /// error. Handles are released on drop.
    pub fn close(&self) -> Result<()> {
        if let Ok(conn) = self.writer.lock() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
        Ok(())
    }
}
