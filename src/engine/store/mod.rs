// Fractal Memory Engine — Memory Table
// Durable per-agent vector records in SQLite via rusqlite.
// One database per memory root; every agent shares the single `memories`
// table, partitioned by agent_id.
//
// Module layout:
//   schema  — CREATE TABLE / idempotent migrations
//   records — upsert, batch upsert, fetch_all / fetch_recent / fetch_by_ids

use crate::atoms::error::{EngineError, EngineResult};
use log::info;
use parking_lot::Mutex;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

mod records;
mod schema;

pub use records::NewRecord;

/// Thread-safe database wrapper.
pub struct MemoryStore {
    /// The SQLite connection, protected by a Mutex.
    /// `pub` for integration tests that poke at raw rows.
    pub conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// Open (or create) the memory database and initialize tables.
    /// Any failure here is a StorageUnavailable for the caller.
    pub fn open(path: &Path) -> EngineResult<Self> {
        info!("[memory] Opening memory table at {:?}", path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::storage(parent, e))?;
        }
        let conn = Connection::open(path).map_err(|e| EngineError::storage(path, e))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        // Concurrent writers from other threads/processes wait instead of failing fast.
        conn.busy_timeout(std::time::Duration::from_secs(5)).ok();

        schema::run_migrations(&conn).map_err(|e| EngineError::storage(path, e))?;

        Ok(MemoryStore {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database; nothing survives the process.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::run_migrations(&conn)?;
        Ok(MemoryStore { conn: Mutex::new(conn), path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Case-fold, trim and collapse internal whitespace.
pub fn normalize_text(text: &str) -> String {
    text.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stable hex SHA-256 of the normalized text; the dedup key within an agent.
pub fn fingerprint(text: &str) -> String {
    format!("{:x}", Sha256::digest(normalize_text(text).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_case_and_whitespace() {
        assert_eq!(fingerprint("Hello  World"), fingerprint("  hello world\n"));
        assert_eq!(fingerprint("a\tb"), fingerprint("A B"));
        assert_ne!(fingerprint("hello world"), fingerprint("hello, world"));
        assert_eq!(fingerprint("x").len(), 64);
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/memory.sqlite3");
        let store = MemoryStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), Some(path.as_path()));
    }

    #[test]
    fn test_open_on_a_file_parent_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a dir").unwrap();
        let err = MemoryStore::open(&blocker.join("memory.sqlite3")).err().unwrap();
        assert!(matches!(err, EngineError::Storage { .. }), "got {:?}", err);
    }
}
