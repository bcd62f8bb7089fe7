// Database schema and migrations for the memory table.
// Called once by MemoryStore::open() after WAL is enabled.
// Adding a column: append an idempotent ALTER TABLE … ADD COLUMN at the end of
// run_migrations() (errors are swallowed) — never edit existing SQL.

use super::fingerprint;
use crate::atoms::error::EngineResult;
use log::info;
use rusqlite::{params, Connection, OptionalExtension};

pub(crate) fn run_migrations(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS memories (
            id INTEGER PRIMARY KEY,
            agent_id TEXT NOT NULL,
            ts REAL NOT NULL,
            text TEXT NOT NULL,
            meta TEXT NOT NULL DEFAULT '{}',
            vec BLOB NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_mem_agent ON memories(agent_id);
        CREATE INDEX IF NOT EXISTS idx_mem_ts ON memories(ts);
        ",
    )?;

    // ── Dedup columns (absent in stores created before fingerprinting) ──
    if !has_column(conn, "memories", "fingerprint") {
        info!("[memory] Migrating: adding memories.fingerprint");
        conn.execute_batch("ALTER TABLE memories ADD COLUMN fingerprint TEXT;").ok();
    }
    if !has_column(conn, "memories", "freq") {
        info!("[memory] Migrating: adding memories.freq");
        conn.execute_batch("ALTER TABLE memories ADD COLUMN freq INTEGER NOT NULL DEFAULT 1;").ok();
    }

    ensure_unique_fingerprints(conn)?;

    Ok(())
}

/// Make `idx_mem_fp` a UNIQUE index. Stores written by older tools carry a
/// plain index of the same name, fingerprints in another format (or none),
/// and possibly repeated rows. Those rows are re-fingerprinted and merged
/// into the oldest row of each group (freq summed, latest ts kept) before
/// the index is rebuilt. A no-op once the unique index exists.
fn ensure_unique_fingerprints(conn: &Connection) -> EngineResult<()> {
    let unique: Option<i64> = conn
        .query_row(
            "SELECT \"unique\" FROM pragma_index_list('memories') WHERE name = 'idx_mem_fp'",
            [],
            |r| r.get(0),
        )
        .optional()?;
    if unique == Some(1) {
        return Ok(());
    }

    let tx = conn.unchecked_transaction()?;
    let stale: Vec<(i64, String)> = {
        let mut stmt = tx.prepare(
            "SELECT id, text FROM memories WHERE fingerprint IS NULL OR length(fingerprint) != 64",
        )?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    for (id, text) in &stale {
        tx.execute("UPDATE memories SET fingerprint = ?1 WHERE id = ?2", params![fingerprint(text), id])?;
    }

    tx.execute_batch(
        "UPDATE memories SET
             freq = (SELECT SUM(COALESCE(d.freq, 1)) FROM memories d
                     WHERE d.agent_id = memories.agent_id AND d.fingerprint = memories.fingerprint),
             ts = (SELECT MAX(d.ts) FROM memories d
                   WHERE d.agent_id = memories.agent_id AND d.fingerprint = memories.fingerprint)
         WHERE id IN (SELECT MIN(id) FROM memories GROUP BY agent_id, fingerprint HAVING COUNT(*) > 1);",
    )?;
    let merged = tx.execute(
        "DELETE FROM memories WHERE id NOT IN (SELECT MIN(id) FROM memories GROUP BY agent_id, fingerprint)",
        [],
    )?;
    tx.execute_batch(
        "DROP INDEX IF EXISTS idx_mem_fp;
         CREATE UNIQUE INDEX idx_mem_fp ON memories(agent_id, fingerprint);",
    )?;
    tx.commit()?;

    if !stale.is_empty() || merged > 0 {
        info!(
            "[memory] Migrating: re-fingerprinted {} row(s), merged {} duplicate(s)",
            stale.len(),
            merged
        );
    }
    Ok(())
}

pub(crate) fn has_column(conn: &Connection, table: &str, column: &str) -> bool {
    conn.prepare(&format!("SELECT name FROM pragma_table_info('{}') WHERE name = ?1", table))
        .and_then(|mut stmt| stmt.exists([column]))
        .unwrap_or(false)
}
