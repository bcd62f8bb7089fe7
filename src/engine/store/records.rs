use super::{fingerprint, MemoryStore};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{MemoryRecord, Metadata, UpsertOutcome};
use crate::engine::embedding::f32_vec_to_bytes;
use crate::engine::embedding::vector::bytes_to_f32_vec;
use log::warn;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

const RECORD_COLUMNS: &str = "id, agent_id, ts, text, meta, vec, fingerprint, freq";

/// SQLite caps bound parameters per statement; stay well below it.
const IDS_PER_QUERY: usize = 500;

/// A row about to be written. The embedding is already computed.
#[derive(Debug, Clone, Copy)]
pub struct NewRecord<'a> {
    pub text: &'a str,
    pub metadata: &'a Metadata,
    pub ts: f64,
    pub embedding: &'a [f32],
}

impl MemoryRecord {
    /// Map a row with columns (RECORD_COLUMNS) → MemoryRecord.
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let id: i64 = row.get(0)?;
        let meta_json: String = row.get(4)?;
        let metadata = serde_json::from_str::<Metadata>(&meta_json).unwrap_or_else(|e| {
            warn!("[memory] Record {} has unreadable metadata: {}", id, e);
            Metadata::new()
        });
        let blob: Vec<u8> = row.get(5)?;
        let freq: i64 = row.get::<_, Option<i64>>(7)?.unwrap_or(1);
        Ok(MemoryRecord {
            id,
            agent_id: row.get(1)?,
            created_at: row.get(2)?,
            text: row.get(3)?,
            metadata,
            embedding: bytes_to_f32_vec(&blob),
            fingerprint: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
            frequency: freq.max(1) as u32,
        })
    }
}

impl MemoryStore {
    // ── Writes ─────────────────────────────────────────────────────────

    /// Bump timestamp + frequency of an existing equivalent record, if any.
    /// Lets callers skip embedding work for repeats.
    pub fn touch_duplicate(&self, agent_id: &str, text: &str, ts: f64) -> EngineResult<Option<UpsertOutcome>> {
        let conn = self.conn.lock();
        let fp = fingerprint(text);
        let row = conn
            .query_row(
                "UPDATE memories SET ts = ?1, freq = COALESCE(freq, 1) + 1
                 WHERE agent_id = ?2 AND fingerprint = ?3
                 RETURNING id, freq",
                params![ts, agent_id, fp],
                |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(id, freq)| UpsertOutcome { id, inserted: false, frequency: freq as u32 }))
    }

    /// Insert a new record, or bump the existing one with the same fingerprint.
    /// Committed before returning.
    pub fn upsert(&self, agent_id: &str, record: NewRecord<'_>) -> EngineResult<UpsertOutcome> {
        let conn = self.conn.lock();
        upsert_on(&conn, agent_id, record)
    }

    /// Upsert many records under one transaction (one durability commit).
    pub fn upsert_batch(&self, agent_id: &str, records: &[NewRecord<'_>]) -> EngineResult<Vec<UpsertOutcome>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            outcomes.push(upsert_on(&tx, agent_id, *record)?);
        }
        tx.commit()?;
        Ok(outcomes)
    }

    // ── Reads ──────────────────────────────────────────────────────────

    /// Every record for an agent, in insertion order.
    pub fn fetch_all(&self, agent_id: &str) -> EngineResult<Vec<MemoryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM memories WHERE agent_id = ?1 ORDER BY id",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![agent_id], MemoryRecord::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(records)
    }

    /// Records with an id above `after_id`, in insertion order.
    pub fn fetch_after(&self, agent_id: &str, after_id: i64) -> EngineResult<Vec<MemoryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM memories WHERE agent_id = ?1 AND id > ?2 ORDER BY id",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![agent_id, after_id], MemoryRecord::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(records)
    }

    /// The `limit` most recently touched records, newest first.
    pub fn fetch_recent(&self, agent_id: &str, limit: usize) -> EngineResult<Vec<MemoryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM memories WHERE agent_id = ?1 ORDER BY ts DESC, id DESC LIMIT ?2",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![agent_id, limit as i64], MemoryRecord::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(records)
    }

    /// Records with the given ids that belong to `agent_id`, in insertion order.
    /// Unknown ids are silently skipped.
    pub fn fetch_by_ids(&self, agent_id: &str, ids: &[i64]) -> EngineResult<Vec<MemoryRecord>> {
        let mut unique: Vec<i64> = ids.to_vec();
        unique.sort_unstable();
        unique.dedup();

        let conn = self.conn.lock();
        let mut out = Vec::with_capacity(unique.len());
        for chunk in unique.chunks(IDS_PER_QUERY) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM memories WHERE agent_id = ? AND id IN ({}) ORDER BY id",
                RECORD_COLUMNS, placeholders
            ))?;
            let bind = std::iter::once(rusqlite::types::Value::from(agent_id.to_string()))
                .chain(chunk.iter().map(|id| rusqlite::types::Value::from(*id)));
            let rows = stmt
                .query_map(params_from_iter(bind), MemoryRecord::from_row)?
                .filter_map(|r| r.ok());
            out.extend(rows);
        }
        Ok(out)
    }

    pub fn get(&self, id: i64) -> EngineResult<Option<MemoryRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("SELECT {} FROM memories WHERE id = ?1", RECORD_COLUMNS),
                params![id],
                MemoryRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn count(&self, agent_id: &str) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE agent_id = ?1",
            params![agent_id],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn total_frequency(&self, agent_id: &str) -> EngineResult<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COALESCE(SUM(COALESCE(freq, 1)), 0) FROM memories WHERE agent_id = ?1",
            params![agent_id],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    /// Distinct agent ids that own at least one record.
    pub fn agents(&self) -> EngineResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT agent_id FROM memories ORDER BY agent_id")?;
        let agents = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(agents)
    }
}

fn upsert_on(conn: &Connection, agent_id: &str, record: NewRecord<'_>) -> EngineResult<UpsertOutcome> {
    let fp = fingerprint(record.text);
    let meta = serde_json::to_string(record.metadata)?;
    let blob = f32_vec_to_bytes(record.embedding);
    let (id, freq): (i64, i64) = conn.query_row(
        "INSERT INTO memories (agent_id, ts, text, meta, vec, fingerprint, freq)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)
         ON CONFLICT(agent_id, fingerprint)
         DO UPDATE SET ts = excluded.ts, freq = COALESCE(memories.freq, 1) + 1
         RETURNING id, freq",
        params![agent_id, record.ts, record.text, meta, blob, fp],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    Ok(UpsertOutcome { id, inserted: freq == 1, frequency: freq as u32 })
}
