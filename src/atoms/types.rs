// ── Fractal Memory Atoms: Shared Types ─────────────────────────────────────
// Plain data passed between the store, the index, the ranker and callers.
// No I/O here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Caller-defined structured data attached to a memory.
/// Opaque to the engine; returned unmodified with hits, key order preserved.
pub type Metadata = Map<String, Value>;

/// One durable memory row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: i64,
    pub agent_id: String,
    /// Seconds since the Unix epoch (fractional).
    pub created_at: f64,
    pub text: String,
    pub metadata: Metadata,
    /// L2-normalized; width may differ between rows written by different backends.
    pub embedding: Vec<f32>,
    pub fingerprint: String,
    pub frequency: u32,
}

/// A text + metadata pair handed to `add_batch`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryItem {
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Explicit timestamp; `None` means "now".
    #[serde(default)]
    pub ts: Option<f64>,
}

impl MemoryItem {
    pub fn new(text: impl Into<String>, metadata: Metadata) -> Self {
        Self { text: text.into(), metadata, ts: None }
    }
}

/// Result of one upsert against the memory table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: i64,
    /// False when an equivalent record already existed and was bumped.
    pub inserted: bool,
    pub frequency: u32,
}

/// Ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: i64,
    pub text: String,
    pub metadata: Metadata,
    pub timestamp: f64,
    pub score: f64,
}

/// Summary of the live ANN index for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub dim: usize,
    pub clusters: usize,
    pub count: usize,
    pub built_at: f64,
    pub bucket_sizes: Vec<usize>,
}

/// Per-agent memory statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub agent_id: String,
    pub records: usize,
    /// Sum of frequency over all records (total accepted writes).
    pub total_frequency: u64,
    pub index: Option<IndexSummary>,
}
