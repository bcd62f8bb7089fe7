// ── Fractal Memory Atoms: Constants ────────────────────────────────────────
// All named defaults for the crate live here. Config structs read them in
// their `Default` impls; nothing else should hard-code these numbers.

// ── Embedding ──────────────────────────────────────────────────────────────
pub const DEFAULT_EMBED_BASE_URL: &str = "http://127.0.0.1:11434";
pub const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_EMBED_DIMS: usize = 768;
pub const DEFAULT_EMBED_TIMEOUT_SECS: u64 = 6;
/// Readiness check runs once per process with a tighter budget than real calls.
pub const DEFAULT_EMBED_READY_TIMEOUT_SECS: u64 = 2;
/// Hashed embedding only looks at the first N tokens of a text.
pub const HASH_EMBED_MAX_TOKENS: usize = 512;

// ── IVF index ──────────────────────────────────────────────────────────────
pub const DEFAULT_IVF_CLUSTERS: usize = 64;
pub const DEFAULT_IVF_NPROBE: usize = 4;
pub const DEFAULT_KMEANS_ITERS: usize = 3;
pub const DEFAULT_REBUILD_THRESHOLD: usize = 512;
/// Exact-scan fallback reads at most this many of the newest records.
pub const DEFAULT_SCAN_CAP: usize = 5000;
pub const DEFAULT_KMEANS_SEED: u64 = 0x5EED_F4AC;

/// Fractal path prefix under which IVF indexes are stored.
pub const IVF_TREE_ROOT: [&str; 2] = ["retrieval", "ivf"];

// ── Ranking ────────────────────────────────────────────────────────────────
pub const DEFAULT_TOP_K: usize = 8;
pub const DEFAULT_TFIDF_WEIGHT: f64 = 0.3;
pub const DEFAULT_MIN_SCORE: f64 = 0.25;
pub const DEFAULT_INJECT_HEADER: &str = "### Retrieved long-term memory";

// ── Fractal store batching ─────────────────────────────────────────────────
pub const DEFAULT_FLUSH_BATCH: usize = 10;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 2000;
pub const FRACTAL_FILE_NAME: &str = "fmm.json";
/// Key under which a node's payload sequence is serialized.
pub const FRACTAL_DATA_KEY: &str = "__data__";

// ── Memory table ───────────────────────────────────────────────────────────
pub const DB_FILE_NAME: &str = "memory.sqlite3";
pub const DEFAULT_INGEST_WORKERS: usize = 4;

// ── Environment overrides ──────────────────────────────────────────────────
pub const ENV_HOME: &str = "FMEM_HOME";
pub const ENV_PREFIX: &str = "FMEM_";
