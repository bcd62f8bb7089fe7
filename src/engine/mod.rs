// Fractal Memory Engine — stateful components
// Everything that touches disk, network or shared state lives under here;
// plain types and constants stay in crate::atoms.
//
// Leaf-to-root:
//   embedding/    — text → normalized vectors (remote backends + hashed floor)
//   fractal       — per-agent path-addressed tree with batched persistence
//   store/        — SQLite memory table with fingerprint upsert
//   ivf/          — k-means clustered ANN index kept inside the fractal tree
//   ranker        — cosine + TF-IDF + decay + freshness scoring
//   retrieval     — MemoryEngine facade (add / search / reindex)

pub mod config;
pub mod embedding;
pub mod fractal;
pub mod ivf;
pub mod paths;
pub mod ranker;
pub mod retrieval;
pub mod side_effects;
pub mod store;

/// Current wall-clock time as fractional Unix seconds.
pub(crate) fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
