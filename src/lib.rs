// Fractal Memory — durable per-agent long-term memory with semantic retrieval.
//
// atoms/  — pure types, constants, error enum
// engine/ — embedding, memory table, fractal store, IVF index, ranker, facade

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult};
pub use atoms::types::{IndexSummary, MemoryItem, MemoryRecord, MemoryStats, Metadata, SearchHit, UpsertOutcome};
pub use engine::config::{EmbeddingMode, MemoryConfig};
pub use engine::embedding::{Embedder, EmbeddingBackend};
pub use engine::fractal::{flush_all, FlushGuard, FractalNode, FractalStore};
pub use engine::ivf::IvfIndex;
pub use engine::retrieval::{MemoryEngine, SearchOptions};
pub use engine::side_effects::{SideEffect, SideEffectSink};
