// Fractal Memory Engine — Configuration
//
// `MemoryConfig` is the single knob surface for the engine. It is loaded from
// an optional TOML file, then overridden by FMEM_* environment variables.
// Bad override values are logged and ignored so a typo never stops startup.

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ── Embedding ──────────────────────────────────────────────────────────

/// Which embedding backend(s) to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingMode {
    /// Remote service first, hashed embedding on any failure. A service found
    /// down by the startup readiness check is not retried for the process.
    #[default]
    Auto,
    /// Remote service on every call, with no readiness gate. Each failed call
    /// still degrades to hashed rather than failing.
    Remote,
    /// Deterministic hashed embedding only (offline, reproducible).
    Hash,
}

impl FromStr for EmbeddingMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "remote" | "ollama" | "openai" => Ok(Self::Remote),
            "hash" | "hashed" | "offline" => Ok(Self::Hash),
            other => Err(EngineError::Config(format!("unknown embedding mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub mode: EmbeddingMode,
    /// Base URL for the embedding API (Ollama or OpenAI-compatible).
    pub base_url: String,
    pub model: String,
    /// Output width of the hashed embedding; remote widths are whatever the model returns.
    pub dims: usize,
    /// Per-call connect+read timeout.
    pub timeout_secs: u64,
    pub ready_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            mode: EmbeddingMode::Auto,
            base_url: DEFAULT_EMBED_BASE_URL.into(),
            model: DEFAULT_EMBED_MODEL.into(),
            dims: DEFAULT_EMBED_DIMS,
            timeout_secs: DEFAULT_EMBED_TIMEOUT_SECS,
            ready_timeout_secs: DEFAULT_EMBED_READY_TIMEOUT_SECS,
        }
    }
}

// ── IVF index ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// When false, every search is an exact scan.
    pub enabled: bool,
    /// Cluster count K (capped at corpus size during build).
    pub clusters: usize,
    pub nprobe: usize,
    pub kmeans_iters: usize,
    /// Corpus size at which an index is built automatically.
    pub rebuild_threshold: usize,
    /// Exact-scan fallback only reads the newest `scan_cap` records.
    pub scan_cap: usize,
    /// k-means++ seed; fixed so rebuilds of the same corpus are reproducible.
    pub seed: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            clusters: DEFAULT_IVF_CLUSTERS,
            nprobe: DEFAULT_IVF_NPROBE,
            kmeans_iters: DEFAULT_KMEANS_ITERS,
            rebuild_threshold: DEFAULT_REBUILD_THRESHOLD,
            scan_cap: DEFAULT_SCAN_CAP,
            seed: DEFAULT_KMEANS_SEED,
        }
    }
}

// ── Ranking ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    pub top_k: usize,
    /// Per-day exponential decay rate; 0 disables.
    pub decay_rate: f64,
    /// Blend a TF-IDF lexical term into the cosine score.
    pub hybrid: bool,
    pub tfidf_weight: f64,
    /// Weight of the sigmoid freshness bonus; 0 disables.
    pub fresh_boost: f64,
    /// Floor applied by prompt injection.
    pub min_score: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            decay_rate: 0.0,
            hybrid: false,
            tfidf_weight: DEFAULT_TFIDF_WEIGHT,
            fresh_boost: 0.0,
            min_score: DEFAULT_MIN_SCORE,
        }
    }
}

// ── Store ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Memory root. `None` resolves via FMEM_HOME / the platform data dir.
    pub root: Option<PathBuf>,
    pub flush_batch: usize,
    pub flush_interval_ms: u64,
    pub ingest_workers: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: None,
            flush_batch: DEFAULT_FLUSH_BATCH,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            ingest_workers: DEFAULT_INGEST_WORKERS,
        }
    }
}

// ── Top level ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub ranking: RankingConfig,
    pub store: StoreConfig,
}

impl MemoryConfig {
    /// Load from an optional TOML file, then apply FMEM_* environment overrides.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    EngineError::Config(format!("cannot read {}: {}", p.display(), e))
                })?;
                let parsed: MemoryConfig = toml::from_str(&raw)?;
                info!("[config] Loaded {}", p.display());
                parsed
            }
            None => MemoryConfig::default(),
        };
        config.apply_overrides(std::env::vars());
        Ok(config.normalized())
    }

    /// Config for tests and offline tools: hashed embeddings rooted at `root`.
    pub fn offline(root: impl Into<PathBuf>, dims: usize) -> Self {
        let mut config = MemoryConfig::default();
        config.embedding.mode = EmbeddingMode::Hash;
        config.embedding.dims = dims;
        config.store.root = Some(root.into());
        config.normalized()
    }

    /// Apply `FMEM_*` overrides from any key/value source.
    pub fn apply_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, raw) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else { continue };
            match name {
                "HOME" => self.store.root = Some(PathBuf::from(raw)),
                "EMBED_MODE" => set_parsed(&key, &raw, &mut self.embedding.mode),
                "EMBED_URL" => self.embedding.base_url = raw,
                "EMBED_MODEL" => self.embedding.model = raw,
                "EMBED_DIM" => set_parsed(&key, &raw, &mut self.embedding.dims),
                "EMBED_TIMEOUT" => set_parsed(&key, &raw, &mut self.embedding.timeout_secs),
                "IVF_ENABLED" => set_flag(&key, &raw, &mut self.index.enabled),
                "IVF_K" => set_parsed(&key, &raw, &mut self.index.clusters),
                "IVF_NPROBE" => set_parsed(&key, &raw, &mut self.index.nprobe),
                "KMEANS_ITERS" => set_parsed(&key, &raw, &mut self.index.kmeans_iters),
                "REINDEX_THRESHOLD" => set_parsed(&key, &raw, &mut self.index.rebuild_threshold),
                "SCAN_MAX" => set_parsed(&key, &raw, &mut self.index.scan_cap),
                "TOP_K" => set_parsed(&key, &raw, &mut self.ranking.top_k),
                "DECAY" => set_parsed(&key, &raw, &mut self.ranking.decay_rate),
                "HYBRID" => set_flag(&key, &raw, &mut self.ranking.hybrid),
                "TFIDF_WEIGHT" => set_parsed(&key, &raw, &mut self.ranking.tfidf_weight),
                "FRESH_BOOST" => set_parsed(&key, &raw, &mut self.ranking.fresh_boost),
                "MIN_SCORE" => set_parsed(&key, &raw, &mut self.ranking.min_score),
                "FLUSH_BATCH" => set_parsed(&key, &raw, &mut self.store.flush_batch),
                "FLUSH_MS" => set_parsed(&key, &raw, &mut self.store.flush_interval_ms),
                "INGEST_WORKERS" => set_parsed(&key, &raw, &mut self.store.ingest_workers),
                _ => {}
            }
        }
    }

    /// Clamp counts that must be at least 1 and rates that must be non-negative.
    pub fn normalized(mut self) -> Self {
        self.embedding.dims = self.embedding.dims.max(1);
        self.embedding.timeout_secs = self.embedding.timeout_secs.max(1);
        self.embedding.ready_timeout_secs = self.embedding.ready_timeout_secs.max(1);
        self.index.clusters = self.index.clusters.max(1);
        self.index.nprobe = self.index.nprobe.max(1);
        self.index.kmeans_iters = self.index.kmeans_iters.max(1);
        self.index.scan_cap = self.index.scan_cap.max(1);
        self.ranking.decay_rate = self.ranking.decay_rate.max(0.0);
        self.ranking.fresh_boost = self.ranking.fresh_boost.max(0.0);
        self.store.flush_batch = self.store.flush_batch.max(1);
        self.store.ingest_workers = self.store.ingest_workers.max(1);
        self
    }
}

fn set_parsed<T: FromStr>(key: &str, raw: &str, slot: &mut T) {
    match raw.trim().parse::<T>() {
        Ok(v) => *slot = v,
        Err(_) => warn!("[config] Ignoring {}={:?} (unparseable)", key, raw),
    }
}

fn set_flag(key: &str, raw: &str, slot: &mut bool) {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => *slot = true,
        "0" | "false" | "no" | "off" => *slot = false,
        _ => warn!("[config] Ignoring {}={:?} (expected a boolean)", key, raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let c = MemoryConfig::default();
        assert_eq!(c.index.clusters, 64);
        assert_eq!(c.index.nprobe, 4);
        assert_eq!(c.index.kmeans_iters, 3);
        assert_eq!(c.index.rebuild_threshold, 512);
        assert_eq!(c.store.flush_batch, 10);
        assert_eq!(c.store.flush_interval_ms, 2000);
        assert_eq!(c.embedding.mode, EmbeddingMode::Auto);
    }

    #[test]
    fn test_env_overrides_apply_and_bad_values_are_ignored() {
        let mut c = MemoryConfig::default();
        c.apply_overrides(vars(&[
            ("FMEM_IVF_K", "16"),
            ("FMEM_EMBED_MODE", "hash"),
            ("FMEM_HYBRID", "yes"),
            ("FMEM_IVF_NPROBE", "many"),
            ("UNRELATED", "1"),
        ]));
        assert_eq!(c.index.clusters, 16);
        assert_eq!(c.embedding.mode, EmbeddingMode::Hash);
        assert!(c.ranking.hybrid);
        assert_eq!(c.index.nprobe, 4, "unparseable override must leave the default");
    }

    #[test]
    fn test_toml_sections_are_partial() {
        let raw = "[index]\nclusters = 8\n\n[ranking]\nfresh_boost = 0.5\n";
        let c: MemoryConfig = toml::from_str(raw).unwrap();
        assert_eq!(c.index.clusters, 8);
        assert_eq!(c.index.nprobe, 4);
        assert!((c.ranking.fresh_boost - 0.5).abs() < 1e-9);
        assert_eq!(c.store.flush_batch, 10);
    }

    #[test]
    fn test_normalized_clamps_zero_counts() {
        let mut c = MemoryConfig::default();
        c.index.clusters = 0;
        c.store.flush_batch = 0;
        c.ranking.decay_rate = -1.0;
        let c = c.normalized();
        assert_eq!(c.index.clusters, 1);
        assert_eq!(c.store.flush_batch, 1);
        assert_eq!(c.ranking.decay_rate, 0.0);
    }

    #[test]
    fn test_embedding_mode_parse() {
        assert_eq!("Ollama".parse::<EmbeddingMode>().unwrap(), EmbeddingMode::Remote);
        assert_eq!("".parse::<EmbeddingMode>().unwrap(), EmbeddingMode::Auto);
        assert!("quantum".parse::<EmbeddingMode>().is_err());
    }
}
