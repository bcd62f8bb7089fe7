// Fractal Memory Engine — Retrieval Facade
//
// The add / search / reindex surface used by the agent runtime and by
// ingestion tools. Wires the Memory Table, Embedding Provider, IVF index,
// Fractal Store and Ranker together.
//
// Guarantees:
//   • add_* commits before returning; a following search sees the write.
//   • Storage failures propagate. Embedding, index and width problems are
//     recovered here and never reach the caller.
//   • Index maintenance after a commit goes through the SideEffectSink.

use crate::atoms::constants::DEFAULT_INJECT_HEADER;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{IndexSummary, MemoryItem, MemoryRecord, MemoryStats, Metadata, SearchHit, UpsertOutcome};
use crate::engine::config::MemoryConfig;
use crate::engine::embedding::Embedder;
use crate::engine::fractal::{self, FractalStore};
use crate::engine::ivf::{self, IvfIndex};
use crate::engine::now_secs;
use crate::engine::paths;
use crate::engine::ranker::{self, RankParams};
use crate::engine::side_effects::{run_side_effect, LogSink, SideEffect, SideEffectSink};
use crate::engine::store::{MemoryStore, NewRecord};
use futures::StreamExt;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Per-call overrides for search. Unset fields fall back to `RankingConfig`
/// (and `IndexConfig::nprobe`). `min_score` has no config fallback in
/// `search_memory`; `inject_for_prompt` uses the configured floor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOptions {
    pub top_k: Option<usize>,
    pub decay_rate: Option<f64>,
    pub hybrid: Option<bool>,
    pub tfidf_weight: Option<f64>,
    pub fresh_boost: Option<f64>,
    pub min_score: Option<f64>,
    pub nprobe: Option<usize>,
}

impl SearchOptions {
    pub fn top_k(mut self, n: usize) -> Self {
        self.top_k = Some(n);
        self
    }

    pub fn decay(mut self, rate: f64) -> Self {
        self.decay_rate = Some(rate);
        self
    }

    pub fn hybrid(mut self, weight: f64) -> Self {
        self.hybrid = Some(true);
        self.tfidf_weight = Some(weight);
        self
    }

    pub fn fresh_boost(mut self, boost: f64) -> Self {
        self.fresh_boost = Some(boost);
        self
    }

    pub fn min_score(mut self, floor: f64) -> Self {
        self.min_score = Some(floor);
        self
    }

    pub fn nprobe(mut self, n: usize) -> Self {
        self.nprobe = Some(n);
        self
    }
}

pub struct MemoryEngine {
    config: MemoryConfig,
    root: PathBuf,
    store: MemoryStore,
    embedder: Embedder,
    sink: Arc<dyn SideEffectSink>,
}

impl MemoryEngine {
    /// Open the memory root named by `config` with the configured embedder.
    pub fn open(config: MemoryConfig) -> EngineResult<Self> {
        let embedder = Embedder::from_config(&config.embedding)?;
        Self::with_embedder(config, embedder)
    }

    pub fn with_embedder(config: MemoryConfig, embedder: Embedder) -> EngineResult<Self> {
        let root = paths::memory_root(&config);
        let store = MemoryStore::open(&paths::db_path(&root))?;
        info!(
            "[retrieval] Memory root {:?} (embedding={:?}, ivf={})",
            root, config.embedding.mode, config.index.enabled
        );
        Ok(MemoryEngine {
            config,
            root,
            store,
            embedder,
            sink: Arc::new(LogSink),
        })
    }

    /// Route side-effect failures somewhere other than the log.
    pub fn with_sink(mut self, sink: Arc<dyn SideEffectSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// The agent's shared Fractal Store.
    pub fn fractal(&self, agent_id: &str) -> EngineResult<Arc<FractalStore>> {
        FractalStore::for_agent(&self.root, agent_id, &self.config.store)
    }

    // ── Writes ─────────────────────────────────────────────────────────

    /// Store one memory and return its id. Equivalent text already stored for
    /// this agent is bumped instead of duplicated, and keeps its id.
    pub async fn add_memory(&self, agent_id: &str, text: &str, metadata: Metadata) -> EngineResult<i64> {
        let outcome = self.upsert_item(agent_id, MemoryItem::new(text, metadata)).await?;
        Ok(outcome.id)
    }

    /// `add_memory` with an explicit timestamp and the full outcome.
    pub async fn upsert_item(&self, agent_id: &str, item: MemoryItem) -> EngineResult<UpsertOutcome> {
        let ts = item.ts.unwrap_or_else(now_secs);
        // Repeats never pay for an embedding.
        if let Some(outcome) = self.store.touch_duplicate(agent_id, &item.text, ts)? {
            return Ok(outcome);
        }
        let vec = self.embedder.embed_one(&item.text).await;
        let outcome = self.store.upsert(
            agent_id,
            NewRecord { text: &item.text, metadata: &item.metadata, ts, embedding: &vec },
        )?;
        if outcome.inserted {
            self.after_commit(agent_id, &[(outcome.id, vec.as_slice())]).await;
        }
        Ok(outcome)
    }

    /// Embed all texts in one provider call, then upsert them under a single
    /// commit. Outcomes are in input order.
    pub async fn add_batch(&self, agent_id: &str, items: Vec<MemoryItem>) -> EngineResult<Vec<UpsertOutcome>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<String> = items.iter().map(|i| i.text.clone()).collect();
        let vecs = self.embedder.embed(&texts).await;
        self.commit_batch(agent_id, &items, &vecs).await
    }

    /// Bulk ingestion: batches are embedded concurrently by up to
    /// `store.ingest_workers` tasks, then committed one batch at a time in
    /// input order.
    pub async fn ingest(&self, agent_id: &str, batches: Vec<Vec<MemoryItem>>) -> EngineResult<Vec<UpsertOutcome>> {
        let workers = self.config.store.ingest_workers.max(1);
        let total: usize = batches.iter().map(Vec::len).sum();
        info!("[retrieval] Ingesting {} item(s) in {} batch(es) for '{}'", total, batches.len(), agent_id);

        let mut embedded = futures::stream::iter(batches)
            .map(|batch| async move {
                let texts: Vec<String> = batch.iter().map(|i| i.text.clone()).collect();
                let vecs = self.embedder.embed(&texts).await;
                (batch, vecs)
            })
            .buffered(workers);

        let mut outcomes = Vec::with_capacity(total);
        while let Some((batch, vecs)) = embedded.next().await {
            if batch.is_empty() {
                continue;
            }
            outcomes.extend(self.commit_batch(agent_id, &batch, &vecs).await?);
        }
        Ok(outcomes)
    }

    async fn commit_batch(&self, agent_id: &str, items: &[MemoryItem], vecs: &[Vec<f32>]) -> EngineResult<Vec<UpsertOutcome>> {
        let now = now_secs();
        let rows: Vec<NewRecord<'_>> = items
            .iter()
            .zip(vecs)
            .map(|(item, vec)| NewRecord {
                text: &item.text,
                metadata: &item.metadata,
                ts: item.ts.unwrap_or(now),
                embedding: vec,
            })
            .collect();
        let outcomes = self.store.upsert_batch(agent_id, &rows)?;

        let fresh: Vec<(i64, &[f32])> = outcomes
            .iter()
            .zip(vecs)
            .filter(|(o, _)| o.inserted)
            .map(|(o, v)| (o.id, v.as_slice()))
            .collect();
        info!(
            "[retrieval] Committed {} item(s) for '{}' ({} new)",
            outcomes.len(),
            agent_id,
            fresh.len()
        );
        if !fresh.is_empty() {
            self.after_commit(agent_id, &fresh).await;
        }
        Ok(outcomes)
    }

    /// Incremental index insert for new ids, then the auto-rebuild check.
    /// Nothing here can fail the write that preceded it.
    async fn after_commit(&self, agent_id: &str, fresh: &[(i64, &[f32])]) {
        if !self.config.index.enabled {
            return;
        }
        let effect = SideEffect::IndexInsert { first_id: fresh[0].0, count: fresh.len() };
        let Some(fractal) = run_side_effect(self.sink.as_ref(), agent_id, effect, || self.fractal(agent_id)) else {
            return;
        };
        if let Some(Some(n)) = run_side_effect(self.sink.as_ref(), agent_id, effect, || IvfIndex::append(&fractal, fresh)) {
            debug!("[ivf] Appended {} of {} id(s) for '{}'", n, fresh.len(), agent_id);
        }

        if let Err(e) = self.maybe_rebuild(agent_id, &fractal).await {
            self.sink.report(agent_id, SideEffect::AutoRebuild, &e);
        }
    }

    async fn maybe_rebuild(&self, agent_id: &str, fractal: &FractalStore) -> EngineResult<()> {
        let corpus = self.store.count(agent_id)?;
        if corpus < self.config.index.rebuild_threshold {
            return Ok(());
        }
        let current = IvfIndex::load(fractal).unwrap_or_else(|e| {
            warn!("[ivf] Stored index for '{}' unusable, rebuilding: {}", agent_id, e);
            None
        });
        if ivf::needs_rebuild(current.as_ref(), corpus, self.config.index.rebuild_threshold) {
            info!("[ivf] Auto-rebuild for '{}' at {} records", agent_id, corpus);
            self.reindex(agent_id, self.config.index.clusters, self.config.index.kmeans_iters).await?;
        }
        Ok(())
    }

    // ── Index administration ───────────────────────────────────────────

    /// Rebuild the agent's IVF index from every stored vector. Records
    /// committed while k-means runs are folded in before the swap. Returns
    /// `None` when the agent has no records.
    pub async fn reindex(&self, agent_id: &str, k: usize, iters: usize) -> EngineResult<Option<IndexSummary>> {
        let records = self.store.fetch_all(agent_id)?;
        if records.is_empty() {
            info!("[ivf] Nothing to index for '{}'", agent_id);
            return Ok(None);
        }
        let seed = self.config.index.seed;
        let k = k.max(1);
        let iters = iters.max(1);
        let built = tokio::task::spawn_blocking(move || IvfIndex::build(&records, k, iters, seed))
            .await
            .map_err(|e| EngineError::Other(format!("index build task failed: {}", e)))?;
        let Some(index) = built else {
            return Ok(None);
        };
        let snapshot = index.count;
        let fractal = self.fractal(agent_id)?;
        let index = index.install(&fractal, |after| {
            let late = self.store.fetch_after(agent_id, after)?;
            Ok(late.into_iter().map(|r| (r.id, r.embedding)).collect())
        })?;
        info!(
            "[ivf] Built index for '{}': {} vectors ({} during build), dim={}, K={}",
            agent_id,
            index.count,
            index.count - snapshot,
            index.dim,
            index.k
        );
        Ok(Some(index.summary()))
    }

    // ── Reads ──────────────────────────────────────────────────────────

    /// Ranked hits for `query`. Blank queries return no hits.
    pub async fn search_memory(&self, agent_id: &str, query: &str, opts: &SearchOptions) -> EngineResult<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let query_vec = self.embedder.embed_one(query).await;
        let params = self.rank_params(opts, opts.min_score);

        if let Some((records, dim)) = self.index_candidates(agent_id, &query_vec, opts)? {
            return Ok(ranker::rank(query, &query_vec, dim, records, &params));
        }

        let records = self.store.fetch_recent(agent_id, self.config.index.scan_cap)?;
        Ok(ranker::rank(query, &query_vec, query_vec.len(), records, &params))
    }

    /// Candidate records from the nearest IVF buckets, with the index width. `None`
    /// means: use the exact scan.
    fn index_candidates(
        &self,
        agent_id: &str,
        query_vec: &[f32],
        opts: &SearchOptions,
    ) -> EngineResult<Option<(Vec<MemoryRecord>, usize)>> {
        if !self.config.index.enabled {
            return Ok(None);
        }
        let index = match IvfIndex::load(&*self.fractal(agent_id)?) {
            Ok(Some(index)) => index,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("[ivf] Ignoring stored index for '{}': {}", agent_id, e);
                return Ok(None);
            }
        };
        let nprobe = opts.nprobe.unwrap_or(self.config.index.nprobe);
        let ids = index.candidates(query_vec, nprobe);
        if ids.is_empty() {
            return Ok(None);
        }
        let records = self.store.fetch_by_ids(agent_id, &ids)?;
        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some((records, index.dim)))
    }

    fn rank_params(&self, opts: &SearchOptions, min_score: Option<f64>) -> RankParams {
        let r = &self.config.ranking;
        RankParams {
            top_k: opts.top_k.unwrap_or(r.top_k),
            decay_rate: opts.decay_rate.unwrap_or(r.decay_rate).max(0.0),
            hybrid: opts.hybrid.unwrap_or(r.hybrid),
            tfidf_weight: opts.tfidf_weight.unwrap_or(r.tfidf_weight),
            fresh_boost: opts.fresh_boost.unwrap_or(r.fresh_boost).max(0.0),
            min_score,
            now: now_secs(),
        }
    }

    /// Hits at or above the score floor as a markdown block for a prompt:
    ///
    /// ```text
    /// ### Retrieved long-term memory:
    /// - (0.87) The project codename is Blue Fox.
    /// ```
    ///
    /// Empty string when nothing qualifies.
    pub async fn inject_for_prompt(
        &self,
        agent_id: &str,
        query: &str,
        opts: &SearchOptions,
        header: Option<&str>,
    ) -> EngineResult<String> {
        let floor = opts.min_score.unwrap_or(self.config.ranking.min_score);
        let opts = SearchOptions { min_score: Some(floor), ..opts.clone() };
        let hits = self.search_memory(agent_id, query, &opts).await?;
        if hits.is_empty() {
            return Ok(String::new());
        }
        let lines: Vec<String> = hits.iter().map(|h| format!("- ({:.2}) {}", h.score, h.text)).collect();
        Ok(format!("{}:\n{}\n", header.unwrap_or(DEFAULT_INJECT_HEADER), lines.join("\n")))
    }

    pub fn stats(&self, agent_id: &str) -> EngineResult<MemoryStats> {
        let index = match IvfIndex::load(&*self.fractal(agent_id)?) {
            Ok(index) => index.map(|i| i.summary()),
            Err(e) => {
                warn!("[ivf] Stored index for '{}' is unreadable: {}", agent_id, e);
                None
            }
        };
        Ok(MemoryStats {
            agent_id: agent_id.to_string(),
            records: self.store.count(agent_id)?,
            total_frequency: self.store.total_frequency(agent_id)?,
            index,
        })
    }

    pub fn agents(&self) -> EngineResult<Vec<String>> {
        self.store.agents()
    }

    /// Label outline of the agent's fractal tree.
    pub fn outline(&self, agent_id: &str) -> EngineResult<String> {
        Ok(self.fractal(agent_id)?.outline())
    }

    /// Persist every live Fractal Store.
    pub fn flush(&self) -> usize {
        fractal::flush_all()
    }
}
