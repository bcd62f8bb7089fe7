// Fractal Memory Engine — IVF (inverted file) ANN index
//
// Coarse quantization over an agent's memory vectors: K centroids from
// k-means plus one id list per centroid. Queries probe the `nprobe` nearest
// buckets and score only their members exactly.
//
// The index is stored as the single datum of the fractal node
//   retrieval/ivf/dim{D}/K{K}
// and is replaced wholesale by a rebuild. Between rebuilds, new records are
// appended to their nearest bucket in place; ids at or below `built_through`
// were covered by the build and are never appended twice.

pub mod kmeans;

use crate::atoms::constants::IVF_TREE_ROOT;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{IndexSummary, MemoryRecord};
use crate::engine::embedding::vector::{align_dim, dot, nearest_by_dot};
use crate::engine::fractal::{FractalNode, FractalStore};
use crate::engine::now_secs;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvfIndex {
    pub dim: usize,
    #[serde(rename = "K")]
    pub k: usize,
    /// Unix seconds of the build.
    #[serde(rename = "ts")]
    pub built_at: f64,
    /// Vectors indexed at build time plus incremental inserts since.
    pub count: usize,
    /// Highest record id the build covered. Incremental inserts of ids at or
    /// below it are already in a bucket and are skipped.
    #[serde(default)]
    pub built_through: i64,
    pub centroids: Vec<Vec<f32>>,
    pub buckets: BTreeMap<usize, Vec<i64>>,
}

impl IvfIndex {
    /// Cluster `records` into at most `k` buckets. Every vector is aligned to
    /// the width of the newest record first. `None` for an empty corpus.
    pub fn build(records: &[MemoryRecord], k: usize, iters: usize, seed: u64) -> Option<IvfIndex> {
        let dim = records.iter().max_by_key(|r| r.id)?.embedding.len();
        if dim == 0 {
            return None;
        }
        let vectors: Vec<Vec<f32>> = records.iter().map(|r| align_dim(&r.embedding, dim)).collect();
        let centroids = kmeans::kmeans(&vectors, k, iters, seed);
        if centroids.is_empty() {
            return None;
        }

        let mut buckets: BTreeMap<usize, Vec<i64>> = (0..centroids.len()).map(|j| (j, Vec::new())).collect();
        for (record, v) in records.iter().zip(&vectors) {
            let j = nearest_by_dot(v, &centroids).unwrap_or(0);
            buckets.entry(j).or_default().push(record.id);
        }

        Some(IvfIndex {
            dim,
            k: centroids.len(),
            built_at: now_secs(),
            count: records.len(),
            built_through: records.iter().map(|r| r.id).max().unwrap_or(0),
            centroids,
            buckets,
        })
    }

    /// Reject structures that would make bucket search meaningless.
    pub fn validate(&self) -> EngineResult<()> {
        if self.dim == 0 || self.k == 0 {
            return Err(EngineError::MalformedIndex(format!("dim={} K={}", self.dim, self.k)));
        }
        if self.centroids.len() != self.k {
            return Err(EngineError::MalformedIndex(format!(
                "K={} but {} centroids",
                self.k,
                self.centroids.len()
            )));
        }
        if let Some(bad) = self.centroids.iter().position(|c| c.len() != self.dim) {
            return Err(EngineError::MalformedIndex(format!(
                "centroid {} has width {}, expected {}",
                bad,
                self.centroids[bad].len(),
                self.dim
            )));
        }
        if let Some(key) = self.buckets.keys().find(|j| **j >= self.k) {
            return Err(EngineError::MalformedIndex(format!("bucket {} out of range for K={}", key, self.k)));
        }
        Ok(())
    }

    /// Bucket whose centroid has the largest dot product with `v`.
    pub fn nearest_bucket(&self, v: &[f32]) -> usize {
        nearest_by_dot(&align_dim(v, self.dim), &self.centroids).unwrap_or(0)
    }

    /// Append `id` to its nearest bucket. Centroids are left untouched.
    pub fn insert(&mut self, id: i64, v: &[f32]) -> usize {
        let j = self.nearest_bucket(v);
        self.buckets.entry(j).or_default().push(id);
        self.count += 1;
        j
    }

    /// Ids from the `nprobe` buckets nearest to `query`, nearest bucket first.
    pub fn candidates(&self, query: &[f32], nprobe: usize) -> Vec<i64> {
        let q = align_dim(query, self.dim);
        let mut order: Vec<(usize, f64)> = self.centroids.iter().map(|c| dot(&q, c)).enumerate().collect();
        order.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        order
            .iter()
            .take(nprobe.max(1))
            .filter_map(|(j, _)| self.buckets.get(j))
            .flat_map(|ids| ids.iter().copied())
            .collect()
    }

    pub fn bucket_sizes(&self) -> Vec<usize> {
        (0..self.k).map(|j| self.buckets.get(&j).map_or(0, |b| b.len())).collect()
    }

    pub fn summary(&self) -> IndexSummary {
        IndexSummary {
            dim: self.dim,
            clusters: self.k,
            count: self.count,
            built_at: self.built_at,
            bucket_sizes: self.bucket_sizes(),
        }
    }

    // ── Fractal persistence ────────────────────────────────────────────

    /// The active index for the agent: the most recently built one across all
    /// widths, highest K on ties. `Ok(None)` when nothing has been built.
    pub fn load(store: &FractalStore) -> EngineResult<Option<IvfIndex>> {
        let Some(root) = store.subtree(&IVF_TREE_ROOT) else {
            return Ok(None);
        };
        let Some((dim_label, k_label)) = active_leaf(&root) else {
            return Ok(None);
        };
        let leaf = root
            .get(&[dim_label.as_str(), k_label.as_str()])
            .ok_or_else(|| EngineError::MalformedIndex(format!("{}/{} vanished", dim_label, k_label)))?;
        parse_leaf(leaf, &dim_label, &k_label).map(Some)
    }

    /// Store as the active index for its width, dropping indexes of other K
    /// at the same width, and write the tree through.
    pub fn save(&self, store: &FractalStore) -> EngineResult<()> {
        self.clone().install(store, |_| Ok(Vec::new())).map(drop)
    }

    /// `save` for a freshly built index. `late(built_through)` returns the
    /// (id, vector) of every record committed after the build snapshot; they
    /// are inserted under the same tree lock that replaces the stored index,
    /// so a write racing with the rebuild ends up in exactly one bucket.
    pub fn install<F>(mut self, store: &FractalStore, late: F) -> EngineResult<IvfIndex>
    where
        F: FnOnce(i64) -> EngineResult<Vec<(i64, Vec<f32>)>>,
    {
        let dim_label = format!("dim{}", self.dim);
        let k_label = format!("K{}", self.k);
        let mut outcome: EngineResult<usize> = Ok(0);
        store.update(|tree| {
            let late = match late(self.built_through) {
                Ok(late) => late,
                Err(e) => {
                    outcome = Err(e);
                    return false;
                }
            };
            for (id, v) in &late {
                self.insert(*id, v);
                self.built_through = self.built_through.max(*id);
            }
            let value = match serde_json::to_value(&self) {
                Ok(value) => value,
                Err(e) => {
                    outcome = Err(e.into());
                    return false;
                }
            };
            let dim_node = tree.get_or_create(&[IVF_TREE_ROOT[0], IVF_TREE_ROOT[1], dim_label.as_str()]);
            let dropped = dim_node.remove_children(Some(k_label.as_str()));
            dim_node.get_or_create(&[k_label.as_str()]).data = vec![value];
            outcome = Ok(dropped);
            true
        })?;
        let dropped = outcome?;
        if dropped > 0 {
            info!("[ivf] Replaced {} older index(es) at {}", dropped, dim_label);
        }
        store.persist()?;
        Ok(self)
    }

    /// Incremental insert of committed records into the active index, as one
    /// read-modify-write under the tree lock. Only the centroids are decoded;
    /// bucket lists and `count` are edited in the stored JSON. Returns how
    /// many ids were appended, or `None` when no index exists.
    pub fn append(store: &FractalStore, items: &[(i64, &[f32])]) -> EngineResult<Option<usize>> {
        let mut outcome: EngineResult<Option<usize>> = Ok(None);
        store.update(|tree| {
            let Some(root) = tree.get_mut(&IVF_TREE_ROOT) else {
                return false;
            };
            let Some((dim_label, k_label)) = active_leaf(root) else {
                return false;
            };
            let Some(raw) = root
                .get_mut(&[dim_label.as_str(), k_label.as_str()])
                .and_then(|leaf| leaf.data.last_mut())
            else {
                return false;
            };
            match append_in_place(raw, items) {
                Ok(n) => {
                    outcome = Ok(Some(n));
                    n > 0
                }
                Err(e) => {
                    outcome = Err(EngineError::MalformedIndex(format!("{}/{}: {}", dim_label, k_label, e)));
                    false
                }
            }
        })?;
        outcome
    }
}

fn append_in_place(raw: &mut Value, items: &[(i64, &[f32])]) -> Result<usize, String> {
    let dim = raw.get("dim").and_then(Value::as_u64).filter(|d| *d > 0).ok_or("missing dim")? as usize;
    let k = raw.get("K").and_then(Value::as_u64).filter(|k| *k > 0).ok_or("missing K")? as usize;
    let centroids = raw.get("centroids").ok_or("missing centroids")?;
    let centroids = Vec::<Vec<f32>>::deserialize(centroids).map_err(|e| e.to_string())?;
    if centroids.len() != k || centroids.iter().any(|c| c.len() != dim) {
        return Err(format!("centroids do not match dim={} K={}", dim, k));
    }
    let through = raw.get("built_through").and_then(Value::as_i64).unwrap_or(0);
    let assigned: Vec<(i64, usize)> = items
        .iter()
        .filter(|(id, _)| *id > through)
        .map(|(id, v)| (*id, nearest_by_dot(&align_dim(v, dim), &centroids).unwrap_or(0)))
        .collect();
    if assigned.is_empty() {
        return Ok(0);
    }

    let obj = raw.as_object_mut().ok_or("index is not an object")?;
    let buckets = obj
        .entry("buckets")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or("buckets is not an object")?;
    if buckets.values().any(|b| !b.is_array()) {
        return Err("bucket is not a list".to_string());
    }
    for (id, j) in &assigned {
        if let Value::Array(ids) = buckets.entry(j.to_string()).or_insert_with(|| Value::Array(Vec::new())) {
            ids.push(Value::from(*id));
        }
    }
    let count = obj.get("count").and_then(Value::as_u64).unwrap_or(0);
    obj.insert("count".to_string(), Value::from(count + assigned.len() as u64));
    Ok(assigned.len())
}

/// Auto-rebuild rule: the corpus has reached `threshold` and there is either
/// no index or one that covers less than half of it.
pub fn needs_rebuild(index: Option<&IvfIndex>, corpus: usize, threshold: usize) -> bool {
    if corpus == 0 || corpus < threshold {
        return false;
    }
    match index {
        None => true,
        Some(idx) => idx.count < corpus / 2,
    }
}

/// (dim label, K label) of the active index under `retrieval/ivf`.
fn active_leaf(root: &FractalNode) -> Option<(String, String)> {
    let mut best: Option<(f64, usize, String, String)> = None;
    for (dim_label, dim_node) in &root.children {
        if parse_label(dim_label, "dim").is_none() {
            continue;
        }
        for (k_label, leaf) in &dim_node.children {
            let Some(k) = parse_label(k_label, "K") else { continue };
            let built = leaf
                .data
                .last()
                .and_then(|v| v.get("ts"))
                .and_then(|t| t.as_f64())
                .unwrap_or(0.0);
            let better = match &best {
                None => true,
                Some((b_built, b_k, _, _)) => built > *b_built || (built == *b_built && k > *b_k),
            };
            if better {
                best = Some((built, k, dim_label.clone(), k_label.clone()));
            }
        }
    }
    best.map(|(_, _, d, k)| (d, k))
}

fn parse_leaf(leaf: &FractalNode, dim_label: &str, k_label: &str) -> EngineResult<IvfIndex> {
    let raw = leaf
        .data
        .last()
        .ok_or_else(|| EngineError::MalformedIndex(format!("{}/{} holds no index", dim_label, k_label)))?;
    let index: IvfIndex = serde_json::from_value(raw.clone())
        .map_err(|e| EngineError::MalformedIndex(format!("{}/{}: {}", dim_label, k_label, e)))?;
    index.validate()?;
    if parse_label(dim_label, "dim") != Some(index.dim) {
        warn!("[ivf] Index under {} reports dim={}", dim_label, index.dim);
    }
    Ok(index)
}

fn parse_label(label: &str, prefix: &str) -> Option<usize> {
    label.strip_prefix(prefix)?.parse().ok()
}
