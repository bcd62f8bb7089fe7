// Fractal Memory Engine — Fractal Store
//
// A hierarchical, path-addressed, append-only document tree per agent,
// persisted as one JSON file with batched/debounced writes. It is also
// where the IVF index lives (see engine::ivf).
//
// One in-memory tree per file per process: `FractalStore::for_agent` hands
// out a shared `Arc` from a registry. All tree mutation, the flush decision
// and the file write happen under the store's single lock, so two persists
// never interleave on the same file.

use crate::atoms::constants::FRACTAL_DATA_KEY;
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::config::StoreConfig;
use crate::engine::now_secs;
use crate::engine::paths;
use log::{error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

/// Live stores keyed by tree file path.
static REGISTRY: LazyLock<Mutex<HashMap<PathBuf, Arc<FractalStore>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

// ── Tree ───────────────────────────────────────────────────────────────────

/// One node of the tree. The node's label is its key in the parent's
/// `children` map; payloads sit under `__data__` next to the child labels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FractalNode {
    #[serde(rename = "__data__", default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<Value>,
    #[serde(flatten)]
    pub children: BTreeMap<String, FractalNode>,
}

impl FractalNode {
    pub fn get(&self, path: &[&str]) -> Option<&FractalNode> {
        let mut node = self;
        for label in path {
            node = node.children.get(*label)?;
        }
        Some(node)
    }

    pub fn get_mut(&mut self, path: &[&str]) -> Option<&mut FractalNode> {
        let mut node = self;
        for label in path {
            node = node.children.get_mut(*label)?;
        }
        Some(node)
    }

    /// Walk `path`, creating missing nodes on the way.
    pub fn get_or_create(&mut self, path: &[&str]) -> &mut FractalNode {
        let mut node = self;
        for label in path {
            node = node.children.entry((*label).to_string()).or_default();
        }
        node
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.children.is_empty()
    }

    /// Drop every child except `keep`; returns how many went.
    pub fn remove_children(&mut self, keep: Option<&str>) -> usize {
        let before = self.children.len();
        self.children.retain(|label, _| Some(label.as_str()) == keep);
        before - self.children.len()
    }

    /// Indented label outline with payload counts, e.g. `retrieval/` `  ivf/`.
    pub fn outline(&self) -> String {
        let mut out = String::new();
        self.outline_into(0, &mut out);
        out
    }

    fn outline_into(&self, depth: usize, out: &mut String) {
        for (label, child) in &self.children {
            out.push_str(&"  ".repeat(depth));
            out.push_str(label);
            if !child.data.is_empty() {
                out.push_str(&format!(" [{}]", child.data.len()));
            }
            out.push('\n');
            child.outline_into(depth + 1, out);
        }
    }
}

// ── Store ──────────────────────────────────────────────────────────────────

struct FractalState {
    tree: FractalNode,
    dirty: bool,
    inserts: usize,
    since: Instant,
}

pub struct FractalStore {
    agent_id: String,
    path: PathBuf,
    batch_size: usize,
    flush_interval: Duration,
    state: Mutex<FractalState>,
}

impl FractalStore {
    /// The shared store for `agent_id` under `root`. First call loads the
    /// tree from disk; later calls return the same handle regardless of the
    /// batching settings they pass. A tree file that exists but cannot be
    /// read is a storage error, and nothing is registered.
    pub fn for_agent(root: &Path, agent_id: &str, config: &StoreConfig) -> EngineResult<Arc<FractalStore>> {
        let path = paths::fractal_path(root, agent_id);
        let mut registry = REGISTRY.lock();
        if let Some(store) = registry.get(&path) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(FractalStore::load(agent_id, path.clone(), config)?);
        registry.insert(path, Arc::clone(&store));
        Ok(store)
    }

    fn load(agent_id: &str, path: PathBuf, config: &StoreConfig) -> EngineResult<Self> {
        let tree = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<FractalNode>(&raw) {
                Ok(tree) => tree,
                Err(e) => {
                    let aside = set_aside(&path)?;
                    warn!("[fractal] Unparsable tree at {:?} ({}), moved to {:?}; starting empty", path, e, aside);
                    FractalNode::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FractalNode::default(),
            Err(e) => return Err(EngineError::storage(&path, e)),
        };
        info!("[fractal] Loaded tree for agent '{}' from {:?}", agent_id, path);
        Ok(FractalStore {
            agent_id: agent_id.to_string(),
            path,
            batch_size: config.flush_batch.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms),
            state: Mutex::new(FractalState {
                tree,
                dirty: false,
                inserts: 0,
                since: Instant::now(),
            }),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `payload` to the data of the node at `path`, then flush if the
    /// batch size or flush interval has been reached.
    pub fn insert(&self, path: &[&str], payload: Value) -> EngineResult<()> {
        check_labels(path)?;
        let mut state = self.state.lock();
        state.tree.get_or_create(path).data.push(payload);
        self.after_write(&mut state)
    }

    /// Make `payload` the only datum at `path`. Counts as one insert.
    pub fn replace(&self, path: &[&str], payload: Value) -> EngineResult<()> {
        check_labels(path)?;
        let mut state = self.state.lock();
        state.tree.get_or_create(path).data = vec![payload];
        self.after_write(&mut state)
    }

    /// Drop every child of the node at `path` except `keep`. Returns how many
    /// were removed. The change is flushed on the next persist.
    pub fn remove_children(&self, path: &[&str], keep: Option<&str>) -> usize {
        let mut state = self.state.lock();
        let Some(node) = state.tree.get_mut(path) else {
            return 0;
        };
        let removed = node.remove_children(keep);
        if removed > 0 {
            state.dirty = true;
        }
        removed
    }

    /// Read-modify-write under the lock. The closure reports whether it
    /// changed anything; a change counts as one insert for the flush policy.
    pub fn update<F>(&self, f: F) -> EngineResult<bool>
    where
        F: FnOnce(&mut FractalNode) -> bool,
    {
        let mut state = self.state.lock();
        if !f(&mut state.tree) {
            return Ok(false);
        }
        self.after_write(&mut state)?;
        Ok(true)
    }

    /// Data sequence at `path` (empty when the node does not exist).
    pub fn query(&self, path: &[&str]) -> Vec<Value> {
        let state = self.state.lock();
        state.tree.get(path).map(|n| n.data.clone()).unwrap_or_default()
    }

    /// Clone of the subtree at `path`.
    pub fn subtree(&self, path: &[&str]) -> Option<FractalNode> {
        let state = self.state.lock();
        state.tree.get(path).cloned()
    }

    pub fn snapshot(&self) -> FractalNode {
        self.state.lock().tree.clone()
    }

    pub fn outline(&self) -> String {
        self.state.lock().tree.outline()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Write the whole tree if dirty; otherwise a no-op.
    pub fn persist(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        self.persist_locked(&mut state)
    }

    fn after_write(&self, state: &mut FractalState) -> EngineResult<()> {
        state.dirty = true;
        state.inserts += 1;
        let now = Instant::now();
        if state.inserts >= self.batch_size || now.duration_since(state.since) >= self.flush_interval {
            self.persist_locked(state)?;
            state.since = now;
            state.inserts = 0;
        }
        Ok(())
    }

    fn persist_locked(&self, state: &mut FractalState) -> EngineResult<()> {
        if !state.dirty {
            return Ok(());
        }
        write_atomic(&self.path, &state.tree)?;
        state.dirty = false;
        Ok(())
    }
}

/// Persist every live store. Failures are logged and skipped so one bad
/// disk path cannot block the rest.
pub fn flush_all() -> usize {
    let stores: Vec<Arc<FractalStore>> = REGISTRY.lock().values().cloned().collect();
    let mut flushed = 0;
    for store in stores {
        match store.persist() {
            Ok(()) => flushed += 1,
            Err(e) => error!("[fractal] Flush failed for agent '{}': {}", store.agent_id, e),
        }
    }
    flushed
}

/// Flushes every live store when dropped. Hold one in `main` so trees are
/// written on normal shutdown.
#[must_use = "the guard flushes when it goes out of scope"]
pub struct FlushGuard;

impl Drop for FlushGuard {
    fn drop(&mut self) {
        let n = flush_all();
        info!("[fractal] Shutdown flush over {} store(s)", n);
    }
}

fn check_labels(path: &[&str]) -> EngineResult<()> {
    if path.iter().any(|l| *l == FRACTAL_DATA_KEY) {
        return Err(EngineError::Other(format!(
            "'{}' is reserved and cannot be used as a node label",
            FRACTAL_DATA_KEY
        )));
    }
    Ok(())
}

fn write_atomic(path: &Path, tree: &FractalNode) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| EngineError::storage(parent, e))?;
    }
    let json = serde_json::to_string_pretty(tree)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| EngineError::storage(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| EngineError::storage(path, e))?;
    Ok(())
}

/// Rename an unparsable tree file to `<name>.corrupt-<unix secs>` so the next
/// persist cannot overwrite it.
fn set_aside(path: &Path) -> EngineResult<PathBuf> {
    let aside = path.with_extension(format!("json.corrupt-{}", now_secs() as i64));
    std::fs::rename(path, &aside).map_err(|e| EngineError::storage(path, e))?;
    Ok(aside)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(batch: usize, interval_ms: u64) -> StoreConfig {
        StoreConfig { flush_batch: batch, flush_interval_ms: interval_ms, ..StoreConfig::default() }
    }

    #[test]
    fn test_same_agent_shares_one_handle() {
        let dir = tempfile::tempdir().unwrap();
        let a = FractalStore::for_agent(dir.path(), "shared", &config(10, 60_000)).unwrap();
        let b = FractalStore::for_agent(dir.path(), "shared", &config(1, 0)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let other = FractalStore::for_agent(dir.path(), "someone-else", &config(10, 60_000)).unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn test_insert_creates_path_and_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FractalStore::for_agent(dir.path(), "order", &config(100, 60_000)).unwrap();
        store.insert(&["topics", "rust"], json!({"n": 1})).unwrap();
        store.insert(&["topics", "rust"], json!({"n": 2})).unwrap();
        store.insert(&["topics"], json!("mid")).unwrap();
        assert_eq!(store.query(&["topics", "rust"]), vec![json!({"n": 1}), json!({"n": 2})]);
        assert_eq!(store.query(&["topics"]), vec![json!("mid")]);
        assert!(store.query(&["missing"]).is_empty());
        assert!(store.is_dirty(), "nothing flushed below the batch size");
    }

    #[test]
    fn test_batch_size_triggers_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = FractalStore::for_agent(dir.path(), "batch", &config(3, 60_000)).unwrap();
        store.insert(&["a"], json!(1)).unwrap();
        store.insert(&["a"], json!(2)).unwrap();
        assert!(!store.path().exists());
        store.insert(&["a"], json!(3)).unwrap();
        assert!(store.path().exists());
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_interval_triggers_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = FractalStore::for_agent(dir.path(), "interval", &config(1000, 0)).unwrap();
        store.insert(&["a"], json!(1)).unwrap();
        assert!(store.path().exists(), "a zero interval flushes on every insert");
    }

    #[test]
    fn test_persist_is_noop_when_clean() {
        let dir = tempfile::tempdir().unwrap();
        let store = FractalStore::for_agent(dir.path(), "clean", &config(10, 60_000)).unwrap();
        store.persist().unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn test_round_trip_reconstructs_identical_tree() {
        let dir = tempfile::tempdir().unwrap();
        let store = FractalStore::for_agent(dir.path(), "roundtrip", &config(100, 60_000)).unwrap();
        store.insert(&["x", "y", "z"], json!({"k": [1, 2, 3]})).unwrap();
        store.insert(&["x", "y", "z"], json!("second")).unwrap();
        store.insert(&["x", "w"], json!(null)).unwrap();
        store.persist().unwrap();

        let reloaded = FractalStore::load("roundtrip", store.path().to_path_buf(), &config(100, 60_000)).unwrap();
        assert_eq!(reloaded.snapshot(), store.snapshot());
        assert_eq!(reloaded.query(&["x", "y", "z"]), vec![json!({"k": [1, 2, 3]}), json!("second")]);
    }

    #[test]
    fn test_data_key_serialization_layout() {
        let mut tree = FractalNode::default();
        tree.get_or_create(&["a"]).data.push(json!(1));
        let v = serde_json::to_value(&tree).unwrap();
        assert_eq!(v, json!({"a": {"__data__": [1]}}));
    }

    #[test]
    fn test_reserved_label_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FractalStore::for_agent(dir.path(), "reserved", &config(10, 60_000)).unwrap();
        assert!(store.insert(&["__data__"], json!(1)).is_err());
    }

    #[test]
    fn test_replace_and_remove_children() {
        let dir = tempfile::tempdir().unwrap();
        let store = FractalStore::for_agent(dir.path(), "replace", &config(100, 60_000)).unwrap();
        store.insert(&["idx", "K4"], json!("old")).unwrap();
        store.replace(&["idx", "K4"], json!("new")).unwrap();
        store.replace(&["idx", "K8"], json!("eight")).unwrap();
        assert_eq!(store.query(&["idx", "K4"]), vec![json!("new")]);
        assert_eq!(store.remove_children(&["idx"], Some("K8")), 1);
        assert!(store.subtree(&["idx", "K4"]).is_none());
        assert_eq!(store.remove_children(&["nope"], None), 0);
        assert!(store.outline().contains("K8 [1]"));
    }

    #[test]
    fn test_update_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FractalStore::for_agent(dir.path(), "update", &config(100, 60_000)).unwrap();
        assert!(!store.update(|_| false).unwrap());
        assert!(!store.is_dirty());
        let changed = store
            .update(|tree| {
                tree.get_or_create(&["n"]).data.push(json!(7));
                true
            })
            .unwrap();
        assert!(changed);
        assert!(store.is_dirty());
        assert_eq!(store.query(&["n"]), vec![json!(7)]);
    }

    #[test]
    fn test_corrupt_file_is_set_aside_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fmm.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = FractalStore::load("corrupt", path.clone(), &config(1, 0)).unwrap();
        assert!(store.snapshot().is_empty());
        assert!(!path.exists());

        store.insert(&["a"], json!(1)).unwrap();
        assert!(path.exists());
        let kept: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("fmm.json.corrupt-"))
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(std::fs::read(kept[0].path()).unwrap(), b"{not json");
    }

    #[test]
    fn test_unreadable_tree_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the tree file should be: reading it fails with
        // something other than NotFound.
        let agent = "dir-in-the-way";
        std::fs::create_dir_all(paths::fractal_path(dir.path(), agent)).unwrap();
        let err = FractalStore::for_agent(dir.path(), agent, &config(10, 60_000)).err().unwrap();
        assert!(err.is_storage(), "got {:?}", err);
        assert!(!REGISTRY.lock().contains_key(&paths::fractal_path(dir.path(), agent)));
    }

    #[test]
    fn test_concurrent_inserts_and_persists_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let threads = 8;
        let per_thread = 50;
        std::thread::scope(|scope| {
            for t in 0..threads {
                let root = dir.path();
                scope.spawn(move || {
                    let store = FractalStore::for_agent(root, "contended", &config(7, 60_000)).unwrap();
                    for i in 0..per_thread {
                        store.insert(&["log", &format!("t{}", t % 2)], json!({"t": t, "i": i})).unwrap();
                        if i % 10 == 0 {
                            store.persist().unwrap();
                        }
                    }
                });
            }
        });

        let store = FractalStore::for_agent(dir.path(), "contended", &config(7, 60_000)).unwrap();
        store.persist().unwrap();
        let on_disk: FractalNode = serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(on_disk, store.snapshot());
        let total: usize = ["t0", "t1"].iter().map(|l| on_disk.get(&["log", l]).unwrap().data.len()).sum();
        assert_eq!(total, threads * per_thread);
        for t in 0..threads {
            let mine: Vec<i64> = on_disk.get(&["log", &format!("t{}", t % 2)]).unwrap().data.iter()
                .filter(|v| v["t"] == json!(t))
                .map(|v| v["i"].as_i64().unwrap())
                .collect();
            assert_eq!(mine, (0..per_thread as i64).collect::<Vec<_>>(), "thread {} appends stay in order", t);
        }
    }

    #[test]
    fn test_flush_guard_writes_dirty_stores() {
        let dir = tempfile::tempdir().unwrap();
        let store = FractalStore::for_agent(dir.path(), "guarded", &config(100, 60_000)).unwrap();
        store.insert(&["a"], json!(1)).unwrap();
        {
            let _guard = FlushGuard;
        }
        assert!(store.path().exists());
        assert!(!store.is_dirty());
    }
}
