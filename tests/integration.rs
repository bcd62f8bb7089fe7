// End-to-end behaviour of the memory engine, offline (hashed embeddings).

use fractal_memory::engine::store::MemoryStore;
use fractal_memory::{
    Embedder, EngineError, FractalNode, FractalStore, IvfIndex, MemoryConfig, MemoryEngine, MemoryItem, Metadata,
    SearchOptions,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

fn engine_with(root: &Path, dims: usize, tweak: impl FnOnce(&mut MemoryConfig)) -> MemoryEngine {
    let mut config = MemoryConfig::offline(root, dims);
    tweak(&mut config);
    MemoryEngine::with_embedder(config, Embedder::hashed(dims)).unwrap()
}

fn engine(root: &Path) -> MemoryEngine {
    engine_with(root, 256, |_| {})
}

fn items(texts: impl IntoIterator<Item = String>) -> Vec<MemoryItem> {
    texts.into_iter().map(|t| MemoryItem::new(t, Metadata::new())).collect()
}

#[tokio::test]
async fn test_codename_is_top_hit() {
    let dir = tempfile::tempdir().unwrap();
    let e = engine(dir.path());
    for t in [
        "Bought groceries for the week",
        "Meeting moved to Thursday afternoon",
        "The cat knocked over a plant",
        "Remember to renew the passport",
        "Weather looks rainy tomorrow",
        "Call the dentist about cleaning",
    ] {
        e.add_memory("a1", t, Metadata::new()).await.unwrap();
    }
    let id = e.add_memory("a1", "The project codename is Blue Fox.", Metadata::new()).await.unwrap();

    let hits = e
        .search_memory("a1", "project codename", &SearchOptions::default().top_k(5))
        .await
        .unwrap();
    assert!(hits.len() <= 5);
    assert_eq!(hits[0].id, id);
    assert_eq!(hits[0].text, "The project codename is Blue Fox.");
    assert!(hits[1..].iter().all(|h| h.score < hits[0].score));
}

#[tokio::test]
async fn test_identical_text_stored_once_with_frequency_two() {
    let dir = tempfile::tempdir().unwrap();
    let e = engine(dir.path());
    let first = e.add_memory("a1", "x", Metadata::new()).await.unwrap();
    let second = e.add_memory("a1", "x", Metadata::new()).await.unwrap();
    assert_eq!(first, second);

    let rows = e.store().fetch_all("a1").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].frequency, 2);

    // Case and whitespace variants count as the same memory.
    let third = e.add_memory("a1", "  X ", Metadata::new()).await.unwrap();
    assert_eq!(third, first);
    assert_eq!(e.store().fetch_all("a1").unwrap()[0].frequency, 3);
}

#[tokio::test]
async fn test_reindex_partitions_every_id_once() {
    let dir = tempfile::tempdir().unwrap();
    let e = engine_with(dir.path(), 64, |c| c.index.clusters = 8);
    let texts = (0..1000).map(|i| format!("record {} in group {} tagged {}", i, i % 17, i % 5));
    for chunk in items(texts).chunks(250) {
        e.add_batch("a1", chunk.to_vec()).await.unwrap();
    }

    let summary = e.reindex("a1", 8, 3).await.unwrap().unwrap();
    assert_eq!(summary.clusters, 8);
    assert_eq!(summary.count, 1000);
    assert_eq!(summary.bucket_sizes.iter().sum::<usize>(), 1000);

    let index = IvfIndex::load(&e.fractal("a1").unwrap()).unwrap().unwrap();
    let mut ids: Vec<i64> = index.buckets.values().flatten().copied().collect();
    ids.sort_unstable();
    let mut stored: Vec<i64> = e.store().fetch_all("a1").unwrap().iter().map(|r| r.id).collect();
    stored.sort_unstable();
    assert_eq!(ids, stored, "each stored id appears in exactly one bucket");
}

#[tokio::test]
async fn test_all_buckets_match_exact_scan() {
    let dir = tempfile::tempdir().unwrap();
    let indexed = engine_with(dir.path(), 32, |_| {});
    let texts = (0..300).map(|i| format!("fact {} concerns area {} and detail {}", i, i % 11, i % 23));
    indexed.add_batch("a1", items(texts)).await.unwrap();
    let k = indexed.reindex("a1", 6, 3).await.unwrap().unwrap().clusters;

    let exact = engine_with(dir.path(), 32, |c| c.index.enabled = false);
    for q in ["area 3 and detail 7", "fact 42", "concerns detail 19", "unrelated words entirely"] {
        let via_ivf = indexed
            .search_memory("a1", q, &SearchOptions::default().nprobe(k).top_k(1))
            .await
            .unwrap();
        let via_scan = exact.search_memory("a1", q, &SearchOptions::default().top_k(1)).await.unwrap();
        assert_eq!(via_ivf[0].id, via_scan[0].id, "query {:?}", q);
    }
}

#[tokio::test]
async fn test_new_memory_found_without_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let e = engine_with(dir.path(), 64, |_| {});
    e.add_batch("a1", items((0..80).map(|i| format!("background note {}", i)))).await.unwrap();
    let built = e.reindex("a1", 8, 3).await.unwrap().unwrap();

    let id = e.add_memory("a1", "zebra crossing near the harbour", Metadata::new()).await.unwrap();
    let stats = e.stats("a1").unwrap().index.unwrap();
    assert_eq!(stats.built_at, built.built_at, "no rebuild happened");
    assert_eq!(stats.count, 81);

    let hits = e
        .search_memory("a1", "zebra crossing near the harbour", &SearchOptions::default().nprobe(1))
        .await
        .unwrap();
    assert_eq!(hits[0].id, id);
}

#[tokio::test]
async fn test_mixed_widths_coexist() {
    let dir = tempfile::tempdir().unwrap();
    let narrow = engine_with(dir.path(), 32, |_| {});
    narrow.add_memory("a1", "written with the small model", Metadata::new()).await.unwrap();
    narrow.add_memory("a1", "another small model entry", Metadata::new()).await.unwrap();

    let wide = engine_with(dir.path(), 96, |_| {});
    wide.add_memory("a1", "written with the large model", Metadata::new()).await.unwrap();

    let widths: Vec<usize> = wide.store().fetch_all("a1").unwrap().iter().map(|r| r.embedding.len()).collect();
    assert_eq!(widths, vec![32, 32, 96]);

    for e in [&narrow, &wide] {
        let hits = e.search_memory("a1", "model", &SearchOptions::default()).await.unwrap();
        assert_eq!(hits.len(), 3);
    }

    // Index built at one width still answers queries of the other.
    wide.reindex("a1", 2, 3).await.unwrap().unwrap();
    assert_eq!(narrow.search_memory("a1", "small model", &SearchOptions::default().nprobe(2)).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_decay_and_boost_shift_ranking() {
    let dir = tempfile::tempdir().unwrap();
    let e = engine(dir.path());
    let day = 86_400.0;
    let now = chrono::Utc::now().timestamp() as f64;
    let old = e
        .upsert_item("a1", MemoryItem { ts: Some(now - 90.0 * day), ..MemoryItem::new("status report alpha", Metadata::new()) })
        .await
        .unwrap()
        .id;
    let new = e
        .upsert_item("a1", MemoryItem { ts: Some(now - 60.0), ..MemoryItem::new("status report beta", Metadata::new()) })
        .await
        .unwrap()
        .id;

    let plain = e.search_memory("a1", "status report", &SearchOptions::default()).await.unwrap();
    assert_eq!(plain.len(), 2);
    assert!((plain[0].score - plain[1].score).abs() < 1e-9, "equal raw similarity");
    assert_eq!(plain[0].id, old, "ties keep insertion order");

    let decayed = e.search_memory("a1", "status report", &SearchOptions::default().decay(0.05)).await.unwrap();
    assert_eq!(decayed[0].id, new);

    let boosted = e.search_memory("a1", "status report", &SearchOptions::default().fresh_boost(0.5)).await.unwrap();
    assert_eq!(boosted[0].id, new);
    assert!(boosted[0].score >= plain.iter().find(|h| h.id == new).unwrap().score);
}

#[tokio::test]
async fn test_writes_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let e = engine(dir.path());
        e.add_memory("a1", "durable fact", json!({"k": "v"}).as_object().cloned().unwrap()).await.unwrap()
    };
    let e = engine(dir.path());
    let hits = e.search_memory("a1", "durable fact", &SearchOptions::default()).await.unwrap();
    assert_eq!(hits[0].id, id);
    assert_eq!(hits[0].metadata["k"], json!("v"));
}

#[test]
fn test_fractal_tree_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config = MemoryConfig::offline(dir.path(), 8);
    let store = FractalStore::for_agent(dir.path(), "tree-agent", &config.store).unwrap();
    store.insert(&["notes", "daily"], json!({"d": 1})).unwrap();
    store.insert(&["notes", "daily"], json!({"d": 2})).unwrap();
    store.insert(&["notes", "weekly", "w1"], json!("summary")).unwrap();
    store.persist().unwrap();

    let on_disk: FractalNode = serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
    assert_eq!(on_disk, store.snapshot());
    assert_eq!(on_disk.get(&["notes", "daily"]).unwrap().data, vec![json!({"d": 1}), json!({"d": 2})]);
}

#[test]
fn test_unwritable_root_is_storage_error() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();
    let config = MemoryConfig::offline(&blocker, 8);
    let err = MemoryEngine::with_embedder(config, Embedder::hashed(8)).err().unwrap();
    assert!(err.is_storage(), "got {:?}", err);
    assert!(matches!(err, EngineError::Storage { .. }));
    assert!(MemoryStore::open(&blocker.join("memory.sqlite3")).is_err());
}

#[tokio::test]
async fn test_exact_scan_reads_only_newest_records() {
    let dir = tempfile::tempdir().unwrap();
    let e = engine_with(dir.path(), 64, |c| {
        c.index.enabled = false;
        c.index.scan_cap = 3;
    });
    let now = chrono::Utc::now().timestamp() as f64;
    let mut ids = Vec::new();
    for i in 0..10 {
        let ts = Some(now - (10 - i) as f64 * 60.0);
        let item = MemoryItem { ts, ..MemoryItem::new(format!("log line {}", i), Metadata::new()) };
        ids.push(e.upsert_item("capped", item).await.unwrap().id);
    }

    let hits = e.search_memory("capped", "log line 0", &SearchOptions::default().top_k(10)).await.unwrap();
    assert_eq!(hits.len(), 3);
    let mut got: Vec<i64> = hits.iter().map(|h| h.id).collect();
    got.sort_unstable();
    assert_eq!(got, ids[7..].to_vec(), "only the newest scan_cap records are candidates");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_and_reindex_index_every_id_once() {
    let dir = tempfile::tempdir().unwrap();
    let e = Arc::new(engine_with(dir.path(), 64, |c| {
        c.index.clusters = 4;
        c.index.rebuild_threshold = 10_000;
    }));
    e.add_batch("busy", items((0..40).map(|i| format!("seed note {}", i)))).await.unwrap();
    e.reindex("busy", 4, 3).await.unwrap().unwrap();

    let mut writers = Vec::new();
    for t in 0..8 {
        let e = Arc::clone(&e);
        writers.push(tokio::spawn(async move {
            for i in 0..25 {
                e.add_memory("busy", &format!("writer {} note {}", t, i), Metadata::new()).await.unwrap();
            }
            e.add_memory("busy", "shared note", Metadata::new()).await.unwrap()
        }));
    }
    let rebuilder = {
        let e = Arc::clone(&e);
        tokio::spawn(async move {
            for _ in 0..3 {
                e.reindex("busy", 4, 3).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    let mut shared = Vec::new();
    for w in writers {
        shared.push(w.await.unwrap());
    }
    rebuilder.await.unwrap();

    assert!(shared.windows(2).all(|w| w[0] == w[1]), "one id for the repeated text");
    let rows = e.store().fetch_all("busy").unwrap();
    assert_eq!(rows.len(), 40 + 8 * 25 + 1);
    assert_eq!(rows.iter().find(|r| r.text == "shared note").unwrap().frequency, 8);

    let index = IvfIndex::load(&e.fractal("busy").unwrap()).unwrap().unwrap();
    let mut indexed: Vec<i64> = index.buckets.values().flatten().copied().collect();
    indexed.sort_unstable();
    let stored: Vec<i64> = rows.iter().map(|r| r.id).collect();
    assert_eq!(indexed, stored, "every committed id sits in exactly one bucket");
    assert_eq!(index.count, stored.len());
}

#[tokio::test]
async fn test_lookalike_agent_ids_keep_separate_indexes() {
    let dir = tempfile::tempdir().unwrap();
    let e = engine_with(dir.path(), 64, |c| c.index.rebuild_threshold = 10_000);
    e.add_batch("a_b", items((0..12).map(|i| format!("underscore agent fact {}", i)))).await.unwrap();
    e.add_batch("a/b", items((0..5).map(|i| format!("slash agent fact {}", i)))).await.unwrap();

    assert_ne!(e.fractal("a_b").unwrap().path(), e.fractal("a/b").unwrap().path());

    e.reindex("a_b", 3, 3).await.unwrap().unwrap();
    assert!(e.stats("a/b").unwrap().index.is_none(), "reindexing one agent leaves the other alone");

    e.reindex("a/b", 2, 3).await.unwrap().unwrap();
    let underscore = e.stats("a_b").unwrap().index.unwrap();
    let slash = e.stats("a/b").unwrap().index.unwrap();
    assert_eq!((underscore.clusters, underscore.count), (3, 12));
    assert_eq!((slash.clusters, slash.count), (2, 5));

    let hits = e.search_memory("a/b", "underscore agent fact 3", &SearchOptions::default()).await.unwrap();
    assert!(hits.iter().all(|h| h.text.starts_with("slash agent")));
}
