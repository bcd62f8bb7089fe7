// Fractal Memory Engine — Hybrid Ranker
//
// score = cosine(record, query)
//       + tfidf_weight * tfidf(query, record)      (hybrid mode)
//       then × exp(-decay_rate * age_days)         (decay_rate > 0)
//       then + fresh_boost * sigmoid(1 - age_hours) (fresh_boost > 0)
//
// The TF-IDF vocabulary is the candidate set handed in, not the whole
// corpus, so an IVF search and an exact scan can weigh terms differently.
// Ties keep insertion order (record id ascending).

use crate::atoms::types::{MemoryRecord, SearchHit};
use crate::engine::embedding::vector::{align_dim, dot};
use crate::engine::store::normalize_text;
use std::collections::{HashMap, HashSet};

const SECS_PER_DAY: f64 = 86_400.0;
const SECS_PER_HOUR: f64 = 3_600.0;

#[derive(Debug, Clone, PartialEq)]
pub struct RankParams {
    pub top_k: usize,
    pub decay_rate: f64,
    pub hybrid: bool,
    pub tfidf_weight: f64,
    pub fresh_boost: f64,
    /// Drop hits scoring below this after all adjustments.
    pub min_score: Option<f64>,
    /// Reference time (Unix seconds) for ages.
    pub now: f64,
}

/// Score, sort and cut `records` against the query. `dim` is the width both
/// sides are aligned to before the dot product.
pub fn rank(query: &str, query_vec: &[f32], dim: usize, mut records: Vec<MemoryRecord>, params: &RankParams) -> Vec<SearchHit> {
    if records.is_empty() || params.top_k == 0 {
        return Vec::new();
    }
    records.sort_by_key(|r| r.id);

    let q = align_dim(query_vec, dim);
    let mut scores: Vec<f64> = records.iter().map(|r| dot(&align_dim(&r.embedding, dim), &q)).collect();

    if params.hybrid && params.tfidf_weight != 0.0 {
        let docs: Vec<&str> = records.iter().map(|r| r.text.as_str()).collect();
        for (s, t) in scores.iter_mut().zip(tfidf_scores(query, &docs)) {
            *s += params.tfidf_weight * t;
        }
    }

    if params.decay_rate > 0.0 {
        for (s, r) in scores.iter_mut().zip(&records) {
            *s = apply_decay(*s, params.decay_rate, age_secs(params.now, r.created_at) / SECS_PER_DAY);
        }
    }

    if params.fresh_boost > 0.0 {
        for (s, r) in scores.iter_mut().zip(&records) {
            *s += params.fresh_boost * freshness(age_secs(params.now, r.created_at) / SECS_PER_HOUR);
        }
    }

    let mut order: Vec<usize> = (0..records.len()).collect();
    // Stable: equal scores stay in id order.
    order.sort_by(|a, b| scores[*b].partial_cmp(&scores[*a]).unwrap_or(std::cmp::Ordering::Equal));

    let mut slots: Vec<Option<MemoryRecord>> = records.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter(|i| params.min_score.map_or(true, |floor| scores[*i] >= floor))
        .take(params.top_k)
        .filter_map(|i| {
            let r = slots[i].take()?;
            Some(SearchHit {
                id: r.id,
                text: r.text,
                metadata: r.metadata,
                timestamp: r.created_at,
                score: scores[i],
            })
        })
        .collect()
}

/// Multiplicative decay. A negative score is pushed further down by the same
/// fraction so that age never lifts a record.
pub fn apply_decay(score: f64, rate: f64, age_days: f64) -> f64 {
    let factor = (-rate * age_days.max(0.0)).exp();
    if score >= 0.0 {
        score * factor
    } else {
        score * (2.0 - factor)
    }
}

/// sigmoid(1 - age_hours): ≈0.73 for brand-new items, ≈0 after half a day.
pub fn freshness(age_hours: f64) -> f64 {
    1.0 / (1.0 + (age_hours.max(0.0) - 1.0).exp())
}

fn age_secs(now: f64, ts: f64) -> f64 {
    (now - ts).max(0.0)
}

fn tokens(s: &str) -> Vec<String> {
    normalize_text(s).split(' ').filter(|w| !w.is_empty()).map(str::to_string).collect()
}

/// TF-IDF dot product of the query against each doc, with
/// idf(t) = ln((N + 1) / (df(t) + 1)) + 1 over `docs`.
pub fn tfidf_scores(query: &str, docs: &[&str]) -> Vec<f64> {
    let doc_tokens: Vec<Vec<String>> = docs.iter().map(|d| tokens(d)).collect();

    let mut df: HashMap<&str, usize> = HashMap::new();
    for toks in &doc_tokens {
        let seen: HashSet<&str> = toks.iter().map(String::as_str).collect();
        for t in seen {
            *df.entry(t).or_insert(0) += 1;
        }
    }
    let n = docs.len().max(1) as f64;
    let idf = |t: &str| df.get(t).map_or(0.0, |d| ((n + 1.0) / (*d as f64 + 1.0)).ln() + 1.0);

    let mut q_tf: HashMap<String, usize> = HashMap::new();
    for t in tokens(query) {
        *q_tf.entry(t).or_insert(0) += 1;
    }
    let q_weights: Vec<(&str, f64)> = q_tf.iter().map(|(t, c)| (t.as_str(), *c as f64 * idf(t.as_str()))).collect();

    doc_tokens
        .iter()
        .map(|toks| {
            let mut tf: HashMap<&str, usize> = HashMap::new();
            for t in toks {
                *tf.entry(t.as_str()).or_insert(0) += 1;
            }
            q_weights
                .iter()
                .filter_map(|(t, wq)| tf.get(t).map(|c| wq * (*c as f64 * idf(*t))))
                .sum::<f64>()
        })
        .collect()
}
