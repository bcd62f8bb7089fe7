// k-means over unit vectors: k-means++ seeding, then a bounded number of
// Lloyd rounds that assign by maximum dot product (cosine, since every
// input is normalized) and renormalize each mean.

use crate::engine::embedding::vector::{l2_normalize, nearest_by_dot};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Cluster `vectors` (all of one width) into at most `k` centroids.
/// Returns fewer than `k` when the corpus is smaller or has fewer distinct
/// points. Empty input yields no centroids.
pub fn kmeans(vectors: &[Vec<f32>], k: usize, iters: usize, seed: u64) -> Vec<Vec<f32>> {
    if vectors.is_empty() || k == 0 {
        return Vec::new();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = kmeans_plus_plus_init(vectors, k.min(vectors.len()), &mut rng);

    for _ in 0..iters.max(1) {
        let assignments: Vec<usize> = vectors
            .iter()
            .map(|v| nearest_by_dot(v, &centroids).unwrap_or(0))
            .collect();
        update_centroids(vectors, &assignments, &mut centroids);
    }
    centroids
}

/// Pick seeds with probability proportional to squared distance from the
/// nearest seed chosen so far.
fn kmeans_plus_plus_init(vectors: &[Vec<f32>], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let n = vectors.len();
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
    centroids.push(vectors[rng.gen_range(0..n)].clone());

    let mut min_distances = vec![f64::MAX; n];
    while centroids.len() < k {
        let Some(last) = centroids.last() else { break };
        for (i, v) in vectors.iter().enumerate() {
            let d = squared_distance(v, last);
            if d < min_distances[i] {
                min_distances[i] = d;
            }
        }

        let total: f64 = min_distances.iter().sum();
        if total <= f64::EPSILON {
            // Every remaining point coincides with a seed.
            break;
        }
        let target = rng.gen::<f64>() * total;
        let mut acc = 0.0;
        let mut chosen = None;
        for (i, d) in min_distances.iter().enumerate() {
            acc += d;
            if acc > target && *d > 0.0 {
                chosen = Some(i);
                break;
            }
        }
        // Float drift can leave `target` just past the final sum.
        let idx = chosen.unwrap_or_else(|| farthest(&min_distances));
        centroids.push(vectors[idx].clone());
    }
    centroids
}

/// Mean of each cluster, renormalized. A cluster that lost all its members
/// keeps its previous centroid.
fn update_centroids(vectors: &[Vec<f32>], assignments: &[usize], centroids: &mut [Vec<f32>]) {
    let dim = centroids.first().map(|c| c.len()).unwrap_or(0);
    let mut sums = vec![vec![0.0f64; dim]; centroids.len()];
    let mut counts = vec![0usize; centroids.len()];

    for (v, &cluster) in vectors.iter().zip(assignments) {
        counts[cluster] += 1;
        for (s, x) in sums[cluster].iter_mut().zip(v) {
            *s += *x as f64;
        }
    }

    for ((centroid, sum), count) in centroids.iter_mut().zip(sums).zip(counts) {
        if count == 0 {
            continue;
        }
        let mut mean: Vec<f32> = sum.iter().map(|s| (s / count as f64) as f32).collect();
        l2_normalize(&mut mean);
        *centroid = mean;
    }
}

fn squared_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = *x as f64 - *y as f64;
            d * d
        })
        .sum()
}

fn farthest(distances: &[f64]) -> usize {
    distances
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}
