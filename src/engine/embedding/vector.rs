// ── Vector math utilities ──────────────────────────────────────────────

/// Convert a byte slice (from SQLite BLOB) to a Vec<f32>.
pub(crate) fn bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Convert a Vec<f32> to bytes for SQLite BLOB storage.
pub fn f32_vec_to_bytes(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Scale to unit length in place. A zero vector stays zero.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt() + 1e-12;
    for x in v.iter_mut() {
        *x = (*x as f64 / norm) as f32;
    }
}

/// Truncate or zero-pad to `dim`, then renormalize.
/// Used wherever vectors written by different backends meet.
pub fn align_dim(v: &[f32], dim: usize) -> Vec<f32> {
    let mut out: Vec<f32> = v.iter().copied().take(dim).collect();
    out.resize(dim, 0.0);
    l2_normalize(&mut out);
    out
}

/// Dot product over the common prefix. For normalized vectors of equal width
/// this is the cosine similarity.
pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| *x as f64 * *y as f64).sum()
}

/// Index of the row with maximum dot product against `v`. Ties go to the lowest index.
pub fn nearest_by_dot(v: &[f32], rows: &[Vec<f32>]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, row) in rows.iter().enumerate() {
        let d = dot(v, row);
        match best {
            Some((_, b)) if d <= b => {}
            _ => best = Some((i, d)),
        }
    }
    best.map(|(i, _)| i)
}
