// Fractal Memory Engine — Deterministic Hashed Embedding
//
// Feature hashing: every lower-cased whitespace token is SHA-256'd and the
// digest picks four (bucket, sign) pairs. Buckets are summed and the result
// is L2-normalized. Fully offline and reproducible across runs and machines.

use super::vector::l2_normalize;
use crate::atoms::constants::HASH_EMBED_MAX_TOKENS;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy)]
pub struct HashedEmbedder {
    dims: usize,
}

impl HashedEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let lowered = text.to_lowercase();
        for token in lowered.split_whitespace().take(HASH_EMBED_MAX_TOKENS) {
            let digest = Sha256::digest(token.as_bytes());
            for k in (0..16).step_by(4) {
                let bucket = u16::from_be_bytes([digest[k], digest[k + 1]]) as usize % self.dims;
                let sign = if digest[k + 2] & 1 == 1 { 1.0 } else { -1.0 };
                v[bucket] += sign;
            }
        }
        l2_normalize(&mut v);
        v
    }

    pub fn embed_all(&self, texts: &[String]) -> Vec<Vec<f32>> {
        texts.iter().map(|t| self.embed_text(t)).collect()
    }
}
