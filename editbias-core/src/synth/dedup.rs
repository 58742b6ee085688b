//! Near-duplicate detection for base prompts.
//!
//! 64-bit SimHash over unigram and bigram features, indexed by four 16-bit LSH
//! bands. Two fingerprints within Hamming distance 3 always share at least one
//! band, so for the default bound the band lookup has perfect recall; the
//! distance check then confirms each candidate.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

const BANDS: u32 = 4;
const BAND_BITS: u32 = 16;

/// SimHash fingerprint of a text.
pub fn simhash(text: &str) -> u64 {
    let tokens = super::tokens(text);
    let mut features: Vec<String> = tokens.clone();
    features.extend(tokens.windows(2).map(|w| format!("{} {}", w[0], w[1])));

    let mut weights = [0i64; 64];
    for feature in &features {
        let h = feature_hash(feature);
        for (bit, weight) in weights.iter_mut().enumerate() {
            if h >> bit & 1 == 1 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    }

    weights
        .iter()
        .enumerate()
        .filter(|(_, w)| **w > 0)
        .fold(0u64, |acc, (bit, _)| acc | (1 << bit))
}

fn feature_hash(feature: &str) -> u64 {
    let digest = Sha256::digest(feature.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// LSH index over accepted fingerprints.
pub struct NearDuplicateIndex {
    max_hamming: u32,
    fingerprints: Vec<(String, u64)>,
    buckets: HashMap<(u32, u64), Vec<usize>>,
}

impl NearDuplicateIndex {
    pub fn new(max_hamming: u32) -> Self {
        Self {
            max_hamming,
            fingerprints: Vec::new(),
            buckets: HashMap::new(),
        }
    }

    fn bands(fingerprint: u64) -> impl Iterator<Item = (u32, u64)> {
        (0..BANDS).map(move |band| {
            let shift = band * BAND_BITS;
            (band, (fingerprint >> shift) & ((1u64 << BAND_BITS) - 1))
        })
    }

    /// Insert `text` under `id`, or return the id of the earlier near-duplicate.
    pub fn insert(&mut self, id: &str, text: &str) -> Option<String> {
        let fingerprint = simhash(text);

        let mut candidates: Vec<usize> = Self::bands(fingerprint)
            .filter_map(|band| self.buckets.get(&band))
            .flatten()
            .copied()
            .collect();
        candidates.sort_unstable();
        candidates.dedup();

        if let Some(&hit) = candidates
            .iter()
            .find(|&&i| hamming(self.fingerprints[i].1, fingerprint) <= self.max_hamming)
        {
            return Some(self.fingerprints[hit].0.clone());
        }

        let index = self.fingerprints.len();
        self.fingerprints.push((id.to_string(), fingerprint));
        for band in Self::bands(fingerprint) {
            self.buckets.entry(band).or_default().push(index);
        }
        None
    }
}
