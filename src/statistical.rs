//! Statistical (logit-bias) watermark scoring
//!
//! A keyed pseudorandom hash decides, per context seed, which token ids are
//! "green". Detection counts how many observed tokens landed in their own
//! green set and converts the excess over chance into a one-sided z-score
//! and p-value.

use crate::keys::derive_context_seed;

const MASK63: u64 = (1u64 << 63) - 1;
const MIX_A: u64 = 2862933555777941757;
const MIX_B: u64 = 3037000493;

/// Keyed 63-bit mix used both for dense greenlist membership and for ranking
/// tokens into the sparse greenlist.
pub fn mix63(x: u64) -> u64 {
    MIX_A.wrapping_mul(x & MASK63).wrapping_add(MIX_B) & MASK63
}

/// Whether `token_id` falls in the dense green set for `seed` at `greenlist_ratio`.
pub fn token_is_green(token_id: u64, seed: u64, greenlist_ratio: f64) -> bool {
    let threshold = (greenlist_ratio * MASK63 as f64) as u64;
    let h = mix63(token_id ^ (seed & MASK63));
    h < threshold
}

/// Result of scoring a token sequence against the statistical watermark.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StatisticalScore {
    pub total_scored: u64,
    pub green_hits: u64,
    pub expected: f64,
    pub z_score: f64,
    pub p_value_one_sided: f64,
}

impl StatisticalScore {
    fn empty() -> Self {
        Self { total_scored: 0, green_hits: 0, expected: 0.0, z_score: 0.0, p_value_one_sided: 1.0 }
    }
}

fn one_sided_p(z: f64) -> f64 {
    0.5 * libm::erfc(z / std::f64::consts::SQRT_2)
}

/// Dense-mask detector: scores every token against the full-vocabulary green/red split.
#[derive(Clone, Debug)]
pub struct StatisticalWatermarkDetector {
    pub context_width: usize,
    pub greenlist_ratio: f64,
}

impl StatisticalWatermarkDetector {
    pub fn new(context_width: usize, greenlist_ratio: f64) -> Self {
        Self { context_width, greenlist_ratio }
    }

    /// Score `token_ids` under `derived_key`, sliding a `context_width`-token
    /// window ahead of each scored position.
    pub fn score(&self, token_ids: &[u64], derived_key: &[u8]) -> StatisticalScore {
        if token_ids.len() <= self.context_width {
            return StatisticalScore::empty();
        }

        let mut hits = 0u64;
        let mut n = 0u64;
        for idx in self.context_width..token_ids.len() {
            let context = &token_ids[idx - self.context_width..idx];
            let seed = derive_context_seed(derived_key, context);
            if token_is_green(token_ids[idx], seed, self.greenlist_ratio) {
                hits += 1;
            }
            n += 1;
        }

        score_from_counts(n, hits, self.greenlist_ratio)
    }
}

fn score_from_counts(n: u64, hits: u64, p: f64) -> StatisticalScore {
    let n_f = n as f64;
    let expected = n_f * p;
    let var = n_f * p * (1.0 - p);
    let z = if var <= 0.0 { 0.0 } else { (hits as f64 - expected) / var.sqrt() };
    StatisticalScore {
        total_scored: n,
        green_hits: hits,
        expected,
        z_score: z,
        p_value_one_sided: one_sided_p(z),
    }
}

/// Pick the `k` lowest-`mix63` token ids under `seed`, for the sparse (top-k
/// biased subset) variant of the watermark. `k` is clamped to
/// `[1, max_bias_tokens, vocab_size]`.
pub fn select_sparse_green_ids(vocab_size: u64, seed: u64, greenlist_ratio: f64, max_bias_tokens: u64) -> Vec<u64> {
    if vocab_size == 0 {
        return Vec::new();
    }
    let k = sparse_k(vocab_size, greenlist_ratio, max_bias_tokens);

    let mut ranked: Vec<(u64, u64)> = (0..vocab_size).map(|tid| (mix63(tid ^ (seed & MASK63)), tid)).collect();
    ranked.sort_unstable();
    ranked.truncate(k as usize);
    ranked.into_iter().map(|(_, tid)| tid).collect()
}

fn sparse_k(vocab_size: u64, greenlist_ratio: f64, max_bias_tokens: u64) -> u64 {
    let raw = (vocab_size as f64 * greenlist_ratio) as u64;
    raw.max(1).min(max_bias_tokens).min(vocab_size)
}

/// Sparse-mask detector: at each position, recomputes only the top-`k`
/// green id set under that position's context seed (cheaper than materializing
/// a dense mask over the whole vocabulary, at the cost of per-token set rebuild).
pub fn score_sparse_watermark(
    token_ids: &[u64],
    derived_key: &[u8],
    vocab_size: u64,
    context_width: usize,
    greenlist_ratio: f64,
    max_bias_tokens: u64,
) -> StatisticalScore {
    if token_ids.len() <= context_width {
        return StatisticalScore::empty();
    }

    let k = sparse_k(vocab_size, greenlist_ratio, max_bias_tokens);
    let p_green = k as f64 / vocab_size as f64;

    let mut hits = 0u64;
    let mut n = 0u64;
    for idx in context_width..token_ids.len() {
        let context = &token_ids[idx - context_width..idx];
        let seed = derive_context_seed(derived_key, context);
        let green_set = select_sparse_green_ids(vocab_size, seed, greenlist_ratio, max_bias_tokens);
        if green_set.contains(&token_ids[idx]) {
            hits += 1;
        }
        n += 1;
    }

    score_from_counts(n, hits, p_green)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{derive_step_key, DEV_MASTER_KEY};

    #[test]
    fn mix63_is_deterministic() {
        assert_eq!(mix63(42), mix63(42));
        assert_ne!(mix63(42), mix63(43));
    }

    #[test]
    fn short_sequence_scores_empty() {
        let detector = StatisticalWatermarkDetector::new(2, 0.5);
        let score = detector.score(&[1, 2], b"key");
        assert_eq!(score.total_scored, 0);
        assert_eq!(score.p_value_one_sided, 1.0);
    }

    #[test]
    fn dense_all_green_sequence_yields_large_z() {
        let key = derive_step_key(DEV_MASTER_KEY, 1, Some("20260225"), 1);
        let detector = StatisticalWatermarkDetector::new(2, 0.5);

        // Build a sequence where, at each step, we pick whichever of two
        // candidate ids is green so the run is watermark-consistent.
        let mut seq = vec![10u64, 11u64];
        for _ in 0..40 {
            let context = seq[seq.len() - 2..].to_vec();
            let seed = derive_context_seed(&key, &context);
            let candidate_a = 100 + seq.len() as u64;
            let candidate_b = 200 + seq.len() as u64;
            let pick = if token_is_green(candidate_a, seed, 0.5) { candidate_a } else { candidate_b };
            seq.push(pick);
        }

        let score = detector.score(&seq, &key);
        assert!(score.z_score > 4.0, "expected strong green bias, got z={}", score.z_score);
        assert!(score.p_value_one_sided < 1e-4);
    }

    #[test]
    fn sparse_k_is_clamped() {
        assert_eq!(sparse_k(1000, 0.5, 50), 50);
        assert_eq!(sparse_k(1000, 0.0001, 50), 1);
        assert_eq!(sparse_k(10, 0.9, 50), 9);
    }

    #[test]
    fn sparse_selection_is_deterministic_and_sized() {
        let ids_a = select_sparse_green_ids(1000, 777, 0.05, 100);
        let ids_b = select_sparse_green_ids(1000, 777, 0.05, 100);
        assert_eq!(ids_a, ids_b);
        assert_eq!(ids_a.len(), 50);
    }

    #[test]
    fn sparse_score_matches_reference_shape() {
        let key = derive_step_key(DEV_MASTER_KEY, 1, Some("20260225"), 1);
        let seq: Vec<u64> = vec![11, 12, 13, 14, 15, 16, 17];
        let score = score_sparse_watermark(&seq, &key, 50000, 2, 0.5, 25000);
        assert_eq!(score.total_scored, 5);
    }
}
