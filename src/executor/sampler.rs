//! Internal sampler: greedy / top-k / top-p selection over one candidate's
//! logit row. A pure function over a logits slice, since the compiled model
//! is consumed only through `ModelRunner`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// rand 0.10 renamed `Rng::gen_range` to `Rng::random_range`.

use crate::types::SamplerParams;

/// Samples one token id from a single candidate's logit row (already
/// constraint-masked by the caller).
pub fn sample(logits: &[f32], params: &SamplerParams, rng_seed_offset: u64) -> u32 {
    match params {
        SamplerParams::Greedy | SamplerParams::Unspecified => argmax(logits),
        SamplerParams::TopK { k } => {
            let mut rng = StdRng::seed_from_u64(rng_seed_offset);
            top_k(logits, *k as usize, &mut rng)
        }
        SamplerParams::TopP {
            k,
            p,
            temperature,
            seed,
        } => {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(rng_seed_offset));
            top_p(logits, *k as usize, *p, *temperature, &mut rng)
        }
    }
}

fn argmax(logits: &[f32]) -> u32 {
    let mut best_idx = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (idx, &val) in logits.iter().enumerate() {
        if val > best_val {
            best_val = val;
            best_idx = idx;
        }
    }
    best_idx as u32
}

fn top_k_indices(logits: &[f32], k: usize) -> Vec<usize> {
    let k = k.max(1).min(logits.len());
    let mut indices: Vec<usize> = (0..logits.len()).collect();
    indices.sort_unstable_by(|&a, &b| logits[b].partial_cmp(&logits[a]).unwrap());
    indices.truncate(k);
    indices
}

fn softmax(values: &[f32], temperature: f32) -> Vec<f32> {
    let temp = if temperature > 0.0 { temperature } else { 1.0 };
    let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = values.iter().map(|v| ((v - max) / temp).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 {
        vec![1.0 / values.len().max(1) as f32; values.len()]
    } else {
        exps.into_iter().map(|e| e / sum).collect()
    }
}

fn top_k(logits: &[f32], k: usize, rng: &mut StdRng) -> u32 {
    let indices = top_k_indices(logits, k);
    let values: Vec<f32> = indices.iter().map(|&i| logits[i]).collect();
    let probs = softmax(&values, 1.0);
    pick_weighted(&indices, &probs, rng)
}

fn top_p(logits: &[f32], k: usize, p: f32, temperature: f32, rng: &mut StdRng) -> u32 {
    let candidate_indices = top_k_indices(logits, k.max(1));
    let values: Vec<f32> = candidate_indices.iter().map(|&i| logits[i]).collect();
    let probs = softmax(&values, temperature);

    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_unstable_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap());

    let mut cumulative = 0.0f32;
    let mut cutoff = order.len();
    for (rank, &idx) in order.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative >= p {
            cutoff = rank + 1;
            break;
        }
    }
    let nucleus: Vec<usize> = order[..cutoff].to_vec();
    let nucleus_probs: Vec<f32> = nucleus.iter().map(|&rank_idx| probs[rank_idx]).collect();
    let nucleus_global: Vec<usize> = nucleus.iter().map(|&i| candidate_indices[i]).collect();
    pick_weighted(&nucleus_global, &renormalize(&nucleus_probs), rng)
}

fn renormalize(probs: &[f32]) -> Vec<f32> {
    let sum: f32 = probs.iter().sum();
    if sum <= 0.0 {
        vec![1.0 / probs.len().max(1) as f32; probs.len()]
    } else {
        probs.iter().map(|p| p / sum).collect()
    }
}

fn pick_weighted(indices: &[usize], probs: &[f32], rng: &mut StdRng) -> u32 {
    let draw: f32 = rng.random_range(0.0..1.0);
    let mut cumulative = 0.0;
    for (&idx, &prob) in indices.iter().zip(probs.iter()) {
        cumulative += prob;
        if draw <= cumulative {
            return idx as u32;
        }
    }
    *indices.last().unwrap_or(&0) as u32
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn greedy_picks_the_max_logit() {
        let logits = vec![0.1, 5.0, -1.0, 2.0];
        assert_eq!(sample(&logits, &SamplerParams::Greedy, 0), 1);
    }

    #[test]
    fn top_k_is_deterministic_for_a_fixed_seed() {
        let logits = vec![0.1, 5.0, -1.0, 2.0, 3.0];
        let params = SamplerParams::TopK { k: 2 };
        let a = sample(&logits, &params, 7);
        let b = sample(&logits, &params, 7);
        assert_eq!(a, b);
    }

    #[test]
    fn top_p_stays_within_the_nucleus() {
        let logits = vec![10.0, 9.9, -5.0, -5.0];
        let params = SamplerParams::TopP {
            k: 4,
            p: 0.5,
            temperature: 1.0,
            seed: 42,
        };
        let picked = sample(&logits, &params, 0);
        assert!(picked == 0 || picked == 1);
    }
}
