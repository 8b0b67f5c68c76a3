//! Next-token selection from a vector of vocabulary scores.
//!
//! The policy is applied in a fixed order: top-k masking, then either greedy
//! argmax (`temperature == 0`) or temperature scaling, softmax, nucleus
//! filtering and a weighted draw.

use rand::{
    Rng, SeedableRng,
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
};

use crate::error::ServiceError;

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    /// Fixes the random source; unseeded generators draw from OS entropy.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: None,
            top_p: Some(0.9),
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: None,
            top_p: None,
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(ServiceError::validation(format!(
                "temperature must be a non-negative number, got {}",
                self.temperature
            )));
        }
        if self.top_k == Some(0) {
            return Err(ServiceError::validation("top_k must be at least 1"));
        }
        if let Some(p) = self.top_p {
            if !p.is_finite() || p <= 0.0 || p > 1.0 {
                return Err(ServiceError::validation(format!(
                    "top_p must be in (0, 1], got {p}"
                )));
            }
        }
        Ok(())
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

/// Picks one vocabulary id from `logits`.
pub fn sample_next<R>(
    logits: &[f32],
    params: &SamplingParams,
    rng: &mut R,
) -> Result<u32, ServiceError>
where
    R: Rng + ?Sized,
{
    params.validate()?;
    if logits.is_empty() {
        return Err(ServiceError::Generation("backend returned no scores".into()));
    }

    let mut scores = logits.to_vec();
    if let Some(k) = params.top_k {
        mask_outside_top_k(&mut scores, k);
    }

    if params.is_greedy() {
        return Ok(argmax(&scores));
    }

    for score in scores.iter_mut() {
        *score /= params.temperature;
    }
    let mut probs = softmax(&scores)?;
    if let Some(p) = params.top_p {
        apply_top_p(&mut probs, p);
    }

    let dist = WeightedIndex::new(&probs)
        .map_err(|e| ServiceError::Generation(format!("invalid token distribution: {e}")))?;
    Ok(dist.sample(rng) as u32)
}

/// Forces every score strictly below the k-th largest to negative infinity.
/// Ties with the k-th score survive.
fn mask_outside_top_k(scores: &mut [f32], k: usize) {
    if k >= scores.len() {
        return;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let min_val = sorted[k - 1];
    for score in scores.iter_mut() {
        if *score < min_val {
            *score = f32::NEG_INFINITY;
        }
    }
}

fn argmax(scores: &[f32]) -> u32 {
    let mut best = 0usize;
    let mut best_score = f32::NEG_INFINITY;
    for (idx, &score) in scores.iter().enumerate() {
        if score > best_score {
            best = idx;
            best_score = score;
        }
    }
    best as u32
}

pub(crate) fn softmax(scores: &[f32]) -> Result<Vec<f32>, ServiceError> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return Err(ServiceError::Generation(
            "no finite score to sample from".into(),
        ));
    }
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    Ok(exps.into_iter().map(|e| e / sum).collect())
}

/// Keeps the smallest set of highest-probability entries whose cumulative
/// mass reaches `p` and zeroes the rest.
fn apply_top_p(probs: &mut [f32], p: f32) {
    if p >= 1.0 {
        return;
    }
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cumulative = 0.0f32;
    let mut cutoff = order.len();
    for (rank, &idx) in order.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative >= p {
            cutoff = rank + 1;
            break;
        }
    }
    for &idx in &order[cutoff..] {
        probs[idx] = 0.0;
    }
}
