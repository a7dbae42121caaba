//! # alpaca-sampling
//!
//! Turns a logits vector into one token id.
//!
//! The pipeline runs in a fixed order:
//!
//! 1. repetition penalty over the last `repeat_last_n` history entries
//! 2. temperature (0 short-circuits to argmax)
//! 3. top-k truncation
//! 4. softmax
//! 5. top-p (nucleus) truncation
//! 6. a draw from the remaining mass with a seeded xorshift RNG

use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("logits must not be empty")]
    InvalidLogits,
    #[error("temperature must be finite and >= 0")]
    InvalidTemperature,
    #[error("no candidate token left after filtering")]
    NoValidTokens,
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// xorshift64 generator. The same seed always yields the same draws.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // xorshift is stuck at zero
        Self {
            state: seed.max(1),
        }
    }

    /// Next value in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// A token id with its current score.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: usize,
    score: f32,
}

/// Highest score first; equal scores keep the lower id first.
fn by_score_desc(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(a.id.cmp(&b.id))
}

/// Configurable token sampler.
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    /// 0 disables the filter.
    top_k: usize,
    /// Values >= 1 disable the filter.
    top_p: f32,
    /// 1.0 disables the penalty.
    repeat_penalty: f32,
    repeat_last_n: usize,
    rng: SeededRng,
}

impl Sampler {
    /// Plain softmax sampling at temperature 1 with no filters.
    pub fn new() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            repeat_penalty: 1.0,
            repeat_last_n: usize::MAX,
            rng: SeededRng::new(42),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    /// Divide positive (multiply negative) logits of recently seen tokens.
    pub fn with_repetition_penalty(mut self, penalty: f32) -> Self {
        self.repeat_penalty = penalty;
        self
    }

    /// Only the last `n` history entries count for the penalty.
    pub fn with_repeat_last_n(mut self, n: usize) -> Self {
        self.repeat_last_n = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SeededRng::new(seed);
        self
    }

    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<usize> {
        self.sample_with_history(logits, &[])
    }

    /// Sample with the repetition penalty applied to the tail of `history`.
    pub fn sample_with_history(
        &mut self,
        logits: &[f32],
        history: &[usize],
    ) -> SamplingResult<usize> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SamplingError::InvalidTemperature);
        }

        let mut candidates: Vec<Candidate> = logits
            .iter()
            .enumerate()
            .map(|(id, &score)| Candidate { id, score })
            .collect();

        let window = history.len().min(self.repeat_last_n);
        self.penalize(&mut candidates, &history[history.len() - window..]);

        if self.temperature == 0.0 {
            return Ok(argmax(&candidates));
        }
        for c in &mut candidates {
            c.score /= self.temperature;
        }

        candidates.sort_by(by_score_desc);
        if self.top_k > 0 {
            candidates.truncate(self.top_k);
        }

        softmax(&mut candidates);
        if self.top_p < 1.0 {
            nucleus(&mut candidates, self.top_p);
        }

        self.draw(&candidates)
    }

    fn penalize(&self, candidates: &mut [Candidate], recent: &[usize]) {
        if self.repeat_penalty == 1.0 || recent.is_empty() {
            return;
        }
        let mut seen = vec![false; candidates.len()];
        for &id in recent {
            // Each distinct token is penalized once.
            let Some(flag) = seen.get_mut(id) else { continue };
            if std::mem::replace(flag, true) {
                continue;
            }
            let c = &mut candidates[id];
            if c.score > 0.0 {
                c.score /= self.repeat_penalty;
            } else {
                c.score *= self.repeat_penalty;
            }
        }
    }

    /// Pick from normalized candidates, falling back to the last one with
    /// mass when rounding leaves the draw above the total.
    fn draw(&mut self, candidates: &[Candidate]) -> SamplingResult<usize> {
        let r = self.rng.next_f32();
        let mut acc = 0.0;
        for c in candidates {
            acc += c.score;
            if r < acc {
                return Ok(c.id);
            }
        }
        candidates
            .iter()
            .rev()
            .find(|c| c.score > 0.0)
            .map(|c| c.id)
            .ok_or(SamplingError::NoValidTokens)
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Id of the highest score, lowest id on ties.
fn argmax(candidates: &[Candidate]) -> usize {
    candidates
        .iter()
        .copied()
        .reduce(|best, c| if c.score > best.score { c } else { best })
        .map_or(0, |c| c.id)
}

/// Replace scores with probabilities.
fn softmax(candidates: &mut [Candidate]) {
    let max = candidates
        .iter()
        .map(|c| c.score)
        .fold(f32::NEG_INFINITY, f32::max);
    let mut total = 0.0;
    for c in candidates.iter_mut() {
        c.score = (c.score - max).exp();
        total += c.score;
    }
    if total > 0.0 && total.is_finite() {
        for c in candidates.iter_mut() {
            c.score /= total;
        }
    } else {
        let uniform = 1.0 / candidates.len() as f32;
        for c in candidates.iter_mut() {
            c.score = uniform;
        }
    }
}

/// Keep the shortest prefix of sorted candidates whose mass reaches `p`,
/// then renormalize.
fn nucleus(candidates: &mut Vec<Candidate>, p: f32) {
    let mut acc = 0.0;
    let mut keep = candidates.len();
    for (i, c) in candidates.iter().enumerate() {
        acc += c.score;
        if acc >= p {
            keep = i + 1;
            break;
        }
    }
    candidates.truncate(keep.max(1));

    let total: f32 = candidates.iter().map(|c| c.score).sum();
    if total > 0.0 {
        for c in candidates.iter_mut() {
            c.score /= total;
        }
    }
}
