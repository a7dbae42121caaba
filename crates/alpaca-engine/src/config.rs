//! Sampling configuration and its valid ranges.

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Upper bound on `n_predict`.
pub const MAX_PREDICT: usize = 4096;

/// Upper bound on `repeat_last_n`.
pub const MAX_REPEAT_LAST_N: usize = 4096;

/// Parameters controlling randomness, length and repetition of a generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Maximum number of tokens to predict.
    pub n_predict: usize,
    /// Softmax temperature. 0.0 selects the most likely token.
    pub temperature: f32,
    /// Nucleus sampling threshold in `(0, 1]`.
    pub top_p: f32,
    /// Keep only the `top_k` most likely tokens. 0 disables the filter.
    pub top_k: usize,
    /// Penalty applied to recently generated tokens. 1.0 disables it.
    pub repeat_penalty: f32,
    /// How many trailing tokens the repeat penalty looks at.
    pub repeat_last_n: usize,
    /// RNG seed for reproducible sampling.
    pub seed: u64,
    /// Run the prompt through the model before sampling begins.
    pub feed_prompt: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            n_predict: 128,
            temperature: 0.2,
            top_p: 1.0,
            top_k: 40,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
            seed: 0,
            feed_prompt: true,
        }
    }
}

impl SamplingConfig {
    pub fn with_n_predict(mut self, n: usize) -> Self {
        self.n_predict = n;
        self
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    pub fn with_repeat_penalty(mut self, penalty: f32, last_n: usize) -> Self {
        self.repeat_penalty = penalty;
        self.repeat_last_n = last_n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_feed_prompt(mut self, feed: bool) -> Self {
        self.feed_prompt = feed;
        self
    }

    /// Check every numeric field against its valid range.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.n_predict == 0 || self.n_predict > MAX_PREDICT {
            return Err(out_of_range("n_predict", self.n_predict, "1..=4096"));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(out_of_range("temperature", self.temperature, ">= 0"));
        }
        if !self.top_p.is_finite() || self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(out_of_range("top_p", self.top_p, "(0, 1]"));
        }
        if !self.repeat_penalty.is_finite() || self.repeat_penalty <= 0.0 {
            return Err(out_of_range("repeat_penalty", self.repeat_penalty, "> 0"));
        }
        if self.repeat_last_n > MAX_REPEAT_LAST_N {
            return Err(out_of_range(
                "repeat_last_n",
                self.repeat_last_n,
                "0..=4096",
            ));
        }
        Ok(())
    }
}

fn out_of_range(
    field: &'static str,
    value: impl ToString,
    expected: &'static str,
) -> ValidationError {
    ValidationError::OutOfRange {
        field,
        value: value.to_string(),
        expected,
    }
}
