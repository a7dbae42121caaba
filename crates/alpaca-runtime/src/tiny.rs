//! Byte-level demo model.
//!
//! A single recurrent block over a 256-entry byte vocabulary:
//!
//! ```text
//! h_t    = rms_norm(decay * h_{t-1} + embed[x_t]) * norm
//! logits = lm_head(h_t + down(silu(up(h_t))))
//! ```
//!
//! Weights live in a safetensors artifact with tensors `embed [256, d]`,
//! `mlp.up [d, ff]`, `mlp.down [ff, d]`, `norm [d]` and `lm_head [d, 256]`.
//! Byte 0 ends the stream.

use std::path::Path;

use alpaca_engine::{GenerationError, ModelHandle, SamplingConfig, Token, TokenId, TokenIter};
use alpaca_sampling::Sampler;

use crate::error::{Result, WeightError};
use crate::weights::{write_f32, F32Tensor, SafetensorsFile};

/// Size of the byte vocabulary.
pub const VOCAB_SIZE: usize = 256;

/// End-of-stream token.
pub const EOS_TOKEN: TokenId = 0;

const NORM_EPS: f32 = 1e-5;

/// Shape and recurrence parameters for [`TinyModel`].
#[derive(Debug, Clone, PartialEq)]
pub struct TinyModelConfig {
    pub d_model: usize,
    pub d_ff: usize,
    /// How much of the previous hidden state survives each step.
    pub decay: f32,
    /// Longest rendered prompt, in bytes, the model accepts.
    pub max_context: usize,
}

impl Default for TinyModelConfig {
    fn default() -> Self {
        Self {
            d_model: 32,
            d_ff: 64,
            decay: 0.5,
            max_context: 2048,
        }
    }
}

/// Simple seeded RNG for weight initialization (xorshift64).
struct WeightRng {
    state: u64,
}

impl WeightRng {
    fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    fn next_f32(&mut self) -> f32 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        // Small magnitude weights for stability
        ((self.state >> 40) as f32 / (1u64 << 24) as f32 - 0.5) * 0.2
    }

    fn fill(&mut self, n: usize) -> Vec<f32> {
        (0..n).map(|_| self.next_f32()).collect()
    }
}

pub struct TinyModel {
    name: String,
    pub config: TinyModelConfig,
    embed: Vec<f32>,    // [vocab, d]
    mlp_up: Vec<f32>,   // [d, ff]
    mlp_down: Vec<f32>, // [ff, d]
    norm: Vec<f32>,     // [d]
    lm_head: Vec<f32>,  // [d, vocab]
}

impl TinyModel {
    /// Build a model with deterministic random weights.
    pub fn random(config: TinyModelConfig, seed: u64) -> Self {
        let mut rng = WeightRng::new(seed);
        let d = config.d_model;
        let ff = config.d_ff;

        Self {
            name: format!("tiny-{d}x{ff}"),
            embed: rng.fill(VOCAB_SIZE * d),
            mlp_up: rng.fill(d * ff),
            mlp_down: rng.fill(ff * d),
            norm: vec![1.0; d],
            lm_head: rng.fill(d * VOCAB_SIZE),
            config,
        }
    }

    /// Load weights from a safetensors artifact.
    ///
    /// Fails if the file is unreadable, malformed, or any tensor is missing
    /// or mis-shaped.
    pub fn load(path: &Path) -> Result<Self> {
        let file = SafetensorsFile::open(path)?;

        let embed_shape = file.shape("embed")?.to_vec();
        let d = match embed_shape.as_slice() {
            [VOCAB_SIZE, d] if *d > 0 => *d,
            _ => {
                return Err(WeightError::Shape {
                    name: "embed".into(),
                    expected: vec![VOCAB_SIZE, 0],
                    got: embed_shape.clone(),
                })
            }
        };
        let ff = match file.shape("mlp.up")? {
            [rows, ff] if *rows == d && *ff > 0 => *ff,
            other => {
                return Err(WeightError::Shape {
                    name: "mlp.up".into(),
                    expected: vec![d, 0],
                    got: other.to_vec(),
                })
            }
        };

        let defaults = TinyModelConfig::default();
        let config = TinyModelConfig {
            d_model: d,
            d_ff: ff,
            decay: parse_meta(&file, "decay").unwrap_or(defaults.decay),
            max_context: parse_meta(&file, "max_context").unwrap_or(defaults.max_context),
        };

        let name = file
            .metadata("name")
            .map(str::to_string)
            .or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| format!("tiny-{d}x{ff}"));

        Ok(Self {
            name,
            embed: file.tensor_f32("embed", &[VOCAB_SIZE, d])?,
            mlp_up: file.tensor_f32("mlp.up", &[d, ff])?,
            mlp_down: file.tensor_f32("mlp.down", &[ff, d])?,
            norm: file.tensor_f32("norm", &[d])?,
            lm_head: file.tensor_f32("lm_head", &[d, VOCAB_SIZE])?,
            config,
        })
    }

    /// Write the weights as a safetensors artifact readable by [`TinyModel::load`].
    pub fn save(&self, path: &Path) -> Result<()> {
        let d = self.config.d_model;
        let ff = self.config.d_ff;
        let decay = self.config.decay.to_string();
        let max_context = self.config.max_context.to_string();
        write_f32(
            path,
            &[
                F32Tensor {
                    name: "embed",
                    shape: vec![VOCAB_SIZE, d],
                    data: &self.embed,
                },
                F32Tensor {
                    name: "mlp.up",
                    shape: vec![d, ff],
                    data: &self.mlp_up,
                },
                F32Tensor {
                    name: "mlp.down",
                    shape: vec![ff, d],
                    data: &self.mlp_down,
                },
                F32Tensor {
                    name: "norm",
                    shape: vec![d],
                    data: &self.norm,
                },
                F32Tensor {
                    name: "lm_head",
                    shape: vec![d, VOCAB_SIZE],
                    data: &self.lm_head,
                },
            ],
            &[
                ("name", self.name.as_str()),
                ("decay", decay.as_str()),
                ("max_context", max_context.as_str()),
            ],
        )
    }

    /// Matrix-vector multiply: x @ W where W is [in_dim, out_dim] row-major.
    fn matvec(x: &[f32], w: &[f32], in_dim: usize, out_dim: usize) -> Vec<f32> {
        let mut out = vec![0.0; out_dim];
        for (j, &xj) in x.iter().enumerate().take(in_dim) {
            let row = &w[j * out_dim..(j + 1) * out_dim];
            for (o, &wji) in out.iter_mut().zip(row) {
                *o += xj * wji;
            }
        }
        out
    }

    /// Advance the hidden state by one byte.
    fn step(&self, hidden: &mut [f32], token: usize) {
        let d = self.config.d_model;
        let emb = &self.embed[token * d..(token + 1) * d];
        for (h, &e) in hidden.iter_mut().zip(emb) {
            *h = self.config.decay * *h + e;
        }
        let mean_sq = hidden.iter().map(|v| v * v).sum::<f32>() / d as f32;
        let scale = 1.0 / (mean_sq + NORM_EPS).sqrt();
        for (h, &g) in hidden.iter_mut().zip(&self.norm) {
            *h *= scale * g;
        }
    }

    fn logits(&self, hidden: &[f32]) -> Vec<f32> {
        let d = self.config.d_model;
        let ff = self.config.d_ff;
        let up: Vec<f32> = Self::matvec(hidden, &self.mlp_up, d, ff)
            .into_iter()
            .map(|v| v / (1.0 + (-v).exp()))
            .collect();
        let down = Self::matvec(&up, &self.mlp_down, ff, d);
        let residual: Vec<f32> = hidden.iter().zip(&down).map(|(h, m)| h + m).collect();
        Self::matvec(&residual, &self.lm_head, d, VOCAB_SIZE)
    }
}

fn parse_meta<T: std::str::FromStr>(file: &SafetensorsFile, key: &str) -> Option<T> {
    file.metadata(key).and_then(|v| v.parse().ok())
}

impl ModelHandle for TinyModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(
        &mut self,
        prompt: &str,
        config: &SamplingConfig,
    ) -> alpaca_engine::Result<TokenIter<'_>> {
        let bytes = prompt.as_bytes();
        if bytes.is_empty() {
            return Err(GenerationError::Encoding("prompt encodes to zero tokens".into()));
        }
        if bytes.len() > self.config.max_context {
            return Err(GenerationError::ContextOverflow {
                len: bytes.len(),
                limit: self.config.max_context,
            });
        }

        let mut hidden = vec![0.0; self.config.d_model];
        let mut history = Vec::with_capacity(bytes.len() + config.n_predict);
        if config.feed_prompt {
            for &b in bytes {
                self.step(&mut hidden, b as usize);
                history.push(b as usize);
            }
        } else if let Some(&last) = bytes.last() {
            self.step(&mut hidden, last as usize);
            history.push(last as usize);
        }

        let sampler = Sampler::new()
            .with_temperature(config.temperature)
            .with_top_k(config.top_k)
            .with_top_p(config.top_p)
            .with_repetition_penalty(config.repeat_penalty)
            .with_repeat_last_n(config.repeat_last_n)
            .with_seed(config.seed);

        Ok(Box::new(Generation {
            model: self,
            hidden,
            history,
            sampler,
            remaining: config.n_predict,
            decoder: Utf8Decoder::default(),
            finished: false,
        }))
    }
}

/// One in-flight generation over a borrowed [`TinyModel`].
struct Generation<'a> {
    model: &'a TinyModel,
    hidden: Vec<f32>,
    history: Vec<usize>,
    sampler: Sampler,
    remaining: usize,
    decoder: Utf8Decoder,
    finished: bool,
}

impl Iterator for Generation<'_> {
    type Item = alpaca_engine::Result<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.remaining == 0 {
            return None;
        }

        let logits = self.model.logits(&self.hidden);
        let next = match self.sampler.sample_with_history(&logits, &self.history) {
            Ok(t) => t,
            Err(e) => {
                self.finished = true;
                return Some(Err(GenerationError::Backend(e.to_string())));
            }
        };

        if next as TokenId == EOS_TOKEN {
            return self.end_of_stream().map(Ok);
        }

        self.model.step(&mut self.hidden, next);
        self.history.push(next);
        self.remaining -= 1;

        let mut text = self.decoder.push(next as u8);
        if self.remaining == 0 {
            text.push_str(&self.decoder.finish());
        }
        Some(Ok(Token::new(next as TokenId, text)))
    }
}

impl Generation<'_> {
    /// Stop at EOS, flushing any held-back bytes as a last token under the
    /// id of the byte that started them.
    fn end_of_stream(&mut self) -> Option<Token> {
        self.finished = true;
        let text = self.decoder.finish();
        if text.is_empty() {
            return None;
        }
        let id = self.history.last().copied().unwrap_or_default();
        Some(Token::new(id as TokenId, text))
    }
}

/// Incremental UTF-8 decoder for byte tokens.
///
/// Holds back the bytes of an incomplete character; invalid sequences
/// become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Feed one byte, returning whatever text is now complete.
    pub fn push(&mut self, byte: u8) -> String {
        self.pending.push(byte);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush held-back bytes as lossy text.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> TinyModel {
        TinyModel::random(TinyModelConfig::default(), 12345)
    }

    fn run(model: &mut TinyModel, prompt: &str, config: &SamplingConfig) -> Vec<Token> {
        model
            .generate(prompt, config)
            .unwrap()
            .collect::<alpaca_engine::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn logits_cover_vocab_and_are_finite() {
        let m = model();
        let mut h = vec![0.0; m.config.d_model];
        m.step(&mut h, b'a' as usize);
        let logits = m.logits(&h);
        assert_eq!(logits.len(), VOCAB_SIZE);
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn generation_respects_budget() {
        let mut m = model();
        let config = SamplingConfig::default().with_n_predict(5).with_temperature(0.8);
        assert!(run(&mut m, "hello", &config).len() <= 5);
    }

    #[test]
    fn same_seed_same_output() {
        let mut m = model();
        let config = SamplingConfig::default().with_temperature(0.9).with_seed(7);
        let a = run(&mut m, "Say hello", &config);
        let b = run(&mut m, "Say hello", &config);
        assert_eq!(a, b);
    }

    #[test]
    fn eos_never_emitted() {
        let mut m = model();
        let config = SamplingConfig::default().with_temperature(1.0).with_top_k(0);
        for seed in 0..20 {
            let tokens = run(&mut m, "abc", &config.clone().with_seed(seed));
            assert!(tokens.iter().all(|t| t.id != EOS_TOKEN));
        }
    }

    #[test]
    fn eos_flushes_incomplete_character() {
        let m = model();
        let mut generation = Generation {
            model: &m,
            hidden: vec![0.0; m.config.d_model],
            history: vec![0xE2],
            sampler: Sampler::new(),
            remaining: 4,
            decoder: Utf8Decoder::default(),
            finished: false,
        };
        assert_eq!(generation.decoder.push(0xE2), "");

        let last = generation.end_of_stream().unwrap();
        assert_eq!(last.text, "\u{FFFD}");
        assert_eq!(last.id, 0xE2);
        assert!(generation.next().is_none());
        assert!(generation.end_of_stream().is_none());
    }

    #[test]
    fn context_overflow_rejected() {
        let mut m = TinyModel::random(
            TinyModelConfig {
                max_context: 8,
                ..TinyModelConfig::default()
            },
            1,
        );
        let err = m
            .generate("way more than eight bytes", &SamplingConfig::default())
            .err()
            .unwrap();
        assert_eq!(err, GenerationError::ContextOverflow { len: 25, limit: 8 });
    }

    #[test]
    fn feed_prompt_changes_starting_state() {
        let mut m = model();
        let greedy = SamplingConfig::default().with_temperature(0.0).with_n_predict(16);
        let fed = run(&mut m, "xyz", &greedy);
        let unfed = run(&mut m, "xyz", &greedy.clone().with_feed_prompt(false));
        let only_last = run(&mut m, "z", &greedy);
        assert_eq!(unfed, only_last);
        assert!(fed.len() <= 16);
    }

    #[test]
    fn decoder_holds_back_partial_chars() {
        let mut d = Utf8Decoder::default();
        let bytes = "é".as_bytes();
        assert_eq!(d.push(bytes[0]), "");
        assert_eq!(d.push(bytes[1]), "é");
        assert_eq!(d.push(b'a'), "a");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut d = Utf8Decoder::default();
        assert_eq!(d.push(0xff), "\u{FFFD}");
        assert_eq!(d.push(0xc3), "");
        assert_eq!(d.push(b'x'), "\u{FFFD}x");
        assert_eq!(d.push(0xe2), "");
        assert_eq!(d.finish(), "\u{FFFD}");
    }
}
