//! # alpaca-engine
//!
//! The "narrow waist" of the alpaca.rs stack. Defines the [`ModelHandle`] trait
//! and the types every other crate agrees on: tokens, generation errors,
//! sampling configuration and the instruction prompt template. Backends plug in
//! behind [`ModelHandle`] without the queue or the HTTP layer knowing which
//! one is loaded.
//!
//! ## Design Notes
//!
//! ### Single writer
//! [`ModelHandle::generate`] takes `&mut self`. A handle is owned by exactly
//! one generation worker, so two generations can never run against the same
//! model state at once. Nothing else in the process holds a reference capable
//! of calling `generate`.
//!
//! ### Pull-based output
//! `generate` returns a lazy [`TokenIter`]. The caller decides when to pull
//! the next token, which is where cancellation is checked.

pub mod config;
pub mod prompt;

pub use config::{SamplingConfig, MAX_PREDICT, MAX_REPEAT_LAST_N};
pub use prompt::{Prompt, PromptTemplate, ALPACA_PREFIX, ALPACA_SUFFIX};

pub type Result<T> = std::result::Result<T, GenerationError>;

/// Token ID type. Byte-level backends use `0..=255`.
pub type TokenId = u32;

/// Atomic unit of generated output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub id: TokenId,
    /// Decoded text for this token. May be empty while a multi-byte
    /// character is still incomplete.
    pub text: String,
}

impl Token {
    pub fn new(id: TokenId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
        }
    }
}

/// Failure raised by a model while producing tokens.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("malformed prompt encoding: {0}")]
    Encoding(String),
    #[error("prompt of {len} tokens exceeds context limit {limit}")]
    ContextOverflow { len: usize, limit: usize },
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Input rejected before it reaches the queue.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("{field} = {value} is out of range (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Lazy, finite, non-restartable token sequence produced by one generation.
///
/// Each call to `next` yields a token, ends the stream with `None`, or
/// yields a [`GenerationError`]. Consumers stop pulling after the first error.
pub type TokenIter<'a> = Box<dyn Iterator<Item = Result<Token>> + Send + 'a>;

/// A loaded model, exposed as a single-call-at-a-time generation capability.
pub trait ModelHandle: Send {
    /// Human-readable model name for logs and health reporting.
    fn name(&self) -> &str;

    /// Start generating a completion for an already-templated prompt.
    ///
    /// The returned iterator borrows the handle mutably, so a second
    /// generation cannot start until the first one is dropped.
    fn generate(&mut self, prompt: &str, config: &SamplingConfig) -> Result<TokenIter<'_>>;
}

impl<M: ModelHandle + ?Sized> ModelHandle for Box<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn generate(&mut self, prompt: &str, config: &SamplingConfig) -> Result<TokenIter<'_>> {
        (**self).generate(prompt, config)
    }
}
