//! Deterministic scripted backend for tests and local development.
//!
//! Replies with a fixed word script, optionally preceded by the words of the
//! prompt's instruction, pausing between tokens or failing part-way
//! through. A shared
//! [`ScriptProbe`] records what the backend saw.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alpaca_engine::{
    GenerationError, ModelHandle, SamplingConfig, Token, TokenIter, ALPACA_PREFIX, ALPACA_SUFFIX,
};

/// Observations shared between a [`ScriptedModel`] and the test holding it.
#[derive(Debug, Default)]
pub struct ScriptProbe {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    tokens_emitted: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptProbe {
    /// Number of `generate` calls that returned a stream.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of streams alive at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Streams currently alive.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn tokens_emitted(&self) -> usize {
        self.tokens_emitted.load(Ordering::SeqCst)
    }

    /// Prompts in the order generation started.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

pub struct ScriptedModel {
    name: String,
    words: Vec<String>,
    token_delay: Duration,
    fail_after: Option<usize>,
    echo: bool,
    probe: Arc<ScriptProbe>,
}

impl ScriptedModel {
    /// Reply with `script`, one whitespace-separated word per token.
    pub fn new(script: &str) -> Self {
        Self {
            name: "scripted".to_string(),
            words: script.split_whitespace().map(str::to_string).collect(),
            token_delay: Duration::ZERO,
            fail_after: None,
            echo: false,
            probe: Arc::new(ScriptProbe::default()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sleep this long before producing each token.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Yield a backend error after `n` tokens.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Start each reply by repeating the instruction found in the prompt.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn probe(&self) -> Arc<ScriptProbe> {
        Arc::clone(&self.probe)
    }

    /// Token texts produced for `prompt` under a given budget.
    pub fn expected_texts(&self, prompt: &str, n_predict: usize) -> Vec<String> {
        let echoed: Vec<&str> = if self.echo {
            instruction_of(prompt).split_whitespace().collect()
        } else {
            Vec::new()
        };
        echoed
            .into_iter()
            .chain(self.words.iter().map(String::as_str))
            .take(n_predict)
            .enumerate()
            .map(|(i, w)| if i == 0 { w.to_string() } else { format!(" {w}") })
            .collect()
    }
}

/// The instruction inside an Alpaca-rendered prompt, or the whole prompt.
fn instruction_of(prompt: &str) -> &str {
    prompt
        .strip_prefix(ALPACA_PREFIX)
        .and_then(|rest| rest.strip_suffix(ALPACA_SUFFIX))
        .unwrap_or(prompt)
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new("Hello! How can I help you today?")
    }
}

impl ModelHandle for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(
        &mut self,
        prompt: &str,
        config: &SamplingConfig,
    ) -> alpaca_engine::Result<TokenIter<'_>> {
        if prompt.contains('\0') {
            return Err(GenerationError::Encoding("NUL byte in prompt".into()));
        }

        if let Ok(mut prompts) = self.probe.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(ScriptStream {
            texts: self.expected_texts(prompt, config.n_predict).into_iter(),
            index: 0,
            delay: self.token_delay,
            fail_after: self.fail_after,
            failed: false,
            probe: Arc::clone(&self.probe),
        }))
    }
}

struct ScriptStream {
    texts: std::vec::IntoIter<String>,
    index: usize,
    delay: Duration,
    fail_after: Option<usize>,
    failed: bool,
    probe: Arc<ScriptProbe>,
}

impl Iterator for ScriptStream {
    type Item = alpaca_engine::Result<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.fail_after == Some(self.index) {
            self.failed = true;
            return Some(Err(GenerationError::Backend(format!(
                "scripted failure after {} tokens",
                self.index
            ))));
        }
        let text = self.texts.next()?;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let token = Token::new(self.index as u32, text);
        self.index += 1;
        self.probe.tokens_emitted.fetch_add(1, Ordering::SeqCst);
        Some(Ok(token))
    }
}

impl Drop for ScriptStream {
    fn drop(&mut self) {
        self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
