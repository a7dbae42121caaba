//! Per-generation timing hooks.
//!
//! - [`GenerationMetrics`]: TTFT, tokens/sec and token counts for one run
//! - [`TelemetryHook`]: callbacks fired while a generation runs
//! - [`GenerationTimer`]: records timestamps and computes metrics
//! - [`NoopTelemetry`], [`TracingTelemetry`], [`RecordingTelemetry`]: built-in hooks

use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Summary of one generation run.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationMetrics {
    /// Model that served the run.
    pub model: String,
    /// Length of the rendered prompt in bytes.
    pub prompt_bytes: usize,
    /// Time from start until the first token was ready, in milliseconds.
    pub ttft_ms: f64,
    /// Decode throughput, excluding the wait for the first token.
    pub tokens_per_sec: f64,
    pub generated_tokens: usize,
    pub total_time_ms: f64,
}

/// Callbacks fired while a generation runs.
///
/// Every method defaults to a no-op so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    fn on_first_token(&self, _ttft_ms: f64) {}

    fn on_token(&self, _index: usize, _elapsed_ms: f64) {}

    fn on_complete(&self, _metrics: &GenerationMetrics) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Emits one `tracing` event per completed generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetryHook for TracingTelemetry {
    fn on_first_token(&self, ttft_ms: f64) {
        tracing::debug!(ttft_ms, "first token ready");
    }

    fn on_complete(&self, m: &GenerationMetrics) {
        tracing::info!(
            model = %m.model,
            prompt_bytes = m.prompt_bytes,
            generated_tokens = m.generated_tokens,
            ttft_ms = format_args!("{:.1}", m.ttft_ms),
            tokens_per_sec = format_args!("{:.1}", m.tokens_per_sec),
            total_ms = format_args!("{:.1}", m.total_time_ms),
            "generation finished"
        );
    }
}

/// Keeps every completed run's metrics for later inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingTelemetry {
    runs: Arc<Mutex<Vec<GenerationMetrics>>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<GenerationMetrics> {
        self.runs.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn last(&self) -> Option<GenerationMetrics> {
        self.runs.lock().ok().and_then(|r| r.last().cloned())
    }
}

impl TelemetryHook for RecordingTelemetry {
    fn on_complete(&self, metrics: &GenerationMetrics) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.push(metrics.clone());
        }
    }
}

/// Records timestamps for one generation and reports to a shared hook.
///
/// Call [`GenerationTimer::mark_token`] after each token and
/// [`GenerationTimer::finish`] once the stream ends, whatever the outcome.
pub struct GenerationTimer {
    model: String,
    prompt_bytes: usize,
    start: Instant,
    first_token: Option<Instant>,
    token_count: usize,
    hook: Arc<dyn TelemetryHook>,
}

impl GenerationTimer {
    pub fn new(model: impl Into<String>, prompt_bytes: usize, hook: Arc<dyn TelemetryHook>) -> Self {
        Self {
            model: model.into(),
            prompt_bytes,
            start: Instant::now(),
            first_token: None,
            token_count: 0,
            hook,
        }
    }

    /// Count one produced token. The first call also fires `on_first_token`.
    pub fn mark_token(&mut self) {
        let now = Instant::now();
        if self.first_token.is_none() {
            self.first_token = Some(now);
            self.hook
                .on_first_token(now.duration_since(self.start).as_secs_f64() * 1000.0);
        }
        self.token_count += 1;
        self.hook
            .on_token(self.token_count, now.duration_since(self.start).as_secs_f64() * 1000.0);
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    /// Compute metrics and fire `on_complete`.
    pub fn finish(self) -> GenerationMetrics {
        let total_time_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        let ttft_ms = self
            .first_token
            .map(|t| t.duration_since(self.start).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        // The first token is part of the prefill wait.
        let decode_ms = total_time_ms - ttft_ms;
        let decoded = self.token_count.saturating_sub(1);
        let tokens_per_sec = if decode_ms > 0.0 && decoded > 0 {
            decoded as f64 / (decode_ms / 1000.0)
        } else {
            0.0
        };

        let metrics = GenerationMetrics {
            model: self.model,
            prompt_bytes: self.prompt_bytes,
            ttft_ms,
            tokens_per_sec,
            generated_tokens: self.token_count,
            total_time_ms,
        };
        self.hook.on_complete(&metrics);
        metrics
    }
}
