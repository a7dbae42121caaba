//! Application state and configuration.

use std::time::Duration;

use alpaca_engine::SamplingConfig;

use crate::queue::GenerationQueue;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Front door to the single generation worker.
    pub queue: GenerationQueue,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(queue: GenerationQueue, config: ServerConfig) -> Self {
        Self { queue, config }
    }
}

/// Per-request behaviour of the HTTP layer.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Wall-clock cap on one request, waiting time in the queue included.
    pub request_timeout: Duration,
    /// Sampling parameters applied to every request.
    pub sampling: SamplingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            sampling: SamplingConfig::default(),
        }
    }
}
