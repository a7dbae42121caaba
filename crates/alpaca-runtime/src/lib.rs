//! # alpaca-runtime
//!
//! Concrete [`ModelHandle`](alpaca_engine::ModelHandle) backends for alpaca.rs,
//! the safetensors weight loader they share, and per-generation telemetry
//! hooks (TTFT, tok/s).

pub mod error;
pub mod scripted;
pub mod telemetry;
pub mod tiny;
pub mod weights;

use std::fmt;
use std::path::Path;

use alpaca_engine::ModelHandle;

pub use error::{Result, WeightError};
pub use scripted::{ScriptProbe, ScriptedModel};
pub use telemetry::{
    GenerationMetrics, GenerationTimer, NoopTelemetry, RecordingTelemetry, TelemetryHook,
    TracingTelemetry,
};
pub use tiny::{TinyModel, TinyModelConfig, Utf8Decoder};

/// Which backend serves generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Byte-level model loaded from a safetensors artifact.
    #[default]
    Tiny,
    /// Canned reply, no weights needed.
    Scripted,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Tiny => write!(f, "tiny"),
            Backend::Scripted => write!(f, "scripted"),
        }
    }
}

/// Load a model for `backend`. `path` is ignored by [`Backend::Scripted`].
pub fn load_model(backend: Backend, path: &Path) -> Result<Box<dyn ModelHandle>> {
    let model: Box<dyn ModelHandle> = match backend {
        Backend::Tiny => Box::new(TinyModel::load(path)?),
        Backend::Scripted => Box::new(ScriptedModel::default()),
    };
    tracing::info!(%backend, model = model.name(), path = %path.display(), "model loaded");
    Ok(model)
}
