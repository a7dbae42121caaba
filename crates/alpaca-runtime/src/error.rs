//! Error types for loading model artifacts.

use thiserror::Error;

/// Failure while opening, parsing or writing a weight file.
#[derive(Error, Debug)]
pub enum WeightError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed weight file: {0}")]
    Format(String),

    #[error("tensor '{0}' not found")]
    MissingTensor(String),

    #[error("tensor '{name}' has dtype {dtype}, expected F32")]
    Dtype { name: String, dtype: String },

    #[error("tensor '{name}' has shape {got:?}, expected {expected:?}")]
    Shape {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
}

pub type Result<T> = std::result::Result<T, WeightError>;
