//! `/answer` query and reply types.

use serde::{Deserialize, Serialize};

/// Query string of `GET /answer` and `GET /answer/stream`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnswerQuery {
    /// Instruction text for the model.
    pub info: Option<String>,
}

/// `{"message": ...}`, used for answers and errors alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub message: String,
}

impl MessageBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
