//! Request and response bodies.

pub mod answer;
pub mod health;

pub use answer::{AnswerQuery, MessageBody};
pub use health::HealthResponse;
