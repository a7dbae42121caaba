//! HTTP request handlers.

pub mod answer;
pub mod health;

pub use answer::{handle_answer, handle_answer_stream};
pub use health::handle_health;
