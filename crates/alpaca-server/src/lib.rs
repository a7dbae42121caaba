//! # alpaca-server
//!
//! HTTP front end for a single locally loaded model.
//!
//! Requests become [`Session`]s, which wait in a FIFO [`GenerationQueue`]
//! for the one worker thread that owns the model. Tokens flow back to the
//! handler as they are produced, either collected into one JSON reply
//! (`GET /answer`) or relayed as Server-Sent Events (`GET /answer/stream`).

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod queue;
pub mod server;
pub mod session;
pub mod state;
pub mod streaming;

pub use config::{Cli, Command};
pub use error::ServerError;
pub use queue::{GenerationQueue, QueueConfig, QueueStats};
pub use server::{create_router, run_server};
pub use session::{Session, SessionError, SessionState};
pub use state::{AppState, ServerConfig};
