use serde::Serialize;

use crate::queue::QueueStats;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model: String,
    pub queue: QueueStats,
}
