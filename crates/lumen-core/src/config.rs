use std::time::Duration;

use derivative::Derivative;
use serde::{Deserialize, Serialize};

#[derive(Debug, Derivative, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct ManagerConfig {
    /// Events buffered per subscriber before the oldest are dropped.
    #[derivative(Default(value = "256"))]
    pub stream_capacity: usize,
    /// Maximum characters per paced chunk when the final text is replayed.
    #[derivative(Default(value = "48"))]
    pub chunk_size: usize,
    /// Delay between paced chunks, in milliseconds.
    #[derivative(Default(value = "30"))]
    pub chunk_delay_ms: u64,
    /// Bounded wait when reading the completion handle, in milliseconds.
    #[derivative(Default(value = "2000"))]
    pub completion_timeout_ms: u64,
}

impl ManagerConfig {
    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }
}
