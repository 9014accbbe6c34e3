use std::fmt;

use derivative::Derivative;
use serde::{Deserialize, Serialize};

pub mod completion;
pub mod config;
pub mod engine;
pub mod manager;
pub mod reconcile;
mod registry;
mod release;
pub mod stream;

pub use completion::{Completer, Completion, CompletionError};
pub use config::ManagerConfig;
pub use engine::{Engine, IncrementalCallback, Session};
pub use manager::RequestManager;
pub use stream::{ResultStream, Subscription};

/// Identifier of one generation request. Never reused once issued.
#[derive(
    Derivative, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[derivative(Debug = "transparent")]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    /// Time-ordered (UUID7), so ids sort in start order.
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model finished and its output was delivered.
    Stop,
    /// Generation failed; the text carries the error description.
    Error,
    /// Generation ended without any output.
    Empty,
    /// The request was cancelled.
    Cancelled,
    /// Still in progress.
    #[default]
    Null,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Error => "error",
            FinishReason::Empty => "empty",
            FinishReason::Cancelled => "cancelled",
            FinishReason::Null => "null",
        }
    }
}

/// One unit of streamed output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialResult {
    pub request_id: RequestId,
    pub text: String,
    /// Set on the single terminal event of a request.
    pub done: bool,
    pub reason: FinishReason,
}

impl PartialResult {
    pub fn fragment(request_id: RequestId, text: impl Into<String>) -> Self {
        Self {
            request_id,
            text: text.into(),
            done: false,
            reason: FinishReason::Null,
        }
    }

    pub fn terminal(request_id: RequestId, text: impl Into<String>, reason: FinishReason) -> Self {
        Self {
            request_id,
            text: text.into(),
            done: true,
            reason,
        }
    }

    /// The sentinel pushed when a request is cancelled.
    pub fn cancelled(request_id: RequestId) -> Self {
        Self::terminal(request_id, "", FinishReason::Cancelled)
    }

    /// The sentinel pushed when generation produced nothing usable.
    pub fn no_output(request_id: RequestId) -> Self {
        Self::terminal(request_id, "", FinishReason::Empty)
    }
}

/// Sampling parameters handed to the engine when a session is created.
///
/// The engine is authoritative for accepted ranges; nothing here is validated.
#[derive(Debug, Derivative, Clone, PartialEq, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct SamplingParams {
    #[derivative(Default(value = "40"))]
    pub top_k: usize,
    #[derivative(Default(value = "0.8"))]
    pub temperature: f32,
    /// Optional random seed for reproducible sampling.
    pub seed: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique_and_ordered() {
        let first = RequestId::new();
        let second = RequestId::new();
        assert_ne!(first, second);
        assert!(first < second);
    }

    #[test]
    fn test_sentinels_are_terminal() {
        let id = RequestId::new();
        let cancelled = PartialResult::cancelled(id);
        assert!(cancelled.done);
        assert_eq!(cancelled.reason, FinishReason::Cancelled);
        assert!(cancelled.text.is_empty());

        let empty = PartialResult::no_output(id);
        assert!(empty.done);
        assert_eq!(empty.reason, FinishReason::Empty);

        let fragment = PartialResult::fragment(id, "Hel");
        assert!(!fragment.done);
        assert_eq!(fragment.reason, FinishReason::Null);
    }

    #[test]
    fn test_sampling_params_defaults() {
        let params = SamplingParams::default();
        assert_eq!(params.top_k, 40);
        assert_eq!(params.temperature, 0.8);
        assert_eq!(params.seed, None);
    }
}
