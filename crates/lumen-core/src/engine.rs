//! Contract with the inference engine.
//!
//! The manager only ever talks to a model through these traits. Calls may be
//! blocking native calls; callbacks and completions arrive on engine-managed
//! threads.

use std::sync::Arc;

use anyhow::Result;

use crate::{completion::Completion, SamplingParams};

/// Incremental output callback: `(fragment, done)`.
///
/// Invoked from arbitrary engine threads, possibly concurrently with the
/// completion resolving. Must not block.
pub type IncrementalCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// A loaded model. Owned by the composition root and shared with the manager.
pub trait Engine: Send + Sync {
    /// Allocate a fresh generation context.
    fn create_session(&self, params: &SamplingParams) -> Result<Box<dyn Session>>;

    /// Free the model. Called once on manager shutdown.
    fn release(&self) -> Result<()>;
}

/// One single-use generation context.
pub trait Session: Send + Sync {
    /// Submit the prompt. A session accepts exactly one query.
    fn submit_query(&self, text: &str) -> Result<()>;

    /// Start generating in the background and return the terminal handle.
    fn generate_async(&self, callback: IncrementalCallback) -> Result<Completion>;

    /// Best-effort stop of an ongoing generation.
    fn cancel_generation(&self);

    /// Free native resources. The manager calls this exactly once.
    fn release(&self) -> Result<()>;
}
