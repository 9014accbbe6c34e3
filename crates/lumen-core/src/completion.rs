//! One-shot completion cell shared between an engine session and the manager.
//!
//! The engine holds the [`Completer`] and resolves it exactly once when
//! generation ends. Any number of [`Completion`] clones can observe the result,
//! either with a bounded wait ([`Completion::get`]) or by suspending until it
//! resolves ([`Completion::resolved`]). Later resolutions are ignored, which is
//! what makes cancellation race-free: whoever resolves first wins.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompletionError {
    #[error("completion did not resolve within {0:?}")]
    Timeout(Duration),
    #[error("generation was cancelled")]
    Cancelled,
    #[error("generation failed: {0}")]
    Execution(String),
}

type Slot = Option<Result<String, CompletionError>>;

/// Create a linked completer/completion pair.
pub fn channel() -> (Completer, Completion) {
    let (sender, _) = watch::channel(None);
    let sender = Arc::new(sender);
    let completer = Completer {
        sender: sender.clone(),
    };
    (completer, Completion { sender })
}

/// The engine side of a completion.
#[derive(Debug)]
pub struct Completer {
    sender: Arc<watch::Sender<Slot>>,
}

impl Completer {
    /// Resolve with the final output text. Returns `false` if already resolved.
    pub fn complete(&self, text: impl Into<String>) -> bool {
        resolve(&self.sender, Ok(text.into()))
    }

    /// Resolve with an execution error. Returns `false` if already resolved.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        resolve(&self.sender, Err(CompletionError::Execution(message.into())))
    }

    /// Whether the observer side cancelled before the engine resolved.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.sender.borrow(), Some(Err(CompletionError::Cancelled)))
    }
}

/// The observer side of a completion. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Completion {
    sender: Arc<watch::Sender<Slot>>,
}

impl Completion {
    /// Suspend until the completion resolves, however it resolves.
    pub async fn resolved(&self) {
        let mut receiver = self.sender.subscribe();
        // the sender lives in `self`, so the channel cannot close under us
        let _ = receiver.wait_for(Option::is_some).await;
    }

    /// Suspend until resolved and return the outcome.
    pub async fn wait(&self) -> Result<String, CompletionError> {
        self.resolved().await;
        self.try_get().unwrap_or(Err(CompletionError::Cancelled))
    }

    /// Wait at most `timeout` for the outcome.
    pub async fn get(&self, timeout: Duration) -> Result<String, CompletionError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CompletionError::Timeout(timeout)),
        }
    }

    /// The outcome if already resolved.
    pub fn try_get(&self) -> Option<Result<String, CompletionError>> {
        self.sender.borrow().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.sender.borrow().is_some()
    }

    /// Resolve as cancelled if still pending. Returns `false` if already resolved.
    pub fn cancel(&self) -> bool {
        resolve(&self.sender, Err(CompletionError::Cancelled))
    }
}

fn resolve(sender: &watch::Sender<Slot>, outcome: Result<String, CompletionError>) -> bool {
    sender.send_if_modified(|slot| match slot {
        Some(_) => false,
        None => {
            *slot = Some(outcome);
            true
        }
    })
}
