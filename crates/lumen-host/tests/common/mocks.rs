//! Mock engines for the caller-side flows.
//!
//! `ReplyEngine` answers every prompt with a fixed outcome, `StalledEngine`
//! never finishes so timeouts can be exercised.

#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use anyhow::Result;
use lumen_core::{
    completion, Completer, Completion, Engine, IncrementalCallback, SamplingParams, Session,
};

#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Error(String),
}

/// Resolves each session's completion straight away, without callbacks.
pub struct ReplyEngine {
    pub reply: Reply,
}

impl ReplyEngine {
    pub fn text(text: &str) -> Self {
        Self {
            reply: Reply::Text(text.into()),
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            reply: Reply::Error(message.into()),
        }
    }
}

impl Engine for ReplyEngine {
    fn create_session(&self, _params: &SamplingParams) -> Result<Box<dyn Session>> {
        Ok(Box::new(ReplySession(self.reply.clone())))
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }
}

struct ReplySession(Reply);

impl Session for ReplySession {
    fn submit_query(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    fn generate_async(&self, _callback: IncrementalCallback) -> Result<Completion> {
        let (completer, completion) = completion::channel();
        match &self.0 {
            Reply::Text(text) => completer.complete(text.as_str()),
            Reply::Error(message) => completer.fail(message.as_str()),
        };
        Ok(completion)
    }

    fn cancel_generation(&self) {}

    fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// Streams one fragment and then hangs until cancelled.
#[derive(Default)]
pub struct StalledEngine {
    pub cancels: Arc<AtomicUsize>,
    pub releases: Arc<AtomicUsize>,
}

impl Engine for StalledEngine {
    fn create_session(&self, _params: &SamplingParams) -> Result<Box<dyn Session>> {
        Ok(Box::new(StalledSession {
            cancels: self.cancels.clone(),
            releases: self.releases.clone(),
            completer: Default::default(),
            cancelled: Default::default(),
        }))
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }
}

struct StalledSession {
    cancels: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
    completer: std::sync::Mutex<Option<Completer>>,
    cancelled: AtomicBool,
}

impl Session for StalledSession {
    fn submit_query(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    fn generate_async(&self, callback: IncrementalCallback) -> Result<Completion> {
        let (completer, completion) = completion::channel();
        *self.completer.lock().unwrap() = Some(completer);
        std::thread::spawn(move || callback("thinking", false));
        Ok(completion)
    }

    fn cancel_generation(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
