//! A deterministic in-process engine.
//!
//! Each session replies to its prompt by echoing it back word by word from a
//! thread of its own, the way a native engine calls back from its decode loop.
//! It lets the binary and the host tests run without a model.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use lumen_core::{
    completion, Completer, Completion, Engine, IncrementalCallback, SamplingParams, Session,
};

use crate::config::EngineConfig;

pub const REPLY_PREFIX: &str = "You said: ";

#[derive(Debug)]
pub struct LoopbackEngine {
    token_delay: Duration,
    model_path: Option<PathBuf>,
    created: AtomicUsize,
    released: Arc<AtomicUsize>,
    shut_down: AtomicBool,
}

impl LoopbackEngine {
    pub fn new(config: &EngineConfig, model_path: Option<PathBuf>) -> Self {
        Self {
            token_delay: config.token_delay(),
            model_path,
            created: AtomicUsize::new(0),
            released: Default::default(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn model_path(&self) -> Option<&Path> {
        self.model_path.as_deref()
    }

    pub fn sessions_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Session releases so far, duplicates included.
    pub fn sessions_released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// The full text a session produces for `prompt`.
    pub fn reply(prompt: &str) -> String {
        match prompt.trim() {
            "" => String::new(),
            prompt => format!("{REPLY_PREFIX}{prompt}"),
        }
    }
}

impl Engine for LoopbackEngine {
    fn create_session(&self, params: &SamplingParams) -> Result<Box<dyn Session>> {
        if self.shut_down.load(Ordering::SeqCst) {
            bail!("engine has been released");
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(
            event = "session_created",
            top_k = params.top_k,
            temperature = params.temperature,
            "Loopback session created"
        );
        Ok(Box::new(LoopbackSession {
            token_delay: self.token_delay,
            reply: Mutex::new(None),
            cancelled: Arc::new(AtomicBool::new(false)),
            released: AtomicBool::new(false),
            release_count: self.released.clone(),
        }))
    }

    fn release(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            bail!("engine released twice");
        }
        Ok(())
    }
}

struct LoopbackSession {
    token_delay: Duration,
    reply: Mutex<Option<String>>,
    cancelled: Arc<AtomicBool>,
    released: AtomicBool,
    release_count: Arc<AtomicUsize>,
}

impl Session for LoopbackSession {
    fn submit_query(&self, text: &str) -> Result<()> {
        let mut reply = self.reply.lock().unwrap_or_else(|err| err.into_inner());
        if reply.is_some() {
            bail!("session already has a query");
        }
        *reply = Some(LoopbackEngine::reply(text));
        Ok(())
    }

    fn generate_async(&self, callback: IncrementalCallback) -> Result<Completion> {
        let reply = self
            .reply
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        let Some(reply) = reply else {
            bail!("no query submitted");
        };

        let (completer, completion) = completion::channel();
        let cancelled = self.cancelled.clone();
        let token_delay = self.token_delay;
        std::thread::Builder::new()
            .name("lumen-loopback".into())
            .spawn(move || generate(reply, token_delay, callback, completer, cancelled))?;
        Ok(completion)
    }

    fn cancel_generation(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn release(&self) -> Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.release_count.fetch_add(1, Ordering::SeqCst);
        if self.released.swap(true, Ordering::SeqCst) {
            bail!("session released twice");
        }
        Ok(())
    }
}

fn generate(
    reply: String,
    token_delay: Duration,
    callback: IncrementalCallback,
    completer: Completer,
    cancelled: Arc<AtomicBool>,
) {
    let words: Vec<&str> = reply.split_inclusive(' ').collect();
    let last = words.len().saturating_sub(1);
    for (index, word) in words.iter().enumerate() {
        std::thread::sleep(token_delay);
        if cancelled.load(Ordering::SeqCst) || completer.is_cancelled() {
            tracing::trace!(event = "generation_stopped", words = index, "Generation stopped");
            return;
        }
        callback(word, index == last);
    }
    completer.complete(reply);
}
