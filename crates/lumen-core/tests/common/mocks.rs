//! Mock engines for testing.
//!
//! - `ManualEngine`: the test drives every callback and completion by hand.
//! - `ScriptedEngine`: each session streams fixed words from its own thread.

#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use lumen_core::{
    completion, Completer, Completion, Engine, IncrementalCallback, PartialResult, RequestId,
    SamplingParams, Session, Subscription,
};

/// Engine whose sessions are driven step by step from the test.
#[derive(Default)]
pub struct ManualEngine {
    sessions: Mutex<Vec<Arc<ManualSession>>>,
    pub fail_create: AtomicBool,
    pub fail_submit: AtomicBool,
    pub fail_release: AtomicBool,
    pub released: AtomicBool,
    /// Handed to the next session; its `submit_query` blocks until the gate opens.
    pub submit_gate: Mutex<Option<mpsc::Receiver<()>>>,
}

impl ManualEngine {
    pub fn session(&self, index: usize) -> Arc<ManualSession> {
        self.sessions.lock().unwrap()[index].clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

impl Engine for ManualEngine {
    fn create_session(&self, params: &SamplingParams) -> Result<Box<dyn Session>> {
        if self.fail_create.load(Ordering::SeqCst) {
            bail!("engine failed to allocate a session");
        }
        let session = Arc::new(ManualSession {
            params: params.clone(),
            fail_submit: self.fail_submit.load(Ordering::SeqCst),
            fail_release: self.fail_release.load(Ordering::SeqCst),
            submit_gate: Mutex::new(self.submit_gate.lock().unwrap().take()),
            ..Default::default()
        });
        self.sessions.lock().unwrap().push(session.clone());
        Ok(Box::new(SessionHandle(session)))
    }

    fn release(&self) -> Result<()> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct ManualSession {
    pub params: SamplingParams,
    pub prompt: Mutex<Option<String>>,
    callback: Mutex<Option<IncrementalCallback>>,
    completer: Mutex<Option<Completer>>,
    fail_submit: bool,
    fail_release: bool,
    submit_gate: Mutex<Option<mpsc::Receiver<()>>>,
    pub releases: AtomicUsize,
    pub cancels: AtomicUsize,
}

impl ManualSession {
    /// Invoke the incremental callback as the engine would.
    pub fn emit(&self, fragment: &str, done: bool) {
        let callback = self.callback.lock().unwrap().clone();
        let callback = callback.expect("generation not started");
        callback(fragment, done);
    }

    pub fn complete(&self, text: &str) -> bool {
        self.completer.lock().unwrap().as_ref().unwrap().complete(text)
    }

    pub fn fail(&self, message: &str) -> bool {
        self.completer.lock().unwrap().as_ref().unwrap().fail(message)
    }

    pub fn is_cancelled(&self) -> bool {
        self.completer.lock().unwrap().as_ref().unwrap().is_cancelled()
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

struct SessionHandle(Arc<ManualSession>);

impl Session for SessionHandle {
    fn submit_query(&self, text: &str) -> Result<()> {
        let gate = self.0.submit_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        if self.0.fail_submit {
            bail!("query rejected");
        }
        *self.0.prompt.lock().unwrap() = Some(text.to_string());
        Ok(())
    }

    fn generate_async(&self, callback: IncrementalCallback) -> Result<Completion> {
        let (completer, completion) = completion::channel();
        *self.0.callback.lock().unwrap() = Some(callback);
        *self.0.completer.lock().unwrap() = Some(completer);
        Ok(completion)
    }

    fn cancel_generation(&self) {
        self.0.cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) -> Result<()> {
        self.0.releases.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_release {
            bail!("native release failed");
        }
        Ok(())
    }
}

/// Engine whose sessions stream `words` on a background thread, one every
/// `delay`, then resolve the completion with the whole text.
pub struct ScriptedEngine {
    pub words: Vec<String>,
    pub delay: Duration,
    pub releases: Arc<Mutex<Vec<Arc<AtomicUsize>>>>,
}

impl ScriptedEngine {
    pub fn new(words: &[&str], delay: Duration) -> Self {
        Self {
            words: words.iter().map(|word| word.to_string()).collect(),
            delay,
            releases: Default::default(),
        }
    }

    pub fn release_counts(&self) -> Vec<usize> {
        self.releases
            .lock()
            .unwrap()
            .iter()
            .map(|count| count.load(Ordering::SeqCst))
            .collect()
    }
}

impl Engine for ScriptedEngine {
    fn create_session(&self, _params: &SamplingParams) -> Result<Box<dyn Session>> {
        let releases = Arc::new(AtomicUsize::new(0));
        self.releases.lock().unwrap().push(releases.clone());
        Ok(Box::new(ScriptedSession {
            words: self.words.clone(),
            delay: self.delay,
            cancelled: Arc::new(AtomicBool::new(false)),
            releases,
        }))
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }
}

struct ScriptedSession {
    words: Vec<String>,
    delay: Duration,
    cancelled: Arc<AtomicBool>,
    releases: Arc<AtomicUsize>,
}

impl Session for ScriptedSession {
    fn submit_query(&self, _text: &str) -> Result<()> {
        Ok(())
    }

    fn generate_async(&self, callback: IncrementalCallback) -> Result<Completion> {
        let (completer, completion) = completion::channel();
        let words = self.words.clone();
        let delay = self.delay;
        let cancelled = self.cancelled.clone();
        std::thread::spawn(move || {
            let last = words.len().saturating_sub(1);
            for (index, word) in words.iter().enumerate() {
                if cancelled.load(Ordering::SeqCst) || completer.is_cancelled() {
                    return;
                }
                std::thread::sleep(delay);
                callback(word, index == last);
            }
            completer.complete(words.concat());
        });
        Ok(completion)
    }

    fn cancel_generation(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn release(&self) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Collect events of `id` up to and including its terminal event.
pub async fn collect_until_done(
    subscription: &mut Subscription,
    id: RequestId,
    timeout: Duration,
) -> Vec<PartialResult> {
    let mut events = Vec::new();
    let collect = async {
        while let Some(event) = subscription.recv_for(id).await {
            let done = event.done;
            events.push(event);
            if done {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(timeout, collect).await;
    events
}

/// Events of `id` that arrive within `window`.
pub async fn drain_for(
    subscription: &mut Subscription,
    id: RequestId,
    window: Duration,
) -> Vec<PartialResult> {
    let mut events = Vec::new();
    let drain = async {
        while let Some(event) = subscription.recv_for(id).await {
            events.push(event);
        }
    };
    let _ = tokio::time::timeout(window, drain).await;
    events
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
