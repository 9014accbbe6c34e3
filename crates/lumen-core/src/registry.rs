use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, OnceLock,
    },
    time::Instant,
};

use dashmap::DashMap;
use derivative::Derivative;
use tokio::sync::Notify;

use crate::{
    completion::Completion, engine::Session, stream::ResultStream, FinishReason, PartialResult,
    RequestId,
};

/// Text pushed to the stream so far. Guarded by the per-request emission lock.
#[derive(Debug, Default)]
pub(crate) struct Emitted {
    pub text: String,
    pub fragments: usize,
}

impl Emitted {
    fn append(&mut self, text: &str) {
        self.text.push_str(text);
        self.fragments += 1;
    }
}

/// What the callback path did with one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Emission {
    /// Pushed a non-terminal fragment.
    Fragment,
    /// Pushed the request's terminal event.
    Terminal,
    /// Dropped because another path owns the terminal output.
    Suppressed,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct RequestState {
    pub id: RequestId,
    #[derivative(Debug = "ignore")]
    pub session: Arc<dyn Session>,
    /// Set once generation has launched.
    completion: OnceLock<Completion>,
    /// The right to finish the request was claimed.
    done_emitted: AtomicBool,
    /// A terminal event actually went out. Guarded by the emission lock.
    terminal_pushed: AtomicBool,
    /// The terminal path took over; callbacks push nothing more.
    final_emission_started: AtomicBool,
    /// Release was scheduled.
    closed: AtomicBool,
    #[derivative(Debug = "ignore")]
    close_signal: Notify,
    last_incremental: Mutex<String>,
    emitted: Mutex<Emitted>,
    pub started: Instant,
}

impl RequestState {
    pub fn new(id: RequestId, session: Arc<dyn Session>) -> Self {
        Self {
            id,
            session,
            completion: OnceLock::new(),
            done_emitted: AtomicBool::new(false),
            terminal_pushed: AtomicBool::new(false),
            final_emission_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
            last_incremental: Mutex::new(String::new()),
            emitted: Mutex::new(Emitted::default()),
            started: Instant::now(),
        }
    }

    pub fn completion(&self) -> Option<&Completion> {
        self.completion.get()
    }

    pub fn set_completion(&self, completion: Completion) {
        let _ = self.completion.set(completion);
    }

    /// Claim the right to push the terminal event. True for exactly one caller.
    pub fn claim_done(&self) -> bool {
        latch(&self.done_emitted)
    }

    /// Claim the right to schedule release. True for exactly one caller.
    pub fn claim_close(&self) -> bool {
        let claimed = latch(&self.closed);
        if claimed {
            self.close_signal.notify_one();
        }
        claimed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Suspend until release has been scheduled.
    pub async fn closed(&self) {
        if !self.is_closed() {
            self.close_signal.notified().await;
        }
    }

    pub fn last_incremental(&self) -> String {
        lock(&self.last_incremental).clone()
    }

    pub fn emitted_len(&self) -> (usize, usize) {
        let emitted = lock(&self.emitted);
        (emitted.fragments, emitted.text.chars().count())
    }

    /// Callback path. Check, push and append happen under the emission lock,
    /// so nothing slips in once the terminal path has taken over.
    pub fn emit_incremental(&self, stream: &ResultStream, fragment: &str, done: bool) -> Emission {
        *lock(&self.last_incremental) = fragment.to_owned();

        let mut emitted = lock(&self.emitted);
        if self.final_emission_started.load(Ordering::Acquire) {
            return Emission::Suppressed;
        }
        if done && !self.claim_done() {
            return Emission::Suppressed;
        }

        let event = match done {
            true => {
                self.final_emission_started.store(true, Ordering::Release);
                self.terminal_pushed.store(true, Ordering::Release);
                PartialResult::terminal(self.id, fragment, FinishReason::Stop)
            }
            false => PartialResult::fragment(self.id, fragment),
        };
        if stream.push(event) {
            emitted.append(fragment);
        }
        match done {
            true => Emission::Terminal,
            false => Emission::Fragment,
        }
    }

    /// Terminal path. Stops further callback emission and returns a snapshot of
    /// what has been emitted up to this point.
    pub fn begin_final_emission(&self) -> String {
        let emitted = lock(&self.emitted);
        self.final_emission_started.store(true, Ordering::Release);
        emitted.text.clone()
    }

    /// Push one piece of reconciled output. Only valid after
    /// [`Self::begin_final_emission`]. Returns `false` once a terminal event
    /// is out, which mid-emission means the request was cancelled.
    pub fn emit_final(&self, stream: &ResultStream, event: PartialResult) -> bool {
        let mut emitted = lock(&self.emitted);
        if self.terminal_pushed.load(Ordering::Acquire) {
            return false;
        }
        if event.done {
            self.terminal_pushed.store(true, Ordering::Release);
        }
        let text = event.text.clone();
        if stream.push(event) {
            emitted.append(&text);
        }
        true
    }

    /// Cancel path. Pushes the cancellation sentinel unless a terminal event
    /// was already emitted, cutting short a terminal path that is still
    /// pacing chunks. Returns whether the sentinel was pushed.
    pub fn emit_cancelled(&self, stream: &ResultStream) -> bool {
        let _emitted = lock(&self.emitted);
        self.final_emission_started.store(true, Ordering::Release);
        self.claim_done();
        if self.terminal_pushed.swap(true, Ordering::AcqRel) {
            return false;
        }
        stream.push(PartialResult::cancelled(self.id));
        true
    }
}

fn latch(flag: &AtomicBool) -> bool {
    flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Poisoning only means another path panicked mid-update; the text is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Active requests by id.
#[derive(Debug, Default)]
pub(crate) struct RequestRegistry {
    requests: DashMap<RequestId, Arc<RequestState>>,
}

impl RequestRegistry {
    pub fn insert(&self, state: Arc<RequestState>) {
        self.requests.insert(state.id, state);
    }

    pub fn get(&self, id: &RequestId) -> Option<Arc<RequestState>> {
        self.requests.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &RequestId) -> Option<Arc<RequestState>> {
        self.requests.remove(id).map(|(_, state)| state)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.requests.contains_key(id)
    }

    pub fn ids(&self) -> Vec<RequestId> {
        self.requests.iter().map(|entry| *entry.key()).collect()
    }

    /// Remove and return every registered request.
    pub fn drain(&self) -> Vec<Arc<RequestState>> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.remove(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}
