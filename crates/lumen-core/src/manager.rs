//! The request manager.
//!
//! Every request has two ways to finish: the engine's incremental callback
//! reporting `done`, and its completion handle resolving. Either may come
//! first, both may come, and the caller may cancel at any point. Exactly one
//! terminal event reaches the stream and the session is released exactly once,
//! whatever the interleaving.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{bail, Context as _, Result};
use itertools::Itertools;
use tokio::runtime::Handle;

use crate::{
    completion::{Completion, CompletionError},
    config::ManagerConfig,
    engine::{Engine, IncrementalCallback, Session},
    reconcile,
    registry::{Emission, RequestRegistry, RequestState},
    release::ReleaseWorker,
    stream::{ResultStream, Subscription},
    FinishReason, PartialResult, RequestId, SamplingParams,
};

/// Starts, streams, cancels and releases generation requests.
///
/// Cloning is cheap; all clones share the same registry and stream.
#[derive(Clone)]
pub struct RequestManager {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Arc<dyn Engine>,
    config: ManagerConfig,
    registry: RequestRegistry,
    stream: ResultStream,
    release: ReleaseWorker,
    runtime: Handle,
    shut_down: AtomicBool,
}

impl RequestManager {
    /// Must be called inside a tokio runtime; later calls may come from any thread.
    pub fn new(engine: Arc<dyn Engine>, config: ManagerConfig) -> Result<Self> {
        let runtime = Handle::try_current().context("request manager needs a tokio runtime")?;
        let stream = ResultStream::new(config.stream_capacity);
        let release = ReleaseWorker::spawn()?;

        tracing::info!(
            event = "manager_started",
            stream_capacity = config.stream_capacity,
            chunk_size = config.chunk_size,
            chunk_delay_ms = config.chunk_delay_ms,
            "Request manager started"
        );

        let inner = Inner {
            engine,
            config,
            registry: Default::default(),
            stream,
            release,
            runtime,
            shut_down: AtomicBool::new(false),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Subscribe to partial results of all requests.
    ///
    /// Only events pushed after this call are seen, so subscribe before
    /// starting the request you want to follow.
    pub fn subscribe(&self) -> Subscription {
        self.inner.stream.subscribe()
    }

    /// Start generating for `prompt`. Never waits for generation.
    ///
    /// If the session cannot be set up the error is logged and the returned id
    /// will never produce events; callers detect this with their own timeout.
    pub fn start_request(&self, prompt: &str, params: &SamplingParams) -> RequestId {
        let id = RequestId::new();
        match self.inner.launch(id, prompt, params) {
            Ok(()) => tracing::info!(
                event = "request_started",
                request_id = %id,
                prompt_chars = prompt.chars().count(),
                top_k = params.top_k,
                temperature = params.temperature,
                seed = ?params.seed,
                active = self.inner.registry.len(),
                "Request started"
            ),
            Err(err) => tracing::error!(
                event = "request_setup_failed",
                request_id = %id,
                error = %err,
                "Request setup failed"
            ),
        }
        id
    }

    /// Cancel one request. Unknown or finished ids are ignored with a warning.
    pub fn cancel_request(&self, id: &RequestId) {
        match self.inner.registry.remove(id) {
            Some(state) => self.inner.cancel(&state),
            None => tracing::warn!(
                event = "cancel_unknown_request",
                request_id = %id,
                "Cancel ignored, request is not active"
            ),
        }
    }

    /// Cancel every active request. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let states = self.inner.registry.drain();
        for state in &states {
            self.inner.cancel(state);
        }
        states.len()
    }

    pub fn is_running(&self, id: &RequestId) -> bool {
        self.inner.registry.contains(id)
    }

    /// Active ids in start order.
    pub fn active_request_ids(&self) -> Vec<RequestId> {
        self.inner.registry.ids().into_iter().sorted().collect()
    }

    /// Wait for the request's completion handle to resolve.
    ///
    /// Returns `None` at once if the request is not active. Dropping the
    /// returned future before it finishes cancels the completion handle.
    pub async fn await_request_completion(
        &self,
        id: &RequestId,
    ) -> Option<Result<String, CompletionError>> {
        let completion = self.inner.registry.get(id)?.completion()?.clone();
        let mut guard = CancelOnDrop {
            completion: &completion,
            armed: true,
        };
        let outcome = completion.wait().await;
        guard.armed = false;
        Some(outcome)
    }

    /// Cancel everything, drain pending releases and free the engine.
    /// Requests started afterwards fail setup.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let cancelled = self.cancel_all();

        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.release.stop()).await?;
        self.inner.engine.release()?;

        tracing::info!(
            event = "manager_shutdown",
            cancelled = cancelled,
            "Request manager shut down"
        );
        Ok(())
    }
}

impl Inner {
    fn launch(self: &Arc<Self>, id: RequestId, prompt: &str, params: &SamplingParams) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            bail!("request manager is shut down");
        }

        let session: Arc<dyn Session> = self.engine.create_session(params)?.into();
        let state = Arc::new(RequestState::new(id, session));
        if let Err(err) = self.begin(&state, prompt) {
            self.registry.remove(&id);
            self.schedule_release(&state);
            return Err(err);
        }

        // a shutdown that began after the check above may have drained the
        // registry before this request was inserted
        if self.shut_down.load(Ordering::SeqCst) {
            if let Some(state) = self.registry.remove(&id) {
                self.cancel(&state);
            }
            bail!("request manager shut down while the request was starting");
        }
        Ok(())
    }

    fn begin(self: &Arc<Self>, state: &Arc<RequestState>, prompt: &str) -> Result<()> {
        state.session.submit_query(prompt)?;
        // register first: a callback may report `done` before `generate_async` returns
        self.registry.insert(state.clone());

        let callback = self.incremental_callback(state);
        let completion = state.session.generate_async(callback)?;
        state.set_completion(completion.clone());

        self.runtime
            .spawn(self.clone().on_complete(state.clone(), completion));
        Ok(())
    }

    fn incremental_callback(self: &Arc<Self>, state: &Arc<RequestState>) -> IncrementalCallback {
        let inner = Arc::downgrade(self);
        let state = Arc::downgrade(state);
        Arc::new(move |fragment: &str, done: bool| {
            let (Some(inner), Some(state)) = (inner.upgrade(), state.upgrade()) else {
                return;
            };
            inner.on_incremental(&state, fragment, done);
        })
    }

    /// Callback path.
    fn on_incremental(&self, state: &Arc<RequestState>, fragment: &str, done: bool) {
        match state.emit_incremental(&self.stream, fragment, done) {
            Emission::Fragment => {}
            Emission::Terminal => {
                self.log_complete(state, FinishReason::Stop);
                self.finish(state);
            }
            Emission::Suppressed => tracing::trace!(
                event = "fragment_suppressed",
                request_id = %state.id,
                done = done,
                "Fragment suppressed"
            ),
        }
    }

    /// Completion path. Runs once per request, when the handle resolves.
    ///
    /// Stops listening once the request is closed by another path; the handle
    /// itself is left to the engine, so awaiters still see its real outcome.
    async fn on_complete(self: Arc<Self>, state: Arc<RequestState>, completion: Completion) {
        tokio::select! {
            _ = completion.resolved() => {}
            _ = state.closed() => return,
        }

        if state.claim_done() {
            let outcome = completion.get(self.config.completion_timeout()).await;
            if let Err(err) = &outcome {
                tracing::debug!(
                    event = "completion_failed",
                    request_id = %state.id,
                    error = %err,
                    "Completion resolved without text"
                );
            }
            // `None` when a cancel cut the emission short and logged it
            if let Some(reason) = self.emit_final(&state, outcome).await {
                self.log_complete(&state, reason);
            }
        }
        self.finish(&state);
    }

    /// Push whatever part of the final text the stream still owes, paced in
    /// chunks, ending with the terminal event. Returns `None` if a cancel
    /// pushed the terminal event first.
    async fn emit_final(
        &self,
        state: &RequestState,
        outcome: Result<String, CompletionError>,
    ) -> Option<FinishReason> {
        let (final_text, reason) = final_text(outcome, state.last_incremental());
        let emitted = state.begin_final_emission();
        if final_text.is_empty() {
            return state
                .emit_final(&self.stream, PartialResult::terminal(state.id, "", reason))
                .then_some(reason);
        }

        let owed = reconcile::owed_suffix(&emitted, &final_text);
        let chunks = reconcile::split_chunks(owed, self.config.chunk_size);
        tracing::debug!(
            event = "final_reconciled",
            request_id = %state.id,
            final_chars = final_text.chars().count(),
            emitted_chars = emitted.chars().count(),
            owed_chars = owed.chars().count(),
            chunks = chunks.len(),
            "Final text reconciled"
        );

        let Some(last) = chunks.len().checked_sub(1) else {
            return state
                .emit_final(&self.stream, PartialResult::terminal(state.id, "", reason))
                .then_some(reason);
        };
        for (index, chunk) in chunks.into_iter().enumerate() {
            let event = match index == last {
                true => PartialResult::terminal(state.id, chunk, reason),
                false => PartialResult::fragment(state.id, chunk),
            };
            if !state.emit_final(&self.stream, event) {
                tracing::debug!(
                    event = "final_emission_cut",
                    request_id = %state.id,
                    chunks_sent = index,
                    "Final emission stopped by cancel"
                );
                return None;
            }
            if index != last {
                tokio::time::sleep(self.config.chunk_delay()).await;
            }
        }
        Some(reason)
    }

    fn cancel(&self, state: &Arc<RequestState>) {
        let pushed = state.emit_cancelled(&self.stream);
        state.session.cancel_generation();
        if let Some(completion) = state.completion() {
            completion.cancel();
        }
        self.schedule_release(state);
        if pushed {
            self.log_complete(state, FinishReason::Cancelled);
        }
    }

    fn finish(&self, state: &Arc<RequestState>) {
        self.registry.remove(&state.id);
        self.schedule_release(state);
    }

    fn schedule_release(&self, state: &Arc<RequestState>) {
        if state.claim_close() {
            self.release.submit(state.clone());
        }
    }

    fn log_complete(&self, state: &RequestState, reason: FinishReason) {
        let (fragments, emitted_chars) = state.emitted_len();
        tracing::info!(
            event = "request_complete",
            canonical = true,
            request_id = %state.id,
            finish_reason = %reason.as_str(),
            fragments = fragments,
            emitted_chars = emitted_chars,
            duration_ms = state.started.elapsed().as_millis() as u64,
            "Request completed"
        );
    }
}

/// Pick the final text of a request and the reason its terminal event carries.
///
/// The resolved value wins when it has text; an execution error surfaces its
/// description; otherwise the last incremental fragment is the fallback. A
/// cancelled handle keeps the fallback text but still reports `Cancelled`.
fn final_text(
    outcome: Result<String, CompletionError>,
    last_incremental: String,
) -> (String, FinishReason) {
    match outcome {
        Ok(text) if !text.is_empty() => (text, FinishReason::Stop),
        Err(CompletionError::Execution(message)) if !message.is_empty() => {
            (message, FinishReason::Error)
        }
        Err(CompletionError::Cancelled) => (last_incremental, FinishReason::Cancelled),
        _ if !last_incremental.is_empty() => (last_incremental, FinishReason::Stop),
        _ => (String::new(), FinishReason::Empty),
    }
}

struct CancelOnDrop<'a> {
    completion: &'a Completion,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.completion.cancel();
        }
    }
}
