//! Single worker that releases sessions one at a time.
//!
//! Native teardown never runs on a callback thread or a listener task, and two
//! releases never run concurrently.

use std::{
    sync::{Arc, Mutex},
    thread::JoinHandle,
};

use anyhow::Result;
use flume::{Receiver, Sender};

use crate::registry::RequestState;

#[derive(Debug)]
pub(crate) struct ReleaseWorker {
    sender: Mutex<Option<Sender<Arc<RequestState>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReleaseWorker {
    pub fn spawn() -> Result<Self> {
        let (sender, receiver) = flume::unbounded();
        let handle = std::thread::Builder::new()
            .name("lumen-release".into())
            .spawn(move || run(receiver))?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a release. Callers must hold the request's close latch.
    pub fn submit(&self, state: Arc<RequestState>) {
        debug_assert!(state.is_closed());
        let sender = match self.sender.lock() {
            Ok(sender) => sender.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let rejected = match sender {
            Some(sender) => sender.send(state).err().map(|err| err.into_inner()),
            None => Some(state),
        };
        // the worker is gone; releasing here is still better than leaking
        if let Some(state) = rejected {
            tracing::warn!(
                event = "release_inline",
                request_id = %state.id,
                "Release worker stopped, releasing on caller thread"
            );
            release(&state);
        }
    }

    /// Stop accepting jobs, drain the queue and join the worker thread.
    /// Blocks, so call it off the async executor.
    pub fn stop(&self) {
        let sender = match self.sender.lock() {
            Ok(mut sender) => sender.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        let handle = match self.handle.lock() {
            Ok(mut handle) => handle.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(event = "release_worker_panicked", "Release worker panicked");
            }
        }
    }
}

fn run(receiver: Receiver<Arc<RequestState>>) {
    while let Ok(state) = receiver.recv() {
        release(&state);
    }
    tracing::info!("[release] exit");
}

fn release(state: &RequestState) {
    match state.session.release() {
        Ok(()) => tracing::debug!(
            event = "session_released",
            request_id = %state.id,
            "Session released"
        ),
        Err(err) => tracing::warn!(
            event = "session_release_failed",
            request_id = %state.id,
            error = %err,
            "Session release failed"
        ),
    }
}
