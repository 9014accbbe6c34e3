//! Caller-side flows: collecting a chat response and validating structured
//! output, both bounded by a timeout.

use std::time::{Duration, Instant};

use lumen_core::{FinishReason, RequestId, RequestManager, SamplingParams};
use serde_json::{Deserializer, Map, Value};

use crate::logging;

/// How a collected chat request ended. Partial text is kept where there is some.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
    Completed(String),
    /// Generation failed; holds the error description.
    Failed(String),
    Cancelled(String),
    NoOutput,
    /// No terminal event within the timeout; the request was cancelled.
    TimedOut(String),
}

impl ChatOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatOutcome::Completed(_) => "completed",
            ChatOutcome::Failed(_) => "failed",
            ChatOutcome::Cancelled(_) => "cancelled",
            ChatOutcome::NoOutput => "no_output",
            ChatOutcome::TimedOut(_) => "timed_out",
        }
    }

    pub fn text(&self) -> &str {
        match self {
            ChatOutcome::Completed(text)
            | ChatOutcome::Failed(text)
            | ChatOutcome::Cancelled(text)
            | ChatOutcome::TimedOut(text) => text,
            ChatOutcome::NoOutput => "",
        }
    }
}

/// Start a request for `prompt` and concatenate its fragments until the
/// terminal event, or until `timeout` passes.
pub async fn collect_response(
    manager: &RequestManager,
    prompt: &str,
    params: &SamplingParams,
    timeout: Duration,
) -> ChatOutcome {
    collect(manager, prompt, params, timeout).await.1
}

async fn collect(
    manager: &RequestManager,
    prompt: &str,
    params: &SamplingParams,
    timeout: Duration,
) -> (RequestId, ChatOutcome) {
    let started = Instant::now();
    // subscribe first so no early fragment is missed
    let mut subscription = manager.subscribe();
    let id = manager.start_request(prompt, params);

    let mut text = String::new();
    let receive = async {
        while let Some(event) = subscription.recv_for(id).await {
            text.push_str(&event.text);
            if event.done {
                return Some(event.reason);
            }
        }
        None
    };
    let finished = tokio::time::timeout(timeout, receive).await;

    let outcome = match finished {
        Ok(Some(FinishReason::Stop | FinishReason::Null)) if !text.is_empty() => {
            ChatOutcome::Completed(text)
        }
        Ok(Some(FinishReason::Error)) => ChatOutcome::Failed(text),
        Ok(Some(FinishReason::Cancelled)) => ChatOutcome::Cancelled(text),
        Ok(_) => ChatOutcome::NoOutput,
        Err(_) => {
            if manager.is_running(&id) {
                manager.cancel_request(&id);
            }
            logging::errors::request_timed_out(
                id,
                timeout.as_millis() as u64,
                text.chars().count(),
            );
            ChatOutcome::TimedOut(text)
        }
    };

    logging::requests::chat_collected(
        id,
        outcome.as_str(),
        outcome.text().chars().count(),
        started.elapsed().as_millis() as u64,
    );
    (id, outcome)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    /// The first JSON object found in the response.
    Valid(Map<String, Value>),
    /// The request completed but its text holds no JSON object.
    Unparseable(String),
    /// The request ended without a completed response.
    NoOutput(ChatOutcome),
}

/// Ask for structured output and extract the first JSON object of the reply.
pub async fn validate_json(
    manager: &RequestManager,
    prompt: &str,
    params: &SamplingParams,
    timeout: Duration,
) -> Validation {
    let (id, outcome) = collect(manager, prompt, params, timeout).await;
    let validation = match outcome {
        ChatOutcome::Completed(text) => match extract_json_object(&text) {
            Some(object) => Validation::Valid(object),
            None => Validation::Unparseable(text),
        },
        outcome => Validation::NoOutput(outcome),
    };

    match &validation {
        Validation::Valid(_) => logging::requests::validation_result(id, "valid"),
        Validation::Unparseable(text) => {
            logging::errors::validation_unparseable(id, text.chars().count())
        }
        Validation::NoOutput(_) => logging::requests::validation_result(id, "no_output"),
    }
    validation
}

/// The first balanced JSON object embedded in `text`, if any.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    text.match_indices('{').find_map(|(start, _)| {
        Deserializer::from_str(&text[start..])
            .into_iter::<Map<String, Value>>()
            .next()
            .and_then(Result::ok)
    })
}
