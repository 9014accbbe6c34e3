//! Logging setup and structured event helpers.
//!
//! Events carry an `event` field with a stable snake_case name so log lines can
//! be filtered and aggregated without parsing the message text. The manager in
//! `lumen-core` emits its own request events (`request_started`,
//! `request_complete`, ...) in the same shape.

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level. Logs go to stderr; stdout is left to generated text.
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;
    let json = config.json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let plain = (!config.json).then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .try_init()
        .map_err(|err| anyhow!("failed to install logger: {err}"))
}

/// Process lifecycle events
pub mod lifecycle {
    use std::path::Path;

    /// Emitted at startup.
    pub fn startup(binary: &str, version: &str) {
        tracing::info!(
            event = "startup",
            binary = %binary,
            version = %version,
            "Starting"
        );
    }

    pub fn config_loaded(config_path: &str) {
        tracing::info!(
            event = "config_loaded",
            config_path = %config_path,
            "Configuration loaded"
        );
    }

    /// Emitted once the model file is in the work directory.
    pub fn asset_materialized(path: &Path, copied: bool) {
        tracing::info!(
            event = "asset_materialized",
            path = %path.display(),
            copied = copied,
            "Model asset ready"
        );
    }

    pub fn engine_ready(kind: &str, model_path: Option<&Path>) {
        tracing::info!(
            event = "engine_ready",
            kind = %kind,
            model_path = ?model_path,
            "Engine ready"
        );
    }

    /// Emitted on shutdown.
    pub fn shutdown(cancelled: usize) {
        tracing::info!(
            event = "shutdown",
            cancelled = cancelled,
            "Shutting down"
        );
    }
}

/// Caller-side request events
pub mod requests {
    use lumen_core::RequestId;

    /// Emitted when a chat collection finishes, however it finished.
    pub fn chat_collected(request_id: RequestId, outcome: &str, chars: usize, duration_ms: u64) {
        tracing::info!(
            event = "chat_collected",
            request_id = %request_id,
            outcome = %outcome,
            chars = chars,
            duration_ms = duration_ms,
            "Chat response collected"
        );
    }

    pub fn validation_result(request_id: RequestId, outcome: &str) {
        tracing::info!(
            event = "validation_result",
            request_id = %request_id,
            outcome = %outcome,
            "Validation finished"
        );
    }
}

/// Error events
pub mod errors {
    use lumen_core::RequestId;

    /// Model asset could not be copied into the work directory.
    pub fn asset_failed(file_name: &str, error: &str) {
        tracing::error!(
            event = "asset_failed",
            file_name = %file_name,
            error = %error,
            "Model asset materialization failed"
        );
    }

    /// No terminal event arrived in time; the request was cancelled.
    pub fn request_timed_out(request_id: RequestId, timeout_ms: u64, partial_chars: usize) {
        tracing::warn!(
            event = "request_timed_out",
            request_id = %request_id,
            timeout_ms = timeout_ms,
            partial_chars = partial_chars,
            "Request timed out"
        );
    }

    pub fn validation_unparseable(request_id: RequestId, chars: usize) {
        tracing::warn!(
            event = "validation_unparseable",
            request_id = %request_id,
            chars = chars,
            "No JSON object found in response"
        );
    }
}
