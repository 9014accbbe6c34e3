use std::{path::PathBuf, time::Duration};

use derivative::Derivative;
use lumen_core::{ManagerConfig, SamplingParams};
use serde::{Deserialize, Serialize};

/// Top-level configuration, one TOML table per section. Every section may be
/// omitted.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub manager: ManagerConfig,
    pub model: ModelConfig,
    pub log: LogConfig,
    /// Sampling parameters used when the caller supplies none.
    pub sampling: SamplingParams,
    pub engine: EngineConfig,
}

#[derive(Debug, Derivative, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct ModelConfig {
    /// Directory the model ships in.
    #[derivative(Default(value = "\"assets\".into()"))]
    pub packaged_dir: PathBuf,
    /// Writable directory the model is copied into before loading.
    #[derivative(Default(value = "\"models\".into()"))]
    pub work_dir: PathBuf,
    /// Model file name. No asset is materialized when unset.
    pub file_name: Option<String>,
}

#[derive(Debug, Derivative, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    #[derivative(Default(value = "\"info\".into()"))]
    pub level: String,
    /// Emit JSON lines instead of human readable output.
    pub json: bool,
}

#[derive(Debug, Derivative, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Pause before each word the loopback engine produces, in milliseconds.
    #[derivative(Default(value = "15"))]
    pub token_delay_ms: u64,
}

impl EngineConfig {
    pub fn token_delay(&self) -> Duration {
        Duration::from_millis(self.token_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.log.level, "info");
        assert_eq!(config.model.work_dir, PathBuf::from("models"));
        assert_eq!(config.engine.token_delay(), Duration::from_millis(15));
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            [manager]
            chunk_size = 12

            [model]
            file_name = "tiny.bin"

            [log]
            json = true

            [sampling]
            temperature = 0.2
            seed = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.manager.chunk_size, 12);
        assert_eq!(config.manager.stream_capacity, 256);
        assert_eq!(config.model.file_name.as_deref(), Some("tiny.bin"));
        assert_eq!(config.model.packaged_dir, PathBuf::from("assets"));
        assert!(config.log.json);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.sampling.temperature, 0.2);
        assert_eq!(config.sampling.top_k, 40);
        assert_eq!(config.sampling.seed, Some(7));
    }
}
