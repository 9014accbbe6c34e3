//! lumen-host: wires configuration, logging, assets and an engine into a
//! [`RequestManager`], and provides the caller-side flows built on top of it.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context as _, Result};
use lumen_core::RequestManager;
use tokio::{
    fs::File,
    io::{AsyncReadExt, BufReader},
};

pub mod assets;
pub mod config;
pub mod engine;
pub mod flows;
pub mod logging;

pub use config::Config;
pub use engine::LoopbackEngine;

/// Build a path from a permitted base directory and a name.
///
/// Returns an error if the resulting path would escape the permitted directory.
pub fn build_path(path: impl AsRef<Path>, name: impl AsRef<Path>) -> Result<PathBuf> {
    let permitted = path.as_ref();
    let name = name.as_ref();
    if name.ancestors().any(|p| p.ends_with(Path::new(".."))) {
        bail!("cannot have \"..\" in names");
    }
    let path = match name.is_absolute() || name.starts_with(permitted) {
        true => name.into(),
        false => permitted.join(name),
    };
    match path.starts_with(permitted) {
        true => Ok(path),
        false => bail!("path not permitted"),
    }
}

/// Load a configuration file from the given path.
pub async fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let file = File::open(path)
        .await
        .with_context(|| format!("failed to open config {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut contents = String::new();
    reader.read_to_string(&mut contents).await?;
    let config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    logging::lifecycle::config_loaded(&path.display().to_string());
    Ok(config)
}

/// Materialize the model asset (if one is configured), build the loopback
/// engine and hand it to a new request manager.
///
/// Must be called inside a tokio runtime.
pub async fn launch(config: &Config) -> Result<(Arc<LoopbackEngine>, RequestManager)> {
    let model_path = match &config.model.file_name {
        Some(file_name) => {
            let model = &config.model;
            let path = assets::materialize(&model.packaged_dir, &model.work_dir, file_name)
                .await
                .inspect_err(|err| {
                    logging::errors::asset_failed(file_name, &err.to_string());
                })?;
            Some(path)
        }
        None => None,
    };

    let engine = Arc::new(LoopbackEngine::new(&config.engine, model_path));
    let manager = RequestManager::new(engine.clone(), config.manager.clone())?;
    logging::lifecycle::engine_ready("loopback", engine.model_path());
    Ok((engine, manager))
}
