//! Copying the packaged model into a writable work directory.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tokio::fs;

use crate::{build_path, logging};

/// Make sure `<work_dir>/<file_name>` exists, copying it from
/// `<packaged_dir>/<file_name>` if it does not, and return its path.
///
/// An existing file is never overwritten. The copy goes through a temporary
/// file so an interrupted copy is not mistaken for a complete model later.
pub async fn materialize(
    packaged_dir: impl AsRef<Path>,
    work_dir: impl AsRef<Path>,
    file_name: &str,
) -> Result<PathBuf> {
    let source = build_path(packaged_dir, file_name)?;
    let target = build_path(work_dir.as_ref(), file_name)?;

    if fs::try_exists(&target).await? {
        logging::lifecycle::asset_materialized(&target, false);
        return Ok(target);
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    let partial = target.with_extension("partial");
    fs::copy(&source, &partial)
        .await
        .with_context(|| format!("failed to copy {}", source.display()))?;
    fs::rename(&partial, &target).await?;

    logging::lifecycle::asset_materialized(&target, true);
    Ok(target)
}
