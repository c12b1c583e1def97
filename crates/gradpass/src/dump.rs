//! Best-effort JSON snapshots of jobs for offline inspection.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::job::Job;

/// Writes `job` to `dir/{name}.json`, creating `dir` if needed.
pub fn write_job_snapshot_to(dir: &Path, name: &str, job: &Job) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create dump directory {}", dir.display()))?;
    let file_name: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let path = dir.join(format!("{file_name}.json"));
    fs::write(&path, job.to_json_pretty()?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Snapshots `job` into `dir` when one is given; failures are logged and otherwise ignored.
pub fn write_job_snapshot(dir: Option<&Path>, name: &str, job: &Job) {
    let Some(dir) = dir else {
        return;
    };
    match write_job_snapshot_to(dir, name, job) {
        Ok(path) => log::debug!("wrote job snapshot {}", path.display()),
        Err(err) => log::warn!("skipping job snapshot {name}: {err:#}"),
    }
}
