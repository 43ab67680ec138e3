//! On-disk netDb reader.
//!
//! A router keeps its netDb as `routerInfo-<hash>.dat` files spread over
//! `rX` subdirectories.  The directory walk runs on the blocking pool since
//! a busy router's netDb holds thousands of files.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use super::{DescriptorRecord, DescriptorSource};

const FILE_PREFIX: &str = "routerInfo-";
const FILE_SUFFIX: &str = ".dat";

/// Router infos read from a local netDb directory.
#[derive(Debug, Clone)]
pub struct LocalNetDb {
    path: PathBuf,
    max_age: Option<Duration>,
}

impl LocalNetDb {
    /// `max_age_secs == 0` disables the age filter.
    pub fn new(path: impl Into<PathBuf>, max_age_secs: u64) -> Self {
        Self {
            path: path.into(),
            max_age: (max_age_secs > 0).then(|| Duration::from_secs(max_age_secs)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl DescriptorSource for LocalNetDb {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn records(&self) -> Result<Vec<DescriptorRecord>> {
        let path = self.path.clone();
        let max_age = self.max_age;
        let records = tokio::task::spawn_blocking(move || scan(&path, max_age, SystemTime::now()))
            .await
            .context("netDb scan task failed")??;
        debug!(records = records.len(), "netDb scanned");
        Ok(records)
    }

    async fn is_available(&self) -> bool {
        tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}

fn is_router_info(name: &str) -> bool {
    name.len() > FILE_PREFIX.len() + FILE_SUFFIX.len()
        && name.starts_with(FILE_PREFIX)
        && name.ends_with(FILE_SUFFIX)
}

/// Walk `root` and read every router info that passes the age filter.
///
/// Only a failure to list `root` itself is an error; problems with
/// individual entries are logged and skipped.
fn scan(root: &Path, max_age: Option<Duration>, now: SystemTime) -> Result<Vec<DescriptorRecord>> {
    let top = fs::read_dir(root)
        .with_context(|| format!("failed to read netDb directory: {}", root.display()))?;

    let mut records = Vec::new();
    let mut pending = vec![top];

    while let Some(entries) = pending.pop() {
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "failed to read netDb entry");
                    continue;
                }
            };
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "failed to stat netDb entry");
                    continue;
                }
            };

            if meta.is_dir() {
                match fs::read_dir(entry.path()) {
                    Ok(sub) => pending.push(sub),
                    Err(e) => {
                        warn!(path = %entry.path().display(), error = %e, "failed to read netDb subdirectory")
                    }
                }
                continue;
            }

            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !meta.is_file() || !is_router_info(name) || meta.len() == 0 {
                continue;
            }

            if let Some(max_age) = max_age {
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|mtime| now.duration_since(mtime).ok())
                    .unwrap_or_default();
                if age > max_age {
                    continue;
                }
            }

            match fs::read(entry.path()) {
                Ok(payload) if !payload.is_empty() => {
                    records.push(DescriptorRecord::new(name, payload));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "failed to read router info")
                }
            }
        }
    }

    records.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(records)
}
