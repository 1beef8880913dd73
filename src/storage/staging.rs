//! Staged writes that become visible through a single rename.
//!
//! Staging files live in a hidden directory under the storage root, on the
//! same filesystem as the buckets. The target's bucket directory is only
//! created at publish time, so a write that fails never leaves a bucket behind.

use crate::{Error, Result};

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const STAGING_SUFFIX: &str = ".tmp";

/// Directory under the storage root holding in-flight writes.
pub(crate) const STAGING_DIR: &str = ".staging";

/// A file written beside the bucket tree and published atomically.
///
/// Dropping an unpublished `StagedFile` removes the staging file, so any error
/// path leaves the previously published dataset untouched.
#[derive(Debug)]
pub struct StagedFile {
    staging: PathBuf,
    target: PathBuf,
    published: bool,
}

impl StagedFile {
    pub(crate) fn new(dir: &Path, dataset: &str, target: PathBuf) -> Self {
        let staging = dir.join(format!(
            ".{}.{}{}",
            dataset,
            uuid::Uuid::new_v4().simple(),
            STAGING_SUFFIX
        ));
        Self {
            staging,
            target,
            published: false,
        }
    }

    /// Where the writer should put its bytes.
    pub fn path(&self) -> &Path {
        &self.staging
    }

    /// Canonical dataset location.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Replace the target with the staged file.
    pub async fn publish(mut self) -> Result<()> {
        self.prepare_target().await?;
        tokio::fs::rename(&self.staging, &self.target)
            .await
            .map_err(|e| self.publish_error(e))?;
        self.published = true;
        debug!(target = %self.target.display(), "Published staged dataset");
        Ok(())
    }

    /// Publish only if the target does not exist yet.
    ///
    /// Uses a hard link so the existence check and the publish are one step.
    pub async fn publish_new(mut self) -> Result<()> {
        self.prepare_target().await?;
        match tokio::fs::hard_link(&self.staging, &self.target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::Conflict(format!(
                    "dataset {} already exists",
                    self.target.display()
                )));
            }
            Err(e) => return Err(self.publish_error(e)),
        }
        self.published = true;
        if let Err(e) = tokio::fs::remove_file(&self.staging).await {
            warn!(staging = %self.staging.display(), error = %e, "Failed to remove staging link");
        }
        debug!(target = %self.target.display(), "Published new dataset");
        Ok(())
    }

    /// Create the bucket directory of the target if it is missing.
    async fn prepare_target(&self) -> Result<()> {
        let Some(bucket_dir) = self.target.parent() else {
            return Err(Error::Internal(format!(
                "dataset path {} has no bucket directory",
                self.target.display()
            )));
        };
        if tokio::fs::metadata(bucket_dir).await.is_err() {
            tokio::fs::create_dir_all(bucket_dir).await?;
            info!(bucket = %bucket_dir.display(), "Created bucket");
        }
        Ok(())
    }

    /// A missing path at publish means the bucket was deleted after
    /// `prepare_target`, or the staging file was removed underneath us.
    fn publish_error(&self, e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::Conflict(format!(
                "write to {} was interrupted: its bucket or staging file was removed concurrently",
                self.target.display()
            ))
        } else {
            e.into()
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        match std::fs::remove_file(&self.staging) {
            Ok(()) => debug!(staging = %self.staging.display(), "Discarded staged dataset"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(staging = %self.staging.display(), error = %e, "Failed to discard staged dataset")
            }
        }
    }
}

/// Whether a directory entry is a staging file.
pub(crate) fn is_staging_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(STAGING_SUFFIX)
}
