//! Bucket store
//!
//! Buckets are directories directly under the storage root and datasets are
//! single Parquet files inside them:
//!
//! ```text
//! <root>/<bucket>/<dataset>.parquet
//! <root>/.staging/.<dataset>.<uuid>.tmp
//! ```
//!
//! A bucket exists exactly when its directory does, and its directory is
//! only created when the first write into it publishes. Every mutation goes
//! through a staging file or a directory rename so an observer only ever sees
//! whole datasets.

mod names;
mod staging;
mod writer;

pub use names::{validate_name, NameKind, MAX_NAME_LEN};
use staging::STAGING_DIR;
pub use staging::StagedFile;
pub use writer::{ensure_same_columns, DatasetWriter};

use crate::{Error, Result};

use arrow_schema::SchemaRef;
use parquet::arrow::ParquetRecordBatchStreamBuilder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File extension used for dataset files
pub const DATASET_EXTENSION: &str = "parquet";

/// How a write treats an existing dataset of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Fail if the dataset already exists
    Error,
    /// Add rows to the existing dataset; schemas must match
    Append,
    /// Replace the existing dataset
    #[serde(alias = "replace")]
    Overwrite,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Error => "error",
            WriteMode::Append => "append",
            WriteMode::Overwrite => "overwrite",
        }
    }
}

/// What a bucket delete removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMode {
    /// Remove the bucket only if it holds no datasets
    #[default]
    #[serde(alias = "error")]
    Default,
    /// Remove every dataset, keep the empty bucket
    DeleteContents,
    /// Remove every dataset and the bucket itself
    #[serde(alias = "delete")]
    DeleteAll,
}

impl DeleteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteMode::Default => "default",
            DeleteMode::DeleteContents => "delete_contents",
            DeleteMode::DeleteAll => "delete_all",
        }
    }
}

/// Outcome of a bucket delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketDeletion {
    pub bucket: String,
    pub datasets_removed: usize,
    pub bucket_removed: bool,
}

/// Footer-level facts about a stored dataset
#[derive(Debug, Clone)]
pub struct DatasetInfo {
    pub bucket: String,
    pub dataset: String,
    pub schema: SchemaRef,
    pub num_rows: i64,
    pub size_bytes: u64,
}

/// Maps bucket and dataset names onto the filesystem.
#[derive(Debug, Clone)]
pub struct BucketStore {
    root: PathBuf,
}

impl BucketStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Staging files left behind by an interrupted process are removed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(STAGING_DIR)).await?;
        let root = tokio::fs::canonicalize(&root).await?;

        let mut stale = 0usize;
        let mut entries = tokio::fs::read_dir(root.join(STAGING_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            if staging::is_staging_name(&entry.file_name().to_string_lossy()) {
                tokio::fs::remove_file(entry.path()).await?;
                stale += 1;
            }
        }
        info!(root = %root.display(), stale_staging_files = stale, "Opened bucket store");
        Ok(Self { root })
    }

    /// Absolute storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for `bucket`.
    pub fn bucket_path(&self, bucket: &str) -> Result<PathBuf> {
        validate_name(NameKind::Bucket, bucket)?;
        Ok(self.root.join(bucket))
    }

    /// File location for `(bucket, dataset)`.
    pub fn resolve_path(&self, bucket: &str, dataset: &str) -> Result<PathBuf> {
        validate_name(NameKind::Dataset, dataset)?;
        Ok(self
            .bucket_path(bucket)?
            .join(format!("{dataset}.{DATASET_EXTENSION}")))
    }

    pub async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        is_dir(&self.bucket_path(bucket)?).await
    }

    pub async fn dataset_exists(&self, bucket: &str, dataset: &str) -> Result<bool> {
        let path = self.resolve_path(bucket, dataset)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of all buckets, sorted.
    pub async fn list_buckets(&self) -> Result<Vec<String>> {
        let mut buckets = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !names::is_valid_name(&name) {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                buckets.push(name);
            }
        }
        buckets.sort();
        Ok(buckets)
    }

    /// Names of the datasets in `bucket`, sorted.
    pub async fn list_datasets(&self, bucket: &str) -> Result<Vec<String>> {
        let path = self.bucket_path(bucket)?;
        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("No such bucket {bucket}")));
            }
            Err(e) => return Err(e.into()),
        };

        let suffix = format!(".{DATASET_EXTENSION}");
        let mut datasets = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(name) = file_name.strip_suffix(&suffix) else {
                continue;
            };
            if names::is_valid_name(name) && entry.file_type().await?.is_file() {
                datasets.push(name.to_string());
            }
        }
        datasets.sort();
        Ok(datasets)
    }

    /// Read the Parquet footer of a dataset.
    pub async fn dataset_info(&self, bucket: &str, dataset: &str) -> Result<DatasetInfo> {
        let path = self.resolve_path(bucket, dataset)?;
        let file = open_dataset(&path, bucket, dataset).await?;
        let size_bytes = file.metadata().await?.len();
        let builder = ParquetRecordBatchStreamBuilder::new(file).await?;
        Ok(DatasetInfo {
            bucket: bucket.to_string(),
            dataset: dataset.to_string(),
            schema: builder.schema().clone(),
            num_rows: builder.metadata().file_metadata().num_rows(),
            size_bytes,
        })
    }

    /// Remove one dataset. Returns whether a file was removed.
    pub async fn delete_dataset(&self, bucket: &str, dataset: &str, missing_ok: bool) -> Result<bool> {
        let path = self.resolve_path(bucket, dataset)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(bucket, dataset, "Deleted dataset");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if missing_ok {
                    Ok(false)
                } else {
                    Err(Error::NotFound(format!(
                        "Dataframe {dataset} not found in bucket {bucket}"
                    )))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a bucket according to `mode`.
    ///
    /// In default mode a bucket holding any dataset is left untouched and a
    /// `Conflict` is returned.
    pub async fn delete_bucket(&self, bucket: &str, mode: DeleteMode) -> Result<BucketDeletion> {
        let path = self.bucket_path(bucket)?;
        if !is_dir(&path).await? {
            return Err(Error::NotFound(format!("Bucket {bucket} not found")));
        }
        let datasets = self.list_datasets(bucket).await?;

        let deletion = match mode {
            DeleteMode::Default => {
                if !datasets.is_empty() {
                    return Err(Error::Conflict(format!(
                        "Bucket Not Empty: {bucket} holds {} dataset(s)",
                        datasets.len()
                    )));
                }
                self.remove_bucket_dir(bucket, &path).await?;
                BucketDeletion {
                    bucket: bucket.to_string(),
                    datasets_removed: 0,
                    bucket_removed: true,
                }
            }
            DeleteMode::DeleteContents => {
                let mut removed = 0;
                for dataset in &datasets {
                    if self.delete_dataset(bucket, dataset, true).await? {
                        removed += 1;
                    }
                }
                BucketDeletion {
                    bucket: bucket.to_string(),
                    datasets_removed: removed,
                    bucket_removed: false,
                }
            }
            DeleteMode::DeleteAll => {
                self.remove_bucket_dir(bucket, &path).await?;
                BucketDeletion {
                    bucket: bucket.to_string(),
                    datasets_removed: datasets.len(),
                    bucket_removed: true,
                }
            }
        };

        info!(
            bucket,
            mode = mode.as_str(),
            datasets_removed = deletion.datasets_removed,
            bucket_removed = deletion.bucket_removed,
            "Deleted bucket"
        );
        Ok(deletion)
    }

    /// Reserve a staging file for a write to `(bucket, dataset)`.
    ///
    /// The bucket is not touched until the staged file is published.
    pub async fn stage(&self, bucket: &str, dataset: &str) -> Result<StagedFile> {
        let target = self.resolve_path(bucket, dataset)?;
        let dir = self.root.join(STAGING_DIR);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(StagedFile::new(&dir, dataset, target))
    }

    /// Take the bucket out of the namespace with one rename, then remove it.
    async fn remove_bucket_dir(&self, bucket: &str, path: &Path) -> Result<()> {
        let tombstone = self
            .root
            .join(format!(".{}.{}.deleting", bucket, uuid::Uuid::new_v4().simple()));
        tokio::fs::rename(path, &tombstone).await?;
        debug!(bucket, tombstone = %tombstone.display(), "Bucket unlinked");
        tokio::fs::remove_dir_all(&tombstone).await?;
        Ok(())
    }
}

/// Open a dataset file, mapping a missing file onto `NotFound`.
pub(crate) async fn open_dataset(path: &Path, bucket: &str, dataset: &str) -> Result<tokio::fs::File> {
    match tokio::fs::File::open(path).await {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
            "dataframe {dataset} in bucket {bucket} not found"
        ))),
        Err(e) => Err(e.into()),
    }
}

async fn is_dir(path: &Path) -> Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.is_dir()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
