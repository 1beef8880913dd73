//! Bucket service
//!
//! Get, put, list and resample on top of the bucket store and query executor.
//! Shared by the Flight layer and the action dispatcher.

use crate::codec::{
    DatasetDescriptor, DatasetRef, DatasetTicket, Filter, ListRequest, ResampleMethod,
    ResampleRequest,
};
use crate::query::{DatasetScan, QueryExecutor};
use crate::resample::resample;
use crate::storage::{ensure_same_columns, BucketStore, DatasetInfo, DatasetWriter, WriteMode};
use crate::{Error, Result};

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

/// Outcome of a put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutReport {
    /// Rows received in this request
    pub rows_written: u64,
    /// Rows in the dataset after publishing
    pub total_rows: u64,
}

/// Outcome of a resample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResampleReport {
    pub source_rows: u64,
    pub target_rows: u64,
}

#[derive(Debug, Clone)]
pub struct BucketService {
    store: BucketStore,
    executor: QueryExecutor,
}

impl BucketService {
    pub fn new(store: BucketStore) -> Self {
        let executor = QueryExecutor::new(store.clone());
        Self { store, executor }
    }

    pub fn with_executor(executor: QueryExecutor) -> Self {
        Self {
            store: executor.store().clone(),
            executor,
        }
    }

    pub fn store(&self) -> &BucketStore {
        &self.store
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    /// Resolve a ticket into a lazy scan.
    pub async fn get(&self, ticket: &DatasetTicket) -> Result<DatasetScan> {
        self.executor
            .read(&ticket.dataset, ticket.filter.as_ref())
            .await
    }

    /// Write `batches` to the descriptor's dataset.
    ///
    /// Nothing becomes visible until the whole stream has been consumed and
    /// the staged file is published. Any error drops the staged file.
    pub async fn put<S>(
        &self,
        descriptor: &DatasetDescriptor,
        schema: SchemaRef,
        mut batches: S,
    ) -> Result<PutReport>
    where
        S: Stream<Item = Result<RecordBatch>> + Send + Unpin,
    {
        let start = Instant::now();
        let target = &descriptor.dataset;
        let exists = self
            .store
            .dataset_exists(&target.bucket, &target.dataset)
            .await?;

        let mut existing = None;
        match descriptor.mode {
            WriteMode::Error if exists => {
                return Err(Error::Conflict(format!(
                    "dataframe {} already exists in bucket {}",
                    target.dataset, target.bucket
                )));
            }
            WriteMode::Append if exists => {
                let scan = self.executor.read(target, None).await?;
                ensure_same_columns(&scan.schema, &schema)?;
                existing = Some(scan);
            }
            _ => {}
        }

        let staged = self.store.stage(&target.bucket, &target.dataset).await?;
        let writer_schema = existing
            .as_ref()
            .map(|scan| scan.schema.clone())
            .unwrap_or(schema);
        let mut writer = DatasetWriter::create(staged.path(), writer_schema).await?;

        let mut copied = 0u64;
        if let Some(mut scan) = existing {
            while let Some(batch) = scan.stream.next().await {
                let batch = batch?;
                copied += batch.num_rows() as u64;
                writer.write(&batch).await?;
            }
        }

        while let Some(batch) = batches.next().await {
            writer.write(&batch?).await?;
        }

        let total_rows = writer.finish().await?;
        match descriptor.mode {
            WriteMode::Error => staged.publish_new().await?,
            WriteMode::Append | WriteMode::Overwrite => staged.publish().await?,
        }

        let report = PutReport {
            rows_written: total_rows - copied,
            total_rows,
        };
        info!(
            bucket = %target.bucket,
            dataset = %target.dataset,
            mode = descriptor.mode.as_str(),
            rows_written = report.rows_written,
            total_rows = report.total_rows,
            duration_ms = start.elapsed().as_millis() as u64,
            "Dataset written"
        );
        Ok(report)
    }

    /// Footer facts for one dataset.
    pub async fn info(&self, dataset: &DatasetRef) -> Result<DatasetInfo> {
        self.store
            .dataset_info(&dataset.bucket, &dataset.dataset)
            .await
    }

    /// Datasets matching a `list` request, ordered by bucket then name.
    pub async fn list(&self, request: &ListRequest) -> Result<Vec<DatasetInfo>> {
        request.validate()?;
        let pattern = request.pattern()?;

        let buckets = match &request.bucket {
            Some(bucket) => vec![bucket.clone()],
            None => self.store.list_buckets().await?,
        };

        let mut infos = Vec::new();
        for bucket in &buckets {
            let datasets = match self.store.list_datasets(bucket).await {
                Ok(datasets) => datasets,
                // Removed while listing everything.
                Err(Error::NotFound(_)) if request.bucket.is_none() => continue,
                Err(e) => return Err(e),
            };

            for dataset in datasets {
                if let Some(pattern) = &pattern {
                    if !pattern.is_match(&dataset) {
                        continue;
                    }
                }
                match self.store.dataset_info(bucket, &dataset).await {
                    Ok(info) => infos.push(info),
                    Err(e) if e.kind() == crate::ErrorKind::NotFound => {
                        debug!(bucket = %bucket, dataset = %dataset, "Dataset vanished during listing");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(infos)
    }

    /// Derive the target dataset from the source and write it with the request mode.
    ///
    /// The source is read once, so the reported row count and the derived
    /// rows describe the same version even under a concurrent overwrite.
    pub async fn resample(&self, request: &ResampleRequest) -> Result<ResampleReport> {
        let (source_schema, source) = self.executor.collect(&request.source, None).await?;
        let source_rows: u64 = source.iter().map(|b| b.num_rows() as u64).sum();

        let (schema, batches) = match &request.method {
            ResampleMethod::Rule(rule) => {
                let out = resample(&source_schema, &source, rule)?;
                (out.schema(), vec![out])
            }
            ResampleMethod::Sql(sql) => {
                self.executor
                    .query_batches(&request.source, source_schema, source, &Filter::Sql(sql.clone()))
                    .await?
            }
        };

        let descriptor = DatasetDescriptor::new(request.target.clone(), request.mode);
        let stream = futures::stream::iter(batches.into_iter().map(Ok));
        let report = self.put(&descriptor, schema, stream).await?;

        info!(
            source = %request.source,
            target = %request.target,
            source_rows,
            target_rows = report.rows_written,
            "Resample complete"
        );
        Ok(ResampleReport {
            source_rows,
            target_rows: report.rows_written,
        })
    }
}
