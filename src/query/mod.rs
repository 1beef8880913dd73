//! Dataset reads
//!
//! Unfiltered reads stream straight out of the Parquet file one batch at a
//! time. Filtered reads go through DataFusion with the dataset registered as
//! the only table.

pub mod engine;

pub use engine::{SqlEngine, DEFAULT_BATCH_SIZE};

use crate::codec::{DatasetRef, Filter};
use crate::storage::{open_dataset, BucketStore};
use crate::{Error, Result};

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use futures::stream::{Stream, StreamExt, TryStreamExt};
use parquet::arrow::ParquetRecordBatchStreamBuilder;
use std::pin::Pin;
use tracing::debug;

/// Stream of batches produced by a read
pub type BatchStream = Pin<Box<dyn Stream<Item = Result<RecordBatch>> + Send>>;

/// Result of a read: the output schema and a lazy stream of batches.
pub struct DatasetScan {
    pub schema: SchemaRef,
    pub stream: BatchStream,
}

impl DatasetScan {
    /// Drain the stream into memory.
    pub async fn collect(self) -> Result<Vec<RecordBatch>> {
        self.stream.try_collect().await
    }
}

impl std::fmt::Debug for DatasetScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetScan")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Executes reads against the bucket store.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    store: BucketStore,
    engine: SqlEngine,
    batch_size: usize,
}

impl QueryExecutor {
    pub fn new(store: BucketStore) -> Self {
        Self::with_batch_size(store, DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(store: BucketStore, batch_size: usize) -> Self {
        Self {
            store,
            engine: SqlEngine::new(batch_size),
            batch_size: batch_size.max(1),
        }
    }

    pub fn store(&self) -> &BucketStore {
        &self.store
    }

    /// Read a dataset, optionally filtered.
    pub async fn read(&self, dataset: &DatasetRef, filter: Option<&Filter>) -> Result<DatasetScan> {
        let path = self.store.resolve_path(&dataset.bucket, &dataset.dataset)?;
        // Opening first pins the current version and reports a missing dataset.
        let file = open_dataset(&path, &dataset.bucket, &dataset.dataset).await?;

        match filter {
            None => {
                let builder = ParquetRecordBatchStreamBuilder::new(file)
                    .await?
                    .with_batch_size(self.batch_size);
                let schema = builder.schema().clone();
                let stream = builder.build()?.map_err(Error::from);
                debug!(dataset = %dataset, "Streaming dataset");
                Ok(DatasetScan {
                    schema,
                    stream: stream.boxed(),
                })
            }
            Some(filter) => {
                drop(file);
                let stream = self
                    .engine
                    .execute_stream(&dataset.dataset, &path, filter)
                    .await?;
                let schema = stream.schema();
                Ok(DatasetScan {
                    schema,
                    stream: stream.map_err(Error::from).boxed(),
                })
            }
        }
    }

    /// Run `filter` over batches already collected from `dataset`.
    pub async fn query_batches(
        &self,
        dataset: &DatasetRef,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
        filter: &Filter,
    ) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let stream = self
            .engine
            .execute_batches(&dataset.dataset, schema, batches, filter)
            .await?;
        let schema = stream.schema();
        let batches: Vec<RecordBatch> = stream.map_err(Error::from).try_collect().await?;
        Ok((schema, batches))
    }

    /// Read a dataset fully into memory.
    pub async fn collect(
        &self,
        dataset: &DatasetRef,
        filter: Option<&Filter>,
    ) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let scan = self.read(dataset, filter).await?;
        let schema = scan.schema.clone();
        Ok((schema, scan.collect().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DatasetWriter;
    use arrow_array::cast::AsArray;
    use arrow_array::types::Int64Type;
    use arrow_array::{Int64Array, StringArray};
    use arrow_schema::{DataType, Field, Schema};
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn executor_with_prices() -> (tempfile::TempDir, QueryExecutor) {
        let dir = tempdir().unwrap();
        let store = BucketStore::open(dir.path()).await.unwrap();

        let schema = Arc::new(Schema::new(vec![
            Field::new("sym", DataType::Utf8, false),
            Field::new("price", DataType::Int64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec!["a", "b", "c", "d"])),
                Arc::new(Int64Array::from(vec![1, 5, 3, 8])),
            ],
        )
        .unwrap();
        let staged = store.stage("b", "prices").await.unwrap();
        let mut writer = DatasetWriter::create(staged.path(), schema).await.unwrap();
        writer.write(&batch).await.unwrap();
        writer.finish().await.unwrap();
        staged.publish().await.unwrap();

        (dir, QueryExecutor::with_batch_size(store, 2))
    }

    fn prices(batches: &[RecordBatch], column: usize) -> Vec<i64> {
        batches
            .iter()
            .flat_map(|b| b.column(column).as_primitive::<Int64Type>().values().to_vec())
            .collect()
    }

    #[tokio::test]
    async fn test_unfiltered_read_streams_batches() {
        let (_dir, executor) = executor_with_prices().await;
        let (schema, batches) = executor
            .collect(&DatasetRef::new("b", "prices"), None)
            .await
            .unwrap();

        assert_eq!(schema.fields().len(), 2);
        assert_eq!(batches.len(), 2);
        assert_eq!(prices(&batches, 1), vec![1, 5, 3, 8]);
    }

    #[tokio::test]
    async fn test_where_filter() {
        let (_dir, executor) = executor_with_prices().await;
        let filter = Filter::Where("price > 2".to_string());
        let (_, batches) = executor
            .collect(&DatasetRef::new("b", "prices"), Some(&filter))
            .await
            .unwrap();
        assert_eq!(prices(&batches, 1), vec![5, 3, 8]);
    }

    #[tokio::test]
    async fn test_sql_filter() {
        let (_dir, executor) = executor_with_prices().await;
        let filter = Filter::Sql("SELECT sum(price) AS total FROM prices".to_string());
        let (schema, batches) = executor
            .collect(&DatasetRef::new("b", "prices"), Some(&filter))
            .await
            .unwrap();
        assert_eq!(schema.field(0).name(), "total");
        assert_eq!(prices(&batches, 0), vec![17]);
    }

    #[tokio::test]
    async fn test_bad_filters_are_query_errors() {
        let (_dir, executor) = executor_with_prices().await;
        let dataset = DatasetRef::new("b", "prices");

        for filter in [
            Filter::Where("nope > 1".to_string()),
            Filter::Where("price >".to_string()),
            Filter::Sql("SELECT * FROM other".to_string()),
            Filter::Sql("DROP TABLE prices".to_string()),
        ] {
            let err = executor.read(&dataset, Some(&filter)).await.unwrap_err();
            assert!(matches!(err, Error::Query(_)), "{filter:?}: {err}");
        }
    }

    #[tokio::test]
    async fn test_missing_dataset() {
        let (_dir, executor) = executor_with_prices().await;
        let err = executor
            .read(&DatasetRef::new("b", "ghost"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
