//! DataFusion query engine integration

use crate::codec::Filter;
use crate::storage::DATASET_EXTENSION;
use crate::{Error, Result};

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use datafusion::datasource::file_format::parquet::ParquetFormat;
use datafusion::datasource::MemTable;
use datafusion::datasource::listing::{
    ListingOptions, ListingTable, ListingTableConfig, ListingTableUrl,
};
use datafusion::execution::context::SQLOptions;
use datafusion::physical_plan::SendableRecordBatchStream;
use datafusion::prelude::*;
use datafusion::sql::TableReference;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Default rows per batch produced by a query
pub const DEFAULT_BATCH_SIZE: usize = 8192;

/// Runs filters and statements against a single dataset file.
///
/// Every call gets its own `SessionContext` holding exactly one table, so a
/// statement can only ever see the dataset named in its ticket.
#[derive(Debug, Clone)]
pub struct SqlEngine {
    batch_size: usize,
}

impl Default for SqlEngine {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl SqlEngine {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    fn context(&self) -> SessionContext {
        // One partition keeps rows in file order.
        let config = SessionConfig::new()
            .with_batch_size(self.batch_size)
            .with_target_partitions(1)
            .with_information_schema(false)
            .with_parquet_pruning(true);
        SessionContext::new_with_config(config)
    }

    /// Register the file at `path` as table `table`.
    async fn register_dataset(&self, ctx: &SessionContext, table: &str, path: &Path) -> Result<()> {
        let file_format = ParquetFormat::default().with_enable_pruning(true);
        let listing_options = ListingOptions::new(Arc::new(file_format))
            .with_file_extension(format!(".{DATASET_EXTENSION}"))
            .with_collect_stat(true);

        let table_url = ListingTableUrl::parse(path.to_string_lossy())?;
        let config = ListingTableConfig::new(table_url)
            .with_listing_options(listing_options)
            .infer_schema(&ctx.state())
            .await?;
        let provider = ListingTable::try_new(config)?;
        ctx.register_table(TableReference::bare(table.to_string()), Arc::new(provider))?;
        Ok(())
    }

    /// SQL text run for `filter` against `table`.
    pub fn statement(table: &str, filter: &Filter) -> String {
        match filter {
            Filter::Where(predicate) => format!("SELECT * FROM \"{table}\" WHERE {predicate}"),
            Filter::Sql(sql) => sql.clone(),
        }
    }

    /// Plan and start executing `filter` against the dataset at `path`.
    pub async fn execute_stream(
        &self,
        table: &str,
        path: &Path,
        filter: &Filter,
    ) -> Result<SendableRecordBatchStream> {
        let ctx = self.context();
        self.register_dataset(&ctx, table, path).await?;
        Self::run(&ctx, table, filter).await
    }

    /// Run `filter` over batches already read from a dataset.
    pub async fn execute_batches(
        &self,
        table: &str,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
        filter: &Filter,
    ) -> Result<SendableRecordBatchStream> {
        let ctx = self.context();
        let provider = MemTable::try_new(schema, vec![batches])?;
        ctx.register_table(TableReference::bare(table.to_string()), Arc::new(provider))?;
        Self::run(&ctx, table, filter).await
    }

    async fn run(ctx: &SessionContext, table: &str, filter: &Filter) -> Result<SendableRecordBatchStream> {
        let sql = Self::statement(table, filter);
        debug!(table, sql = %sql, "Executing dataset query");

        let options = SQLOptions::new()
            .with_allow_ddl(false)
            .with_allow_dml(false)
            .with_allow_statements(false);
        let df = ctx
            .sql_with_options(&sql, options)
            .await
            .map_err(|e| match Error::from(e) {
                Error::DataFusion(e) => Error::Query(e.to_string()),
                other => other,
            })?;
        Ok(df.execute_stream().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_where_statement_quotes_table() {
        let sql = SqlEngine::statement("daily-prices", &Filter::Where("price > 3".to_string()));
        assert_eq!(sql, "SELECT * FROM \"daily-prices\" WHERE price > 3");
    }

    #[tokio::test]
    async fn test_execute_batches() {
        use arrow_array::cast::AsArray;
        use arrow_array::types::Int64Type;
        use arrow_array::Int64Array;
        use arrow_schema::{DataType, Field, Schema};
        use futures::TryStreamExt;

        let schema = Arc::new(Schema::new(vec![Field::new("price", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from(vec![1, 5, 3, 8]))],
        )
        .unwrap();
        let stream = SqlEngine::default()
            .execute_batches("prices", schema, vec![batch], &Filter::Where("price > 3".to_string()))
            .await
            .unwrap();
        let batches: Vec<RecordBatch> = stream.try_collect().await.unwrap();
        let prices: Vec<i64> = batches
            .iter()
            .flat_map(|b| b.column(0).as_primitive::<Int64Type>().values().to_vec())
            .collect();
        assert_eq!(prices, vec![5, 8]);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.parquet");
        let filter = Filter::Where("price > 3".to_string());

        let err = SqlEngine::default()
            .execute_stream("gone", &path, &filter)
            .await
            .err()
            .expect("expected an error");
        assert_eq!(err.kind(), crate::ErrorKind::NotFound, "{err}");
    }

    #[test]
    fn test_sql_statement_passes_through() {
        let sql = SqlEngine::statement("x", &Filter::Sql("SELECT 1".to_string()));
        assert_eq!(sql, "SELECT 1");
    }
}
