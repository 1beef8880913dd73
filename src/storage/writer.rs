//! Parquet writer for dataset files

use crate::{Error, Result};

use arrow_array::RecordBatch;
use arrow_schema::{Schema, SchemaRef};
use parquet::arrow::AsyncArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::{EnabledStatistics, WriterProperties, WriterVersion};
use std::path::{Path, PathBuf};
use tokio::fs::File;

/// Writes record batches incrementally into a single Parquet file.
pub struct DatasetWriter {
    path: PathBuf,
    schema: SchemaRef,
    writer: AsyncArrowWriter<File>,
    rows: u64,
}

impl DatasetWriter {
    /// Create the file at `path` and prepare to write `schema`.
    pub async fn create(path: &Path, schema: SchemaRef) -> Result<Self> {
        let file = File::create(path).await?;
        let writer =
            AsyncArrowWriter::try_new(file, schema.clone(), Some(writer_properties()))?;
        Ok(Self {
            path: path.to_path_buf(),
            schema,
            writer,
            rows: 0,
        })
    }

    /// Schema every written batch is held to.
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Write one batch. The batch is rebound to the writer schema first.
    pub async fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        let batch = conform_batch(&self.schema, batch)?;
        self.writer.write(&batch).await?;
        self.rows += batch.num_rows() as u64;
        Ok(())
    }

    /// Flush the footer and fsync. Returns the number of rows in the file.
    pub async fn finish(self) -> Result<u64> {
        self.writer.close().await?;
        File::open(&self.path).await?.sync_all().await?;
        Ok(self.rows)
    }
}

/// Writer properties shared by every dataset file
fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_writer_version(WriterVersion::PARQUET_2_0)
        // ZSTD level 3: good ratio, fast
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(3).unwrap_or_default()))
        .set_dictionary_enabled(true)
        .set_max_row_group_size(500_000)
        .set_statistics_enabled(EnabledStatistics::Page)
        .set_data_page_size_limit(1024 * 1024)
        .build()
}

/// Check that two schemas carry the same columns, in order, with the same types.
///
/// Nullability and metadata are not compared.
pub fn ensure_same_columns(existing: &Schema, incoming: &Schema) -> Result<()> {
    let describe = |schema: &Schema| {
        schema
            .fields()
            .iter()
            .map(|f| format!("{}: {}", f.name(), f.data_type()))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let same = existing.fields().len() == incoming.fields().len()
        && existing
            .fields()
            .iter()
            .zip(incoming.fields().iter())
            .all(|(a, b)| a.name() == b.name() && a.data_type() == b.data_type());

    if same {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "schema mismatch: existing [{}], incoming [{}]",
            describe(existing),
            describe(incoming)
        )))
    }
}

fn conform_batch(schema: &SchemaRef, batch: &RecordBatch) -> Result<RecordBatch> {
    if batch.schema() == *schema {
        return Ok(batch.clone());
    }
    ensure_same_columns(schema, &batch.schema())?;
    RecordBatch::try_new(schema.clone(), batch.columns().to_vec())
        .map_err(|e| Error::Validation(format!("batch does not fit dataset schema: {e}")))
}
