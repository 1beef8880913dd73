//! Time-series resampling
//!
//! Rows are bucketed into epoch-aligned, half-open windows
//! `[floor(ts / w) * w, floor(ts / w) * w + w)` and each mapped column is
//! reduced with its aggregation function. Windows without rows produce no
//! output row. Columns without a mapping are dropped.

mod aggregate;
mod window;

pub use window::{parse_window, Window};

use crate::{Error, Result};

use arrow::compute::{cast, concat_batches};
use arrow_array::cast::AsArray;
use arrow_array::types::Int64Type;
use arrow_array::{Array, ArrayRef, Int64Array, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

/// Aggregation applied to one column per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFunc {
    Mean,
    Sum,
    Min,
    Max,
    Count,
    First,
    Last,
}

impl AggFunc {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggFunc::Mean => "mean",
            AggFunc::Sum => "sum",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::Count => "count",
            AggFunc::First => "first",
            AggFunc::Last => "last",
        }
    }
}

/// Which column carries time, how wide a window is, and how to reduce each column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResampleRule {
    pub time_col: String,
    pub window: Window,
    pub agg: BTreeMap<String, AggFunc>,
}

impl ResampleRule {
    pub fn new(time_col: impl Into<String>, window: Window) -> Self {
        Self {
            time_col: time_col.into(),
            window,
            agg: BTreeMap::new(),
        }
    }

    pub fn with_agg(mut self, column: impl Into<String>, func: AggFunc) -> Self {
        self.agg.insert(column.into(), func);
        self
    }

    /// Check the rule against `schema` and return the output schema.
    ///
    /// Output columns are the time column followed by the mapped columns in
    /// source order.
    pub fn output_schema(&self, schema: &Schema) -> Result<SchemaRef> {
        let time_field = schema.field_with_name(&self.time_col).map_err(|_| {
            Error::Validation(format!("time column '{}' not found", self.time_col))
        })?;
        let DataType::Timestamp(unit, _) = time_field.data_type() else {
            return Err(Error::Validation(format!(
                "time column '{}' has type {}, expected a timestamp",
                self.time_col,
                time_field.data_type()
            )));
        };
        self.window.in_unit(unit)?;

        if self.agg.is_empty() {
            return Err(Error::Validation(
                "resample rule maps no columns".to_string(),
            ));
        }
        if self.agg.contains_key(&self.time_col) {
            return Err(Error::Validation(format!(
                "time column '{}' cannot be aggregated",
                self.time_col
            )));
        }
        if let Some(missing) = self.agg.keys().find(|c| schema.field_with_name(c).is_err()) {
            return Err(Error::Validation(format!("column '{missing}' not found")));
        }

        let mut fields = vec![Field::new(
            time_field.name(),
            time_field.data_type().clone(),
            false,
        )];
        for field in schema.fields() {
            let Some(func) = self.agg.get(field.name()) else {
                continue;
            };
            let data_type = aggregate::output_type(*func, field.data_type()).ok_or_else(|| {
                Error::Validation(format!(
                    "aggregation {} is not supported for column '{}' of type {}",
                    func.as_str(),
                    field.name(),
                    field.data_type()
                ))
            })?;
            fields.push(Field::new(
                field.name(),
                data_type,
                *func != AggFunc::Count,
            ));
        }
        Ok(Arc::new(Schema::new(fields)))
    }
}

/// Resample `batches` (all of `schema`) according to `rule`.
pub fn resample(schema: &SchemaRef, batches: &[RecordBatch], rule: &ResampleRule) -> Result<RecordBatch> {
    let output = rule.output_schema(schema)?;
    let DataType::Timestamp(unit, _) = output.field(0).data_type() else {
        return Err(Error::Internal("resample output lost its time column".to_string()));
    };
    let width = rule.window.in_unit(unit)?;

    let input = concat_batches(schema, batches)?;
    if input.num_rows() > u32::MAX as usize {
        return Err(Error::Validation(format!(
            "resample input of {} rows is too large",
            input.num_rows()
        )));
    }

    let time = input
        .column_by_name(&rule.time_col)
        .ok_or_else(|| Error::Validation(format!("time column '{}' not found", rule.time_col)))?;
    let ticks = cast(time, &DataType::Int64)?;
    let ticks = ticks.as_primitive::<Int64Type>();

    // Row indices ordered by timestamp; the sort is stable so ties keep input order.
    let mut order: Vec<u32> = (0..input.num_rows() as u32)
        .filter(|&row| ticks.is_valid(row as usize))
        .collect();
    order.sort_by_key(|&row| ticks.value(row as usize));

    let mut starts: Vec<i64> = Vec::new();
    let mut windows: Vec<Range<usize>> = Vec::new();
    for (pos, &row) in order.iter().enumerate() {
        let ts = ticks.value(row as usize);
        let start = ts
            .div_euclid(width)
            .checked_mul(width)
            .ok_or_else(|| Error::Validation(format!("timestamp {ts} is out of range")))?;
        if starts.last() == Some(&start) {
            if let Some(range) = windows.last_mut() {
                range.end = pos + 1;
            }
        } else {
            starts.push(start);
            windows.push(pos..pos + 1);
        }
    }

    let start_column: ArrayRef = Arc::new(Int64Array::from(starts));
    let mut columns = vec![cast(&start_column, output.field(0).data_type())?];
    for field in output.fields().iter().skip(1) {
        let func = rule.agg[field.name()];
        let column = input
            .column_by_name(field.name())
            .ok_or_else(|| Error::Validation(format!("column '{}' not found", field.name())))?;
        columns.push(aggregate::aggregate(
            func,
            field.name(),
            column,
            &order,
            &windows,
        )?);
    }

    debug!(
        input_rows = input.num_rows(),
        windows = windows.len(),
        window = %rule.window,
        "Resampled batch"
    );
    Ok(RecordBatch::try_new(output, columns)?)
}
