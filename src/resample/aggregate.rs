//! Per-window aggregation kernels.
//!
//! Every kernel receives the row order (indices sorted by timestamp) and the
//! contiguous ranges of that order making up each window. Nulls are skipped.

use super::AggFunc;
use crate::{Error, Result};

use arrow::compute::{cast, take};
use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int64Type, UInt64Type};
use arrow_array::{
    Array, ArrayRef, ArrowPrimitiveType, Float64Array, Int64Array, PrimitiveArray, UInt32Array,
};
use arrow_schema::DataType;
use std::ops::Range;
use std::sync::Arc;

/// Output type of `func` over a column of `input`, or `None` if unsupported.
pub(crate) fn output_type(func: AggFunc, input: &DataType) -> Option<DataType> {
    match func {
        AggFunc::Count => Some(DataType::Int64),
        AggFunc::First | AggFunc::Last => Some(input.clone()),
        AggFunc::Mean => is_numeric(input).then_some(DataType::Float64),
        AggFunc::Sum | AggFunc::Min | AggFunc::Max => accumulator_type(input),
    }
}

fn is_numeric(data_type: &DataType) -> bool {
    accumulator_type(data_type).is_some()
}

fn accumulator_type(data_type: &DataType) -> Option<DataType> {
    match data_type {
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => {
            Some(DataType::Int64)
        }
        DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => {
            Some(DataType::UInt64)
        }
        DataType::Float32 | DataType::Float64 => Some(DataType::Float64),
        _ => None,
    }
}

/// Aggregate `column` once per window.
pub(crate) fn aggregate(
    func: AggFunc,
    name: &str,
    column: &ArrayRef,
    order: &[u32],
    windows: &[Range<usize>],
) -> Result<ArrayRef> {
    let unsupported = || {
        Error::Validation(format!(
            "aggregation {} is not supported for column '{}' of type {}",
            func.as_str(),
            name,
            column.data_type()
        ))
    };

    match func {
        AggFunc::Count => Ok(count(column, order, windows)),
        AggFunc::First => pick(column, order, windows, false),
        AggFunc::Last => pick(column, order, windows, true),
        AggFunc::Mean => {
            if !is_numeric(column.data_type()) {
                return Err(unsupported());
            }
            let values = cast(column, &DataType::Float64)?;
            Ok(mean(values.as_primitive::<Float64Type>(), order, windows))
        }
        AggFunc::Sum | AggFunc::Min | AggFunc::Max => {
            let target = accumulator_type(column.data_type()).ok_or_else(unsupported)?;
            let values = cast(column, &target)?;
            match target {
                DataType::Int64 => {
                    fold_numeric::<Int64Type>(func, name, values.as_primitive(), order, windows)
                }
                DataType::UInt64 => {
                    fold_numeric::<UInt64Type>(func, name, values.as_primitive(), order, windows)
                }
                _ => fold_numeric::<Float64Type>(func, name, values.as_primitive(), order, windows),
            }
        }
    }
}

fn count(column: &ArrayRef, order: &[u32], windows: &[Range<usize>]) -> ArrayRef {
    let counts: Int64Array = windows
        .iter()
        .map(|range| {
            order[range.clone()]
                .iter()
                .filter(|&&row| column.is_valid(row as usize))
                .count() as i64
        })
        .collect::<Vec<_>>()
        .into();
    Arc::new(counts)
}

fn pick(column: &ArrayRef, order: &[u32], windows: &[Range<usize>], last: bool) -> Result<ArrayRef> {
    let valid = |row: &&u32| column.is_valid(**row as usize);
    let indices: UInt32Array = windows
        .iter()
        .map(|range| {
            let rows = &order[range.clone()];
            if last {
                rows.iter().rev().find(valid).copied()
            } else {
                rows.iter().find(valid).copied()
            }
        })
        .collect::<Vec<_>>()
        .into();
    Ok(take(column.as_ref(), &indices, None)?)
}

fn mean(values: &Float64Array, order: &[u32], windows: &[Range<usize>]) -> ArrayRef {
    let means: Float64Array = windows
        .iter()
        .map(|range| {
            let (sum, n) = order[range.clone()]
                .iter()
                .map(|&row| row as usize)
                .filter(|&row| values.is_valid(row))
                .fold((0.0, 0u64), |(sum, n), row| (sum + values.value(row), n + 1));
            (n > 0).then(|| sum / n as f64)
        })
        .collect::<Vec<_>>()
        .into();
    Arc::new(means)
}

fn fold_numeric<T>(
    func: AggFunc,
    name: &str,
    values: &PrimitiveArray<T>,
    order: &[u32],
    windows: &[Range<usize>],
) -> Result<ArrayRef>
where
    T: ArrowPrimitiveType,
    T::Native: PartialOrd + CheckedAdd,
{
    let mut out = Vec::with_capacity(windows.len());
    for range in windows {
        let mut acc: Option<T::Native> = None;
        for &row in &order[range.clone()] {
            let row = row as usize;
            if values.is_null(row) {
                continue;
            }
            let v = values.value(row);
            acc = Some(match (acc, func) {
                (None, _) => v,
                (Some(a), AggFunc::Sum) => a.add_checked(v).ok_or_else(|| {
                    Error::Validation(format!("sum of column '{name}' overflows"))
                })?,
                (Some(a), AggFunc::Min) => {
                    if v < a {
                        v
                    } else {
                        a
                    }
                }
                (Some(a), _) => {
                    if v > a {
                        v
                    } else {
                        a
                    }
                }
            });
        }
        out.push(acc);
    }
    Ok(Arc::new(out.into_iter().collect::<PrimitiveArray<T>>()))
}

/// Addition that reports integer overflow. Floats never fail.
pub(crate) trait CheckedAdd: Sized {
    fn add_checked(self, other: Self) -> Option<Self>;
}

impl CheckedAdd for i64 {
    fn add_checked(self, other: Self) -> Option<Self> {
        self.checked_add(other)
    }
}

impl CheckedAdd for u64 {
    fn add_checked(self, other: Self) -> Option<Self> {
        self.checked_add(other)
    }
}

impl CheckedAdd for f64 {
    fn add_checked(self, other: Self) -> Option<Self> {
        Some(self + other)
    }
}
