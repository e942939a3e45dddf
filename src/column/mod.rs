//! Column storage engine.
//!
//! - [`Column`]: one typed array (with a tensor form for fixed-shape list values and a generic
//!   fallback for everything else)
//! - [`Table`]: named, equal-length columns shared behind an `Arc` so that row views
//!   ([`crate::types::Record::view`]) can read and write it
//! - [`ChunkedTable`]: a sequence of fixed-row-count tables for memory-bounded processing
//! - [`apply`]: vectorized application of operators to tables

pub mod apply;
mod table;

pub use table::{ChunkedTable, Table};

use crate::error::{PipelineError, PipelineResult};
use crate::types::{DataType, Value};

/// A single column of values.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Bool(Vec<bool>),
    Utf8(Vec<String>),
    /// Row-major `f64` buffer; `shape[0]` is the row count.
    Tensor { data: Vec<f64>, shape: Vec<usize> },
    /// Values that are not representable as a flat typed array (nulls, mixed types, records).
    Values(Vec<Value>),
}

impl Column {
    /// Infer the narrowest column representation for `values`.
    ///
    /// Integers mixed with floats widen to `Float64`. Lists of numbers with a uniform shape become
    /// a [`Column::Tensor`]. Anything else (including nulls) falls back to [`Column::Values`].
    pub fn from_values(values: Vec<Value>) -> Self {
        if values.is_empty() {
            return Column::Values(values);
        }
        if values.iter().all(|v| matches!(v, Value::Int64(_))) {
            return Column::Int64(values.iter().filter_map(Value::as_i64).collect());
        }
        if values
            .iter()
            .all(|v| matches!(v, Value::Int64(_) | Value::Float64(_)))
        {
            return Column::Float64(values.iter().filter_map(Value::as_f64).collect());
        }
        if values.iter().all(|v| matches!(v, Value::Bool(_))) {
            return Column::Bool(values.iter().filter_map(Value::as_bool).collect());
        }
        if values.iter().all(|v| matches!(v, Value::Utf8(_))) {
            return Column::Utf8(
                values
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::Utf8(s) => Some(s),
                        _ => None,
                    })
                    .collect(),
            );
        }
        if values.iter().all(|v| matches!(v, Value::List(_))) {
            if let Some(tensor) = tensor_from_rows(&values) {
                return tensor;
            }
        }
        Column::Values(values)
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Int64(v) => v.len(),
            Column::Float64(v) => v.len(),
            Column::Bool(v) => v.len(),
            Column::Utf8(v) => v.len(),
            Column::Tensor { shape, .. } => shape.first().copied().unwrap_or(0),
            Column::Values(v) => v.len(),
        }
    }

    /// Check that a tensor buffer holds exactly `shape.iter().product()` cells.
    pub fn validate(&self) -> PipelineResult<()> {
        match self {
            Column::Tensor { data, shape } if shape.is_empty() => Err(PipelineError::schema(format!(
                "tensor column with {} cells has an empty shape",
                data.len()
            ))),
            Column::Tensor { data, shape } if data.len() != shape.iter().product::<usize>() => {
                Err(PipelineError::schema(format!(
                    "tensor column has {} cells, shape {shape:?} needs {}",
                    data.len(),
                    shape.iter().product::<usize>()
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Column::Int64(_) => DataType::Int64,
            Column::Float64(_) => DataType::Float64,
            Column::Bool(_) => DataType::Bool,
            Column::Utf8(_) => DataType::Utf8,
            Column::Tensor { .. } => DataType::List,
            Column::Values(_) => DataType::Any,
        }
    }

    /// Buffer shape with a free leading dimension: `[-1]` for flat columns, `[-1, d1, ...]` for
    /// tensors.
    pub fn shape(&self) -> Vec<isize> {
        match self {
            Column::Tensor { shape, .. } => std::iter::once(-1)
                .chain(shape.iter().skip(1).map(|d| *d as isize))
                .collect(),
            _ => vec![-1],
        }
    }

    /// The value at `row`, or `None` when out of range.
    pub fn get(&self, row: usize) -> Option<Value> {
        match self {
            Column::Int64(v) => v.get(row).map(|x| Value::Int64(*x)),
            Column::Float64(v) => v.get(row).map(|x| Value::Float64(*x)),
            Column::Bool(v) => v.get(row).map(|x| Value::Bool(*x)),
            Column::Utf8(v) => v.get(row).map(|x| Value::Utf8(x.clone())),
            Column::Tensor { data, shape } => {
                if row >= self.len() {
                    return None;
                }
                let inner = &shape[1..];
                let width: usize = inner.iter().product();
                data.get(row * width..(row + 1) * width)
                    .map(|cells| nest(cells, inner))
            }
            Column::Values(v) => v.get(row).cloned(),
        }
    }

    /// All values in row order.
    pub fn to_values(&self) -> Vec<Value> {
        (0..self.len()).filter_map(|i| self.get(i)).collect()
    }

    /// Overwrite the value at `row`, widening to [`Column::Values`] when the type does not fit.
    pub(crate) fn set(&mut self, row: usize, value: Value) {
        match (&mut *self, &value) {
            (Column::Int64(v), Value::Int64(x)) => v[row] = *x,
            (Column::Float64(v), Value::Float64(x)) => v[row] = *x,
            (Column::Float64(v), Value::Int64(x)) => v[row] = *x as f64,
            (Column::Bool(v), Value::Bool(x)) => v[row] = *x,
            (Column::Utf8(v), Value::Utf8(x)) => v[row] = x.clone(),
            (Column::Values(v), _) => v[row] = value,
            _ => {
                let mut values = self.to_values();
                values[row] = value;
                *self = Column::Values(values);
            }
        }
    }

    /// A column of `len` nulls.
    pub(crate) fn nulls(len: usize) -> Self {
        Column::Values(vec![Value::Null; len])
    }
}

impl From<Vec<i64>> for Column {
    fn from(v: Vec<i64>) -> Self {
        Column::Int64(v)
    }
}

impl From<Vec<f64>> for Column {
    fn from(v: Vec<f64>) -> Self {
        Column::Float64(v)
    }
}

impl From<Vec<bool>> for Column {
    fn from(v: Vec<bool>) -> Self {
        Column::Bool(v)
    }
}

impl From<Vec<String>> for Column {
    fn from(v: Vec<String>) -> Self {
        Column::Utf8(v)
    }
}

fn tensor_from_rows(rows: &[Value]) -> Option<Column> {
    let inner = value_shape(&rows[0])?;
    let mut data = Vec::new();
    for row in rows {
        if value_shape(row)? != inner {
            return None;
        }
        flatten_numbers(row, &mut data);
    }
    let mut shape = vec![rows.len()];
    shape.extend(inner);
    Some(Column::Tensor { data, shape })
}

fn value_shape(v: &Value) -> Option<Vec<usize>> {
    match v {
        Value::Int64(_) | Value::Float64(_) => Some(Vec::new()),
        Value::List(items) => {
            let first = value_shape(items.first()?)?;
            for item in &items[1..] {
                if value_shape(item)? != first {
                    return None;
                }
            }
            let mut shape = vec![items.len()];
            shape.extend(first);
            Some(shape)
        }
        _ => None,
    }
}

fn flatten_numbers(v: &Value, out: &mut Vec<f64>) {
    match v {
        Value::List(items) => items.iter().for_each(|item| flatten_numbers(item, out)),
        other => out.extend(other.as_f64()),
    }
}

fn nest(data: &[f64], shape: &[usize]) -> Value {
    match shape.split_first() {
        None => Value::Float64(data.first().copied().unwrap_or_default()),
        Some((_, inner)) => {
            let width: usize = inner.iter().product();
            Value::List(data.chunks(width.max(1)).map(|c| nest(c, inner)).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Column;
    use crate::types::{DataType, Value};

    #[test]
    fn inference_picks_narrowest_type() {
        assert_eq!(
            Column::from_values(vec![Value::from(1), Value::from(2)]),
            Column::Int64(vec![1, 2])
        );
        assert_eq!(
            Column::from_values(vec![Value::from(1), Value::from(2.5)]),
            Column::Float64(vec![1.0, 2.5])
        );
        assert_eq!(
            Column::from_values(vec![Value::from(1), Value::Null]).data_type(),
            DataType::Any
        );
    }

    #[test]
    fn embeddings_become_tensors() {
        let col = Column::from_values(vec![
            Value::list([1.0, 2.0, 3.0]),
            Value::list([4.0, 5.0, 6.0]),
        ]);
        assert_eq!(col.shape(), vec![-1, 3]);
        assert_eq!(col.len(), 2);
        assert_eq!(col.get(1), Some(Value::list([4.0, 5.0, 6.0])));
    }

    #[test]
    fn ragged_lists_fall_back_to_values() {
        let col = Column::from_values(vec![Value::list([1, 2]), Value::list([3])]);
        assert!(matches!(col, Column::Values(_)));
        assert_eq!(col.shape(), vec![-1]);
    }

    #[test]
    fn tensor_buffer_must_match_shape() {
        let short = Column::Tensor {
            data: vec![],
            shape: vec![3, 3],
        };
        assert!(short.validate().is_err());
        assert_eq!(short.get(0), None);
        let ok = Column::Tensor {
            data: vec![1.0, 2.0],
            shape: vec![2, 1],
        };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.get(1), Some(Value::list([2.0])));
    }

    #[test]
    fn set_widens_on_type_mismatch() {
        let mut col = Column::Int64(vec![1, 2]);
        col.set(1, Value::from("x"));
        assert_eq!(col.to_values(), vec![Value::from(1), Value::from("x")]);
    }
}
