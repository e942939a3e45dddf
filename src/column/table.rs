use std::fmt;
use std::iter;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{PipelineError, PipelineResult};
use crate::types::{DataSet, Field, Record, Schema, Value};

use super::Column;

/// Named, equal-length columns shared between all row views of the table.
///
/// The row count is fixed at construction. Columns can be added or overwritten in place (the
/// vectorized apply writes its outputs this way), but never removed.
pub struct Table {
    columns: RwLock<Vec<(String, Column)>>,
    num_rows: usize,
}

impl Table {
    /// Create a table from named columns. All columns must have the same length.
    pub fn new(columns: Vec<(String, Column)>) -> PipelineResult<Self> {
        let num_rows = columns.first().map(|(_, c)| c.len()).unwrap_or(0);
        if let Some((name, col)) = columns.iter().find(|(_, c)| c.len() != num_rows) {
            return Err(PipelineError::schema(format!(
                "column '{name}' has {} rows, expected {num_rows}",
                col.len()
            )));
        }
        for (_, col) in &columns {
            col.validate()?;
        }
        Ok(Self {
            columns: RwLock::new(columns),
            num_rows,
        })
    }

    /// Materialize schema'd rows into one column per field name, in first-seen field order.
    ///
    /// Fields missing from a row become nulls. Non-record elements are rejected.
    pub fn from_values(rows: Vec<Value>) -> PipelineResult<Self> {
        let mut names: Vec<String> = Vec::new();
        let mut records: Vec<Vec<(String, Value)>> = Vec::with_capacity(rows.len());
        for row in rows {
            match row {
                Value::Record(r) => {
                    let pairs = r.to_pairs();
                    for (name, _) in &pairs {
                        if !names.contains(name) {
                            names.push(name.clone());
                        }
                    }
                    records.push(pairs);
                }
                other => {
                    return Err(PipelineError::mode(
                        "to_column",
                        format!("rows must be records, found {other}"),
                    ));
                }
            }
        }

        let num_rows = records.len();
        let columns = names
            .into_iter()
            .map(|name| {
                let values = records
                    .iter()
                    .map(|pairs| {
                        pairs
                            .iter()
                            .find(|(k, _)| *k == name)
                            .map(|(_, v)| v.clone())
                            .unwrap_or(Value::Null)
                    })
                    .collect();
                (name, Column::from_values(values))
            })
            .collect();
        Ok(Self {
            columns: RwLock::new(columns),
            num_rows,
        })
    }

    /// Build a table from a row-indexed frame.
    pub fn from_dataset(ds: &DataSet) -> PipelineResult<Self> {
        let columns = ds
            .schema
            .field_names()
            .map(|name| Ok((name.to_string(), Column::from_values(ds.column_values(name)?))))
            .collect::<PipelineResult<Vec<_>>>()?;
        let mut table = Self::new(columns)?;
        table.num_rows = ds.row_count();
        Ok(table)
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.read().iter().map(|(n, _)| n.clone()).collect()
    }

    /// A copy of the named column.
    pub fn column(&self, name: &str) -> Option<Column> {
        self.columns
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c.clone())
    }

    pub fn value(&self, row: usize, name: &str) -> Option<Value> {
        self.columns
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, c)| c.get(row))
    }

    /// All fields of one row, in column order.
    pub fn row_pairs(&self, row: usize) -> Vec<(String, Value)> {
        self.columns
            .read()
            .iter()
            .map(|(n, c)| (n.clone(), c.get(row).unwrap_or(Value::Null)))
            .collect()
    }

    /// Write a single cell. A missing column is added (null-filled) first.
    pub fn set_value(&self, row: usize, name: &str, value: Value) -> PipelineResult<()> {
        if row >= self.num_rows {
            return Err(PipelineError::schema(format!(
                "row {row} out of range for table with {} rows",
                self.num_rows
            )));
        }
        let mut columns = self.columns.write();
        match columns.iter_mut().find(|(n, _)| n == name) {
            Some((_, col)) => col.set(row, value),
            None => {
                let mut col = Column::nulls(self.num_rows);
                col.set(row, value);
                columns.push((name.to_string(), col));
            }
        }
        Ok(())
    }

    /// Add or overwrite a whole column.
    pub fn write_column(&self, name: &str, column: Column) -> PipelineResult<()> {
        if column.len() != self.num_rows {
            return Err(PipelineError::schema(format!(
                "output column '{name}' has {} rows, expected {}",
                column.len(),
                self.num_rows
            )));
        }
        if let Err(PipelineError::Schema { message }) = column.validate() {
            return Err(PipelineError::schema(format!("output column '{name}': {message}")));
        }
        let mut columns = self.columns.write();
        match columns.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = column,
            None => columns.push((name.to_string(), column)),
        }
        Ok(())
    }

    /// Write several output columns keyed positionally by `names`.
    pub fn write_many(&self, names: &[String], columns: Vec<Column>) -> PipelineResult<()> {
        if names.len() != columns.len() {
            return Err(PipelineError::schema(format!(
                "operator produced {} columns for {} outputs",
                columns.len(),
                names.len()
            )));
        }
        for (name, column) in names.iter().zip(columns) {
            self.write_column(name, column)?;
        }
        Ok(())
    }

    /// Row views over this table.
    pub fn views(self: &Arc<Self>) -> impl Iterator<Item = Record> + Send + 'static {
        let table = Arc::clone(self);
        (0..self.num_rows).map(move |row| Record::view(Arc::clone(&table), row))
    }

    /// Copy the table into a row-indexed frame.
    pub fn to_dataset(&self) -> DataSet {
        let columns = self.columns.read();
        let schema = Schema::new(
            columns
                .iter()
                .map(|(n, c)| Field::new(n.clone(), c.data_type()))
                .collect(),
        );
        let rows = (0..self.num_rows)
            .map(|row| {
                columns
                    .iter()
                    .map(|(_, c)| c.get(row).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        DataSet::new(schema, rows)
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("num_rows", &self.num_rows)
            .field("columns", &self.column_names())
            .finish()
    }
}

/// Lazily produced chunk tables.
pub type ChunkStream = Box<dyn Iterator<Item = PipelineResult<Arc<Table>>> + Send>;

/// A sequence of fixed-row-count tables.
pub enum ChunkedTable {
    /// Materialized chunks (multi-pass).
    List(Vec<Arc<Table>>),
    /// Chunks built on demand from an upstream iterator (single-pass).
    Stream(ChunkStream),
}

impl ChunkedTable {
    /// Re-chunk `rows` into tables of `chunksize` rows (the last one may be shorter).
    pub fn feed<I>(rows: I, chunksize: usize, stream: bool) -> PipelineResult<Self>
    where
        I: Iterator<Item = Value> + Send + 'static,
    {
        if chunksize == 0 {
            return Err(PipelineError::mode("set_chunksize", "chunk size must be > 0"));
        }
        let mut rows = rows;
        let chunks = iter::from_fn(move || {
            let chunk: Vec<Value> = rows.by_ref().take(chunksize).collect();
            if chunk.is_empty() {
                None
            } else {
                Some(Table::from_values(chunk).map(Arc::new))
            }
        });
        if stream {
            Ok(ChunkedTable::Stream(Box::new(chunks)))
        } else {
            Ok(ChunkedTable::List(chunks.collect::<PipelineResult<Vec<_>>>()?))
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, ChunkedTable::Stream(_))
    }

    /// Consume into a chunk iterator.
    pub fn into_chunks(self) -> ChunkStream {
        match self {
            ChunkedTable::List(tables) => Box::new(tables.into_iter().map(Ok)),
            ChunkedTable::Stream(it) => it,
        }
    }
}

impl fmt::Debug for ChunkedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkedTable::List(tables) => f.debug_tuple("List").field(&tables.len()).finish(),
            ChunkedTable::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ChunkedTable, Table};
    use crate::column::Column;
    use crate::types::{Record, Value};

    fn rows(n: i64) -> Vec<Value> {
        (0..n)
            .map(|i| Value::Record(Record::new().with("a", i).with("b", format!("r{i}"))))
            .collect()
    }

    #[test]
    fn from_values_uses_first_seen_order_and_nulls() {
        let table = Table::from_values(vec![
            Value::Record(Record::new().with("x", 1)),
            Value::Record(Record::new().with("y", true)),
        ])
        .unwrap();
        assert_eq!(table.column_names(), vec!["x", "y"]);
        assert_eq!(table.value(1, "x"), Some(Value::Null));
        assert_eq!(table.value(1, "y"), Some(Value::Bool(true)));
    }

    #[test]
    fn from_values_rejects_plain_values() {
        let err = Table::from_values(vec![Value::from(1)]).unwrap_err();
        assert!(err.to_string().contains("to_column"));
    }

    #[test]
    fn ragged_columns_are_rejected() {
        let err = Table::new(vec![
            ("a".to_string(), Column::Int64(vec![1, 2])),
            ("b".to_string(), Column::Int64(vec![1])),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn write_many_checks_arity_and_length() {
        let table = Table::from_values(rows(3)).unwrap();
        assert!(table.write_many(&["c".to_string()], vec![]).is_err());
        assert!(table.write_column("c", Column::Int64(vec![1])).is_err());
        table.write_column("a", Column::Int64(vec![9, 9, 9])).unwrap();
        assert_eq!(table.value(2, "a"), Some(Value::Int64(9)));
    }

    #[test]
    fn malformed_tensor_columns_are_rejected() {
        let bad = || Column::Tensor {
            data: vec![],
            shape: vec![3, 3],
        };
        let table = Table::from_values(rows(3)).unwrap();
        let err = table.write_column("t", bad()).unwrap_err();
        assert!(err.to_string().contains("'t'"));
        assert!(table.column("t").is_none());
        assert!(Table::new(vec![("t".to_string(), bad())]).is_err());
    }

    #[test]
    fn feed_chunks_rows_with_short_tail() {
        let chunks = ChunkedTable::feed(rows(5).into_iter(), 2, false).unwrap();
        let ChunkedTable::List(tables) = chunks else {
            panic!("expected materialized chunks");
        };
        let sizes: Vec<usize> = tables.iter().map(|t| t.num_rows()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn streamed_feed_is_lazy() {
        let chunks = ChunkedTable::feed(rows(4).into_iter(), 3, true).unwrap();
        assert!(chunks.is_stream());
        let sizes: Vec<usize> = chunks
            .into_chunks()
            .map(|t| t.unwrap().num_rows())
            .collect();
        assert_eq!(sizes, vec![3, 1]);
    }
}
