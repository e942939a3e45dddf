//! The pipeline container.
//!
//! A [`DataCollection`] owns its backing [`Storage`] and a [`PipelineConfig`]. Every transform
//! consumes the pipeline and returns a child built by the factory: the child keeps the parent's
//! streaming mode (a streamed parent yields a lazy child, a list-backed parent a materialized one)
//! and inherits its configuration.
//!
//! Storage modes:
//!
//! - row-based: a list, a single-pass stream, or a row-indexed [`DataSet`] frame
//! - column-based: one shared [`Table`]; iteration yields row views into it
//! - chunk-based: a [`ChunkedTable`] of fixed-row-count tables
//!
//! ## Example
//!
//! ```rust
//! use data_collection::collection::DataCollection;
//! use data_collection::types::Value;
//!
//! let out = DataCollection::range(6)
//!     .map(|v| Value::Int64(v.as_i64().unwrap_or(0) * 10))
//!     .filter(|v| v.as_i64().is_some_and(|x| x > 10), false)
//!     .batch(2, false)
//!     .unwrap()
//!     .to_list();
//! assert_eq!(out.len(), 2);
//! assert_eq!(out[0], Value::list([20i64, 30]));
//! ```

mod config;
mod processing;

use std::fmt;
use std::iter;
use std::sync::Arc;

use tracing::warn;

use crate::column::{ChunkedTable, Table};
use crate::dispatch::{DispatchPath, Index};
use crate::error::{PipelineError, PipelineResult};
use crate::execution::ValueIter;
use crate::operator::OpArgs;
use crate::operator::dispatcher::{self, Bindings};
use crate::scope;
use crate::types::{DataSet, Record, Value};

pub use config::{ConfigSnapshot, PipelineConfig, PipelineOptions};

/// Backing store of a pipeline.
pub enum Storage {
    List(Vec<Value>),
    Stream(ValueIter),
    Frame(DataSet),
    Table(Arc<Table>),
    Chunks(ChunkedTable),
}

impl Storage {
    fn into_values(self) -> ValueIter {
        match self {
            Storage::List(values) => Box::new(values.into_iter()),
            Storage::Stream(it) => it,
            Storage::Frame(ds) => Box::new((0..ds.row_count()).filter_map(move |i| ds.record(i).map(Value::Record))),
            Storage::Table(table) => Box::new(table.views().map(Value::Record)),
            Storage::Chunks(chunks) => Box::new(chunks.into_chunks().flat_map(|chunk| -> ValueIter {
                match chunk {
                    Ok(table) => Box::new(table.views().map(Value::Record)),
                    Err(e) => {
                        warn!(error = %e, "chunk failed, continuing");
                        Box::new(iter::once(Value::absent(Value::Null, e)))
                    }
                }
            })),
        }
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Storage::List(values) => f.debug_tuple("List").field(&values.len()).finish(),
            Storage::Stream(_) => f.write_str("Stream(..)"),
            Storage::Frame(ds) => f.debug_tuple("Frame").field(&ds.row_count()).finish(),
            Storage::Table(table) => f.debug_tuple("Table").field(table).finish(),
            Storage::Chunks(chunks) => f.debug_tuple("Chunks").field(chunks).finish(),
        }
    }
}

/// How elements are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    RowBased,
    ColumnBased,
    ChunkBased,
}

/// A chainable, lazily or eagerly evaluated pipeline.
#[derive(Debug)]
pub struct DataCollection {
    storage: Storage,
    config: PipelineConfig,
}

impl DataCollection {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            config: PipelineConfig::default(),
        }
    }

    /// A list-backed pipeline over `items`.
    pub fn of<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::new(Storage::List(items.into_iter().map(Into::into).collect()))
    }

    /// A single-pass pipeline pulling from `items`.
    pub fn from_stream<I>(items: I) -> Self
    where
        I: Iterator<Item = Value> + Send + 'static,
    {
        Self::new(Storage::Stream(Box::new(items)))
    }

    /// `0..end` as a list-backed pipeline.
    pub fn range(end: i64) -> Self {
        Self::of(0..end)
    }

    pub fn from_dataset(ds: DataSet) -> Self {
        Self::new(Storage::Frame(ds))
    }

    pub fn from_table(table: Arc<Table>) -> Self {
        Self::new(Storage::Table(table))
    }

    /// Child pipeline over `items`, materialized unless `stream`.
    pub(crate) fn derive(config: PipelineConfig, stream: bool, items: ValueIter) -> Self {
        let storage = if stream {
            Storage::Stream(items)
        } else {
            Storage::List(items.collect())
        };
        Self::derive_with(config, storage)
    }

    /// Child pipeline over an explicit storage.
    pub(crate) fn derive_with(config: PipelineConfig, storage: Storage) -> Self {
        Self { storage, config }
    }

    /// Like [`Self::derive`] for fallible items. A materialized child fails on the first error;
    /// a streamed child turns errors into absent markers.
    pub(crate) fn derive_fallible<I>(config: PipelineConfig, stream: bool, items: I) -> PipelineResult<Self>
    where
        I: Iterator<Item = PipelineResult<Value>> + Send + 'static,
    {
        if stream {
            let items = items.map(|item| {
                item.unwrap_or_else(|e| {
                    warn!(error = %e, "element failed, continuing");
                    Value::absent(Value::Null, e)
                })
            });
            return Ok(Self::derive_with(config, Storage::Stream(Box::new(items))));
        }
        Ok(Self::derive_with(config, Storage::List(items.collect::<PipelineResult<_>>()?)))
    }

    /// Split into configuration, streaming mode and element iterator.
    pub(crate) fn into_parts(self) -> (PipelineConfig, bool, ValueIter) {
        let stream = self.is_stream();
        (self.config, stream, self.storage.into_values())
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn pipeline_config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_stream(&self) -> bool {
        match &self.storage {
            Storage::Stream(_) => true,
            Storage::Chunks(chunks) => chunks.is_stream(),
            _ => false,
        }
    }

    pub fn mode(&self) -> StorageMode {
        match &self.storage {
            Storage::List(_) | Storage::Stream(_) | Storage::Frame(_) => StorageMode::RowBased,
            Storage::Table(_) => StorageMode::ColumnBased,
            Storage::Chunks(_) => StorageMode::ChunkBased,
        }
    }

    /// Switch to single-pass evaluation. Chunked pipelines stay chunked.
    pub fn stream(self) -> Self {
        let storage = match self.storage {
            s @ (Storage::Stream(_) | Storage::Chunks(ChunkedTable::Stream(_))) => s,
            Storage::Chunks(ChunkedTable::List(tables)) => {
                Storage::Chunks(ChunkedTable::Stream(Box::new(tables.into_iter().map(Ok))))
            }
            other => Storage::Stream(other.into_values()),
        };
        Self::derive_with(self.config, storage)
    }

    /// Materialize a streamed pipeline. Failed chunks of a chunked stream are logged and dropped.
    pub fn unstream(self) -> Self {
        let storage = match self.storage {
            Storage::Stream(it) => Storage::List(it.collect()),
            Storage::Chunks(ChunkedTable::Stream(chunks)) => Storage::Chunks(ChunkedTable::List(
                chunks
                    .filter_map(|chunk| {
                        chunk
                            .map_err(|e| warn!(error = %e, "dropping failed chunk"))
                            .ok()
                    })
                    .collect(),
            )),
            other => other,
        };
        Self::derive_with(self.config, storage)
    }

    /// Number of elements. Streams have no known length.
    pub fn len(&self) -> PipelineResult<usize> {
        match &self.storage {
            Storage::List(values) => Ok(values.len()),
            Storage::Frame(ds) => Ok(ds.row_count()),
            Storage::Table(table) => Ok(table.num_rows()),
            Storage::Chunks(ChunkedTable::List(tables)) => Ok(tables.iter().map(|t| t.num_rows()).sum()),
            Storage::Stream(_) | Storage::Chunks(ChunkedTable::Stream(_)) => {
                Err(PipelineError::mode("len", "a non-streamed pipeline"))
            }
        }
    }

    pub fn is_empty(&self) -> PipelineResult<bool> {
        self.len().map(|n| n == 0)
    }

    /// Random access. Only list, frame and table backings support it.
    pub fn get(&self, idx: usize) -> PipelineResult<Value> {
        let found = match &self.storage {
            Storage::List(values) => values.get(idx).cloned(),
            Storage::Frame(ds) => ds.record(idx).map(Value::Record),
            Storage::Table(table) => (idx < table.num_rows()).then(|| Value::Record(Record::view(Arc::clone(table), idx))),
            Storage::Stream(_) | Storage::Chunks(_) => {
                return Err(PipelineError::mode("get", "a list or table backed pipeline"));
            }
        };
        found.ok_or_else(|| PipelineError::mode("get", format!("index {idx} within bounds")))
    }

    /// Replace the element at `idx`. Frames and tables take records, matched by field name.
    pub fn set(&mut self, idx: usize, value: impl Into<Value>) -> PipelineResult<()> {
        let value = value.into();
        match &mut self.storage {
            Storage::List(values) => {
                let slot = values
                    .get_mut(idx)
                    .ok_or_else(|| PipelineError::mode("set", format!("index {idx} within bounds")))?;
                *slot = value;
                Ok(())
            }
            Storage::Frame(ds) => {
                let record = record_arg(value)?;
                let row: Vec<Value> = ds
                    .schema
                    .field_names()
                    .map(|name| record.get(name).unwrap_or(Value::Null))
                    .collect();
                let slot = ds
                    .rows
                    .get_mut(idx)
                    .ok_or_else(|| PipelineError::mode("set", format!("index {idx} within bounds")))?;
                *slot = row;
                Ok(())
            }
            Storage::Table(table) => {
                let record = record_arg(value)?;
                record
                    .to_pairs()
                    .into_iter()
                    .try_for_each(|(name, v)| table.set_value(idx, &name, v))
            }
            Storage::Stream(_) | Storage::Chunks(_) => {
                Err(PipelineError::mode("set", "a list or table backed pipeline"))
            }
        }
    }

    /// Drain into a vector. Absent markers are kept.
    pub fn to_list(self) -> Vec<Value> {
        self.storage.into_values().collect()
    }

    /// Drain into a vector, failing on the first absent marker.
    pub fn try_to_list(self) -> PipelineResult<Vec<Value>> {
        self.storage
            .into_values()
            .map(|v| match v {
                Value::Absent(absent) => Err(PipelineError::execution(format!(
                    "element {} failed: {}",
                    absent.input, absent.error
                ))),
                other => Ok(other),
            })
            .collect()
    }

    /// Materialize as a row-indexed frame. Elements must be records.
    pub fn to_dataset(self) -> PipelineResult<DataSet> {
        match self.storage {
            Storage::Frame(ds) => Ok(ds),
            Storage::Table(table) => Ok(table.to_dataset()),
            other => {
                let records = other
                    .into_values()
                    .map(|v| match v {
                        Value::Record(r) => Ok(r),
                        other => Err(PipelineError::mode(
                            "to_dataset",
                            format!("elements must be records, found {other}"),
                        )),
                    })
                    .collect::<PipelineResult<Vec<Record>>>()?;
                Ok(DataSet::from_records(&records))
            }
        }
    }

    /// Materialize all rows into one shared column table.
    pub fn to_column(self) -> PipelineResult<Self> {
        let storage = match self.storage {
            s @ (Storage::Table(_) | Storage::Chunks(_)) => s,
            Storage::Frame(ds) => Storage::Table(Arc::new(Table::from_dataset(&ds)?)),
            other => Storage::Table(Arc::new(Table::from_values(other.into_values().collect())?)),
        };
        Ok(Self::derive_with(self.config, storage))
    }

    /// Re-chunk into tables of `chunksize` rows; later column applies run chunk by chunk.
    pub fn set_chunksize(self, chunksize: usize) -> PipelineResult<Self> {
        let (mut config, stream, items) = self.into_parts();
        let chunks = ChunkedTable::feed(items, chunksize, stream)?;
        config.set_chunksize(chunksize);
        Ok(Self::derive_with(config, Storage::Chunks(chunks)))
    }

    /// Start a dispatched operator call resolved against `bindings`.
    pub fn dispatch(self, bindings: Bindings) -> PipelineDispatch {
        PipelineDispatch {
            dc: self,
            bindings,
            path: DispatchPath::new(),
        }
    }

    /// Start a dispatched call of the registry operator `name`.
    pub fn op(self, name: &str) -> PipelineDispatch {
        self.dispatch(Bindings::new()).attr(name)
    }
}

fn record_arg(value: Value) -> PipelineResult<Record> {
    match value {
        Value::Record(r) => Ok(r),
        other => Err(PipelineError::mode("set", format!("a record value, found {other}"))),
    }
}

impl IntoIterator for DataCollection {
    type Item = Value;
    type IntoIter = ValueIter;

    fn into_iter(self) -> ValueIter {
        self.storage.into_values()
    }
}

impl FromIterator<Value> for DataCollection {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Self::new(Storage::List(iter.into_iter().collect()))
    }
}

/// A dispatched operator call on a pipeline, built up with [`Self::attr`] and [`Self::index`].
#[derive(Debug)]
pub struct PipelineDispatch {
    dc: DataCollection,
    bindings: Bindings,
    path: DispatchPath,
}

impl PipelineDispatch {
    pub fn attr(mut self, segment: &str) -> Self {
        self.path = self.path.attr(segment);
        self
    }

    pub fn index(mut self, index: impl Into<Index>) -> Self {
        self.path = self.path.index(index);
        self
    }

    /// Resolve the operator and map it over the pipeline.
    pub fn call(self, args: OpArgs) -> PipelineResult<DataCollection> {
        let op = {
            let _frame = scope::enter(self.path.frame());
            dispatcher::resolve(&self.path, &args, &self.bindings, self.dc.config.jit())?
        };
        self.dc.map_op(op)
    }
}
