//! `data-collection` builds chainable, lazily evaluated pipelines over dynamically typed
//! [`types::Value`]s.
//!
//! The primary entrypoint is [`DataCollection`], created with [`of`], [`range`], [`dc`] or one of
//! the [`ingestion`] readers, and transformed by chaining methods such as
//! [`DataCollection::map`], [`DataCollection::filter`] and [`DataCollection::batch`].
//!
//! ## What a pipeline can hold
//!
//! - **row-based**: a list (multi-pass, indexable), a single-pass stream, or a row-indexed
//!   [`types::DataSet`] frame
//! - **column-based**: one shared [`column::Table`]; elements are row views into it
//! - **chunk-based**: a [`column::ChunkedTable`] of tables with a fixed row count
//!
//! Every transform returns a child pipeline that keeps the parent's streaming mode and inherits
//! its configuration (worker pool, chunk size, JIT compiler).
//!
//! ## Quick example: named operators
//!
//! Operators live in a process-wide registry and are applied by name. An index names the record
//! fields an operator reads and writes.
//!
//! ```rust
//! use data_collection::types::Value;
//! use data_collection::operator::OpArgs;
//!
//! data_collection::register_fn("lib_doc_add_one", |v| Value::Int64(v.as_i64().unwrap_or(0) + 1));
//!
//! let out = data_collection::dc()
//!     .index("a")
//!     .call(OpArgs::new().arg(1).arg(2))
//!     .unwrap()
//!     .op("lib_doc_add_one")
//!     .index(("a", "b"))
//!     .call(OpArgs::new())
//!     .unwrap()
//!     .to_list();
//! let second = out[1].as_record().unwrap();
//! assert_eq!(second.get("b"), Some(Value::Int64(3)));
//! ```
//!
//! ## Element failures
//!
//! A failing operator never aborts the pipeline: the element becomes an absent marker
//! ([`types::Value::Absent`]), a warning is logged through `tracing`, and later operators pass it
//! through. [`DataCollection::drop_empty`] removes the markers;
//! [`DataCollection::try_to_list`] turns the first one into an error.
//!
//! ## Modules
//!
//! - [`collection`]: the pipeline container and its transforms
//! - [`operator`]: the operator trait, registry, lazy wrapper and name dispatcher
//! - [`column`]: column tables, chunking and vectorized application
//! - [`execution`]: worker pools, ordered parallel map and split
//! - [`scope`]: the context scope read by operators
//! - [`dispatch`]: dynamic dispatch wrappers and schema indexes
//! - [`ingestion`]: CSV/JSON/glob readers
//! - [`types`]: values, records and frames
//! - [`error`]: the crate error type

pub mod collection;
pub mod column;
pub mod dispatch;
pub mod error;
pub mod execution;
pub mod ingestion;
pub mod operator;
pub mod scope;
pub mod types;

pub use collection::{DataCollection, PipelineOptions, Storage, StorageMode};
pub use dispatch::{DynamicDispatch, Index, Key};
pub use error::{PipelineError, PipelineResult};
pub use execution::{Backend, Parallelism};
pub use operator::registry::{register_callable, register_class, register_factory, register_fn, register_try_fn};
pub use operator::{LazyOperator, OpArgs, Operator, OperatorClass};
pub use types::{Record, Value};

/// A list-backed pipeline over `items`.
pub fn of<I, V>(items: I) -> DataCollection
where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
{
    DataCollection::of(items)
}

/// A list-backed pipeline over `0..end`.
pub fn range(end: i64) -> DataCollection {
    DataCollection::range(end)
}

/// Pipeline constructor driven by an index.
///
/// The positional arguments are the elements. Without an index they are used as is. With one
/// field name each element becomes a record with that field; with several names each element
/// must be a list, zipped with the names into a record.
pub fn dc() -> DynamicDispatch<PipelineResult<DataCollection>> {
    DynamicDispatch::new(|path, args: OpArgs| {
        let Some(index) = path.schema_index() else {
            return Ok(DataCollection::of(args.positional));
        };
        let names: Vec<String> = index
            .keys()
            .iter()
            .flat_map(|key| key.names())
            .map(str::to_string)
            .collect();
        let records = args
            .positional
            .into_iter()
            .map(|item| match (names.as_slice(), item) {
                ([name], item) => Ok(Record::new().with(name.clone(), item)),
                (names, Value::List(values)) if values.len() == names.len() => {
                    Ok(Record::from_pairs(names.iter().cloned().zip(values)))
                }
                (names, other) => Err(PipelineError::mode(
                    format!("dc[{index}]"),
                    format!("each element must be a list of {} values, found {other}", names.len()),
                )),
            })
            .collect::<PipelineResult<Vec<Record>>>()?;
        Ok(DataCollection::of(records))
    })
}

/// Registry operators by dotted name, built lazily on first call.
///
/// `ops().attr("text").attr("split").index(("line", "words")).call(args)` yields a
/// [`LazyOperator`] for the registry entry `text.split`, constructed with `args` when first
/// applied.
pub fn ops() -> DynamicDispatch<PipelineResult<LazyOperator>> {
    DynamicDispatch::new(|path, args: OpArgs| {
        let name = path.name().ok_or_else(|| PipelineError::Resolution { name: String::new() })?;
        LazyOperator::new(name, path.schema_index().cloned(), args, false)
    })
}

#[cfg(test)]
mod tests {
    use super::{dc, ops};
    use crate::error::PipelineError;
    use crate::operator::{OpArgs, OperatorState};
    use crate::types::Value;

    #[test]
    fn dc_without_index_keeps_values() {
        let out = dc().call(OpArgs::new().arg(1).arg(2)).unwrap().to_list();
        assert_eq!(out, vec![Value::Int64(1), Value::Int64(2)]);
    }

    #[test]
    fn dc_zips_tuples_with_names() {
        let out = dc()
            .index(("s", "n"))
            .call(OpArgs::new().arg(Value::list(["a"])).arg(Value::list(["b"])))
            .err();
        assert!(matches!(out, Some(PipelineError::Mode { .. })));

        let rows = OpArgs::new()
            .arg(Value::List(vec![Value::from("a"), Value::from(1)]))
            .arg(Value::List(vec![Value::from("b"), Value::from(2)]));
        let out = dc().index(("s", "n")).call(rows).unwrap().to_list();
        let rec = out[1].as_record().unwrap();
        assert_eq!(rec.get("s"), Some(Value::from("b")));
        assert_eq!(rec.get("n"), Some(Value::Int64(2)));
    }

    #[test]
    fn ops_defers_construction() {
        let op = ops().attr("lib_never_registered").call(OpArgs::new()).unwrap();
        assert_eq!(op.name(), "lib_never_registered");
        assert_eq!(op.state(), OperatorState::Uninitialized);
        assert!(op.call(Value::Null).is_err());
        assert_eq!(op.state(), OperatorState::Failed);
    }
}
