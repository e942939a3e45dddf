//! Lazily constructed operators.
//!
//! A [`LazyOperator`] records the operator name, schema index and construction arguments, and
//! builds the operator on first use. Construction is single-flight: concurrent first calls block
//! until one of them has built the operator, and the instance is then reused for every element.
//! A failed construction is sticky.
//!
//! The operator's calling convention ([`ExecMode`]) is selected once, right after construction.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::column::Column;
use crate::dispatch::{Index, Key};
use crate::error::{PipelineError, PipelineResult};
use crate::scope;
use crate::types::{DataSet, Record, Value};

use super::registry::{self, Factory};
use super::{Capabilities, ExecMode, OpArgs, Operator};

/// Lifecycle of a [`LazyOperator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

#[derive(Clone)]
enum Source {
    Registry,
    Factory(Factory),
    Instance(Arc<dyn Operator>),
}

struct Ready {
    op: Arc<dyn Operator>,
    caps: Capabilities,
    mode: ExecMode,
}

impl Ready {
    fn new(op: Arc<dyn Operator>) -> Self {
        let caps = op.capabilities();
        Self {
            op,
            caps,
            mode: ExecMode::select(caps),
        }
    }
}

enum Failure {
    Unresolved,
    Construction(String),
}

/// An operator that is built on first use and then reused.
pub struct LazyOperator {
    name: String,
    index: Option<Index>,
    args: OpArgs,
    source: Source,
    ready: OnceCell<Ready>,
    failure: OnceCell<Failure>,
    initializing: AtomicBool,
    call_lock: Mutex<()>,
}

impl LazyOperator {
    /// Wrap the registry operator `name`.
    ///
    /// With `load`, the operator is constructed immediately and construction errors are returned
    /// here. Otherwise construction waits for the first call.
    pub fn new(name: impl Into<String>, index: Option<Index>, args: OpArgs, load: bool) -> PipelineResult<Self> {
        let op = Self::with_source(name.into(), index, args, Source::Registry);
        if load {
            op.ensure_ready()?;
        }
        Ok(op)
    }

    /// Wrap a factory; construction is deferred to first use.
    pub fn with_factory(name: impl Into<String>, index: Option<Index>, args: OpArgs, factory: Factory) -> Self {
        Self::with_source(name.into(), index, args, Source::Factory(factory))
    }

    /// Wrap an already constructed operator.
    pub fn from_instance(op: Arc<dyn Operator>, name: impl Into<String>, index: Option<Index>) -> Self {
        let wrapper = Self::with_source(name.into(), index, OpArgs::new(), Source::Instance(Arc::clone(&op)));
        let _ = wrapper.ready.set(Ready::new(op));
        wrapper
    }

    fn with_source(name: String, index: Option<Index>, args: OpArgs, source: Source) -> Self {
        Self {
            name,
            index: index.filter(|i| !i.keys().is_empty()),
            args,
            source,
            ready: OnceCell::new(),
            failure: OnceCell::new(),
            initializing: AtomicBool::new(false),
            call_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> Option<&Index> {
        self.index.as_ref()
    }

    pub fn args(&self) -> &OpArgs {
        &self.args
    }

    pub fn state(&self) -> OperatorState {
        if self.ready.get().is_some() {
            OperatorState::Ready
        } else if self.failure.get().is_some() {
            OperatorState::Failed
        } else if self.initializing.load(Ordering::SeqCst) {
            OperatorState::Initializing
        } else {
            OperatorState::Uninitialized
        }
    }

    fn failure_error(&self, failure: &Failure) -> PipelineError {
        match failure {
            Failure::Unresolved => PipelineError::Resolution {
                name: self.name.clone(),
            },
            Failure::Construction(message) => PipelineError::construction(&self.name, message.clone()),
        }
    }

    fn ready(&self) -> PipelineResult<&Ready> {
        if let Some(ready) = self.ready.get() {
            return Ok(ready);
        }
        self.ready.get_or_try_init(|| {
            if let Some(failure) = self.failure.get() {
                return Err(self.failure_error(failure));
            }
            self.initializing.store(true, Ordering::SeqCst);
            let built = self.construct();
            self.initializing.store(false, Ordering::SeqCst);
            match built {
                Ok(op) => {
                    let ready = Ready::new(op);
                    debug!(operator = %self.name, mode = ?ready.mode, "operator constructed");
                    Ok(ready)
                }
                Err(e) => {
                    let failure = match &e {
                        PipelineError::Resolution { .. } => Failure::Unresolved,
                        PipelineError::Construction { message, .. } => Failure::Construction(message.clone()),
                        other => Failure::Construction(other.to_string()),
                    };
                    let _ = self.failure.set(failure);
                    Err(e)
                }
            }
        })
    }

    fn construct(&self) -> PipelineResult<Arc<dyn Operator>> {
        let mut frame = Record::new().with(scope::NAME_KEY, self.name.as_str());
        if let Some(index) = &self.index {
            frame = frame.with(scope::INDEX_KEY, index.to_value());
        }
        let _frame = scope::enter(frame);
        match &self.source {
            Source::Registry => registry::construct(&self.name, &self.args),
            Source::Factory(factory) => factory(&self.args),
            Source::Instance(op) => Ok(Arc::clone(op)),
        }
    }

    /// Construct the operator if that has not happened yet.
    pub fn ensure_ready(&self) -> PipelineResult<&Arc<dyn Operator>> {
        self.ready().map(|r| &r.op)
    }

    pub fn capabilities(&self) -> PipelineResult<Capabilities> {
        self.ready().map(|r| r.caps)
    }

    pub fn mode(&self) -> PipelineResult<ExecMode> {
        self.ready().map(|r| r.mode)
    }

    pub fn is_stateful(&self) -> PipelineResult<bool> {
        self.ready().map(|r| r.caps.stateful)
    }

    fn invoke(&self, ready: &Ready, args: &[Value]) -> PipelineResult<Value> {
        if ready.caps.stateful {
            let _serial = self.call_lock.lock();
            ready.op.call(args)
        } else {
            ready.op.call(args)
        }
    }

    /// Apply the operator to one element.
    ///
    /// Without a schema index the element itself is the argument and the result replaces it.
    /// With an index, the input key's fields are read from the record and the result is written
    /// to the output key's fields; a group output expects the operator to return a list.
    pub fn call(&self, input: Value) -> PipelineResult<Value> {
        let ready = self.ready()?;
        let Some(index) = &self.index else {
            return self.invoke(ready, std::slice::from_ref(&input));
        };
        let Value::Record(mut record) = input else {
            return Err(PipelineError::mode(
                format!("operator `{}` with index [{index}]", self.name),
                "elements must be records",
            ));
        };
        let args = match index.input() {
            Some(key) => read_key(&record, key)?,
            None => Vec::new(),
        };
        let out = self.invoke(ready, &args)?;
        if let Some(key) = index.output() {
            write_key(&mut record, key, out)?;
        }
        Ok(Value::Record(record))
    }

    /// Apply the operator to whole columns.
    ///
    /// Non-vectorized operators run row by row; a failing row becomes an absent marker in every
    /// output column.
    pub fn vcall(&self, columns: &[Column]) -> PipelineResult<Vec<Column>> {
        let ready = self.ready()?;
        if ready.mode == ExecMode::Vectorized {
            return ready.op.vcall(columns);
        }

        let rows = columns.first().map(Column::len).unwrap_or(0);
        let outputs = self.output_arity();
        let mut out: Vec<Vec<Value>> = vec![Vec::with_capacity(rows); outputs];
        for row in 0..rows {
            let args: Vec<Value> = columns.iter().map(|c| c.get(row).unwrap_or(Value::Null)).collect();
            let result = self.invoke(ready, &args).and_then(|v| split_outputs(v, outputs));
            match result {
                Ok(values) => {
                    for (slot, v) in out.iter_mut().zip(values) {
                        slot.push(v);
                    }
                }
                Err(e) => {
                    warn!(operator = %self.name, row, error = %e, "operator failed on row");
                    let absent = Value::absent(Value::List(args), &e);
                    out.iter_mut().for_each(|slot| slot.push(absent.clone()));
                }
            }
        }
        Ok(out.into_iter().map(Column::from_values).collect())
    }

    fn output_arity(&self) -> usize {
        self.index
            .as_ref()
            .and_then(Index::output)
            .map(|k| k.names().len())
            .unwrap_or(1)
    }

    /// Apply the operator to a whole frame.
    pub fn frame_apply(&self, frame: &DataSet) -> PipelineResult<DataSet> {
        self.ready()?.op.frame_apply(frame)
    }

    /// A wrapper for use on another pipeline branch.
    ///
    /// Registry and factory operators get a fresh, not yet constructed wrapper; wrapped instances
    /// can only be shared.
    pub fn fork(&self) -> LazyOperator {
        match &self.source {
            Source::Instance(op) => Self::from_instance(Arc::clone(op), self.name.clone(), self.index.clone()),
            source => Self::with_source(self.name.clone(), self.index.clone(), self.args.clone(), source.clone()),
        }
    }
}

fn read_key(record: &Record, key: &Key) -> PipelineResult<Vec<Value>> {
    key.names()
        .into_iter()
        .map(|name| {
            record
                .get(name)
                .ok_or_else(|| PipelineError::schema(format!("record has no field '{name}'")))
        })
        .collect()
}

fn write_key(record: &mut Record, key: &Key, out: Value) -> PipelineResult<()> {
    match key {
        Key::Name(name) => record.set(name, out),
        Key::Group(names) => {
            let values = split_outputs(out, names.len())?;
            for (name, v) in names.iter().zip(values) {
                record.set(name, v)?;
            }
            Ok(())
        }
    }
}

fn split_outputs(out: Value, outputs: usize) -> PipelineResult<Vec<Value>> {
    if outputs == 1 {
        return Ok(vec![out]);
    }
    match out {
        Value::List(items) if items.len() == outputs => Ok(items),
        other => Err(PipelineError::schema(format!(
            "expected {outputs} outputs, operator returned {other}"
        ))),
    }
}

impl fmt::Debug for LazyOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyOperator")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{LazyOperator, OperatorState};
    use crate::column::Column;
    use crate::dispatch::{Index, Key};
    use crate::error::PipelineError;
    use crate::operator::registry::register_fn;
    use crate::operator::{FnOperator, OpArgs};
    use crate::types::{Record, Value};

    fn add_one() -> Arc<FnOperator> {
        Arc::new(FnOperator::from_fn(|v| Value::Int64(v.as_i64().unwrap_or(0) + 1)))
    }

    #[test]
    fn eager_load_of_unknown_operator_fails() {
        let err = LazyOperator::new("lazy_test_missing", None, OpArgs::new(), true).unwrap_err();
        assert_eq!(err.to_string(), "failed to load operator `lazy_test_missing`");
    }

    #[test]
    fn deferred_load_fails_on_first_call_and_stays_failed() {
        let op = LazyOperator::new("lazy_test_missing_later", None, OpArgs::new(), false).unwrap();
        assert_eq!(op.state(), OperatorState::Uninitialized);
        assert!(op.call(Value::from(1)).is_err());
        assert_eq!(op.state(), OperatorState::Failed);
        assert!(matches!(op.call(Value::from(1)), Err(PipelineError::Resolution { .. })));
    }

    #[test]
    fn registry_operator_constructs_on_first_call() {
        register_fn("lazy_test_double", |v| Value::Int64(v.as_i64().unwrap_or(0) * 2));
        let op = LazyOperator::new("lazy_test_double", None, OpArgs::new(), false).unwrap();
        assert_eq!(op.state(), OperatorState::Uninitialized);
        assert_eq!(op.call(Value::from(21)).unwrap(), Value::Int64(42));
        assert_eq!(op.state(), OperatorState::Ready);
    }

    #[test]
    fn indexed_call_reads_and_writes_fields() {
        let op = LazyOperator::from_instance(add_one(), "add_one", Some(Index::from(("a", "b"))));
        let out = op.call(Value::Record(Record::new().with("a", 1))).unwrap();
        let rec = out.as_record().unwrap();
        assert_eq!(rec.get("a"), Some(Value::Int64(1)));
        assert_eq!(rec.get("b"), Some(Value::Int64(2)));
    }

    #[test]
    fn indexed_call_needs_records_and_fields() {
        let op = LazyOperator::from_instance(add_one(), "add_one", Some(Index::from(("a", "b"))));
        assert!(matches!(op.call(Value::from(1)), Err(PipelineError::Mode { .. })));
        assert!(matches!(
            op.call(Value::Record(Record::new().with("z", 1))),
            Err(PipelineError::Schema { .. })
        ));
    }

    #[test]
    fn group_output_splits_list_result() {
        let swap = Arc::new(FnOperator::try_from_args(|args| {
            Ok(Value::List(vec![args[1].clone(), args[0].clone()]))
        }));
        let index = Index::new(vec![Key::group(["x", "y"]), Key::group(["y", "x"])]);
        let op = LazyOperator::from_instance(swap, "swap", Some(index));
        let out = op
            .call(Value::Record(Record::new().with("x", 1).with("y", 2)))
            .unwrap();
        let rec = out.as_record().unwrap();
        assert_eq!(rec.get("x"), Some(Value::Int64(1)));
        assert_eq!(rec.get("y"), Some(Value::Int64(2)));
    }

    #[test]
    fn vcall_falls_back_to_rows_and_marks_failures() {
        let op = LazyOperator::from_instance(
            Arc::new(FnOperator::try_from_fn(|v| match v.as_i64() {
                Some(3) => Err(PipelineError::execution("three")),
                Some(x) => Ok(Value::Int64(x + 1)),
                None => Ok(Value::Null),
            })),
            "inc",
            None,
        );
        let out = op.vcall(&[Column::Int64(vec![1, 2, 3])]).unwrap();
        let values = out[0].to_values();
        assert_eq!(values[0], Value::Int64(2));
        assert_eq!(values[1], Value::Int64(3));
        assert!(values[2].is_absent());
    }

    #[test]
    fn fork_of_registry_operator_is_fresh() {
        register_fn("lazy_test_fork", |v| v);
        let op = LazyOperator::new("lazy_test_fork", None, OpArgs::new(), true).unwrap();
        let forked = op.fork();
        assert_eq!(op.state(), OperatorState::Ready);
        assert_eq!(forked.state(), OperatorState::Uninitialized);
        assert_eq!(forked.name(), "lazy_test_fork");
    }
}
