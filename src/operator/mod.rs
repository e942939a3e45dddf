//! Operators: named units of per-element computation.
//!
//! Every operator implements [`Operator::call`]. Operators may additionally declare
//! [`Capabilities`]:
//!
//! - `vectorized`: [`Operator::vcall`] takes whole columns and returns whole columns
//! - `frame_apply`: [`Operator::frame_apply`] transforms a row-indexed [`DataSet`] at once
//! - `stateful`: calls are serialized and the instance is not shared across pipeline branches
//!
//! Capabilities are read once when an operator is wrapped (see [`lazy::LazyOperator`]) and the
//! resulting [`ExecMode`] is cached.

pub mod dispatcher;
pub mod jit;
pub mod lazy;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use crate::column::Column;
use crate::dispatch::Index;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{DataSet, Value};

pub use lazy::{LazyOperator, OperatorState};

/// What an operator can do beyond a plain call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub vectorized: bool,
    pub frame_apply: bool,
    pub stateful: bool,
}

impl Capabilities {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn vectorized() -> Self {
        Self {
            vectorized: true,
            ..Self::default()
        }
    }

    pub fn stateful() -> Self {
        Self {
            stateful: true,
            ..Self::default()
        }
    }

    pub fn frame_apply() -> Self {
        Self {
            frame_apply: true,
            ..Self::default()
        }
    }
}

/// The calling convention selected for an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Vectorized,
    FrameApply,
    Stateful,
    Plain,
}

impl ExecMode {
    /// Highest-priority convention the capabilities allow.
    pub fn select(caps: Capabilities) -> Self {
        if caps.vectorized {
            ExecMode::Vectorized
        } else if caps.frame_apply {
            ExecMode::FrameApply
        } else if caps.stateful {
            ExecMode::Stateful
        } else {
            ExecMode::Plain
        }
    }
}

/// A unit of computation applied to pipeline elements.
pub trait Operator: Send + Sync {
    /// Apply to one element's arguments (one value per input column, or the element itself).
    fn call(&self, args: &[Value]) -> PipelineResult<Value>;

    fn capabilities(&self) -> Capabilities {
        Capabilities::plain()
    }

    /// Apply to whole input columns, returning one column per output.
    fn vcall(&self, _columns: &[Column]) -> PipelineResult<Vec<Column>> {
        Err(PipelineError::mode("vcall", "operator is not vectorized"))
    }

    /// Apply to a whole row-indexed frame.
    fn frame_apply(&self, _frame: &DataSet) -> PipelineResult<DataSet> {
        Err(PipelineError::mode("frame_apply", "operator does not support frame apply"))
    }
}

/// Construction arguments for an operator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpArgs {
    pub positional: Vec<Value>,
    pub keyword: Vec<(String, Value)>,
}

impl OpArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.push((name.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    /// Keyword argument by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.keyword.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn nth(&self, idx: usize) -> Option<&Value> {
        self.positional.get(idx)
    }
}

/// A class-like operator: constructed from [`OpArgs`] at resolution time.
pub trait OperatorClass: Operator + Sized + 'static {
    fn construct(args: &OpArgs) -> PipelineResult<Self>;
}

type CallFn = dyn Fn(&[Value]) -> PipelineResult<Value> + Send + Sync;
type VCallFn = dyn Fn(&[Column]) -> PipelineResult<Vec<Column>> + Send + Sync;

/// Closure-backed operator.
pub struct FnOperator {
    call: Arc<CallFn>,
    vcall: Option<Arc<VCallFn>>,
    caps: Capabilities,
}

impl FnOperator {
    /// Wrap an infallible single-argument function.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Self::try_from_args(move |args| Ok(f(single(args))))
    }

    /// Wrap a fallible single-argument function.
    pub fn try_from_fn<F>(f: F) -> Self
    where
        F: Fn(Value) -> PipelineResult<Value> + Send + Sync + 'static,
    {
        Self::try_from_args(move |args| f(single(args)))
    }

    /// Wrap a fallible function over all input arguments.
    pub fn try_from_args<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> PipelineResult<Value> + Send + Sync + 'static,
    {
        Self {
            call: Arc::new(f),
            vcall: None,
            caps: Capabilities::plain(),
        }
    }

    /// A vectorized operator. The element-wise call runs the column function on one-row columns.
    pub fn vectorized_fn<F>(f: F) -> Self
    where
        F: Fn(&[Column]) -> PipelineResult<Vec<Column>> + Send + Sync + 'static,
    {
        let vcall: Arc<VCallFn> = Arc::new(f);
        let scalar = Arc::clone(&vcall);
        Self {
            call: Arc::new(move |args: &[Value]| {
                let columns: Vec<Column> = args
                    .iter()
                    .map(|v| Column::from_values(vec![v.clone()]))
                    .collect();
                let outputs = scalar(&columns)?;
                let mut values: Vec<Value> = outputs.iter().filter_map(|c| c.get(0)).collect();
                match values.len() {
                    1 => Ok(values.remove(0)),
                    _ => Ok(Value::List(values)),
                }
            }),
            vcall: Some(vcall),
            caps: Capabilities::vectorized(),
        }
    }

    /// Mark the operator stateful.
    pub fn stateful(mut self) -> Self {
        self.caps.stateful = true;
        self
    }
}

fn single(args: &[Value]) -> Value {
    match args {
        [one] => one.clone(),
        [] => Value::Null,
        many => Value::List(many.to_vec()),
    }
}

impl Operator for FnOperator {
    fn call(&self, args: &[Value]) -> PipelineResult<Value> {
        (self.call)(args)
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn vcall(&self, columns: &[Column]) -> PipelineResult<Vec<Column>> {
        match &self.vcall {
            Some(f) => f(columns),
            None => Err(PipelineError::mode("vcall", "operator is not vectorized")),
        }
    }
}

impl fmt::Debug for FnOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperator").field("caps", &self.caps).finish_non_exhaustive()
    }
}

/// Builtin operator that calls a closure on each element (or on the index's input fields).
pub fn runas_op<F>(index: Option<Index>, f: F) -> LazyOperator
where
    F: Fn(Value) -> PipelineResult<Value> + Send + Sync + 'static,
{
    LazyOperator::from_instance(Arc::new(FnOperator::try_from_fn(f)), "runas_op", index)
}
