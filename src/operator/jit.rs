//! JIT step of operator resolution.
//!
//! A pipeline configured with a [`JitCompiler`] asks it first when resolving a dispatched name.
//! A compiler returning `Ok(None)` or an error lets resolution continue with the regular
//! strategies.

use std::fmt;
use std::sync::Arc;

use crate::column::Column;
use crate::dispatch::DispatchPath;
use crate::error::{PipelineError, PipelineResult};
use crate::types::Value;

use super::registry;
use super::{Capabilities, OpArgs, Operator};

/// Produces an accelerated operator for a dispatch path, if it can.
pub trait JitCompiler: Send + Sync + fmt::Debug {
    /// Name reported by [`crate::collection::ConfigSnapshot`].
    fn name(&self) -> &str;

    fn compile(&self, path: &DispatchPath, args: &OpArgs) -> PipelineResult<Option<Arc<dyn Operator>>>;
}

/// Look up a builtin compiler by name.
pub fn by_name(name: &str) -> PipelineResult<Arc<dyn JitCompiler>> {
    match name {
        VectorizeJit::NAME => Ok(Arc::new(VectorizeJit)),
        other => Err(PipelineError::mode(
            "set_jit",
            format!("unknown jit compiler `{other}` (available: {})", VectorizeJit::NAME),
        )),
    }
}

/// Lifts a registered scalar function into a vectorized operator that loops over whole columns.
#[derive(Debug, Default, Clone, Copy)]
pub struct VectorizeJit;

impl VectorizeJit {
    pub const NAME: &'static str = "vectorize";
}

impl JitCompiler for VectorizeJit {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn compile(&self, path: &DispatchPath, args: &OpArgs) -> PipelineResult<Option<Arc<dyn Operator>>> {
        let Some(name) = path.name() else {
            return Ok(None);
        };
        let Some(entry) = registry::resolve_function(name) else {
            return Ok(None);
        };
        let inner = entry.construct(name, args)?;
        if inner.capabilities().vectorized {
            return Ok(Some(inner));
        }
        Ok(Some(Arc::new(Vectorized { inner })))
    }
}

struct Vectorized {
    inner: Arc<dyn Operator>,
}

impl Operator for Vectorized {
    fn call(&self, args: &[Value]) -> PipelineResult<Value> {
        self.inner.call(args)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            vectorized: true,
            ..self.inner.capabilities()
        }
    }

    fn vcall(&self, columns: &[Column]) -> PipelineResult<Vec<Column>> {
        let rows = columns.first().map(Column::len).unwrap_or(0);
        let mut out = Vec::with_capacity(rows);
        for row in 0..rows {
            let args: Vec<Value> = columns.iter().map(|c| c.get(row).unwrap_or(Value::Null)).collect();
            out.push(self.inner.call(&args)?);
        }
        Ok(vec![Column::from_values(out)])
    }
}
