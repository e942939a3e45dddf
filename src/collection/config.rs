//! Pipeline configuration.
//!
//! Every pipeline carries a [`PipelineConfig`]; the factory copies it into each child, so worker
//! pools, chunk size and the JIT compiler apply to every later stage until changed.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::error::PipelineResult;
use crate::execution::{Backend, Parallelism};
use crate::operator::jit::{self, JitCompiler};

use super::DataCollection;

/// Configuration inherited by child pipelines.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    num_worker: Option<usize>,
    backend: Option<Backend>,
    parallel: Option<Parallelism>,
    chunksize: Option<usize>,
    jit: Option<Arc<dyn JitCompiler>>,
}

impl PipelineConfig {
    /// The configured executor, if parallel execution is on.
    pub fn parallel(&self) -> Option<&Parallelism> {
        self.parallel.as_ref()
    }

    /// Requested worker count. Set even when the backend cleared the executor.
    pub fn num_worker(&self) -> Option<usize> {
        self.num_worker
    }

    pub fn backend(&self) -> Option<&Backend> {
        self.backend.as_ref()
    }

    pub fn chunksize(&self) -> Option<usize> {
        self.chunksize
    }

    pub fn jit(&self) -> Option<&dyn JitCompiler> {
        self.jit.as_deref()
    }

    pub(crate) fn set_chunksize(&mut self, chunksize: usize) {
        self.chunksize = Some(chunksize);
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            parallel: self.num_worker,
            backend: self.backend.as_ref().map(ToString::to_string),
            chunksize: self.chunksize,
            jit: self.jit.as_ref().map(|j| j.name().to_string()),
        }
    }
}

/// Options accepted by [`DataCollection::config`]. Unset fields leave the setting unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    pub parallel: Option<usize>,
    pub chunksize: Option<usize>,
    pub jit: Option<String>,
}

impl PipelineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parallel(mut self, num_worker: usize) -> Self {
        self.parallel = Some(num_worker);
        self
    }

    pub fn chunksize(mut self, chunksize: usize) -> Self {
        self.chunksize = Some(chunksize);
        self
    }

    pub fn jit(mut self, compiler: impl Into<String>) -> Self {
        self.jit = Some(compiler.into());
        self
    }
}

/// Serializable view of a pipeline's configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigSnapshot {
    pub parallel: Option<usize>,
    pub backend: Option<String>,
    pub chunksize: Option<usize>,
    pub jit: Option<String>,
}

impl DataCollection {
    /// Apply several settings at once: JIT first, then parallelism, then chunking.
    pub fn config(self, options: PipelineOptions) -> PipelineResult<Self> {
        let mut dc = self;
        if let Some(name) = options.jit.as_deref() {
            dc = dc.set_jit(name)?;
        }
        if let Some(n) = options.parallel {
            dc = dc.set_parallel(Some(n), Backend::Thread)?;
        }
        if let Some(n) = options.chunksize {
            dc = dc.set_chunksize(n)?;
        }
        Ok(dc)
    }

    /// Configure parallel execution for the following stages.
    ///
    /// The thread backend with a worker count builds a pool of that size. Any other backend, or
    /// no worker count, clears the executor and later stages run serially.
    pub fn set_parallel(mut self, num_worker: Option<usize>, backend: impl Into<Backend>) -> PipelineResult<Self> {
        let backend = backend.into();
        self.config.parallel = match (num_worker, &backend) {
            (Some(n), Backend::Thread) => {
                let observer = self.config.parallel.as_ref().and_then(|p| p.observer().cloned());
                let pool = Parallelism::new(n)?;
                Some(match observer {
                    Some(obs) => pool.with_observer(obs),
                    None => pool,
                })
            }
            _ => {
                debug!(?num_worker, %backend, "executor cleared");
                None
            }
        };
        self.config.num_worker = num_worker;
        self.config.backend = Some(backend);
        Ok(self)
    }

    /// Use an already built executor, e.g. one carrying an observer.
    pub fn set_executor(mut self, parallel: Parallelism) -> Self {
        self.config.num_worker = Some(parallel.num_worker());
        self.config.backend = Some(parallel.backend().clone());
        self.config.parallel = Some(parallel);
        self
    }

    /// Select a builtin JIT compiler by name.
    pub fn set_jit(self, compiler: &str) -> PipelineResult<Self> {
        Ok(self.set_jit_compiler(jit::by_name(compiler)?))
    }

    pub fn set_jit_compiler(mut self, compiler: Arc<dyn JitCompiler>) -> Self {
        self.config.jit = Some(compiler);
        self
    }

    pub fn get_config(&self) -> ConfigSnapshot {
        self.config.snapshot()
    }
}
