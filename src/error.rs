use thiserror::Error;

/// Convenience result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Error type returned by pipeline construction, operator resolution and readers.
///
/// Element-level failures inside `map`/`pmap` never surface through this type directly; they are
/// turned into [`crate::types::Absent`] markers and only become errors again when a caller asks
/// for them (e.g. [`crate::DataCollection::try_to_list`]).
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No registry entry, binding, or JIT compiler could produce the named operator.
    #[error("failed to load operator `{name}`")]
    Resolution { name: String },

    /// The operator was found but could not be constructed with the given arguments.
    #[error("failed to construct operator `{name}`: {message}")]
    Construction { name: String, message: String },

    /// The operation requires a capability the pipeline or value does not have.
    #[error("{operation} is not supported: {requirement}")]
    Mode {
        operation: String,
        requirement: String,
    },

    /// An operator failed while processing an element.
    #[error("execution error: {message}")]
    Execution { message: String },

    /// Field/column lookup or table shape error.
    #[error("schema mismatch: {message}")]
    Schema { message: String },

    /// The worker pool could not be created.
    #[error("executor error: {message}")]
    Executor { message: String },

    /// Underlying I/O error (e.g. file not found, permission denied).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV reader error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON reader error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid glob pattern.
    #[error("glob error: {0}")]
    Glob(#[from] glob::PatternError),
}

impl PipelineError {
    pub(crate) fn mode(operation: impl Into<String>, requirement: impl Into<String>) -> Self {
        Self::Mode {
            operation: operation.into(),
            requirement: requirement.into(),
        }
    }

    pub(crate) fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    pub(crate) fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    pub(crate) fn construction(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Construction {
            name: name.into(),
            message: message.into(),
        }
    }
}
