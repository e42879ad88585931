//! Error taxonomy shared by the resolver, the step executor and the
//! runner.

use serde_json::Value;
use thiserror::Error;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("variable not found: {}", .0.join(", "))]
    VariableNotFound(Vec<String>),

    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("cyclic variable reference among: {}", .0.join(", "))]
    CyclicVariableReference(Vec<String>),

    #[error("call to '{name}' failed (args: {args}, kwargs: {kwargs}): {reason}")]
    FunctionCall {
        name: String,
        args: Value,
        kwargs: Value,
        reason: String,
    },

    #[error("extract '{path}' failed: {reason}")]
    ExtractFailure { path: String, reason: String },

    #[error(
        "validation failed: {check} {comparator} {expected} (actual: {actual}){}",
        .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default()
    )]
    ValidationFailure {
        check: String,
        comparator: String,
        expected: Value,
        actual: Value,
        message: Option<String>,
    },

    #[error("referenced testcase '{name}' did not pass")]
    ReferencedTestcase { name: String, errored: bool },

    #[error("invalid definition: {0}")]
    Params(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to load testcase: {0}")]
    Load(String),
}

impl EngineError {
    pub fn params(message: impl Into<String>) -> Self {
        Self::Params(message.into())
    }

    /// Whether the step retry policy applies. Definition bugs
    /// (unknown names, cycles, malformed steps) are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_)
            | Self::ValidationFailure { .. }
            | Self::ExtractFailure { .. } => true,
            Self::ReferencedTestcase { .. } => true,
            _ => false,
        }
    }

    /// `true` when the error is an assertion failure rather than an
    /// infrastructure or definition error.
    pub fn is_failure(&self) -> bool {
        match self {
            Self::ValidationFailure { .. } => true,
            Self::ReferencedTestcase { errored, .. } => !errored,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Params(err.to_string())
    }
}
