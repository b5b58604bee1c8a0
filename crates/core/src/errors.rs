use std::fmt;

use thiserror::Error;

use crate::domain::{StepKey, StepStatus, TaskId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The transaction lost a race with a concurrent writer; retry it from scratch.
    #[error("store transaction conflict")]
    Conflict,
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("record codec failure: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Codec(error.to_string())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("step {0} not found")]
    StepNotFound(StepKey),
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
    #[error("worker `{worker_id}` no longer holds the lease on step {step}")]
    LeaseLost { step: StepKey, worker_id: String },
    #[error("invalid step transition for {step} from {from:?} to {to:?}")]
    InvalidTransition { step: StepKey, from: StepStatus, to: StepStatus },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("codec failure: {0}")]
    Codec(String),
    #[error("engine invariant violation: {0}")]
    InvariantViolation(String),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(StoreError::Conflict))
    }

    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Self::LeaseLost { .. })
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::StepNotFound(_) | Self::TaskNotFound(_) => "not_found",
            Self::LeaseLost { .. } => "lease_lost",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Store(StoreError::Conflict) => "store_conflict",
            Self::Store(_) => "store",
            Self::Codec(_) => "codec",
            Self::InvariantViolation(_) => "invariant",
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        Self::Codec(error.to_string())
    }
}

/// Failure reported by a step handler. The message is stored verbatim on the step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(error: std::io::Error) -> Self {
        Self::new(error.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(format!("invalid handler payload: {error}"))
    }
}

impl From<EngineError> for HandlerError {
    fn from(error: EngineError) -> Self {
        Self::new(error.to_string())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResultStoreError {
    #[error("result store io failure at {path}: {message}")]
    Io { path: String, message: String },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler `{0}` is already registered")]
    DuplicateHandler(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("no handler registered for `{handler}` (step {step})")]
    HandlerNotRegistered { handler: String, step: StepKey },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    ResultStore(#[from] ResultStoreError),
}
