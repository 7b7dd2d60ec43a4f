//! Crate-wide error kinds.
//!
//! Each layer defines its own `thiserror` enum for the failures it can cause
//! directly; all of them collapse into [`CoreError`], which carries the
//! abstract error *kinds* every public operation is documented to return.

use thiserror::Error;

use crate::manager::TaskId;
use crate::types::SessionId;

/// The abstract error kinds carried by every fallible public operation in
/// this crate.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(#[source] anyhow::Error),
}

impl CoreError {
    pub fn internal(msg: impl Into<String>) -> Self {
        CoreError::Internal(anyhow::anyhow!(msg.into()))
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        CoreError::InvalidArgument(msg.into())
    }

    pub fn not_found_session(session_id: SessionId) -> Self {
        CoreError::NotFound(format!("session {session_id} not found"))
    }

    pub fn not_found_task(task_id: TaskId) -> Self {
        CoreError::NotFound(format!("task {task_id} not found"))
    }
}

/// Errors raised directly by the [`crate::executor`] layer.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("sequence length {requested} exceeds remaining context (max {max})")]
    SequenceTooLong { requested: usize, max: usize },

    #[error("backend failure during {op}")]
    Backend {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("no pending or committed token to decode from")]
    NothingToDecode,

    #[error("Input is empty")]
    EmptyInput,

    #[error("constrained decoding requires a tokenizer compatible with the constraint")]
    IncompatibleConstraint,
}

impl From<ExecutorError> for CoreError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::SequenceTooLong { .. } => CoreError::InvalidArgument(e.to_string()),
            ExecutorError::EmptyInput => CoreError::InvalidArgument(e.to_string()),
            ExecutorError::NothingToDecode => CoreError::FailedPrecondition(e.to_string()),
            ExecutorError::IncompatibleConstraint => CoreError::Unimplemented(e.to_string()),
            ExecutorError::Backend { source, .. } => CoreError::Internal(source),
        }
    }
}

/// Errors raised directly by the [`crate::manager`] layer.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("session {session_id} not found")]
    SessionNotFound { session_id: SessionId },

    #[error("session {session_id} already exists")]
    SessionAlreadyExists { session_id: SessionId },

    #[error("task {task_id} not found")]
    TaskNotFound { task_id: TaskId },

    #[error("worker thread shut down unexpectedly")]
    WorkerShutdown,

    #[error("wait timed out")]
    Timeout,

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl From<ManagerError> for CoreError {
    fn from(e: ManagerError) -> Self {
        match e {
            ManagerError::SessionNotFound { session_id } => CoreError::not_found_session(session_id),
            ManagerError::SessionAlreadyExists { session_id } => {
                CoreError::AlreadyExists(format!("session {session_id} already exists"))
            }
            ManagerError::TaskNotFound { task_id } => CoreError::not_found_task(task_id),
            ManagerError::WorkerShutdown => CoreError::internal("execution manager worker shut down"),
            ManagerError::Timeout => CoreError::DeadlineExceeded,
            ManagerError::Executor(inner) => inner.into(),
        }
    }
}

/// Errors raised directly by the [`crate::session`] layer.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("run_decode called before any run_prefill (session is in state Fresh)")]
    DecodeBeforePrefill,

    #[error("control token found inside user-supplied text input")]
    ControlTokenInInput,

    #[error("modality {0:?} is not supported by the current executor")]
    UnsupportedModality(&'static str),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

impl From<SessionError> for CoreError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::DecodeBeforePrefill => CoreError::FailedPrecondition(e.to_string()),
            SessionError::ControlTokenInInput => CoreError::InvalidArgument(e.to_string()),
            SessionError::UnsupportedModality(_) => CoreError::Unimplemented(e.to_string()),
            SessionError::Manager(inner) => inner.into(),
        }
    }
}

/// Errors raised directly by the [`crate::conversation`] layer.
#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("tool call arguments are not a valid JSON object: {0}")]
    ToolArgsNotObject(String),

    #[error("template rendering failed: {0}")]
    TemplateFailed(String),

    #[error("full-history render is not a strict suffix of the incremental render")]
    PrefixInvariantViolated,

    #[error("failed to parse tool-call fence content: {0}")]
    ToolCallParseFailed(String),

    #[error("task group {0} not found")]
    GroupNotFound(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<ConversationError> for CoreError {
    fn from(e: ConversationError) -> Self {
        match e {
            ConversationError::ToolArgsNotObject(_) => CoreError::InvalidArgument(e.to_string()),
            ConversationError::TemplateFailed(_) => CoreError::internal(e.to_string()),
            ConversationError::PrefixInvariantViolated => CoreError::internal(e.to_string()),
            ConversationError::GroupNotFound(_) => CoreError::NotFound(e.to_string()),
            ConversationError::Session(inner) => inner.into(),
        }
    }
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;
