use jdbg_jdwp::{TargetError, ThreadId};
use thiserror::Error;

use crate::eval::ParseError;

pub type DebugResult<T> = Result<T, DebugError>;

#[derive(Error, Debug)]
pub enum DebugError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session already exists: {0}")]
    SessionAlreadyExists(String),
    #[error("no active session")]
    NoActiveSession,
    #[error("thread not found: {0}")]
    ThreadNotFound(ThreadId),
    #[error("no thread selected")]
    NoThreadSelected,
    #[error("thread {0} is not suspended")]
    ThreadNotSuspended(ThreadId),
    #[error("invalid frame index {index} (thread has {count} frames)")]
    InvalidFrameIndex { index: usize, count: usize },
    #[error("variable not found: {0}")]
    VariableNotFound(String),
    #[error("invalid breakpoint location: {0}")]
    InvalidBreakpointLocation(String),
    #[error("class not loaded: {0}")]
    ClassNotLoaded(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("evaluation failed: {0}")]
    EvaluationFailed(String),
    #[error("{}", remote_throw_message(.class_name, .message.as_deref()))]
    RemoteInvocationThrew {
        class_name: String,
        message: Option<String>,
    },
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("VM disconnected")]
    VmDisconnected,
    #[error("breakpoint not found: {0}")]
    BreakpointNotFound(String),
    #[error("target: {0}")]
    Target(TargetError),
}

fn remote_throw_message(class_name: &str, message: Option<&str>) -> String {
    match message {
        Some(message) => format!("method threw exception: {class_name}: {message}"),
        None => format!("method threw exception: {class_name}"),
    }
}

impl DebugError {
    pub(crate) fn evaluation(message: impl Into<String>) -> Self {
        DebugError::EvaluationFailed(message.into())
    }

    /// Stable machine readable code for an RPC layer.
    pub fn code(&self) -> &'static str {
        match self {
            DebugError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            DebugError::SessionAlreadyExists(_) => "SESSION_ALREADY_EXISTS",
            DebugError::NoActiveSession => "NO_ACTIVE_SESSION",
            DebugError::ThreadNotFound(_) => "THREAD_NOT_FOUND",
            DebugError::NoThreadSelected => "NO_THREAD_SELECTED",
            DebugError::ThreadNotSuspended(_) => "THREAD_NOT_SUSPENDED",
            DebugError::InvalidFrameIndex { .. } => "INVALID_FRAME_INDEX",
            DebugError::VariableNotFound(_) => "VARIABLE_NOT_FOUND",
            DebugError::InvalidBreakpointLocation(_) => "INVALID_BREAKPOINT_LOCATION",
            DebugError::ClassNotLoaded(_) => "CLASS_NOT_LOADED",
            DebugError::Parse(_) => "PARSE_ERROR",
            DebugError::EvaluationFailed(_) => "EVALUATION_ERROR",
            DebugError::RemoteInvocationThrew { .. } => "REMOTE_INVOCATION_THREW",
            DebugError::ConnectionFailed(_) => "CONNECTION_FAILED",
            DebugError::VmDisconnected => "VM_DISCONNECTED",
            DebugError::BreakpointNotFound(_) => "BREAKPOINT_NOT_FOUND",
            DebugError::Target(_) => "TARGET_ERROR",
        }
    }
}

impl From<TargetError> for DebugError {
    fn from(err: TargetError) -> Self {
        match err {
            TargetError::Disconnected => DebugError::VmDisconnected,
            TargetError::ThreadNotSuspended(thread) => DebugError::ThreadNotSuspended(thread),
            TargetError::InvalidThread(thread) => DebugError::ThreadNotFound(thread),
            other => DebugError::Target(other),
        }
    }
}
