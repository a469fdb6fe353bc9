//! Connection to a target Java VM for jdbg.
//!
//! `jdbg-core` never speaks the wire protocol directly. Everything it needs
//! from the debuggee (threads, frames, values, remote invocation, event
//! requests and the event stream) goes through the [`TargetConnection`]
//! trait defined here.
//!
//! Two implementations ship with the crate:
//!
//! - [`MockTarget`], a deterministic in-memory VM model used by tests.
//! - [`wire::JdwpTarget`], which talks JDWP over a TCP socket.

mod mock;
pub mod signature;
mod target;
mod value;

use std::io;

use thiserror::Error;

pub use mock::{MockBody, MockFrame, MockInvocation, MockRequest, MockRequestKind, MockState, MockTarget};
pub use target::{
    EventSet, FieldInfo, FrameInfo, InvokeOutcome, LaunchConfig, LocalVariable, Location,
    LocationInfo, MethodInfo, StepDepth, StepSize, SuspendPolicy, TargetConnection,
    TargetConnector, TargetEvent, TargetKind, ThreadInfo, ThreadStatus, TypeInfo, TypeKind,
    VmVersion,
};
pub use value::{ObjectRef, Value};

pub type ThreadId = u64;
pub type FrameId = u64;
pub type ObjectId = u64;
pub type ReferenceTypeId = u64;
pub type MethodId = u64;
pub type FieldId = u64;

/// Identifier of an event request created through a [`TargetConnection`].
///
/// Ids are stable for the lifetime of the request, including across
/// [`TargetConnection::set_request_enabled`] toggles.
pub type RequestId = u32;

pub type Result<T, E = TargetError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("target VM disconnected")]
    Disconnected,
    #[error("thread {0} is not suspended")]
    ThreadNotSuspended(ThreadId),
    #[error("invalid thread {0}")]
    InvalidThread(ThreadId),
    #[error("invalid object {0}")]
    InvalidObject(ObjectId),
    #[error("invalid stack frame")]
    InvalidFrame,
    #[error("index {index} out of bounds for length {length}")]
    IndexOutOfBounds { index: i32, length: i32 },
    #[error("unknown event request {0}")]
    UnknownRequest(RequestId),
    #[error("operation not supported: {0}")]
    Unsupported(String),
    #[error("timed out waiting for the target VM")]
    Timeout,
    #[error("target VM returned error code {code}")]
    Vm { code: u16 },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TargetError {
    /// Whether the error means the connection is gone for good.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TargetError::Disconnected)
    }
}

/// Wire-level JDWP implementation (async, tokio).
pub mod wire;
