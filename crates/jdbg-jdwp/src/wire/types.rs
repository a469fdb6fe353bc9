use std::io;

use thiserror::Error;

use crate::{Location, MethodId, ObjectId, ReferenceTypeId, TargetError, ThreadId};

pub type FrameId = u64;
pub type FieldId = u64;

pub type Result<T, E = JdwpError> = std::result::Result<T, E>;

// JDWP error codes with a dedicated `TargetError` mapping.
pub const ERROR_INVALID_THREAD: u16 = 10;
pub const ERROR_THREAD_NOT_SUSPENDED: u16 = 13;
pub const ERROR_INVALID_OBJECT: u16 = 20;
pub const ERROR_INVALID_FRAMEID: u16 = 30;
pub const ERROR_VM_DEAD: u16 = 112;
pub const ERROR_INVALID_INDEX: u16 = 503;

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("JDWP protocol error: {0}")]
    Protocol(String),
    #[error("timed out waiting for JDWP reply")]
    Timeout,
    #[error("JDWP request cancelled")]
    Cancelled,
    #[error("JDWP connection closed")]
    ConnectionClosed,
    #[error("JDWP VM error code {0}")]
    VmError(u16),
}

impl From<JdwpError> for TargetError {
    fn from(err: JdwpError) -> Self {
        match err {
            JdwpError::Io(err) => TargetError::Io(err),
            JdwpError::Protocol(message) => TargetError::Protocol(message),
            JdwpError::Timeout => TargetError::Timeout,
            JdwpError::Cancelled | JdwpError::ConnectionClosed => TargetError::Disconnected,
            JdwpError::VmError(ERROR_VM_DEAD) => TargetError::Disconnected,
            // Thread ids are not part of the reply; callers that know the
            // thread rewrite these through `with_thread`.
            JdwpError::VmError(ERROR_THREAD_NOT_SUSPENDED) => TargetError::ThreadNotSuspended(0),
            JdwpError::VmError(ERROR_INVALID_THREAD) => TargetError::InvalidThread(0),
            JdwpError::VmError(ERROR_INVALID_OBJECT) => TargetError::InvalidObject(0),
            JdwpError::VmError(ERROR_INVALID_FRAMEID) => TargetError::InvalidFrame,
            JdwpError::VmError(ERROR_INVALID_INDEX) => TargetError::IndexOutOfBounds {
                index: -1,
                length: -1,
            },
            JdwpError::VmError(code) => TargetError::Vm { code },
        }
    }
}

/// Attach the thread id to thread-related errors mapped from a JDWP reply.
pub(crate) fn with_thread(err: JdwpError, thread: ThreadId) -> TargetError {
    match TargetError::from(err) {
        TargetError::ThreadNotSuspended(_) => TargetError::ThreadNotSuspended(thread),
        TargetError::InvalidThread(_) => TargetError::InvalidThread(thread),
        other => other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JdwpIdSizes {
    pub field_id: usize,
    pub method_id: usize,
    pub object_id: usize,
    pub reference_type_id: usize,
    pub frame_id: usize,
}

impl Default for JdwpIdSizes {
    fn default() -> Self {
        // HotSpot uses 8-byte ids on 64-bit VMs; the real sizes are
        // negotiated right after the handshake.
        Self {
            field_id: 8,
            method_id: 8,
            object_id: 8,
            reference_type_id: 8,
            frame_id: 8,
        }
    }
}

/// A value as it travels on the wire: primitives or a tagged object id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JdwpValue {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object { tag: u8, id: ObjectId },
    Void,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefTypeEntry {
    pub ref_type_tag: u8,
    pub type_id: ReferenceTypeId,
    pub signature: String,
    pub status: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodEntry {
    pub method_id: MethodId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldEntry {
    pub field_id: FieldId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableEntry {
    pub code_index: u64,
    pub name: String,
    pub signature: String,
    pub length: u32,
    pub slot: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEntry {
    pub frame_id: FrameId,
    pub location: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTableEntry {
    pub code_index: u64,
    pub line: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineTable {
    pub start: u64,
    pub end: u64,
    pub lines: Vec<LineTableEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionReply {
    pub description: String,
    pub jdwp_major: i32,
    pub jdwp_minor: i32,
    pub vm_version: String,
    pub vm_name: String,
}

/// Reply of the `InvokeMethod`/`NewInstance` commands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvokeReply {
    pub value: JdwpValue,
    /// Tagged id of the thrown exception; id 0 when nothing was thrown.
    pub exception: (u8, ObjectId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum JdwpEvent {
    VmStart {
        request_id: i32,
        thread: ThreadId,
    },
    SingleStep {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    Breakpoint {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    Exception {
        request_id: i32,
        thread: ThreadId,
        location: Location,
        exception: (u8, ObjectId),
        catch_location: Option<Location>,
    },
    ThreadStart {
        request_id: i32,
        thread: ThreadId,
    },
    ThreadDeath {
        request_id: i32,
        thread: ThreadId,
    },
    ClassPrepare {
        request_id: i32,
        thread: ThreadId,
        ref_type_tag: u8,
        type_id: ReferenceTypeId,
        signature: String,
        status: u32,
    },
    VmDeath,
}

/// One decoded `Event.Composite` packet.
#[derive(Debug, Clone, PartialEq)]
pub struct JdwpEventSet {
    pub suspend_policy: u8,
    pub events: Vec<JdwpEvent>,
}
