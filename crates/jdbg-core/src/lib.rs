//! Debugger core for jdbg.
//!
//! The [`SessionRegistry`] owns one [`DebugSession`] per target VM. Each
//! session drives its target through a [`jdbg_jdwp::TargetConnection`],
//! runs an event processor that turns target events into [`DebugEvent`]s,
//! and evaluates Java expressions against suspended frames.
//!
//! ```text
//! SessionRegistry ──▶ DebugSession ──▶ TargetConnection ──▶ target VM
//!                          ▲                  │
//!                          └── EventProcessor ◀┘
//! ```

mod breakpoints;
mod buffer;
mod error;
pub mod eval;
mod events;
mod format;
mod processor;
mod registry;
mod session;

pub use breakpoints::{BreakpointKind, BreakpointSpec, ExceptionBreakpointSpec};
pub use buffer::{EventBufferInfo, DEFAULT_EVENT_BUFFER_CAPACITY};
pub use error::{DebugError, DebugResult};
pub use eval::Evaluation;
pub use events::{DebugEvent, EventKind, EventPayload, ThreadLocation, UnknownEventKind};
pub use format::{display_value, value_to_string};
pub use processor::should_resume;
pub use registry::{SessionRegistry, TargetDescriptor};
pub use session::{
    describe_target, DebugSession, EventListener, FramePage, FrameSummary, ListenerId,
    OriginKind, SessionInfo, SessionState, SessionStatus, SuspendedThread, ThreadSummary,
    VariableInfo, VariableKind,
};
