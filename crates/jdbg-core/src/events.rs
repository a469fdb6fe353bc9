//! Normalized debug events delivered to pollers, waiters and listeners.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use jdbg_jdwp::ThreadId;
use serde::{Deserialize, Serialize};

/// Where a thread was when an event fired.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadLocation {
    pub thread_id: ThreadId,
    pub thread_name: String,
    pub class_name: String,
    pub method_name: String,
    pub line: Option<u32>,
    pub source_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    BreakpointHit {
        /// `None` when the VM reported a breakpoint no known spec owns.
        breakpoint_id: Option<String>,
        location: ThreadLocation,
    },
    StepCompleted {
        location: ThreadLocation,
    },
    ExceptionThrown {
        exception_class: String,
        message: Option<String>,
        caught: bool,
        location: ThreadLocation,
    },
    ThreadStart {
        thread_id: ThreadId,
        name: String,
    },
    ThreadDeath {
        thread_id: ThreadId,
        name: String,
    },
    VmDeath {
        exit_code: i32,
    },
    VmDisconnect {
        reason: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::BreakpointHit { .. } => EventKind::BreakpointHit,
            EventPayload::StepCompleted { .. } => EventKind::StepCompleted,
            EventPayload::ExceptionThrown { .. } => EventKind::ExceptionThrown,
            EventPayload::ThreadStart { .. } => EventKind::ThreadStart,
            EventPayload::ThreadDeath { .. } => EventKind::ThreadDeath,
            EventPayload::VmDeath { .. } => EventKind::VmDeath,
            EventPayload::VmDisconnect { .. } => EventKind::VmDisconnect,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugEvent {
    /// Strictly increasing per session, starting at 1.
    pub sequence: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub session_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl DebugEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn matches(&self, filter: &[EventKind]) -> bool {
        filter.is_empty() || filter.contains(&self.kind())
    }
}

/// Event type names used for filtering; an empty filter matches everything.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BreakpointHit,
    StepCompleted,
    ExceptionThrown,
    ThreadStart,
    ThreadDeath,
    VmDeath,
    VmDisconnect,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::BreakpointHit,
        EventKind::StepCompleted,
        EventKind::ExceptionThrown,
        EventKind::ThreadStart,
        EventKind::ThreadDeath,
        EventKind::VmDeath,
        EventKind::VmDisconnect,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::BreakpointHit => "breakpoint_hit",
            EventKind::StepCompleted => "step_completed",
            EventKind::ExceptionThrown => "exception_thrown",
            EventKind::ThreadStart => "thread_start",
            EventKind::ThreadDeath => "thread_death",
            EventKind::VmDeath => "vm_death",
            EventKind::VmDisconnect => "vm_disconnect",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEventKind(pub String);

impl fmt::Display for UnknownEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event type: {}", self.0)
    }
}

impl std::error::Error for UnknownEventKind {}

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    /// Accepts the snake_case names as well as the upper-case RPC spellings
    /// (`BREAKPOINT_HIT`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_a_type_tag() {
        let event = DebugEvent {
            sequence: 4,
            timestamp_ms: 1_700_000_000_000,
            session_id: "a1b2c3d4".to_string(),
            payload: EventPayload::VmDisconnect {
                reason: "VM disconnected".to_string(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "vm_disconnect");
        assert_eq!(json["sequence"], 4);
        assert_eq!(json["reason"], "VM disconnected");

        let back: DebugEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn event_kinds_parse_from_rpc_spellings() {
        assert_eq!("BREAKPOINT_HIT".parse::<EventKind>(), Ok(EventKind::BreakpointHit));
        assert_eq!("vm_death".parse::<EventKind>(), Ok(EventKind::VmDeath));
        assert!("stopped".parse::<EventKind>().is_err());
    }
}
