//! Per-target debugger state.
//!
//! A [`DebugSession`] wraps one [`TargetConnection`] together with the
//! breakpoint tables, the thread/frame selection and the event buffer. API
//! callers and the session's [`EventProcessor`] share it through an `Arc`;
//! every piece of mutable state sits behind its own short-lived lock.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jdbg_config::SessionConfig;
use jdbg_jdwp::{
    FrameInfo, LaunchConfig, Location, RequestId, StepDepth, StepSize, TargetConnection,
    TargetKind, ThreadId, TypeInfo,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::breakpoints::{
    BreakpointKind, BreakpointSpec, BreakpointTable, ExceptionBreakpointSpec,
    ExceptionBreakpointTable,
};
use crate::buffer::{EventBuffer, EventBufferInfo};
use crate::error::{DebugError, DebugResult};
use crate::eval::{self, Evaluation, Interpreter};
use crate::events::{now_ms, DebugEvent, EventKind, EventPayload, ThreadLocation};
use crate::format::display_value;
use crate::processor::{thread_location, EventProcessor};

/// First 8 hex digits of a random v4 UUID.
pub(crate) fn short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Connected,
    Running,
    Suspended,
    Disconnected,
    Terminated,
}

impl SessionState {
    /// Disconnected and Terminated are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Terminated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Connected => "connected",
            SessionState::Running => "running",
            SessionState::Suspended => "suspended",
            SessionState::Disconnected => "disconnected",
            SessionState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the session got hold of its target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginKind {
    Launched,
    AttachedLocal,
    AttachedRemote,
}

impl OriginKind {
    pub fn of(target: &TargetKind) -> Self {
        match target {
            TargetKind::Remote { .. } => OriginKind::AttachedRemote,
            TargetKind::Local { .. } => OriginKind::AttachedLocal,
            TargetKind::Launch(_) => OriginKind::Launched,
        }
    }
}

/// Human readable description of a target, e.g. `localhost:5005`.
pub fn describe_target(target: &TargetKind) -> String {
    match target {
        TargetKind::Remote { host, port } => format!("{host}:{port}"),
        TargetKind::Local { pid } => format!("pid {pid}"),
        TargetKind::Launch(LaunchConfig { main_class, .. }) => format!("launch {main_class}"),
    }
}

/// Snapshot used by session listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: Option<String>,
    pub origin: Option<OriginKind>,
    pub state: SessionState,
    pub created_at_ms: u64,
    pub target: Option<String>,
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ThreadSummary {
    pub id: ThreadId,
    pub name: String,
    pub status: String,
    pub suspended: bool,
    pub at_breakpoint: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SuspendedThread {
    pub thread_id: ThreadId,
    pub name: String,
    pub at_breakpoint: bool,
    pub breakpoint_id: Option<String>,
    pub location: Option<ThreadLocation>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: SessionState,
    pub thread_count: usize,
    pub suspended_threads: Vec<SuspendedThread>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FrameSummary {
    pub index: usize,
    pub class_name: String,
    pub method_name: String,
    pub line: Option<u32>,
    pub source_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FramePage {
    pub thread_id: ThreadId,
    /// Frames on the whole stack, not just this page.
    pub total: usize,
    pub frames: Vec<FrameSummary>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    This,
    Argument,
    Local,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VariableInfo {
    pub name: String,
    pub type_name: String,
    pub value: String,
    pub kind: VariableKind,
}

pub type ListenerId = u64;

/// Live event callback. Runs synchronously on the event processor task.
pub type EventListener = Arc<dyn Fn(&DebugEvent) + Send + Sync>;

struct Attachment {
    origin: OriginKind,
    description: String,
    conn: Arc<dyn TargetConnection>,
}

#[derive(Default)]
struct Selection {
    thread: Option<ThreadId>,
    frame: usize,
}

pub struct DebugSession {
    id: String,
    name: RwLock<Option<String>>,
    created_at_ms: u64,
    settings: SessionConfig,
    attachment: RwLock<Option<Attachment>>,
    state: RwLock<SessionState>,
    selection: Mutex<Selection>,
    pub(crate) breakpoints: BreakpointTable,
    exception_breakpoints: ExceptionBreakpointTable,
    /// Threads stopped by a breakpoint, with the owning spec when known.
    at_breakpoint: Mutex<HashMap<ThreadId, Option<String>>>,
    /// Outstanding one-shot step request per thread.
    steps: Mutex<HashMap<ThreadId, RequestId>>,
    lifecycle_requests: Mutex<Vec<RequestId>>,
    events: EventBuffer,
    sequence: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, EventListener)>>,
    next_listener: AtomicU64,
    shutdown: CancellationToken,
    processor: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DebugSession {
    pub fn new(id: impl Into<String>, settings: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            name: RwLock::new(None),
            created_at_ms: now_ms(),
            events: EventBuffer::new(settings.event_buffer_capacity),
            settings,
            attachment: RwLock::new(None),
            state: RwLock::new(SessionState::Created),
            selection: Mutex::new(Selection::default()),
            breakpoints: BreakpointTable::new(),
            exception_breakpoints: ExceptionBreakpointTable::new(),
            at_breakpoint: Mutex::new(HashMap::new()),
            steps: Mutex::new(HashMap::new()),
            lifecycle_requests: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            processor: Mutex::new(None),
        })
    }

    /// Bind the session to an open connection and start its event processor.
    pub async fn connect(
        self: &Arc<Self>,
        conn: Arc<dyn TargetConnection>,
        origin: OriginKind,
        description: impl Into<String>,
    ) -> DebugResult<()> {
        if self.state() != SessionState::Created {
            return Err(DebugError::SessionAlreadyExists(self.id.clone()));
        }

        if self.settings.track_thread_lifecycle {
            match conn.watch_thread_lifecycle().await {
                Ok(requests) => *self.lifecycle_requests.lock() = requests,
                Err(err) => tracing::warn!(
                    target: "jdbg.session",
                    session_id = %self.id,
                    error = %err,
                    "thread lifecycle events unavailable"
                ),
            }
        }

        let description = description.into();
        tracing::info!(
            target: "jdbg.session",
            session_id = %self.id,
            ?origin,
            target_vm = %description,
            "session connected"
        );
        *self.attachment.write() = Some(Attachment {
            origin,
            description,
            conn: conn.clone(),
        });
        self.set_state(SessionState::Connected);

        let handle = EventProcessor::new(self.clone(), conn, self.shutdown.child_token()).spawn();
        *self.processor.lock() = Some(handle);
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<String> {
        self.name.read().clone()
    }

    /// Set the display name. An empty name clears it.
    pub fn rename(&self, name: &str) {
        let name = (!name.is_empty()).then(|| name.to_string());
        tracing::debug!(target: "jdbg.session", session_id = %self.id, name = ?name, "session renamed");
        *self.name.write() = name;
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub fn settings(&self) -> &SessionConfig {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Move to `next` unless the session already reached a final state.
    pub(crate) fn set_state(&self, next: SessionState) {
        let mut state = self.state.write();
        if state.is_terminal() || *state == next {
            return;
        }
        tracing::debug!(
            target: "jdbg.session",
            session_id = %self.id,
            from = %*state,
            to = %next,
            "session state changed"
        );
        *state = next;
    }

    pub fn info(&self, active: bool) -> SessionInfo {
        let attachment = self.attachment.read();
        SessionInfo {
            id: self.id.clone(),
            name: self.name(),
            origin: attachment.as_ref().map(|a| a.origin),
            state: self.state(),
            created_at_ms: self.created_at_ms,
            target: attachment.as_ref().map(|a| a.description.clone()),
            active,
        }
    }

    pub(crate) fn connection(&self) -> DebugResult<Arc<dyn TargetConnection>> {
        if self.state().is_terminal() {
            return Err(DebugError::VmDisconnected);
        }
        self.attachment
            .read()
            .as_ref()
            .map(|a| a.conn.clone())
            .ok_or_else(|| {
                DebugError::ConnectionFailed(format!("session {} is not attached to a target", self.id))
            })
    }

    /// The connection if there is one, even after the VM went away.
    fn any_connection(&self) -> Option<Arc<dyn TargetConnection>> {
        self.attachment.read().as_ref().map(|a| a.conn.clone())
    }

    /// Stop the event processor and detach from the target.
    ///
    /// Safe to call more than once and against a target that already went away.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self.processor.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(target: "jdbg.session", session_id = %self.id, error = %err, "event processor task failed");
            }
        }
        if let Some(conn) = self.any_connection() {
            if let Err(err) = conn.dispose().await {
                tracing::debug!(target: "jdbg.session", session_id = %self.id, error = %err, "dispose failed");
            }
        }
        self.set_state(SessionState::Disconnected);
        tracing::info!(target: "jdbg.session", session_id = %self.id, "session closed");
    }

    // ---------------------------------------------------------------------
    // Breakpoints
    // ---------------------------------------------------------------------

    pub async fn add_line_breakpoint(&self, class_name: &str, line: u32) -> DebugResult<BreakpointSpec> {
        self.add_breakpoint(class_name, BreakpointKind::Line { line }, None).await
    }

    pub async fn add_method_breakpoint(
        &self,
        class_name: &str,
        method: &str,
    ) -> DebugResult<BreakpointSpec> {
        self.add_breakpoint(
            class_name,
            BreakpointKind::Method {
                method: method.to_string(),
            },
            None,
        )
        .await
    }

    /// Add a line or method breakpoint, deferring it when `class_name` is not
    /// loaded yet.
    ///
    /// `condition` is kept on the spec and reported back; it does not filter
    /// hits. An empty condition is the same as none.
    pub async fn add_breakpoint(
        &self,
        class_name: &str,
        kind: BreakpointKind,
        condition: Option<&str>,
    ) -> DebugResult<BreakpointSpec> {
        let conn = self.connection()?;
        let spec = BreakpointSpec {
            id: self.unused_breakpoint_id(),
            class_name: class_name.to_string(),
            kind,
            condition: condition.filter(|c| !c.is_empty()).map(str::to_string),
            enabled: true,
            hit_count: 0,
            created_at_ms: now_ms(),
            resolved_locations: 0,
            pending: false,
        };

        let classes = conn.classes_by_name(class_name).await?;
        if classes.is_empty() {
            return self.add_pending(conn.as_ref(), spec).await;
        }

        let locations = resolve_locations(conn.as_ref(), &classes, &spec.kind).await?;
        if locations.is_empty() {
            return Err(DebugError::InvalidBreakpointLocation(spec.location_string()));
        }
        let requests = install_breakpoints(conn.as_ref(), &locations).await?;
        tracing::info!(
            target: "jdbg.session",
            session_id = %self.id,
            breakpoint_id = %spec.id,
            location = %spec.location_string(),
            requests = requests.len(),
            "breakpoint installed"
        );
        let id = spec.id.clone();
        self.breakpoints.insert_installed(spec, requests);
        self.breakpoint(&id)
    }

    async fn add_pending(
        &self,
        conn: &dyn TargetConnection,
        spec: BreakpointSpec,
    ) -> DebugResult<BreakpointSpec> {
        let class_name = spec.class_name.clone();
        let (watch, created) = match self.breakpoints.pending_watch(&class_name) {
            Some(watch) => (watch, false),
            None => (conn.create_class_prepare_watch(&class_name).await?, true),
        };
        let id = spec.id.clone();
        self.breakpoints.insert_pending(spec, watch);

        // A concurrent add for the same class may have registered its watch first.
        if created && self.breakpoints.pending_watch(&class_name) != Some(watch) {
            delete_quietly(conn, watch).await;
        }
        tracing::info!(
            target: "jdbg.session",
            session_id = %self.id,
            breakpoint_id = %id,
            class_name = %class_name,
            "class not loaded; breakpoint deferred"
        );
        self.breakpoint(&id)
    }

    /// Install every pending spec waiting for `class`, now that it is loaded.
    pub(crate) async fn materialize_pending(&self, class: &TypeInfo) {
        let Some((watch, specs)) = self.breakpoints.take_pending(&class.name) else {
            return;
        };
        let Ok(conn) = self.connection() else {
            return;
        };
        delete_quietly(conn.as_ref(), watch).await;

        for spec in specs {
            let requests = match resolve_locations(conn.as_ref(), std::slice::from_ref(class), &spec.kind).await {
                Ok(locations) if locations.is_empty() => {
                    tracing::warn!(
                        target: "jdbg.session",
                        session_id = %self.id,
                        breakpoint_id = %spec.id,
                        location = %spec.location_string(),
                        "no executable code at deferred breakpoint location"
                    );
                    Vec::new()
                }
                Ok(locations) => match install_breakpoints(conn.as_ref(), &locations).await {
                    Ok(requests) => requests,
                    Err(err) => {
                        tracing::warn!(target: "jdbg.session", breakpoint_id = %spec.id, error = %err, "failed to install deferred breakpoint");
                        Vec::new()
                    }
                },
                Err(err) => {
                    tracing::warn!(target: "jdbg.session", breakpoint_id = %spec.id, error = %err, "failed to resolve deferred breakpoint");
                    Vec::new()
                }
            };

            match self.breakpoints.materialize(&spec.id, &requests) {
                Some(true) => {}
                Some(false) => {
                    // Disabled while it was pending.
                    for request in &requests {
                        if let Err(err) = conn.set_request_enabled(*request, false).await {
                            tracing::warn!(target: "jdbg.session", breakpoint_id = %spec.id, error = %err, "failed to disable deferred breakpoint");
                        }
                    }
                }
                None => {
                    for request in requests {
                        delete_quietly(conn.as_ref(), request).await;
                    }
                    continue;
                }
            }
            tracing::info!(
                target: "jdbg.session",
                session_id = %self.id,
                breakpoint_id = %spec.id,
                class_name = %class.name,
                "deferred breakpoint installed"
            );
        }
    }

    pub fn breakpoint(&self, id: &str) -> DebugResult<BreakpointSpec> {
        self.breakpoints
            .get(id)
            .ok_or_else(|| DebugError::BreakpointNotFound(id.to_string()))
    }

    pub fn list_breakpoints(&self) -> Vec<BreakpointSpec> {
        self.breakpoints.list()
    }

    pub fn list_exception_breakpoints(&self) -> Vec<ExceptionBreakpointSpec> {
        self.exception_breakpoints.list()
    }

    pub async fn enable_breakpoint(&self, id: &str) -> DebugResult<()> {
        self.set_breakpoint_enabled(id, true).await
    }

    pub async fn disable_breakpoint(&self, id: &str) -> DebugResult<()> {
        self.set_breakpoint_enabled(id, false).await
    }

    /// Toggle a line, method or exception breakpoint.
    ///
    /// The stored flag changes even when nothing is installed yet, so a
    /// pending breakpoint keeps it once its class loads.
    pub async fn set_breakpoint_enabled(&self, id: &str, enabled: bool) -> DebugResult<()> {
        let requests = match self.breakpoints.set_enabled(id, enabled) {
            Some(requests) => requests,
            None => self
                .exception_breakpoints
                .set_enabled(id, enabled)
                .map(|request| vec![request])
                .ok_or_else(|| DebugError::BreakpointNotFound(id.to_string()))?,
        };
        if requests.is_empty() {
            return Ok(());
        }
        let conn = self.connection()?;
        for request in requests {
            conn.set_request_enabled(request, enabled).await?;
        }
        tracing::debug!(target: "jdbg.session", session_id = %self.id, breakpoint_id = %id, enabled, "breakpoint toggled");
        Ok(())
    }

    /// Remove a line, method or exception breakpoint.
    ///
    /// Local bookkeeping is always updated; failures to delete the target
    /// side requests (for example after a disconnect) are only logged.
    pub async fn remove_breakpoint(&self, id: &str) -> DebugResult<()> {
        let requests: Vec<RequestId> = match self.breakpoints.remove(id) {
            Some(removed) => removed.requests.into_iter().chain(removed.watch).collect(),
            None => self
                .exception_breakpoints
                .remove(id)
                .map(|request| vec![request])
                .ok_or_else(|| DebugError::BreakpointNotFound(id.to_string()))?,
        };
        if let Some(conn) = self.any_connection() {
            for request in requests {
                delete_quietly(conn.as_ref(), request).await;
            }
        }
        tracing::info!(target: "jdbg.session", session_id = %self.id, breakpoint_id = %id, "breakpoint removed");
        Ok(())
    }

    /// Remove every breakpoint of every kind, returning how many were removed.
    pub async fn clear_breakpoints(&self) -> usize {
        let count = self.breakpoints.list().len() + self.exception_breakpoints.list().len();
        let mut requests = self.breakpoints.clear();
        requests.extend(self.exception_breakpoints.clear());
        if let Some(conn) = self.any_connection() {
            for request in requests {
                delete_quietly(conn.as_ref(), request).await;
            }
        }
        count
    }

    /// Break when an exception of `class_name` (or a subclass) is thrown.
    ///
    /// `"*"` and `"any"` match every throwable. A class that is not loaded
    /// yet also falls back to matching every throwable.
    pub async fn add_exception_breakpoint(
        &self,
        class_name: &str,
        caught: bool,
        uncaught: bool,
    ) -> DebugResult<ExceptionBreakpointSpec> {
        let conn = self.connection()?;
        let any = matches!(class_name.trim(), "" | "*" | "any");
        let scope = if any {
            None
        } else {
            conn.classes_by_name(class_name).await?.first().map(|c| c.id)
        };
        if !any && scope.is_none() {
            tracing::info!(
                target: "jdbg.session",
                session_id = %self.id,
                class_name,
                "exception class not loaded; breaking on every throwable"
            );
        }
        let request = conn.create_exception_request(scope, caught, uncaught).await?;
        let spec = ExceptionBreakpointSpec {
            id: self.unused_breakpoint_id(),
            class_name: if any { "*".to_string() } else { class_name.to_string() },
            caught,
            uncaught,
            enabled: true,
            created_at_ms: now_ms(),
        };
        self.exception_breakpoints.insert(spec.clone(), request);
        Ok(spec)
    }

    fn unused_breakpoint_id(&self) -> String {
        loop {
            let id = short_id();
            if !self.breakpoints.contains(&id) && !self.exception_breakpoints.contains(&id) {
                return id;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Execution control
    // ---------------------------------------------------------------------

    /// Resume every thread of the target.
    pub async fn resume(&self) -> DebugResult<()> {
        let conn = self.connection()?;
        conn.resume_all().await?;
        self.at_breakpoint.lock().clear();
        self.set_state(SessionState::Running);
        Ok(())
    }

    /// Suspend every thread of the target.
    pub async fn suspend(&self) -> DebugResult<()> {
        let conn = self.connection()?;
        conn.suspend_all().await?;
        self.set_state(SessionState::Suspended);
        Ok(())
    }

    pub async fn resume_thread(&self, thread: ThreadId) -> DebugResult<()> {
        let conn = self.connection()?;
        conn.resume_thread(thread).await?;
        self.at_breakpoint.lock().remove(&thread);
        Ok(())
    }

    pub async fn suspend_thread(&self, thread: ThreadId) -> DebugResult<()> {
        let conn = self.connection()?;
        conn.suspend_thread(thread).await?;
        Ok(())
    }

    /// Step `thread` (or the selected thread) and let the target run.
    pub async fn step(
        &self,
        thread: Option<ThreadId>,
        depth: StepDepth,
        size: StepSize,
    ) -> DebugResult<()> {
        let conn = self.connection()?;
        let thread = self.target_thread(thread)?;
        if !conn.thread(thread).await?.suspended {
            return Err(DebugError::ThreadNotSuspended(thread));
        }

        let previous = self.steps.lock().remove(&thread);
        if let Some(previous) = previous {
            delete_quietly(conn.as_ref(), previous).await;
        }
        let request = conn.create_step(thread, size, depth).await?;
        self.steps.lock().insert(thread, request);
        tracing::debug!(target: "jdbg.session", session_id = %self.id, thread, ?depth, ?size, "stepping");

        conn.resume_all().await?;
        self.at_breakpoint.lock().clear();
        self.set_state(SessionState::Running);
        Ok(())
    }

    /// Forget the step request that just completed on `thread`, returning
    /// the request to delete.
    pub(crate) fn finish_step(&self, thread: ThreadId, request: Option<RequestId>) -> Option<RequestId> {
        let tracked = self.steps.lock().remove(&thread);
        request.or(tracked)
    }

    /// Bookkeeping for a thread that stopped on a breakpoint, step or exception.
    pub(crate) fn stopped(&self, thread: ThreadId, breakpoint: Option<Option<String>>) {
        if let Some(breakpoint_id) = breakpoint {
            self.at_breakpoint.lock().insert(thread, breakpoint_id);
        }
        *self.selection.lock() = Selection {
            thread: Some(thread),
            frame: 0,
        };
        self.set_state(SessionState::Suspended);
    }

    pub(crate) fn forget_thread(&self, thread: ThreadId) {
        self.at_breakpoint.lock().remove(&thread);
        self.steps.lock().remove(&thread);
        let mut selection = self.selection.lock();
        if selection.thread == Some(thread) {
            *selection = Selection::default();
        }
    }

    // ---------------------------------------------------------------------
    // Threads and frames
    // ---------------------------------------------------------------------

    pub async fn threads(&self) -> DebugResult<Vec<ThreadSummary>> {
        let conn = self.connection()?;
        let threads = conn.all_threads().await?;
        let at_breakpoint = self.at_breakpoint.lock().clone();
        Ok(threads
            .into_iter()
            .map(|t| ThreadSummary {
                at_breakpoint: at_breakpoint.contains_key(&t.id),
                id: t.id,
                name: t.name,
                status: t.status.as_str().to_string(),
                suspended: t.suspended,
            })
            .collect())
    }

    pub async fn select_thread(&self, thread: ThreadId) -> DebugResult<()> {
        let conn = self.connection()?;
        let known = conn.all_threads().await?.iter().any(|t| t.id == thread);
        if !known {
            return Err(DebugError::ThreadNotFound(thread));
        }
        *self.selection.lock() = Selection {
            thread: Some(thread),
            frame: 0,
        };
        Ok(())
    }

    pub fn selected_thread(&self) -> Option<ThreadId> {
        self.selection.lock().thread
    }

    pub fn selected_frame(&self) -> usize {
        self.selection.lock().frame
    }

    /// Frames `start..start + count` of a thread's stack; `count == 0` lists
    /// everything from `start`.
    pub async fn frames(
        &self,
        thread: Option<ThreadId>,
        start: usize,
        count: usize,
    ) -> DebugResult<FramePage> {
        let conn = self.connection()?;
        let thread = self.target_thread(thread)?;
        let frames = conn.frames(thread).await?;
        let total = frames.len();
        let end = if count == 0 {
            total
        } else {
            start.saturating_add(count).min(total)
        };

        let mut page = Vec::new();
        for (index, frame) in frames.iter().enumerate().take(end).skip(start) {
            let info = conn.location_info(&frame.location).await.unwrap_or_default();
            page.push(FrameSummary {
                index,
                class_name: info.class_name,
                method_name: info.method_name,
                line: info.line,
                source_name: info.source_name,
            });
        }
        Ok(FramePage {
            thread_id: thread,
            total,
            frames: page,
        })
    }

    pub async fn select_frame(&self, index: usize) -> DebugResult<()> {
        let conn = self.connection()?;
        let thread = self.target_thread(None)?;
        let count = conn.frames(thread).await?.len();
        if index >= count {
            return Err(DebugError::InvalidFrameIndex { index, count });
        }
        self.selection.lock().frame = index;
        Ok(())
    }

    fn target_thread(&self, thread: Option<ThreadId>) -> DebugResult<ThreadId> {
        thread
            .or_else(|| self.selected_thread())
            .ok_or(DebugError::NoThreadSelected)
    }

    /// Resolve a thread and frame, defaulting to the current selection.
    async fn frame_context(
        &self,
        thread: Option<ThreadId>,
        frame: Option<usize>,
    ) -> DebugResult<(Arc<dyn TargetConnection>, ThreadId, FrameInfo)> {
        let conn = self.connection()?;
        let thread = self.target_thread(thread)?;
        let index = match frame {
            Some(index) => index,
            None => {
                let selection = self.selection.lock();
                if selection.thread == Some(thread) {
                    selection.frame
                } else {
                    0
                }
            }
        };
        let frames = conn.frames(thread).await?;
        let frame = frames
            .get(index)
            .copied()
            .ok_or(DebugError::InvalidFrameIndex {
                index,
                count: frames.len(),
            })?;
        Ok((conn, thread, frame))
    }

    // ---------------------------------------------------------------------
    // Variables and evaluation
    // ---------------------------------------------------------------------

    /// `this` (when present) followed by the frame's visible locals.
    pub async fn variables(
        &self,
        thread: Option<ThreadId>,
        frame: Option<usize>,
    ) -> DebugResult<Vec<VariableInfo>> {
        let (conn, thread, frame) = self.frame_context(thread, frame).await?;
        let interpreter = Interpreter::new(conn.clone(), thread, frame).await?;

        let mut out = Vec::with_capacity(interpreter.locals().len() + 1);
        if let Some(this) = interpreter.this_object() {
            let value = jdbg_jdwp::Value::Object(this.clone());
            out.push(VariableInfo {
                name: "this".to_string(),
                type_name: this.runtime_type.clone(),
                value: display_value(conn.as_ref(), &value).await?,
                kind: VariableKind::This,
            });
        }
        for (variable, value) in interpreter.locals() {
            out.push(VariableInfo {
                name: variable.name.clone(),
                type_name: variable.type_name(),
                value: display_value(conn.as_ref(), value).await?,
                kind: if variable.is_argument {
                    VariableKind::Argument
                } else {
                    VariableKind::Local
                },
            });
        }
        Ok(out)
    }

    /// A single variable of the selected frame.
    pub async fn variable(&self, name: &str) -> DebugResult<VariableInfo> {
        self.variable_in(None, None, name).await
    }

    /// A single variable of `frame` on `thread`; `None` falls back to the
    /// current selection.
    pub async fn variable_in(
        &self,
        thread: Option<ThreadId>,
        frame: Option<usize>,
        name: &str,
    ) -> DebugResult<VariableInfo> {
        self.variables(thread, frame)
            .await?
            .into_iter()
            .find(|v| v.name == name)
            .ok_or_else(|| DebugError::VariableNotFound(name.to_string()))
    }

    /// Evaluate `expression` in the selected frame and store the result in
    /// local `name`.
    pub async fn set_variable(&self, name: &str, expression: &str) -> DebugResult<VariableInfo> {
        let expr = eval::parse(expression)?;
        let (conn, thread, frame) = self.frame_context(None, None).await?;
        let interpreter = Interpreter::new(conn.clone(), thread, frame).await?;
        let variable = interpreter
            .locals()
            .iter()
            .map(|(variable, _)| variable.clone())
            .find(|variable| variable.name == name)
            .ok_or_else(|| DebugError::VariableNotFound(name.to_string()))?;

        let evaluation = interpreter.evaluate(&expr).await?;
        let type_name = variable.type_name();
        let value = interpreter
            .assignment_conversion(evaluation.value, &type_name)
            .await?;
        conn.set_local_value(thread, &frame, &variable, &value).await?;
        tracing::debug!(target: "jdbg.session", session_id = %self.id, thread, variable = name, "variable updated");

        Ok(VariableInfo {
            name: variable.name.clone(),
            value: display_value(conn.as_ref(), &value).await?,
            type_name,
            kind: if variable.is_argument {
                VariableKind::Argument
            } else {
                VariableKind::Local
            },
        })
    }

    /// Evaluate `expression` in the selected frame.
    pub async fn evaluate(&self, expression: &str) -> DebugResult<Evaluation> {
        self.evaluate_in(None, None, expression).await
    }

    pub async fn evaluate_in(
        &self,
        thread: Option<ThreadId>,
        frame: Option<usize>,
        expression: &str,
    ) -> DebugResult<Evaluation> {
        // Parse first so syntax errors never touch the target.
        let expr = eval::parse(expression)?;
        let (conn, thread, frame) = self.frame_context(thread, frame).await?;
        let interpreter = Interpreter::new(conn, thread, frame).await?;
        interpreter.evaluate(&expr).await
    }

    // ---------------------------------------------------------------------
    // Status
    // ---------------------------------------------------------------------

    pub async fn status(&self) -> DebugResult<SessionStatus> {
        let conn = self.connection()?;
        let threads = conn.all_threads().await?;
        let at_breakpoint = self.at_breakpoint.lock().clone();

        let mut suspended_threads = Vec::new();
        for thread in threads.iter().filter(|t| t.suspended) {
            let location = match conn.frames(thread.id).await {
                Ok(frames) => match frames.first() {
                    Some(top) => Some(thread_location(conn.as_ref(), thread.id, &top.location).await),
                    None => None,
                },
                Err(_) => None,
            };
            let breakpoint = at_breakpoint.get(&thread.id);
            suspended_threads.push(SuspendedThread {
                thread_id: thread.id,
                name: thread.name.clone(),
                at_breakpoint: breakpoint.is_some(),
                breakpoint_id: breakpoint.cloned().flatten(),
                location,
            });
        }

        Ok(SessionStatus {
            session_id: self.id.clone(),
            state: self.state(),
            thread_count: threads.len(),
            suspended_threads,
        })
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    /// Stamp `payload` with the next sequence number, buffer it and hand it
    /// to every listener.
    pub(crate) fn emit(&self, payload: EventPayload) -> DebugEvent {
        let event = DebugEvent {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp_ms: now_ms(),
            session_id: self.id.clone(),
            payload,
        };
        tracing::debug!(
            target: "jdbg.events",
            session_id = %self.id,
            sequence = event.sequence,
            kind = %event.kind(),
            "event"
        );
        self.events.push(event.clone());

        let listeners = self.listeners.read().clone();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::warn!(target: "jdbg.events", session_id = %self.id, listener = id, "event listener panicked");
            }
        }
        event
    }

    pub fn poll_events(&self, limit: usize, filter: &[EventKind]) -> Vec<DebugEvent> {
        self.events.poll(limit, filter)
    }

    /// Wait up to `timeout_ms` for a matching event; non-positive values use
    /// the configured default.
    pub async fn wait_for_event(&self, timeout_ms: i64, filter: &[EventKind]) -> Option<DebugEvent> {
        let timeout = u64::try_from(timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.settings.default_wait_timeout());
        self.events.wait(timeout, filter).await
    }

    pub fn clear_events(&self) {
        self.events.clear();
    }

    pub fn event_buffer_info(&self) -> EventBufferInfo {
        self.events.info()
    }

    pub fn add_listener(&self, listener: EventListener) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener, _)| *listener != id);
        listeners.len() != before
    }
}

/// Concrete code locations for a breakpoint in the given loaded classes.
async fn resolve_locations(
    conn: &dyn TargetConnection,
    classes: &[TypeInfo],
    kind: &BreakpointKind,
) -> DebugResult<Vec<Location>> {
    let mut locations = Vec::new();
    for class in classes {
        match kind {
            BreakpointKind::Line { line } => {
                locations.extend(conn.line_locations(class.id, *line).await?);
            }
            BreakpointKind::Method { method } => {
                for candidate in conn.methods(class.id).await? {
                    if candidate.name != *method {
                        continue;
                    }
                    if let Some(entry) = conn.method_entry(&candidate).await? {
                        locations.push(entry);
                    }
                }
            }
        }
    }
    locations.dedup();
    Ok(locations)
}

/// One breakpoint request per location. On failure the requests created
/// so far are deleted again.
async fn install_breakpoints(
    conn: &dyn TargetConnection,
    locations: &[Location],
) -> DebugResult<Vec<RequestId>> {
    let mut requests = Vec::with_capacity(locations.len());
    for location in locations {
        match conn.create_breakpoint(location).await {
            Ok(request) => requests.push(request),
            Err(err) => {
                for request in requests {
                    delete_quietly(conn, request).await;
                }
                return Err(err.into());
            }
        }
    }
    Ok(requests)
}

async fn delete_quietly(conn: &dyn TargetConnection, request: RequestId) {
    if let Err(err) = conn.delete_request(request).await {
        tracing::debug!(target: "jdbg.session", request, error = %err, "failed to delete event request");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids_are_eight_hex_digits() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn terminal_states_are_sticky() {
        let session = DebugSession::new("s1", SessionConfig::default());
        session.set_state(SessionState::Running);
        session.set_state(SessionState::Terminated);
        session.set_state(SessionState::Suspended);
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[test]
    fn operations_need_an_attached_target() {
        let session = DebugSession::new("s1", SessionConfig::default());
        assert!(matches!(
            session.connection(),
            Err(DebugError::ConnectionFailed(_))
        ));
        session.set_state(SessionState::Disconnected);
        assert!(matches!(session.connection(), Err(DebugError::VmDisconnected)));
    }

    #[test]
    fn listeners_see_events_and_panics_are_contained() {
        let session = DebugSession::new("s1", SessionConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.add_listener(Arc::new(|_: &DebugEvent| panic!("listener bug")));
        let id = session.add_listener(Arc::new(move |event: &DebugEvent| {
            sink.lock().push(event.sequence);
        }));

        session.emit(EventPayload::VmDeath { exit_code: 0 });
        session.emit(EventPayload::VmDeath { exit_code: 0 });
        assert!(session.remove_listener(id));
        session.emit(EventPayload::VmDeath { exit_code: 0 });

        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(session.event_buffer_info().buffered_count, 3);
    }

    #[test]
    fn origin_follows_the_target_kind() {
        let remote = TargetKind::Remote {
            host: "localhost".to_string(),
            port: 5005,
        };
        assert_eq!(OriginKind::of(&remote), OriginKind::AttachedRemote);
        assert_eq!(describe_target(&remote), "localhost:5005");
        assert_eq!(
            OriginKind::of(&TargetKind::Local { pid: 42 }),
            OriginKind::AttachedLocal
        );
    }
}
