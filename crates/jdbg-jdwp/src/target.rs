use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::signature::{
    method_argument_signatures, method_return_signature, signature_to_type_name,
};
use crate::{
    FieldId, FrameId, MethodId, ObjectRef, ReferenceTypeId, RequestId, Result, ThreadId, Value,
};

const ACC_STATIC: u32 = 0x0008;

/// An executable code position: class, method and bytecode index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Location {
    pub type_tag: u8,
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64,
}

/// Human readable description of a [`Location`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocationInfo {
    pub class_name: String,
    pub method_name: String,
    pub line: Option<u32>,
    pub source_name: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    Zombie,
    Running,
    Sleeping,
    Monitor,
    Wait,
    NotStarted,
}

impl ThreadStatus {
    pub fn from_jdwp(status: i32) -> Self {
        match status {
            0 => ThreadStatus::Zombie,
            1 => ThreadStatus::Running,
            2 => ThreadStatus::Sleeping,
            3 => ThreadStatus::Monitor,
            4 => ThreadStatus::Wait,
            _ => ThreadStatus::NotStarted,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThreadStatus::Zombie => "zombie",
            ThreadStatus::Running => "running",
            ThreadStatus::Sleeping => "sleeping",
            ThreadStatus::Monitor => "monitor",
            ThreadStatus::Wait => "wait",
            ThreadStatus::NotStarted => "not_started",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
    pub status: ThreadStatus,
    pub suspended: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub id: FrameId,
    pub location: Location,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Class,
    Interface,
    Array,
}

impl TypeKind {
    pub fn from_jdwp_tag(tag: u8) -> Self {
        match tag {
            2 => TypeKind::Interface,
            3 => TypeKind::Array,
            _ => TypeKind::Class,
        }
    }

    pub fn jdwp_tag(self) -> u8 {
        match self {
            TypeKind::Class => 1,
            TypeKind::Interface => 2,
            TypeKind::Array => 3,
        }
    }
}

/// A loaded reference type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeInfo {
    pub id: ReferenceTypeId,
    /// Java type name, e.g. `com.example.Foo` or `int[]`.
    pub name: String,
    pub kind: TypeKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodInfo {
    pub id: MethodId,
    pub declaring_type: ReferenceTypeId,
    pub name: String,
    /// JVM method signature, e.g. `(ILjava/lang/String;)V`.
    pub signature: String,
    pub modifiers: u32,
}

impl MethodInfo {
    pub fn is_static(&self) -> bool {
        self.modifiers & ACC_STATIC != 0
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    pub fn argument_type_names(&self) -> Vec<String> {
        method_argument_signatures(&self.signature)
            .iter()
            .map(|sig| signature_to_type_name(sig))
            .collect()
    }

    pub fn return_type_name(&self) -> String {
        signature_to_type_name(method_return_signature(&self.signature))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldInfo {
    pub id: FieldId,
    pub declaring_type: ReferenceTypeId,
    pub name: String,
    pub signature: String,
    pub modifiers: u32,
}

impl FieldInfo {
    pub fn is_static(&self) -> bool {
        self.modifiers & ACC_STATIC != 0
    }

    pub fn type_name(&self) -> String {
        signature_to_type_name(&self.signature)
    }
}

/// A local variable visible at a frame's current location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalVariable {
    pub name: String,
    pub signature: String,
    pub slot: u32,
    pub is_argument: bool,
}

impl LocalVariable {
    pub fn type_name(&self) -> String {
        signature_to_type_name(&self.signature)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepDepth {
    Into,
    Over,
    Out,
}

impl StepDepth {
    pub fn jdwp_value(self) -> u32 {
        match self {
            StepDepth::Into => 0,
            StepDepth::Over => 1,
            StepDepth::Out => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepSize {
    Instruction,
    Line,
}

impl StepSize {
    pub fn jdwp_value(self) -> u32 {
        match self {
            StepSize::Instruction => 0,
            StepSize::Line => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendPolicy {
    None,
    EventThread,
    All,
}

impl SuspendPolicy {
    pub fn from_jdwp(policy: u8) -> Self {
        match policy {
            0 => SuspendPolicy::None,
            1 => SuspendPolicy::EventThread,
            _ => SuspendPolicy::All,
        }
    }

    pub fn jdwp_value(self) -> u8 {
        match self {
            SuspendPolicy::None => 0,
            SuspendPolicy::EventThread => 1,
            SuspendPolicy::All => 2,
        }
    }
}

/// One event reported by the target VM.
///
/// `request` is `None` when the event was not caused by a request created
/// through the connection (for example the automatic VM start event), or when
/// the request was deleted while the event was in flight.
#[derive(Clone, Debug, PartialEq)]
pub enum TargetEvent {
    VmStart {
        thread: ThreadId,
    },
    Breakpoint {
        request: Option<RequestId>,
        thread: ThreadId,
        location: Location,
    },
    Step {
        request: Option<RequestId>,
        thread: ThreadId,
        location: Location,
    },
    Exception {
        request: Option<RequestId>,
        thread: ThreadId,
        location: Location,
        exception: ObjectRef,
        catch_location: Option<Location>,
    },
    ThreadStart {
        thread: ThreadId,
    },
    ThreadDeath {
        thread: ThreadId,
    },
    ClassPrepare {
        request: Option<RequestId>,
        thread: ThreadId,
        class: TypeInfo,
    },
    VmDeath,
}

impl TargetEvent {
    pub fn thread(&self) -> Option<ThreadId> {
        match self {
            TargetEvent::VmStart { thread }
            | TargetEvent::Breakpoint { thread, .. }
            | TargetEvent::Step { thread, .. }
            | TargetEvent::Exception { thread, .. }
            | TargetEvent::ThreadStart { thread }
            | TargetEvent::ThreadDeath { thread }
            | TargetEvent::ClassPrepare { thread, .. } => Some(*thread),
            TargetEvent::VmDeath => None,
        }
    }
}

/// A batch of events delivered together; the VM applied `suspend_policy`
/// before sending it.
#[derive(Clone, Debug, PartialEq)]
pub struct EventSet {
    pub suspend_policy: SuspendPolicy,
    pub events: Vec<TargetEvent>,
}

/// Result of a remote invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum InvokeOutcome {
    Returned(Value),
    /// The invoked code threw; the payload is the exception object.
    Threw(ObjectRef),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmVersion {
    pub description: String,
    pub vm_name: String,
    pub vm_version: String,
}

/// Where to find (or how to start) a target VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetKind {
    /// Attach to a JDWP agent listening on `host:port`.
    Remote { host: String, port: u16 },
    /// Attach to a running local VM by process id.
    Local { pid: u32 },
    /// Start a new VM under the debugger.
    Launch(LaunchConfig),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchConfig {
    pub main_class: String,
    pub classpath: Vec<PathBuf>,
    pub jvm_args: Vec<String>,
    pub program_args: Vec<String>,
}

/// The capability `jdbg-core` consumes to drive a target VM.
///
/// Methods operating on frames or invoking code require the thread to be
/// suspended and fail with [`crate::TargetError::ThreadNotSuspended`]
/// otherwise. All invocations run in single-threaded mode: other threads of
/// the target stay suspended for the duration of the call.
#[async_trait]
pub trait TargetConnection: Send + Sync {
    async fn version(&self) -> Result<VmVersion>;

    async fn all_threads(&self) -> Result<Vec<ThreadInfo>>;
    async fn thread(&self, thread: ThreadId) -> Result<ThreadInfo>;
    async fn suspend_thread(&self, thread: ThreadId) -> Result<()>;
    async fn resume_thread(&self, thread: ThreadId) -> Result<()>;
    async fn suspend_all(&self) -> Result<()>;
    async fn resume_all(&self) -> Result<()>;

    /// Frames of a suspended thread, innermost first.
    async fn frames(&self, thread: ThreadId) -> Result<Vec<FrameInfo>>;
    async fn location_info(&self, location: &Location) -> Result<LocationInfo>;

    async fn visible_variables(
        &self,
        thread: ThreadId,
        frame: &FrameInfo,
    ) -> Result<Vec<LocalVariable>>;
    async fn local_values(
        &self,
        thread: ThreadId,
        frame: &FrameInfo,
        variables: &[LocalVariable],
    ) -> Result<Vec<Value>>;
    async fn set_local_value(
        &self,
        thread: ThreadId,
        frame: &FrameInfo,
        variable: &LocalVariable,
        value: &Value,
    ) -> Result<()>;
    /// The receiver of the frame's method, `None` for static and native methods.
    async fn this_object(&self, thread: ThreadId, frame: &FrameInfo) -> Result<Option<ObjectRef>>;

    /// Loaded types with the given Java type name (one per defining loader).
    async fn classes_by_name(&self, name: &str) -> Result<Vec<TypeInfo>>;
    async fn superclass(&self, class: ReferenceTypeId) -> Result<Option<TypeInfo>>;
    async fn interfaces(&self, class: ReferenceTypeId) -> Result<Vec<TypeInfo>>;
    /// Methods declared by the type and inherited from its superclasses.
    async fn methods(&self, class: ReferenceTypeId) -> Result<Vec<MethodInfo>>;
    /// Fields declared by the type and inherited from its superclasses.
    async fn fields(&self, class: ReferenceTypeId) -> Result<Vec<FieldInfo>>;
    /// Every line-table location of the type that maps to `line`.
    async fn line_locations(&self, class: ReferenceTypeId, line: u32) -> Result<Vec<Location>>;
    /// First executable location of a method, `None` for abstract and native methods.
    async fn method_entry(&self, method: &MethodInfo) -> Result<Option<Location>>;

    async fn get_field(&self, object: &ObjectRef, field: &FieldInfo) -> Result<Value>;
    async fn set_field(&self, object: &ObjectRef, field: &FieldInfo, value: &Value) -> Result<()>;
    async fn get_static_field(&self, class: ReferenceTypeId, field: &FieldInfo) -> Result<Value>;

    async fn array_length(&self, array: &ObjectRef) -> Result<i32>;
    async fn array_get(&self, array: &ObjectRef, index: i32) -> Result<Value>;
    async fn array_set(&self, array: &ObjectRef, index: i32, value: &Value) -> Result<()>;

    async fn string_value(&self, string: &ObjectRef) -> Result<String>;
    async fn create_string(&self, value: &str) -> Result<ObjectRef>;

    async fn invoke_static(
        &self,
        thread: ThreadId,
        class: ReferenceTypeId,
        method: &MethodInfo,
        args: &[Value],
    ) -> Result<InvokeOutcome>;
    async fn invoke_instance(
        &self,
        thread: ThreadId,
        object: &ObjectRef,
        method: &MethodInfo,
        args: &[Value],
    ) -> Result<InvokeOutcome>;
    async fn new_instance(
        &self,
        thread: ThreadId,
        class: ReferenceTypeId,
        constructor: &MethodInfo,
        args: &[Value],
    ) -> Result<InvokeOutcome>;
    async fn new_array(&self, array_type: ReferenceTypeId, length: i32) -> Result<ObjectRef>;

    async fn create_breakpoint(&self, location: &Location) -> Result<RequestId>;
    /// One-shot step request (count filter 1) on `thread`.
    async fn create_step(&self, thread: ThreadId, size: StepSize, depth: StepDepth)
        -> Result<RequestId>;
    /// Exception request; `None` matches every throwable.
    async fn create_exception_request(
        &self,
        exception: Option<ReferenceTypeId>,
        caught: bool,
        uncaught: bool,
    ) -> Result<RequestId>;
    /// Class-prepare request filtered to an exact class name.
    async fn create_class_prepare_watch(&self, class_name: &str) -> Result<RequestId>;
    /// Non-suspending thread start and thread death requests.
    async fn watch_thread_lifecycle(&self) -> Result<Vec<RequestId>>;
    async fn set_request_enabled(&self, request: RequestId, enabled: bool) -> Result<()>;
    async fn delete_request(&self, request: RequestId) -> Result<()>;

    /// Wait up to `timeout` for the next event batch.
    ///
    /// Returns `Ok(None)` on timeout and [`crate::TargetError::Disconnected`]
    /// once the connection has dropped.
    async fn next_event_set(&self, timeout: Duration) -> Result<Option<EventSet>>;
    /// Undo the suspension the VM applied when it sent `set`.
    async fn resume_event_set(&self, set: &EventSet) -> Result<()>;

    /// Detach from the target. Idempotent.
    async fn dispose(&self) -> Result<()>;
}

/// Opens [`TargetConnection`]s.
#[async_trait]
pub trait TargetConnector: Send + Sync {
    async fn connect(&self, target: &TargetKind) -> Result<Arc<dyn TargetConnection>>;
}
