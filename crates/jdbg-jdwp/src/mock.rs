use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::signature::array_component_type_name;
use crate::{
    EventSet, FieldId, FieldInfo, FrameId, FrameInfo, InvokeOutcome, LocalVariable, Location,
    LocationInfo, MethodId, MethodInfo, ObjectId, ObjectRef, ReferenceTypeId, RequestId, Result,
    StepDepth, StepSize, SuspendPolicy, TargetConnection, TargetError, TargetEvent, ThreadId,
    ThreadInfo, ThreadStatus, TypeInfo, TypeKind, Value, VmVersion,
};

const ACC_PUBLIC: u32 = 0x0001;
const ACC_STATIC: u32 = 0x0008;

/// Scripted body of a mock method.
///
/// Bodies run with exclusive access to the VM state so they can allocate
/// strings and objects or read fields of their receiver.
pub type MockBody = Arc<dyn Fn(&mut MockState, &MockInvocation) -> InvokeOutcome + Send + Sync>;

#[derive(Clone, Debug)]
pub struct MockInvocation {
    pub thread: ThreadId,
    pub method: MethodInfo,
    /// `None` for static methods; for constructors, the freshly allocated object.
    pub receiver: Option<ObjectRef>,
    pub args: Vec<Value>,
}

#[derive(Clone, Debug)]
pub struct MockFrame {
    pub location: Location,
    pub this: Option<ObjectRef>,
    pub locals: Vec<(LocalVariable, Value)>,
}

impl MockFrame {
    pub fn new(location: Location) -> Self {
        Self {
            location,
            this: None,
            locals: Vec::new(),
        }
    }

    pub fn with_this(mut self, this: ObjectRef) -> Self {
        self.this = Some(this);
        self
    }

    pub fn with_local(mut self, name: &str, signature: &str, value: Value) -> Self {
        self.push_variable(name, signature, value, false);
        self
    }

    pub fn with_argument(mut self, name: &str, signature: &str, value: Value) -> Self {
        self.push_variable(name, signature, value, true);
        self
    }

    fn push_variable(&mut self, name: &str, signature: &str, value: Value, is_argument: bool) {
        let slot = self.locals.len() as u32;
        self.locals.push((
            LocalVariable {
                name: name.to_string(),
                signature: signature.to_string(),
                slot,
                is_argument,
            },
            value,
        ));
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MockRequestKind {
    Breakpoint(Location),
    Step {
        thread: ThreadId,
        size: StepSize,
        depth: StepDepth,
    },
    Exception {
        exception: Option<ReferenceTypeId>,
        caught: bool,
        uncaught: bool,
    },
    ClassPrepare(String),
    ThreadStart,
    ThreadDeath,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MockRequest {
    pub id: RequestId,
    pub kind: MockRequestKind,
    pub enabled: bool,
}

struct MockClass {
    info: TypeInfo,
    superclass: Option<ReferenceTypeId>,
    interfaces: Vec<ReferenceTypeId>,
    methods: Vec<MethodInfo>,
    fields: Vec<FieldInfo>,
    statics: HashMap<FieldId, Value>,
    lines: Vec<(u32, Location)>,
    next_index: u64,
    loaded: bool,
}

#[derive(Default)]
struct MockObjectData {
    fields: HashMap<FieldId, Value>,
    string: Option<String>,
    array: Option<Vec<Value>>,
}

struct MockThread {
    info: ThreadInfo,
    frames: Vec<(FrameId, MockFrame)>,
}

enum MockEventItem {
    Set(EventSet),
    Disconnect,
}

/// State of the mock VM.
pub struct MockState {
    next_id: u64,
    next_request: RequestId,
    classes: BTreeMap<ReferenceTypeId, MockClass>,
    objects: HashMap<ObjectId, MockObjectData>,
    threads: BTreeMap<ThreadId, MockThread>,
    bodies: HashMap<MethodId, MockBody>,
    entries: HashMap<MethodId, Location>,
    location_infos: HashMap<Location, LocationInfo>,
    requests: BTreeMap<RequestId, MockRequest>,
    resume_all_calls: usize,
    resumed_event_sets: usize,
    invocations: Vec<String>,
    disposed: bool,
}

impl MockState {
    fn new() -> Self {
        Self {
            next_id: 1,
            next_request: 1,
            classes: BTreeMap::new(),
            objects: HashMap::new(),
            threads: BTreeMap::new(),
            bodies: HashMap::new(),
            entries: HashMap::new(),
            location_infos: HashMap::new(),
            requests: BTreeMap::new(),
            resume_all_calls: 0,
            resumed_event_sets: 0,
            invocations: Vec::new(),
            disposed: false,
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Allocate a `java.lang.String` holding `value`.
    pub fn new_string(&mut self, value: &str) -> ObjectRef {
        let type_id = self.class_id("java.lang.String").unwrap_or_default();
        let id = self.alloc_id();
        self.objects.insert(
            id,
            MockObjectData {
                string: Some(value.to_string()),
                ..MockObjectData::default()
            },
        );
        ObjectRef {
            id,
            type_id,
            runtime_type: "java.lang.String".to_string(),
        }
    }

    /// Allocate an instance of `class` with every field unset (`null`/zero).
    pub fn new_object(&mut self, class: ReferenceTypeId) -> ObjectRef {
        let runtime_type = self
            .classes
            .get(&class)
            .map(|c| c.info.name.clone())
            .unwrap_or_else(|| "<unknown>".to_string());
        let id = self.alloc_id();
        self.objects.insert(id, MockObjectData::default());
        ObjectRef {
            id,
            type_id: class,
            runtime_type,
        }
    }

    pub fn string(&self, object: &ObjectRef) -> Option<String> {
        self.objects.get(&object.id)?.string.clone()
    }

    /// Read a field of `object` by name, searching the class hierarchy.
    pub fn field_value(&self, object: &ObjectRef, name: &str) -> Option<Value> {
        let field = self.find_field(object.type_id, name)?;
        Some(self.read_field(object.id, &field))
    }

    pub fn set_field_value(&mut self, object: &ObjectRef, name: &str, value: Value) -> bool {
        let Some(field) = self.find_field(object.type_id, name) else {
            return false;
        };
        match self.objects.get_mut(&object.id) {
            Some(data) => {
                data.fields.insert(field.id, value);
                true
            }
            None => false,
        }
    }

    pub fn class_id(&self, name: &str) -> Option<ReferenceTypeId> {
        self.classes
            .values()
            .find(|c| c.info.name == name)
            .map(|c| c.info.id)
    }

    fn find_field(&self, class: ReferenceTypeId, name: &str) -> Option<FieldInfo> {
        self.visible_fields(class).into_iter().find(|f| f.name == name)
    }

    fn read_field(&self, object: ObjectId, field: &FieldInfo) -> Value {
        self.objects
            .get(&object)
            .and_then(|data| data.fields.get(&field.id).cloned())
            .unwrap_or_else(|| default_value(&field.type_name()))
    }

    fn hierarchy(&self, class: ReferenceTypeId) -> Vec<ReferenceTypeId> {
        let mut out = Vec::new();
        let mut current = Some(class);
        while let Some(id) = current {
            if out.contains(&id) {
                break;
            }
            out.push(id);
            current = self.classes.get(&id).and_then(|c| c.superclass);
        }
        out
    }

    fn visible_methods(&self, class: ReferenceTypeId) -> Vec<MethodInfo> {
        let mut out: Vec<MethodInfo> = Vec::new();
        for id in self.hierarchy(class) {
            let Some(c) = self.classes.get(&id) else {
                continue;
            };
            for m in &c.methods {
                let overridden = out
                    .iter()
                    .any(|o| o.name == m.name && o.signature == m.signature);
                // Constructors are never inherited.
                if !overridden && (id == class || !m.is_constructor()) {
                    out.push(m.clone());
                }
            }
        }
        out
    }

    fn visible_fields(&self, class: ReferenceTypeId) -> Vec<FieldInfo> {
        let mut out: Vec<FieldInfo> = Vec::new();
        for id in self.hierarchy(class) {
            if let Some(c) = self.classes.get(&id) {
                for f in &c.fields {
                    if !out.iter().any(|o| o.name == f.name) {
                        out.push(f.clone());
                    }
                }
            }
        }
        out
    }

    fn type_info(&self, class: ReferenceTypeId) -> Result<TypeInfo> {
        self.classes
            .get(&class)
            .map(|c| c.info.clone())
            .ok_or_else(|| TargetError::Protocol(format!("unknown reference type {class}")))
    }

    fn array_type(&mut self, name: &str) -> ReferenceTypeId {
        if let Some(id) = self.class_id(name) {
            return id;
        }
        let superclass = self.class_id("java.lang.Object");
        self.insert_class(name, TypeKind::Array, superclass, true)
    }

    fn insert_class(
        &mut self,
        name: &str,
        kind: TypeKind,
        superclass: Option<ReferenceTypeId>,
        loaded: bool,
    ) -> ReferenceTypeId {
        let id = self.alloc_id();
        self.classes.insert(
            id,
            MockClass {
                info: TypeInfo {
                    id,
                    name: name.to_string(),
                    kind,
                },
                superclass,
                interfaces: Vec::new(),
                methods: Vec::new(),
                fields: Vec::new(),
                statics: HashMap::new(),
                lines: Vec::new(),
                next_index: 0,
                loaded,
            },
        );
        id
    }

    fn insert_method(
        &mut self,
        class: ReferenceTypeId,
        name: &str,
        signature: &str,
        modifiers: u32,
        body: Option<MockBody>,
    ) -> MethodInfo {
        let id = self.alloc_id();
        let method = MethodInfo {
            id,
            declaring_type: class,
            name: name.to_string(),
            signature: signature.to_string(),
            modifiers,
        };
        if let Some(c) = self.classes.get_mut(&class) {
            c.methods.push(method.clone());
        }
        if let Some(body) = body {
            self.bodies.insert(id, body);
        }
        method
    }

    fn insert_field(
        &mut self,
        class: ReferenceTypeId,
        name: &str,
        signature: &str,
        modifiers: u32,
    ) -> FieldInfo {
        let id = self.alloc_id();
        let field = FieldInfo {
            id,
            declaring_type: class,
            name: name.to_string(),
            signature: signature.to_string(),
            modifiers,
        };
        if let Some(c) = self.classes.get_mut(&class) {
            c.fields.push(field.clone());
        }
        field
    }

    fn require_suspended(&self, thread: ThreadId) -> Result<&MockThread> {
        let t = self
            .threads
            .get(&thread)
            .ok_or(TargetError::InvalidThread(thread))?;
        if !t.info.suspended {
            return Err(TargetError::ThreadNotSuspended(thread));
        }
        Ok(t)
    }

    fn frame(&self, thread: ThreadId, frame: &FrameInfo) -> Result<&MockFrame> {
        self.require_suspended(thread)?
            .frames
            .iter()
            .find(|(id, _)| *id == frame.id)
            .map(|(_, f)| f)
            .ok_or(TargetError::InvalidFrame)
    }

    fn object(&self, object: &ObjectRef) -> Result<&MockObjectData> {
        self.objects
            .get(&object.id)
            .ok_or(TargetError::InvalidObject(object.id))
    }

    fn array(&self, array: &ObjectRef) -> Result<&Vec<Value>> {
        self.object(array)?
            .array
            .as_ref()
            .ok_or(TargetError::InvalidObject(array.id))
    }

    /// Resolve the body to run for `method` on a receiver of type `class`,
    /// honouring overrides in subclasses.
    fn dispatch(&self, class: ReferenceTypeId, method: &MethodInfo) -> Option<MockBody> {
        for id in self.hierarchy(class) {
            let Some(c) = self.classes.get(&id) else {
                continue;
            };
            if let Some(m) = c
                .methods
                .iter()
                .find(|m| m.name == method.name && m.signature == method.signature)
            {
                if let Some(body) = self.bodies.get(&m.id) {
                    return Some(body.clone());
                }
            }
        }
        self.bodies.get(&method.id).cloned()
    }

    fn run(
        &mut self,
        body: Option<MockBody>,
        invocation: MockInvocation,
    ) -> Result<InvokeOutcome> {
        self.require_suspended(invocation.thread)?;
        let body = body.ok_or_else(|| {
            TargetError::Unsupported(format!("mock method {} has no body", invocation.method.name))
        })?;
        self.invocations.push(invocation.method.name.clone());
        Ok(body(self, &invocation))
    }

    fn suspend_everything(&mut self) {
        for t in self.threads.values_mut() {
            t.info.suspended = true;
        }
    }

    fn resume_everything(&mut self) {
        for t in self.threads.values_mut() {
            t.info.suspended = false;
        }
    }

    fn enabled_requests(&self) -> impl Iterator<Item = &MockRequest> {
        self.requests.values().filter(|r| r.enabled)
    }

    fn add_request(&mut self, kind: MockRequestKind) -> RequestId {
        let id = self.next_request;
        self.next_request += 1;
        self.requests.insert(
            id,
            MockRequest {
                id,
                kind,
                enabled: true,
            },
        );
        id
    }
}

fn default_value(type_name: &str) -> Value {
    match type_name {
        "boolean" => Value::Boolean(false),
        "byte" => Value::Byte(0),
        "char" => Value::Char(0),
        "short" => Value::Short(0),
        "int" => Value::Int(0),
        "long" => Value::Long(0),
        "float" => Value::Float(0.0),
        "double" => Value::Double(0.0),
        _ => Value::Null,
    }
}

/// Deterministic, in-memory [`TargetConnection`] test double.
///
/// `MockTarget::new()` pre-loads a small slice of `java.lang`: `Object`
/// (with `toString`/`hashCode`), `String` (implementing `Comparable`, with
/// `length`), `Number`, `Integer` (boxing via `valueOf`, `intValue`), and
/// the `Throwable` > `Exception` > `RuntimeException` >
/// `ArithmeticException` chain carrying `detailMessage`.
pub struct MockTarget {
    state: Mutex<MockState>,
    events_tx: mpsc::UnboundedSender<MockEventItem>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockEventItem>>,
    disconnected: Mutex<bool>,
}

impl Default for MockTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTarget {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let target = Self {
            state: Mutex::new(MockState::new()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            disconnected: Mutex::new(false),
        };
        target.install_java_lang();
        target
    }

    fn install_java_lang(&self) {
        let object = self.define_class("java.lang.Object", None);
        self.add_method(
            object,
            "toString",
            "()Ljava/lang/String;",
            false,
            Some(Arc::new(|state: &mut MockState, call: &MockInvocation| {
                let text = call
                    .receiver
                    .as_ref()
                    .map(|r| format!("{}@{:x}", r.runtime_type, r.id))
                    .unwrap_or_default();
                InvokeOutcome::Returned(Value::Object(state.new_string(&text)))
            })),
        );
        self.add_method(
            object,
            "hashCode",
            "()I",
            false,
            Some(Arc::new(|_: &mut MockState, call: &MockInvocation| {
                let id = call.receiver.as_ref().map(|r| r.id).unwrap_or_default();
                InvokeOutcome::Returned(Value::Int(id as i32))
            })),
        );
        self.add_method(
            object,
            "<init>",
            "()V",
            false,
            Some(Arc::new(|_: &mut MockState, _: &MockInvocation| {
                InvokeOutcome::Returned(Value::Void)
            })),
        );

        let comparable = self.define_interface("java.lang.Comparable");
        let string = self.define_class("java.lang.String", Some(object));
        self.add_interface(string, comparable);
        self.add_method(
            string,
            "length",
            "()I",
            false,
            Some(Arc::new(|state: &mut MockState, call: &MockInvocation| {
                let len = call
                    .receiver
                    .as_ref()
                    .and_then(|r| state.string(r))
                    .map(|s| s.encode_utf16().count())
                    .unwrap_or_default();
                InvokeOutcome::Returned(Value::Int(len as i32))
            })),
        );
        self.add_method(
            string,
            "toString",
            "()Ljava/lang/String;",
            false,
            Some(Arc::new(|_: &mut MockState, call: &MockInvocation| {
                InvokeOutcome::Returned(
                    call.receiver.clone().map(Value::Object).unwrap_or(Value::Null),
                )
            })),
        );

        let number = self.define_class("java.lang.Number", Some(object));
        let integer = self.define_class("java.lang.Integer", Some(number));
        self.add_field(integer, "value", "I", false);
        self.add_method(
            integer,
            "valueOf",
            "(I)Ljava/lang/Integer;",
            true,
            Some(Arc::new(move |state: &mut MockState, call: &MockInvocation| {
                let boxed = state.new_object(integer);
                let value = call.args.first().cloned().unwrap_or(Value::Int(0));
                state.set_field_value(&boxed, "value", value);
                InvokeOutcome::Returned(Value::Object(boxed))
            })),
        );
        self.add_method(
            integer,
            "intValue",
            "()I",
            false,
            Some(Arc::new(|state: &mut MockState, call: &MockInvocation| {
                let value = call
                    .receiver
                    .as_ref()
                    .and_then(|r| state.field_value(r, "value"))
                    .unwrap_or(Value::Int(0));
                InvokeOutcome::Returned(value)
            })),
        );
        self.add_method(
            integer,
            "toString",
            "()Ljava/lang/String;",
            false,
            Some(Arc::new(|state: &mut MockState, call: &MockInvocation| {
                let text = match call.receiver.as_ref().and_then(|r| state.field_value(r, "value")) {
                    Some(Value::Int(v)) => v.to_string(),
                    _ => "0".to_string(),
                };
                InvokeOutcome::Returned(Value::Object(state.new_string(&text)))
            })),
        );

        let throwable = self.define_class("java.lang.Throwable", Some(object));
        self.add_field(throwable, "detailMessage", "Ljava/lang/String;", false);
        self.add_method(
            throwable,
            "getMessage",
            "()Ljava/lang/String;",
            false,
            Some(Arc::new(|state: &mut MockState, call: &MockInvocation| {
                let message = call
                    .receiver
                    .as_ref()
                    .and_then(|r| state.field_value(r, "detailMessage"))
                    .unwrap_or(Value::Null);
                InvokeOutcome::Returned(message)
            })),
        );
        let exception = self.define_class("java.lang.Exception", Some(throwable));
        let runtime = self.define_class("java.lang.RuntimeException", Some(exception));
        self.define_class("java.lang.ArithmeticException", Some(runtime));
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock()
    }

    /// Define a loaded class.
    pub fn define_class(&self, name: &str, superclass: Option<ReferenceTypeId>) -> ReferenceTypeId {
        self.state().insert_class(name, TypeKind::Class, superclass, true)
    }

    /// Define a class the VM knows about but has not loaded yet. It becomes
    /// visible to `classes_by_name` after [`MockTarget::load_class`].
    pub fn define_unloaded_class(
        &self,
        name: &str,
        superclass: Option<ReferenceTypeId>,
    ) -> ReferenceTypeId {
        self.state().insert_class(name, TypeKind::Class, superclass, false)
    }

    pub fn define_interface(&self, name: &str) -> ReferenceTypeId {
        self.state().insert_class(name, TypeKind::Interface, None, true)
    }

    pub fn add_interface(&self, class: ReferenceTypeId, interface: ReferenceTypeId) {
        if let Some(c) = self.state().classes.get_mut(&class) {
            c.interfaces.push(interface);
        }
    }

    pub fn class_id(&self, name: &str) -> Option<ReferenceTypeId> {
        self.state().class_id(name)
    }

    pub fn add_method(
        &self,
        class: ReferenceTypeId,
        name: &str,
        signature: &str,
        is_static: bool,
        body: Option<MockBody>,
    ) -> MethodInfo {
        let modifiers = if is_static {
            ACC_PUBLIC | ACC_STATIC
        } else {
            ACC_PUBLIC
        };
        self.state()
            .insert_method(class, name, signature, modifiers, body)
    }

    pub fn add_field(
        &self,
        class: ReferenceTypeId,
        name: &str,
        signature: &str,
        is_static: bool,
    ) -> FieldInfo {
        let modifiers = if is_static {
            ACC_PUBLIC | ACC_STATIC
        } else {
            ACC_PUBLIC
        };
        self.state().insert_field(class, name, signature, modifiers)
    }

    pub fn set_static_value(&self, class: ReferenceTypeId, field: &FieldInfo, value: Value) {
        if let Some(c) = self.state().classes.get_mut(&class) {
            c.statics.insert(field.id, value);
        }
    }

    /// Add a line-table entry for `line` inside `method` and return its location.
    ///
    /// The first line added to a method also becomes the method's entry point.
    pub fn add_line(&self, method: &MethodInfo, line: u32) -> Location {
        let mut state = self.state();
        let class = method.declaring_type;
        let Some(c) = state.classes.get_mut(&class) else {
            return Location {
                type_tag: 1,
                class_id: class,
                method_id: method.id,
                index: 0,
            };
        };
        let location = Location {
            type_tag: c.info.kind.jdwp_tag(),
            class_id: class,
            method_id: method.id,
            index: c.next_index,
        };
        c.next_index += 4;
        c.lines.push((line, location));
        let class_name = c.info.name.clone();
        let simple = class_name
            .rsplit('.')
            .next()
            .unwrap_or(class_name.as_str())
            .to_string();
        state.location_infos.insert(
            location,
            LocationInfo {
                class_name,
                method_name: method.name.clone(),
                line: Some(line),
                source_name: Some(format!("{simple}.java")),
            },
        );
        state.entries.entry(method.id).or_insert(location);
        location
    }

    pub fn new_object(&self, class: ReferenceTypeId) -> ObjectRef {
        self.state().new_object(class)
    }

    pub fn new_string(&self, value: &str) -> ObjectRef {
        self.state().new_string(value)
    }

    /// Allocate an array of `element_type` (a Java type name) holding `values`.
    pub fn new_array(&self, element_type: &str, values: Vec<Value>) -> ObjectRef {
        let mut state = self.state();
        let runtime_type = format!("{element_type}[]");
        let type_id = state.array_type(&runtime_type);
        let id = state.alloc_id();
        state.objects.insert(
            id,
            MockObjectData {
                array: Some(values),
                ..MockObjectData::default()
            },
        );
        ObjectRef {
            id,
            type_id,
            runtime_type,
        }
    }

    pub fn set_field_value(&self, object: &ObjectRef, name: &str, value: Value) {
        self.state().set_field_value(object, name, value);
    }

    pub fn field_value(&self, object: &ObjectRef, name: &str) -> Option<Value> {
        self.state().field_value(object, name)
    }

    /// Allocate an exception of class `class` with the given `detailMessage`.
    pub fn new_exception(&self, class: ReferenceTypeId, message: Option<&str>) -> ObjectRef {
        let mut state = self.state();
        let exception = state.new_object(class);
        if let Some(message) = message {
            let text = state.new_string(message);
            state.set_field_value(&exception, "detailMessage", Value::Object(text));
        }
        exception
    }

    pub fn add_thread(&self, name: &str) -> ThreadId {
        let mut state = self.state();
        let id = state.alloc_id();
        state.threads.insert(
            id,
            MockThread {
                info: ThreadInfo {
                    id,
                    name: name.to_string(),
                    status: ThreadStatus::Running,
                    suspended: false,
                },
                frames: Vec::new(),
            },
        );
        id
    }

    /// Append a frame below the frames already added (the first frame added is frame 0).
    pub fn add_frame(&self, thread: ThreadId, frame: MockFrame) -> FrameId {
        let mut state = self.state();
        let id = state.alloc_id();
        if let Some(t) = state.threads.get_mut(&thread) {
            t.frames.push((id, frame));
        }
        id
    }

    pub fn set_suspended(&self, thread: ThreadId, suspended: bool) {
        if let Some(t) = self.state().threads.get_mut(&thread) {
            t.info.suspended = suspended;
        }
    }

    pub fn is_suspended(&self, thread: ThreadId) -> bool {
        self.state()
            .threads
            .get(&thread)
            .map(|t| t.info.suspended)
            .unwrap_or(false)
    }

    pub fn local_value(&self, thread: ThreadId, name: &str) -> Option<Value> {
        let state = self.state();
        let t = state.threads.get(&thread)?;
        let (_, frame) = t.frames.first()?;
        frame
            .locals
            .iter()
            .find(|(v, _)| v.name == name)
            .map(|(_, value)| value.clone())
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.state().requests.values().cloned().collect()
    }

    pub fn request(&self, id: RequestId) -> Option<MockRequest> {
        self.state().requests.get(&id).cloned()
    }

    pub fn breakpoint_requests(&self) -> Vec<MockRequest> {
        self.requests()
            .into_iter()
            .filter(|r| matches!(r.kind, MockRequestKind::Breakpoint(_)))
            .collect()
    }

    pub fn resume_all_calls(&self) -> usize {
        self.state().resume_all_calls
    }

    pub fn resumed_event_sets(&self) -> usize {
        self.state().resumed_event_sets
    }

    /// Names of the methods invoked so far, in call order.
    pub fn invocations(&self) -> Vec<String> {
        self.state().invocations.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.state().disposed
    }

    /// Queue a raw event batch. Events with [`SuspendPolicy::All`] suspend every thread.
    pub fn push_event_set(&self, set: EventSet) {
        if set.suspend_policy == SuspendPolicy::All {
            self.state().suspend_everything();
        }
        let _ = self.events_tx.send(MockEventItem::Set(set));
    }

    /// Make the connection drop; pending and future event reads fail with
    /// [`TargetError::Disconnected`].
    pub fn disconnect(&self) {
        let _ = self.events_tx.send(MockEventItem::Disconnect);
    }

    /// Report a breakpoint hit at `location` if an enabled request covers it.
    pub fn hit_breakpoint(&self, thread: ThreadId, location: Location) -> bool {
        let events: Vec<TargetEvent> = self
            .state()
            .enabled_requests()
            .filter(|r| r.kind == MockRequestKind::Breakpoint(location))
            .map(|r| TargetEvent::Breakpoint {
                request: Some(r.id),
                thread,
                location,
            })
            .collect();
        self.push_if_any(events)
    }

    /// Report completion of the pending step request on `thread`.
    pub fn complete_step(&self, thread: ThreadId, location: Location) -> bool {
        let events: Vec<TargetEvent> = self
            .state()
            .enabled_requests()
            .filter(|r| matches!(r.kind, MockRequestKind::Step { thread: t, .. } if t == thread))
            .map(|r| TargetEvent::Step {
                request: Some(r.id),
                thread,
                location,
            })
            .collect();
        self.push_if_any(events)
    }

    /// Report `exception` thrown at `location` to every matching exception request.
    pub fn throw_exception(
        &self,
        thread: ThreadId,
        location: Location,
        exception: ObjectRef,
        catch_location: Option<Location>,
    ) -> bool {
        let events: Vec<TargetEvent> = {
            let state = self.state();
            let hierarchy = state.hierarchy(exception.type_id);
            let caught = catch_location.is_some();
            state
                .enabled_requests()
                .filter(|r| match &r.kind {
                    MockRequestKind::Exception {
                        exception: filter,
                        caught: c,
                        uncaught: u,
                    } => {
                        (if caught { *c } else { *u })
                            && filter.map(|f| hierarchy.contains(&f)).unwrap_or(true)
                    }
                    _ => false,
                })
                .map(|r| TargetEvent::Exception {
                    request: Some(r.id),
                    thread,
                    location,
                    exception: exception.clone(),
                    catch_location,
                })
                .collect()
        };
        self.push_if_any(events)
    }

    /// Mark `class` loaded and report it to every matching class-prepare watch.
    pub fn load_class(&self, thread: ThreadId, class: ReferenceTypeId) -> bool {
        let events: Vec<TargetEvent> = {
            let mut state = self.state();
            let Some(c) = state.classes.get_mut(&class) else {
                return false;
            };
            c.loaded = true;
            let info = c.info.clone();
            state
                .enabled_requests()
                .filter(|r| r.kind == MockRequestKind::ClassPrepare(info.name.clone()))
                .map(|r| TargetEvent::ClassPrepare {
                    request: Some(r.id),
                    thread,
                    class: info.clone(),
                })
                .collect()
        };
        self.push_if_any(events)
    }

    pub fn start_thread(&self, name: &str) -> ThreadId {
        let thread = self.add_thread(name);
        let watching = self
            .state()
            .enabled_requests()
            .any(|r| r.kind == MockRequestKind::ThreadStart);
        if watching {
            let _ = self.events_tx.send(MockEventItem::Set(EventSet {
                suspend_policy: SuspendPolicy::None,
                events: vec![TargetEvent::ThreadStart { thread }],
            }));
        }
        thread
    }

    pub fn vm_death(&self) {
        let _ = self.events_tx.send(MockEventItem::Set(EventSet {
            suspend_policy: SuspendPolicy::None,
            events: vec![TargetEvent::VmDeath],
        }));
    }

    fn push_if_any(&self, events: Vec<TargetEvent>) -> bool {
        if events.is_empty() {
            return false;
        }
        self.push_event_set(EventSet {
            suspend_policy: SuspendPolicy::All,
            events,
        });
        true
    }
}

#[async_trait]
impl TargetConnection for MockTarget {
    async fn version(&self) -> Result<VmVersion> {
        Ok(VmVersion {
            description: "mock VM".to_string(),
            vm_name: "MockVM".to_string(),
            vm_version: "17".to_string(),
        })
    }

    async fn all_threads(&self) -> Result<Vec<ThreadInfo>> {
        Ok(self.state().threads.values().map(|t| t.info.clone()).collect())
    }

    async fn thread(&self, thread: ThreadId) -> Result<ThreadInfo> {
        self.state()
            .threads
            .get(&thread)
            .map(|t| t.info.clone())
            .ok_or(TargetError::InvalidThread(thread))
    }

    async fn suspend_thread(&self, thread: ThreadId) -> Result<()> {
        let mut state = self.state();
        let t = state
            .threads
            .get_mut(&thread)
            .ok_or(TargetError::InvalidThread(thread))?;
        t.info.suspended = true;
        Ok(())
    }

    async fn resume_thread(&self, thread: ThreadId) -> Result<()> {
        let mut state = self.state();
        let t = state
            .threads
            .get_mut(&thread)
            .ok_or(TargetError::InvalidThread(thread))?;
        t.info.suspended = false;
        Ok(())
    }

    async fn suspend_all(&self) -> Result<()> {
        self.state().suspend_everything();
        Ok(())
    }

    async fn resume_all(&self) -> Result<()> {
        let mut state = self.state();
        state.resume_all_calls += 1;
        state.resume_everything();
        Ok(())
    }

    async fn frames(&self, thread: ThreadId) -> Result<Vec<FrameInfo>> {
        let state = self.state();
        let t = state.require_suspended(thread)?;
        Ok(t.frames
            .iter()
            .map(|(id, f)| FrameInfo {
                id: *id,
                location: f.location,
            })
            .collect())
    }

    async fn location_info(&self, location: &Location) -> Result<LocationInfo> {
        let state = self.state();
        if let Some(info) = state.location_infos.get(location) {
            return Ok(info.clone());
        }
        let class_name = state
            .classes
            .get(&location.class_id)
            .map(|c| c.info.name.clone())
            .unwrap_or_default();
        Ok(LocationInfo {
            class_name,
            ..LocationInfo::default()
        })
    }

    async fn visible_variables(
        &self,
        thread: ThreadId,
        frame: &FrameInfo,
    ) -> Result<Vec<LocalVariable>> {
        let state = self.state();
        let f = state.frame(thread, frame)?;
        Ok(f.locals.iter().map(|(v, _)| v.clone()).collect())
    }

    async fn local_values(
        &self,
        thread: ThreadId,
        frame: &FrameInfo,
        variables: &[LocalVariable],
    ) -> Result<Vec<Value>> {
        let state = self.state();
        let f = state.frame(thread, frame)?;
        variables
            .iter()
            .map(|var| {
                f.locals
                    .iter()
                    .find(|(v, _)| v.slot == var.slot)
                    .map(|(_, value)| value.clone())
                    .ok_or_else(|| TargetError::Protocol(format!("no local in slot {}", var.slot)))
            })
            .collect()
    }

    async fn set_local_value(
        &self,
        thread: ThreadId,
        frame: &FrameInfo,
        variable: &LocalVariable,
        value: &Value,
    ) -> Result<()> {
        let mut state = self.state();
        state.require_suspended(thread)?;
        let t = state
            .threads
            .get_mut(&thread)
            .ok_or(TargetError::InvalidThread(thread))?;
        let (_, f) = t
            .frames
            .iter_mut()
            .find(|(id, _)| *id == frame.id)
            .ok_or(TargetError::InvalidFrame)?;
        let slot = f
            .locals
            .iter_mut()
            .find(|(v, _)| v.slot == variable.slot)
            .ok_or_else(|| TargetError::Protocol(format!("no local in slot {}", variable.slot)))?;
        slot.1 = value.clone();
        Ok(())
    }

    async fn this_object(&self, thread: ThreadId, frame: &FrameInfo) -> Result<Option<ObjectRef>> {
        let state = self.state();
        Ok(state.frame(thread, frame)?.this.clone())
    }

    async fn classes_by_name(&self, name: &str) -> Result<Vec<TypeInfo>> {
        Ok(self
            .state()
            .classes
            .values()
            .filter(|c| c.loaded && c.info.name == name)
            .map(|c| c.info.clone())
            .collect())
    }

    async fn superclass(&self, class: ReferenceTypeId) -> Result<Option<TypeInfo>> {
        let state = self.state();
        let superclass = state.classes.get(&class).and_then(|c| c.superclass);
        superclass.map(|id| state.type_info(id)).transpose()
    }

    async fn interfaces(&self, class: ReferenceTypeId) -> Result<Vec<TypeInfo>> {
        let state = self.state();
        let ids = state
            .classes
            .get(&class)
            .map(|c| c.interfaces.clone())
            .unwrap_or_default();
        ids.into_iter().map(|id| state.type_info(id)).collect()
    }

    async fn methods(&self, class: ReferenceTypeId) -> Result<Vec<MethodInfo>> {
        Ok(self.state().visible_methods(class))
    }

    async fn fields(&self, class: ReferenceTypeId) -> Result<Vec<FieldInfo>> {
        Ok(self.state().visible_fields(class))
    }

    async fn line_locations(&self, class: ReferenceTypeId, line: u32) -> Result<Vec<Location>> {
        Ok(self
            .state()
            .classes
            .get(&class)
            .map(|c| {
                c.lines
                    .iter()
                    .filter(|(l, _)| *l == line)
                    .map(|(_, loc)| *loc)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn method_entry(&self, method: &MethodInfo) -> Result<Option<Location>> {
        Ok(self.state().entries.get(&method.id).copied())
    }

    async fn get_field(&self, object: &ObjectRef, field: &FieldInfo) -> Result<Value> {
        let state = self.state();
        state.object(object)?;
        Ok(state.read_field(object.id, field))
    }

    async fn set_field(&self, object: &ObjectRef, field: &FieldInfo, value: &Value) -> Result<()> {
        let mut state = self.state();
        let data = state
            .objects
            .get_mut(&object.id)
            .ok_or(TargetError::InvalidObject(object.id))?;
        data.fields.insert(field.id, value.clone());
        Ok(())
    }

    async fn get_static_field(&self, class: ReferenceTypeId, field: &FieldInfo) -> Result<Value> {
        let state = self.state();
        Ok(state
            .classes
            .get(&field.declaring_type)
            .or_else(|| state.classes.get(&class))
            .and_then(|c| c.statics.get(&field.id).cloned())
            .unwrap_or_else(|| default_value(&field.type_name())))
    }

    async fn array_length(&self, array: &ObjectRef) -> Result<i32> {
        Ok(self.state().array(array)?.len() as i32)
    }

    async fn array_get(&self, array: &ObjectRef, index: i32) -> Result<Value> {
        let state = self.state();
        let values = state.array(array)?;
        usize::try_from(index)
            .ok()
            .and_then(|i| values.get(i).cloned())
            .ok_or(TargetError::IndexOutOfBounds {
                index,
                length: values.len() as i32,
            })
    }

    async fn array_set(&self, array: &ObjectRef, index: i32, value: &Value) -> Result<()> {
        let mut state = self.state();
        let values = state
            .objects
            .get_mut(&array.id)
            .and_then(|data| data.array.as_mut())
            .ok_or(TargetError::InvalidObject(array.id))?;
        let length = values.len() as i32;
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| values.get_mut(i))
            .ok_or(TargetError::IndexOutOfBounds { index, length })?;
        *slot = value.clone();
        Ok(())
    }

    async fn string_value(&self, string: &ObjectRef) -> Result<String> {
        self.state()
            .object(string)?
            .string
            .clone()
            .ok_or(TargetError::InvalidObject(string.id))
    }

    async fn create_string(&self, value: &str) -> Result<ObjectRef> {
        Ok(self.state().new_string(value))
    }

    async fn invoke_static(
        &self,
        thread: ThreadId,
        _class: ReferenceTypeId,
        method: &MethodInfo,
        args: &[Value],
    ) -> Result<InvokeOutcome> {
        let mut state = self.state();
        let body = state.bodies.get(&method.id).cloned();
        state.run(
            body,
            MockInvocation {
                thread,
                method: method.clone(),
                receiver: None,
                args: args.to_vec(),
            },
        )
    }

    async fn invoke_instance(
        &self,
        thread: ThreadId,
        object: &ObjectRef,
        method: &MethodInfo,
        args: &[Value],
    ) -> Result<InvokeOutcome> {
        let mut state = self.state();
        state.object(object)?;
        let body = state.dispatch(object.type_id, method);
        state.run(
            body,
            MockInvocation {
                thread,
                method: method.clone(),
                receiver: Some(object.clone()),
                args: args.to_vec(),
            },
        )
    }

    async fn new_instance(
        &self,
        thread: ThreadId,
        class: ReferenceTypeId,
        constructor: &MethodInfo,
        args: &[Value],
    ) -> Result<InvokeOutcome> {
        let mut state = self.state();
        state.require_suspended(thread)?;
        let object = state.new_object(class);
        let body = state.bodies.get(&constructor.id).cloned();
        let outcome = state.run(
            body,
            MockInvocation {
                thread,
                method: constructor.clone(),
                receiver: Some(object.clone()),
                args: args.to_vec(),
            },
        )?;
        Ok(match outcome {
            InvokeOutcome::Returned(_) => InvokeOutcome::Returned(Value::Object(object)),
            threw => threw,
        })
    }

    async fn new_array(&self, array_type: ReferenceTypeId, length: i32) -> Result<ObjectRef> {
        let mut state = self.state();
        let info = state.type_info(array_type)?;
        let component = array_component_type_name(&info.name)
            .ok_or_else(|| TargetError::Protocol(format!("{} is not an array type", info.name)))?
            .to_string();
        let len = usize::try_from(length).map_err(|_| TargetError::IndexOutOfBounds {
            index: length,
            length: 0,
        })?;
        let id = state.alloc_id();
        state.objects.insert(
            id,
            MockObjectData {
                array: Some(vec![default_value(&component); len]),
                ..MockObjectData::default()
            },
        );
        Ok(ObjectRef {
            id,
            type_id: array_type,
            runtime_type: info.name,
        })
    }

    async fn create_breakpoint(&self, location: &Location) -> Result<RequestId> {
        Ok(self
            .state()
            .add_request(MockRequestKind::Breakpoint(*location)))
    }

    async fn create_step(
        &self,
        thread: ThreadId,
        size: StepSize,
        depth: StepDepth,
    ) -> Result<RequestId> {
        let mut state = self.state();
        if !state.threads.contains_key(&thread) {
            return Err(TargetError::InvalidThread(thread));
        }
        Ok(state.add_request(MockRequestKind::Step {
            thread,
            size,
            depth,
        }))
    }

    async fn create_exception_request(
        &self,
        exception: Option<ReferenceTypeId>,
        caught: bool,
        uncaught: bool,
    ) -> Result<RequestId> {
        Ok(self.state().add_request(MockRequestKind::Exception {
            exception,
            caught,
            uncaught,
        }))
    }

    async fn create_class_prepare_watch(&self, class_name: &str) -> Result<RequestId> {
        Ok(self
            .state()
            .add_request(MockRequestKind::ClassPrepare(class_name.to_string())))
    }

    async fn watch_thread_lifecycle(&self) -> Result<Vec<RequestId>> {
        let mut state = self.state();
        Ok(vec![
            state.add_request(MockRequestKind::ThreadStart),
            state.add_request(MockRequestKind::ThreadDeath),
        ])
    }

    async fn set_request_enabled(&self, request: RequestId, enabled: bool) -> Result<()> {
        let mut state = self.state();
        let r = state
            .requests
            .get_mut(&request)
            .ok_or(TargetError::UnknownRequest(request))?;
        r.enabled = enabled;
        Ok(())
    }

    async fn delete_request(&self, request: RequestId) -> Result<()> {
        self.state()
            .requests
            .remove(&request)
            .map(|_| ())
            .ok_or(TargetError::UnknownRequest(request))
    }

    async fn next_event_set(&self, timeout: Duration) -> Result<Option<EventSet>> {
        if *self.disconnected.lock() {
            return Err(TargetError::Disconnected);
        }
        let mut rx = self.events_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_elapsed) => Ok(None),
            Ok(Some(MockEventItem::Set(set))) => Ok(Some(set)),
            Ok(Some(MockEventItem::Disconnect)) | Ok(None) => {
                *self.disconnected.lock() = true;
                Err(TargetError::Disconnected)
            }
        }
    }

    async fn resume_event_set(&self, set: &EventSet) -> Result<()> {
        let mut state = self.state();
        state.resumed_event_sets += 1;
        match set.suspend_policy {
            SuspendPolicy::None => {}
            SuspendPolicy::EventThread => {
                if let Some(thread) = set.events.first().and_then(TargetEvent::thread) {
                    if let Some(t) = state.threads.get_mut(&thread) {
                        t.info.suspended = false;
                    }
                }
            }
            SuspendPolicy::All => state.resume_everything(),
        }
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.state().disposed = true;
        Ok(())
    }
}

