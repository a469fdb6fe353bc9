use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::Duration,
};

use async_recursion::async_recursion;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    process::Child,
    sync::broadcast::{self, error::RecvError, error::TryRecvError},
};

use super::{
    client::{EventModifier, JdwpClient, INVOKE_SINGLE_THREADED},
    types::{with_thread, InvokeReply, JdwpError, JdwpEvent, JdwpEventSet, JdwpValue, MethodEntry},
};
use crate::{
    signature::{signature_to_type_name, type_name_to_signature},
    EventSet, FieldInfo, FrameInfo, InvokeOutcome, LocalVariable, Location, LocationInfo,
    MethodInfo, ObjectId, ObjectRef, ReferenceTypeId, RequestId, Result, StepDepth, StepSize,
    SuspendPolicy, TargetConnection, TargetError, TargetEvent, ThreadId, ThreadInfo,
    ThreadStatus, TypeInfo, TypeKind, Value, VmVersion,
};

const EVENT_SINGLE_STEP: u8 = 1;
const EVENT_BREAKPOINT: u8 = 2;
const EVENT_EXCEPTION: u8 = 4;
const EVENT_THREAD_START: u8 = 6;
const EVENT_THREAD_DEATH: u8 = 7;
const EVENT_CLASS_PREPARE: u8 = 8;

const ERROR_ABSENT_INFORMATION: u16 = 101;

#[derive(Debug, Clone)]
struct RequestEntry {
    event_kind: u8,
    suspend_policy: SuspendPolicy,
    modifiers: Vec<EventModifier>,
    /// JDWP id while the request is installed in the VM; `None` while disabled.
    jdwp_id: Option<i32>,
}

#[derive(Debug, Default)]
struct RequestTable {
    entries: HashMap<RequestId, RequestEntry>,
    by_jdwp_id: HashMap<i32, RequestId>,
}

/// [`TargetConnection`] backed by a live JDWP socket.
///
/// Request ids handed out here are logical: disabling a request clears it in
/// the VM and enabling re-installs it with the same modifiers, so the JDWP id
/// changes while the [`RequestId`] stays stable.
pub struct JdwpTarget {
    client: JdwpClient,
    events: tokio::sync::Mutex<broadcast::Receiver<JdwpEventSet>>,
    types: Mutex<HashMap<ReferenceTypeId, TypeInfo>>,
    declared_methods: Mutex<HashMap<ReferenceTypeId, Vec<MethodEntry>>>,
    requests: Mutex<RequestTable>,
    next_request: AtomicU32,
    disposed: AtomicBool,
    child: Mutex<Option<Child>>,
}

impl JdwpTarget {
    pub fn new(client: JdwpClient) -> Self {
        let events = client.subscribe_events();
        Self {
            client,
            events: tokio::sync::Mutex::new(events),
            types: Mutex::new(HashMap::new()),
            declared_methods: Mutex::new(HashMap::new()),
            requests: Mutex::new(RequestTable::default()),
            next_request: AtomicU32::new(1),
            disposed: AtomicBool::new(false),
            child: Mutex::new(None),
        }
    }

    /// Keep a launched debuggee process alive for as long as this target.
    pub(crate) fn with_child(self, child: Child) -> Self {
        *self.child.lock() = Some(child);
        self
    }

    pub fn client(&self) -> &JdwpClient {
        &self.client
    }

    fn cache_type(&self, info: TypeInfo) -> TypeInfo {
        self.types.lock().insert(info.id, info.clone());
        info
    }

    async fn type_info(&self, id: ReferenceTypeId, kind: Option<TypeKind>) -> Result<TypeInfo> {
        if let Some(info) = self.types.lock().get(&id) {
            return Ok(info.clone());
        }
        let signature = self.client.reference_type_signature(id).await?;
        let kind = kind.unwrap_or(if signature.starts_with('[') {
            TypeKind::Array
        } else {
            TypeKind::Class
        });
        Ok(self.cache_type(TypeInfo {
            id,
            name: signature_to_type_name(&signature),
            kind,
        }))
    }

    async fn declared_methods(&self, class: ReferenceTypeId) -> Result<Vec<MethodEntry>> {
        if let Some(methods) = self.declared_methods.lock().get(&class) {
            return Ok(methods.clone());
        }
        let methods = self.client.reference_type_methods(class).await?;
        self.declared_methods.lock().insert(class, methods.clone());
        Ok(methods)
    }

    async fn resolve_object(&self, id: ObjectId) -> Result<Option<ObjectRef>> {
        if id == 0 {
            return Ok(None);
        }
        let (tag, type_id) = self
            .client
            .object_reference_reference_type(id)
            .await
            .map_err(|err| match TargetError::from(err) {
                TargetError::InvalidObject(_) => TargetError::InvalidObject(id),
                other => other,
            })?;
        let info = self.type_info(type_id, Some(TypeKind::from_jdwp_tag(tag))).await?;
        Ok(Some(ObjectRef {
            id,
            type_id,
            runtime_type: info.name,
        }))
    }

    async fn to_value(&self, value: JdwpValue) -> Result<Value> {
        Ok(match value {
            JdwpValue::Boolean(v) => Value::Boolean(v),
            JdwpValue::Byte(v) => Value::Byte(v),
            JdwpValue::Char(v) => Value::Char(v),
            JdwpValue::Short(v) => Value::Short(v),
            JdwpValue::Int(v) => Value::Int(v),
            JdwpValue::Long(v) => Value::Long(v),
            JdwpValue::Float(v) => Value::Float(v),
            JdwpValue::Double(v) => Value::Double(v),
            JdwpValue::Void => Value::Void,
            JdwpValue::Object { id, .. } => match self.resolve_object(id).await? {
                Some(object) => Value::Object(object),
                None => Value::Null,
            },
        })
    }

    async fn to_values(&self, values: Vec<JdwpValue>) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(values.len());
        for value in values {
            out.push(self.to_value(value).await?);
        }
        Ok(out)
    }

    async fn first_value(&self, values: Vec<JdwpValue>) -> Result<Value> {
        match values.into_iter().next() {
            Some(value) => self.to_value(value).await,
            None => Err(TargetError::Protocol("empty value reply".to_string())),
        }
    }

    async fn invoke_outcome(&self, reply: InvokeReply) -> Result<InvokeOutcome> {
        let (_tag, exception) = reply.exception;
        if let Some(thrown) = self.resolve_object(exception).await? {
            return Ok(InvokeOutcome::Threw(thrown));
        }
        Ok(InvokeOutcome::Returned(self.to_value(reply.value).await?))
    }

    async fn install(
        &self,
        event_kind: u8,
        suspend_policy: SuspendPolicy,
        modifiers: Vec<EventModifier>,
    ) -> Result<RequestId> {
        let jdwp_id = self
            .client
            .event_request_set(event_kind, suspend_policy.jdwp_value(), &modifiers)
            .await?;
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let mut requests = self.requests.lock();
        requests.by_jdwp_id.insert(jdwp_id, id);
        requests.entries.insert(
            id,
            RequestEntry {
                event_kind,
                suspend_policy,
                modifiers,
                jdwp_id: Some(jdwp_id),
            },
        );
        tracing::trace!(target: "jdbg.jdwp", request = id, jdwp_id, event_kind, "installed event request");
        Ok(id)
    }

    fn request_for(&self, jdwp_id: i32) -> Option<RequestId> {
        self.requests.lock().by_jdwp_id.get(&jdwp_id).copied()
    }

    async fn convert_event(&self, event: JdwpEvent) -> Result<TargetEvent> {
        Ok(match event {
            JdwpEvent::VmStart { thread, .. } => TargetEvent::VmStart { thread },
            JdwpEvent::SingleStep {
                request_id,
                thread,
                location,
            } => TargetEvent::Step {
                request: self.request_for(request_id),
                thread,
                location,
            },
            JdwpEvent::Breakpoint {
                request_id,
                thread,
                location,
            } => TargetEvent::Breakpoint {
                request: self.request_for(request_id),
                thread,
                location,
            },
            JdwpEvent::Exception {
                request_id,
                thread,
                location,
                exception: (_tag, exception),
                catch_location,
            } => {
                let exception = self.resolve_object(exception).await?.ok_or_else(|| {
                    TargetError::Protocol("exception event without exception object".to_string())
                })?;
                TargetEvent::Exception {
                    request: self.request_for(request_id),
                    thread,
                    location,
                    exception,
                    catch_location,
                }
            }
            JdwpEvent::ThreadStart { thread, .. } => TargetEvent::ThreadStart { thread },
            JdwpEvent::ThreadDeath { thread, .. } => TargetEvent::ThreadDeath { thread },
            JdwpEvent::ClassPrepare {
                request_id,
                thread,
                ref_type_tag,
                type_id,
                signature,
                ..
            } => TargetEvent::ClassPrepare {
                request: self.request_for(request_id),
                thread,
                class: self.cache_type(TypeInfo {
                    id: type_id,
                    name: signature_to_type_name(&signature),
                    kind: TypeKind::from_jdwp_tag(ref_type_tag),
                }),
            },
            JdwpEvent::VmDeath => TargetEvent::VmDeath,
        })
    }

    async fn line_table_for(
        &self,
        class: ReferenceTypeId,
        method: u64,
    ) -> Result<Option<super::types::LineTable>> {
        match self.client.method_line_table(class, method).await {
            Ok(table) => Ok(Some(table)),
            // Native, abstract and no-debug-info methods have no line table.
            Err(JdwpError::VmError(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    #[async_recursion]
    async fn collect_methods(
        &self,
        class: ReferenceTypeId,
        include_constructors: bool,
        out: &mut Vec<MethodInfo>,
    ) -> Result<()> {
        for entry in self.declared_methods(class).await? {
            if entry.name == "<clinit>" || (!include_constructors && entry.name == "<init>") {
                continue;
            }
            // A subclass override hides the inherited method.
            if out
                .iter()
                .any(|m| m.name == entry.name && m.signature == entry.signature)
            {
                continue;
            }
            out.push(MethodInfo {
                id: entry.method_id,
                declaring_type: class,
                name: entry.name,
                signature: entry.signature,
                modifiers: entry.mod_bits,
            });
        }
        if let Some(superclass) = self.client.class_type_superclass(class).await.ok().flatten() {
            self.collect_methods(superclass, false, out).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TargetConnection for JdwpTarget {
    async fn version(&self) -> Result<VmVersion> {
        let reply = self.client.version().await?;
        Ok(VmVersion {
            description: reply.description,
            vm_name: reply.vm_name,
            vm_version: reply.vm_version,
        })
    }

    async fn all_threads(&self) -> Result<Vec<ThreadInfo>> {
        let ids = self.client.all_threads().await?;
        let mut threads = Vec::with_capacity(ids.len());
        for id in ids {
            match self.thread(id).await {
                Ok(info) => threads.push(info),
                // The thread may have died between the two commands.
                Err(TargetError::InvalidThread(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(threads)
    }

    async fn thread(&self, thread: ThreadId) -> Result<ThreadInfo> {
        let name = self
            .client
            .thread_name(thread)
            .await
            .map_err(|err| with_thread(err, thread))?;
        let (status, suspend_status) = self
            .client
            .thread_status(thread)
            .await
            .map_err(|err| with_thread(err, thread))?;
        Ok(ThreadInfo {
            id: thread,
            name,
            status: ThreadStatus::from_jdwp(status),
            suspended: suspend_status & 0x1 != 0,
        })
    }

    async fn suspend_thread(&self, thread: ThreadId) -> Result<()> {
        self.client
            .thread_suspend(thread)
            .await
            .map_err(|err| with_thread(err, thread))
    }

    async fn resume_thread(&self, thread: ThreadId) -> Result<()> {
        self.client
            .thread_resume(thread)
            .await
            .map_err(|err| with_thread(err, thread))
    }

    async fn suspend_all(&self) -> Result<()> {
        Ok(self.client.vm_suspend().await?)
    }

    async fn resume_all(&self) -> Result<()> {
        Ok(self.client.vm_resume().await?)
    }

    async fn frames(&self, thread: ThreadId) -> Result<Vec<FrameInfo>> {
        let frames = self
            .client
            .frames(thread, 0, -1)
            .await
            .map_err(|err| with_thread(err, thread))?;
        Ok(frames
            .into_iter()
            .map(|frame| FrameInfo {
                id: frame.frame_id,
                location: frame.location,
            })
            .collect())
    }

    async fn location_info(&self, location: &Location) -> Result<LocationInfo> {
        let class = self.type_info(location.class_id, None).await?;
        let method_name = self
            .declared_methods(location.class_id)
            .await?
            .into_iter()
            .find(|m| m.method_id == location.method_id)
            .map(|m| m.name)
            .unwrap_or_default();
        let line = self
            .line_table_for(location.class_id, location.method_id)
            .await?
            .and_then(|table| {
                table
                    .lines
                    .iter()
                    .filter(|entry| entry.code_index <= location.index)
                    .max_by_key(|entry| entry.code_index)
                    .and_then(|entry| u32::try_from(entry.line).ok())
            });
        let source_name = self
            .client
            .reference_type_source_file(location.class_id)
            .await
            .ok();
        Ok(LocationInfo {
            class_name: class.name,
            method_name,
            line,
            source_name,
        })
    }

    async fn visible_variables(
        &self,
        _thread: ThreadId,
        frame: &FrameInfo,
    ) -> Result<Vec<LocalVariable>> {
        let location = frame.location;
        let (arg_count, table) = match self
            .client
            .method_variable_table(location.class_id, location.method_id)
            .await
        {
            Ok(reply) => reply,
            // Compiled without -g: no local variable information.
            Err(JdwpError::VmError(ERROR_ABSENT_INFORMATION)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(table
            .into_iter()
            .filter(|var| var.name != "this")
            .filter(|var| {
                var.code_index <= location.index
                    && location.index < var.code_index + u64::from(var.length)
            })
            .map(|var| LocalVariable {
                is_argument: var.slot < arg_count,
                name: var.name,
                signature: var.signature,
                slot: var.slot,
            })
            .collect())
    }

    async fn local_values(
        &self,
        thread: ThreadId,
        frame: &FrameInfo,
        variables: &[LocalVariable],
    ) -> Result<Vec<Value>> {
        if variables.is_empty() {
            return Ok(Vec::new());
        }
        let slots: Vec<(u32, String)> = variables
            .iter()
            .map(|var| (var.slot, var.signature.clone()))
            .collect();
        let values = self
            .client
            .stack_frame_get_values(thread, frame.id, &slots)
            .await
            .map_err(|err| with_thread(err, thread))?;
        self.to_values(values).await
    }

    async fn set_local_value(
        &self,
        thread: ThreadId,
        frame: &FrameInfo,
        variable: &LocalVariable,
        value: &Value,
    ) -> Result<()> {
        self.client
            .stack_frame_set_values(thread, frame.id, &[(variable.slot, to_jdwp(value))])
            .await
            .map_err(|err| with_thread(err, thread))
    }

    async fn this_object(&self, thread: ThreadId, frame: &FrameInfo) -> Result<Option<ObjectRef>> {
        let (_tag, id) = self
            .client
            .stack_frame_this_object(thread, frame.id)
            .await
            .map_err(|err| with_thread(err, thread))?;
        self.resolve_object(id).await
    }

    async fn classes_by_name(&self, name: &str) -> Result<Vec<TypeInfo>> {
        let signature = type_name_to_signature(name);
        let entries = self.client.classes_by_signature(&signature).await?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                self.cache_type(TypeInfo {
                    id: entry.type_id,
                    name: name.to_string(),
                    kind: TypeKind::from_jdwp_tag(entry.ref_type_tag),
                })
            })
            .collect())
    }

    async fn superclass(&self, class: ReferenceTypeId) -> Result<Option<TypeInfo>> {
        match self.client.class_type_superclass(class).await? {
            Some(id) => Ok(Some(self.type_info(id, Some(TypeKind::Class)).await?)),
            None => Ok(None),
        }
    }

    async fn interfaces(&self, class: ReferenceTypeId) -> Result<Vec<TypeInfo>> {
        let ids = self.client.reference_type_interfaces(class).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.type_info(id, Some(TypeKind::Interface)).await?);
        }
        Ok(out)
    }

    async fn methods(&self, class: ReferenceTypeId) -> Result<Vec<MethodInfo>> {
        let mut out = Vec::new();
        self.collect_methods(class, true, &mut out).await?;
        Ok(out)
    }

    async fn fields(&self, class: ReferenceTypeId) -> Result<Vec<FieldInfo>> {
        let mut out = Vec::new();
        let mut current = Some(class);
        while let Some(id) = current {
            for entry in self.client.reference_type_fields(id).await? {
                out.push(FieldInfo {
                    id: entry.field_id,
                    declaring_type: id,
                    name: entry.name,
                    signature: entry.signature,
                    modifiers: entry.mod_bits,
                });
            }
            // Interfaces have no superclass and answer with an error.
            current = self.client.class_type_superclass(id).await.ok().flatten();
        }
        Ok(out)
    }

    async fn line_locations(&self, class: ReferenceTypeId, line: u32) -> Result<Vec<Location>> {
        let type_tag = self.type_info(class, None).await?.kind.jdwp_tag();
        let mut locations = Vec::new();
        for method in self.declared_methods(class).await? {
            let Some(table) = self.line_table_for(class, method.method_id).await? else {
                continue;
            };
            // Several line-table entries may map to the same line; the
            // first code index is the one a debugger should stop at.
            if let Some(entry) = table
                .lines
                .iter()
                .filter(|entry| i64::from(entry.line) == i64::from(line))
                .min_by_key(|entry| entry.code_index)
            {
                locations.push(Location {
                    type_tag,
                    class_id: class,
                    method_id: method.method_id,
                    index: entry.code_index,
                });
            }
        }
        Ok(locations)
    }

    async fn method_entry(&self, method: &MethodInfo) -> Result<Option<Location>> {
        let type_tag = self.type_info(method.declaring_type, None).await?.kind.jdwp_tag();
        Ok(self
            .line_table_for(method.declaring_type, method.id)
            .await?
            .map(|table| Location {
                type_tag,
                class_id: method.declaring_type,
                method_id: method.id,
                index: table.start,
            }))
    }

    async fn get_field(&self, object: &ObjectRef, field: &FieldInfo) -> Result<Value> {
        let values = self
            .client
            .object_reference_get_values(object.id, &[field.id])
            .await?;
        self.first_value(values).await
    }

    async fn set_field(&self, object: &ObjectRef, field: &FieldInfo, value: &Value) -> Result<()> {
        Ok(self
            .client
            .object_reference_set_values(object.id, &[(field.id, to_jdwp(value))])
            .await?)
    }

    async fn get_static_field(&self, class: ReferenceTypeId, field: &FieldInfo) -> Result<Value> {
        let values = self
            .client
            .reference_type_get_values(class, &[field.id])
            .await?;
        self.first_value(values).await
    }

    async fn array_length(&self, array: &ObjectRef) -> Result<i32> {
        Ok(self.client.array_reference_length(array.id).await?)
    }

    async fn array_get(&self, array: &ObjectRef, index: i32) -> Result<Value> {
        let length = self.array_length(array).await?;
        if index < 0 || index >= length {
            return Err(TargetError::IndexOutOfBounds { index, length });
        }
        let values = self
            .client
            .array_reference_get_values(array.id, index, 1)
            .await?;
        self.first_value(values).await
    }

    async fn array_set(&self, array: &ObjectRef, index: i32, value: &Value) -> Result<()> {
        let length = self.array_length(array).await?;
        if index < 0 || index >= length {
            return Err(TargetError::IndexOutOfBounds { index, length });
        }
        Ok(self
            .client
            .array_reference_set_values(array.id, index, &[to_jdwp(value)])
            .await?)
    }

    async fn string_value(&self, string: &ObjectRef) -> Result<String> {
        Ok(self.client.string_reference_value(string.id).await?)
    }

    async fn create_string(&self, value: &str) -> Result<ObjectRef> {
        let id = self.client.create_string(value).await?;
        self.resolve_object(id)
            .await?
            .ok_or_else(|| TargetError::Protocol("CreateString returned null".to_string()))
    }

    async fn invoke_static(
        &self,
        thread: ThreadId,
        class: ReferenceTypeId,
        method: &MethodInfo,
        args: &[Value],
    ) -> Result<InvokeOutcome> {
        let args: Vec<JdwpValue> = args.iter().map(to_jdwp).collect();
        let reply = self
            .client
            .class_type_invoke_method(class, thread, method.id, &args, INVOKE_SINGLE_THREADED)
            .await
            .map_err(|err| with_thread(err, thread))?;
        self.invoke_outcome(reply).await
    }

    async fn invoke_instance(
        &self,
        thread: ThreadId,
        object: &ObjectRef,
        method: &MethodInfo,
        args: &[Value],
    ) -> Result<InvokeOutcome> {
        let args: Vec<JdwpValue> = args.iter().map(to_jdwp).collect();
        let reply = self
            .client
            .object_reference_invoke_method(
                object.id,
                thread,
                method.declaring_type,
                method.id,
                &args,
                INVOKE_SINGLE_THREADED,
            )
            .await
            .map_err(|err| with_thread(err, thread))?;
        self.invoke_outcome(reply).await
    }

    async fn new_instance(
        &self,
        thread: ThreadId,
        class: ReferenceTypeId,
        constructor: &MethodInfo,
        args: &[Value],
    ) -> Result<InvokeOutcome> {
        let args: Vec<JdwpValue> = args.iter().map(to_jdwp).collect();
        let reply = self
            .client
            .class_type_new_instance(class, thread, constructor.id, &args, INVOKE_SINGLE_THREADED)
            .await
            .map_err(|err| with_thread(err, thread))?;
        self.invoke_outcome(reply).await
    }

    async fn new_array(&self, array_type: ReferenceTypeId, length: i32) -> Result<ObjectRef> {
        let id = self.client.array_type_new_instance(array_type, length).await?;
        self.resolve_object(id)
            .await?
            .ok_or_else(|| TargetError::Protocol("ArrayType.NewInstance returned null".to_string()))
    }

    async fn create_breakpoint(&self, location: &Location) -> Result<RequestId> {
        self.install(
            EVENT_BREAKPOINT,
            SuspendPolicy::All,
            vec![EventModifier::LocationOnly {
                location: *location,
            }],
        )
        .await
    }

    async fn create_step(
        &self,
        thread: ThreadId,
        size: StepSize,
        depth: StepDepth,
    ) -> Result<RequestId> {
        self.install(
            EVENT_SINGLE_STEP,
            SuspendPolicy::All,
            vec![
                EventModifier::Step {
                    thread,
                    size: size.jdwp_value(),
                    depth: depth.jdwp_value(),
                },
                EventModifier::Count { count: 1 },
            ],
        )
        .await
    }

    async fn create_exception_request(
        &self,
        exception: Option<ReferenceTypeId>,
        caught: bool,
        uncaught: bool,
    ) -> Result<RequestId> {
        self.install(
            EVENT_EXCEPTION,
            SuspendPolicy::All,
            vec![EventModifier::ExceptionOnly {
                exception_or_null: exception.unwrap_or(0),
                caught,
                uncaught,
            }],
        )
        .await
    }

    async fn create_class_prepare_watch(&self, class_name: &str) -> Result<RequestId> {
        self.install(
            EVENT_CLASS_PREPARE,
            SuspendPolicy::All,
            vec![EventModifier::ClassMatch {
                pattern: class_name.to_string(),
            }],
        )
        .await
    }

    async fn watch_thread_lifecycle(&self) -> Result<Vec<RequestId>> {
        let start = self
            .install(EVENT_THREAD_START, SuspendPolicy::None, Vec::new())
            .await?;
        let death = self
            .install(EVENT_THREAD_DEATH, SuspendPolicy::None, Vec::new())
            .await?;
        Ok(vec![start, death])
    }

    async fn set_request_enabled(&self, request: RequestId, enabled: bool) -> Result<()> {
        let entry = self
            .requests
            .lock()
            .entries
            .get(&request)
            .cloned()
            .ok_or(TargetError::UnknownRequest(request))?;

        match (enabled, entry.jdwp_id) {
            (true, None) => {
                let jdwp_id = self
                    .client
                    .event_request_set(
                        entry.event_kind,
                        entry.suspend_policy.jdwp_value(),
                        &entry.modifiers,
                    )
                    .await?;
                let mut requests = self.requests.lock();
                requests.by_jdwp_id.insert(jdwp_id, request);
                if let Some(entry) = requests.entries.get_mut(&request) {
                    entry.jdwp_id = Some(jdwp_id);
                }
            }
            (false, Some(jdwp_id)) => {
                self.client
                    .event_request_clear(entry.event_kind, jdwp_id)
                    .await?;
                let mut requests = self.requests.lock();
                requests.by_jdwp_id.remove(&jdwp_id);
                if let Some(entry) = requests.entries.get_mut(&request) {
                    entry.jdwp_id = None;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn delete_request(&self, request: RequestId) -> Result<()> {
        let entry = {
            let mut requests = self.requests.lock();
            let entry = requests
                .entries
                .remove(&request)
                .ok_or(TargetError::UnknownRequest(request))?;
            if let Some(jdwp_id) = entry.jdwp_id {
                requests.by_jdwp_id.remove(&jdwp_id);
            }
            entry
        };
        if let Some(jdwp_id) = entry.jdwp_id {
            self.client
                .event_request_clear(entry.event_kind, jdwp_id)
                .await?;
        }
        Ok(())
    }

    async fn next_event_set(&self, timeout: Duration) -> Result<Option<EventSet>> {
        let shutdown = self.client.shutdown_token();
        let mut events = self.events.lock().await;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            let received = tokio::select! {
                biased;
                res = events.recv() => res,
                _ = shutdown.cancelled() => match events.try_recv() {
                    Ok(set) => Ok(set),
                    Err(TryRecvError::Lagged(skipped)) => Err(RecvError::Lagged(skipped)),
                    Err(_) => return Err(TargetError::Disconnected),
                },
                _ = &mut deadline => return Ok(None),
            };

            match received {
                Ok(set) => {
                    let mut converted = Vec::with_capacity(set.events.len());
                    for event in set.events {
                        converted.push(self.convert_event(event).await?);
                    }
                    return Ok(Some(EventSet {
                        suspend_policy: SuspendPolicy::from_jdwp(set.suspend_policy),
                        events: converted,
                    }));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "jdbg.jdwp", skipped, "event reader lagged; JDWP event sets were dropped");
                }
                Err(RecvError::Closed) => return Err(TargetError::Disconnected),
            }
        }
    }

    async fn resume_event_set(&self, set: &EventSet) -> Result<()> {
        match set.suspend_policy {
            SuspendPolicy::None => Ok(()),
            SuspendPolicy::EventThread => {
                match set.events.iter().find_map(TargetEvent::thread) {
                    Some(thread) => self.resume_thread(thread).await,
                    None => Ok(()),
                }
            }
            SuspendPolicy::All => self.resume_all().await,
        }
    }

    async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = match self.client.dispose().await {
            Ok(()) => Ok(()),
            // Nothing left to detach from.
            Err(JdwpError::ConnectionClosed | JdwpError::Cancelled) => Ok(()),
            Err(err) => Err(err.into()),
        };
        self.client.shutdown();
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.start_kill();
        }
        result
    }
}

fn to_jdwp(value: &Value) -> JdwpValue {
    match value {
        Value::Null => JdwpValue::Object { tag: b'L', id: 0 },
        Value::Void => JdwpValue::Void,
        Value::Boolean(v) => JdwpValue::Boolean(*v),
        Value::Byte(v) => JdwpValue::Byte(*v),
        Value::Char(v) => JdwpValue::Char(*v),
        Value::Short(v) => JdwpValue::Short(*v),
        Value::Int(v) => JdwpValue::Int(*v),
        Value::Long(v) => JdwpValue::Long(*v),
        Value::Float(v) => JdwpValue::Float(*v),
        Value::Double(v) => JdwpValue::Double(*v),
        Value::Object(object) => JdwpValue::Object {
            tag: object_tag(object),
            id: object.id,
        },
    }
}

fn object_tag(object: &ObjectRef) -> u8 {
    if object.is_string() {
        b's'
    } else if object.is_array() {
        b'['
    } else {
        b'L'
    }
}

impl std::fmt::Debug for JdwpTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JdwpTarget")
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .field("requests", &self.requests.lock().entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn objects_are_tagged_by_runtime_type() {
        let string = ObjectRef {
            id: 1,
            type_id: 2,
            runtime_type: "java.lang.String".to_string(),
        };
        let array = ObjectRef {
            id: 3,
            type_id: 4,
            runtime_type: "int[]".to_string(),
        };
        assert_eq!(to_jdwp(&Value::Object(string)), JdwpValue::Object { tag: b's', id: 1 });
        assert_eq!(to_jdwp(&Value::Object(array)), JdwpValue::Object { tag: b'[', id: 3 });
        assert_eq!(to_jdwp(&Value::Null), JdwpValue::Object { tag: b'L', id: 0 });
        assert_eq!(to_jdwp(&Value::Char(65)), JdwpValue::Char(65));
    }
}
