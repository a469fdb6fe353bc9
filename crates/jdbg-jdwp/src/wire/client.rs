use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{broadcast, oneshot},
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{
        encode_command, is_primitive_tag, signature_to_tag, PacketReader, PacketWriter,
        FLAG_REPLY, HANDSHAKE, HEADER_LEN,
    },
    types::{
        FieldEntry, FieldId, FrameEntry, FrameId, InvokeReply, JdwpError, JdwpEvent,
        JdwpEventSet, JdwpIdSizes, JdwpValue, LineTable, LineTableEntry, MethodEntry,
        RefTypeEntry, Result, VariableEntry, VersionReply,
    },
};
use crate::{Location, MethodId, ObjectId, ReferenceTypeId, ThreadId};

/// `INVOKE_SINGLE_THREADED`: only the invoking thread runs during the call.
pub const INVOKE_SINGLE_THREADED: u32 = 0x01;

/// Socket-level tuning for a [`JdwpClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bounds the TCP connect and each half of the handshake.
    pub connect_timeout: Duration,
    /// How long a command may wait for its reply.
    pub command_timeout: Duration,
    /// Event sets a slow subscriber may fall behind by before it lags.
    pub event_backlog: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
            event_backlog: 256,
        }
    }
}

/// A JDWP `(command set, command)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Command(u8, u8);

impl Command {
    const VERSION: Self = Self(1, 1);
    const CLASSES_BY_SIGNATURE: Self = Self(1, 2);
    const ALL_THREADS: Self = Self(1, 4);
    const DISPOSE: Self = Self(1, 6);
    const ID_SIZES: Self = Self(1, 7);
    const SUSPEND_VM: Self = Self(1, 8);
    const RESUME_VM: Self = Self(1, 9);
    const CREATE_STRING: Self = Self(1, 11);

    const TYPE_SIGNATURE: Self = Self(2, 1);
    const TYPE_FIELDS: Self = Self(2, 4);
    const TYPE_METHODS: Self = Self(2, 5);
    const TYPE_STATIC_VALUES: Self = Self(2, 6);
    const TYPE_SOURCE_FILE: Self = Self(2, 7);
    const TYPE_INTERFACES: Self = Self(2, 10);

    const CLASS_SUPERCLASS: Self = Self(3, 1);
    const CLASS_INVOKE: Self = Self(3, 3);
    const CLASS_NEW_INSTANCE: Self = Self(3, 4);
    const ARRAY_TYPE_NEW_INSTANCE: Self = Self(4, 1);

    const METHOD_LINE_TABLE: Self = Self(6, 1);
    const METHOD_VARIABLE_TABLE: Self = Self(6, 2);

    const OBJECT_TYPE: Self = Self(9, 1);
    const OBJECT_GET_VALUES: Self = Self(9, 2);
    const OBJECT_SET_VALUES: Self = Self(9, 3);
    const OBJECT_INVOKE: Self = Self(9, 6);
    const STRING_VALUE: Self = Self(10, 1);

    const THREAD_NAME: Self = Self(11, 1);
    const THREAD_SUSPEND: Self = Self(11, 2);
    const THREAD_RESUME: Self = Self(11, 3);
    const THREAD_STATUS: Self = Self(11, 4);
    const THREAD_FRAMES: Self = Self(11, 6);

    const ARRAY_LENGTH: Self = Self(13, 1);
    const ARRAY_GET_VALUES: Self = Self(13, 2);
    const ARRAY_SET_VALUES: Self = Self(13, 3);

    const REQUEST_SET: Self = Self(15, 1);
    const REQUEST_CLEAR: Self = Self(15, 2);

    const FRAME_GET_VALUES: Self = Self(16, 1);
    const FRAME_SET_VALUES: Self = Self(16, 2);
    const FRAME_THIS_OBJECT: Self = Self(16, 3);

    /// Sent by the VM, never by us.
    const COMPOSITE_EVENT: Self = Self(64, 100);
}

/// What the reader task hands back to a waiting command.
#[derive(Debug)]
struct RawReply {
    error_code: u16,
    body: Vec<u8>,
}

/// A successful reply together with the id sizes needed to decode it.
struct Reply {
    body: Vec<u8>,
    sizes: JdwpIdSizes,
}

impl Reply {
    fn reader(&self) -> PacketReader<'_> {
        PacketReader::new(&self.body)
    }
}

type Waiting = HashMap<u32, oneshot::Sender<Result<RawReply>>>;

struct Shared {
    outgoing: tokio::sync::Mutex<OwnedWriteHalf>,
    waiting: Mutex<Waiting>,
    next_packet: AtomicU32,
    sizes: Mutex<JdwpIdSizes>,
    events: broadcast::Sender<JdwpEventSet>,
    closed: CancellationToken,
    options: ClientOptions,
}

/// Unregisters a command's reply slot however the command ends.
struct Slot<'a> {
    shared: &'a Shared,
    id: u32,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.shared.waiting.lock().remove(&self.id);
    }
}

/// Async JDWP client over TCP.
///
/// Commands may be issued concurrently; a background task reads every packet
/// off the socket, routes replies to their command by packet id and
/// broadcasts composite event packets to [`JdwpClient::subscribe_events`].
#[derive(Clone)]
pub struct JdwpClient {
    shared: Arc<Shared>,
}

impl JdwpClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_options(addr, ClientOptions::default()).await
    }

    pub async fn connect_with_options(addr: SocketAddr, options: ClientOptions) -> Result<Self> {
        let limit = options.connect_timeout;
        let mut stream = within(limit, TcpStream::connect(addr)).await?;
        let _ = stream.set_nodelay(true);

        within(limit, stream.write_all(HANDSHAKE)).await?;
        let mut echo = [0u8; HANDSHAKE.len()];
        within(limit, stream.read_exact(&mut echo)).await?;
        if echo[..] != *HANDSHAKE {
            return Err(JdwpError::Protocol(format!(
                "unexpected handshake from {addr}: {:?}",
                String::from_utf8_lossy(&echo)
            )));
        }

        let (reader, writer) = stream.into_split();
        let (events, _) = broadcast::channel(options.event_backlog.max(1));
        let shared = Arc::new(Shared {
            outgoing: tokio::sync::Mutex::new(writer),
            waiting: Mutex::new(HashMap::new()),
            next_packet: AtomicU32::new(1),
            sizes: Mutex::new(JdwpIdSizes::default()),
            events,
            closed: CancellationToken::new(),
            options,
        });
        tokio::spawn(pump(reader, shared.clone()));

        let client = Self { shared };
        let sizes = client.idsizes().await?;
        tracing::debug!(target: "jdbg.jdwp", %addr, ?sizes, "connected to JDWP agent");
        Ok(client)
    }

    pub fn shutdown(&self) {
        self.shared.closed.cancel();
    }

    /// Cancelled once the client stops, on request or because the socket closed.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<JdwpEventSet> {
        self.shared.events.subscribe()
    }

    /// Encode a command body with the current id sizes, send it and wait for
    /// its reply.
    async fn call(
        &self,
        command: Command,
        body: impl FnOnce(&mut PacketWriter, &JdwpIdSizes),
    ) -> Result<Reply> {
        let sizes = *self.shared.sizes.lock();
        let mut w = PacketWriter::new();
        body(&mut w, &sizes);
        let body = self.exchange(command, w.finish()).await?;
        Ok(Reply { body, sizes })
    }

    /// [`JdwpClient::call`] for commands without arguments.
    async fn call_bare(&self, command: Command) -> Result<Reply> {
        self.call(command, |_, _| {}).await
    }

    async fn exchange(&self, command: Command, body: Vec<u8>) -> Result<Vec<u8>> {
        let shared = &*self.shared;
        if shared.closed.is_cancelled() {
            return Err(JdwpError::ConnectionClosed);
        }

        let id = shared.next_packet.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        shared.waiting.lock().insert(id, tx);
        let _slot = Slot { shared, id };

        let packet = encode_command(id, command.0, command.1, &body);
        shared.outgoing.lock().await.write_all(&packet).await?;

        let reply = tokio::select! {
            _ = shared.closed.cancelled() => return Err(JdwpError::Cancelled),
            reply = tokio::time::timeout(shared.options.command_timeout, rx) => match reply {
                Err(_) => return Err(JdwpError::Timeout),
                Ok(Err(_)) => return Err(JdwpError::ConnectionClosed),
                Ok(Ok(reply)) => reply?,
            },
        };

        tracing::trace!(
            target: "jdbg.jdwp",
            command_set = command.0,
            command = command.1,
            error_code = reply.error_code,
            bytes = reply.body.len(),
            "reply"
        );
        match reply.error_code {
            0 => Ok(reply.body),
            code => Err(JdwpError::VmError(code)),
        }
    }

    /// VirtualMachine.IDSizes. Later commands encode ids with the result.
    pub async fn idsizes(&self) -> Result<JdwpIdSizes> {
        let reply = self.call_bare(Command::ID_SIZES).await?;
        let mut r = reply.reader();
        let mut next = || r.read_u32().map(|n| n as usize);
        let sizes = JdwpIdSizes {
            field_id: next()?,
            method_id: next()?,
            object_id: next()?,
            reference_type_id: next()?,
            frame_id: next()?,
        };
        *self.shared.sizes.lock() = sizes;
        Ok(sizes)
    }

    pub async fn version(&self) -> Result<VersionReply> {
        let reply = self.call_bare(Command::VERSION).await?;
        let mut r = reply.reader();
        Ok(VersionReply {
            description: r.read_string()?,
            jdwp_major: r.read_i32()?,
            jdwp_minor: r.read_i32()?,
            vm_version: r.read_string()?,
            vm_name: r.read_string()?,
        })
    }

    pub async fn classes_by_signature(&self, signature: &str) -> Result<Vec<RefTypeEntry>> {
        let reply = self
            .call(Command::CLASSES_BY_SIGNATURE, |w, _| w.write_string(signature))
            .await?;
        let sizes = reply.sizes;
        reply.reader().read_list(|r| {
            Ok(RefTypeEntry {
                ref_type_tag: r.read_u8()?,
                type_id: r.read_reference_type_id(&sizes)?,
                signature: signature.to_owned(),
                status: r.read_u32()?,
            })
        })
    }

    pub async fn all_threads(&self) -> Result<Vec<ThreadId>> {
        let reply = self.call_bare(Command::ALL_THREADS).await?;
        reply.reader().read_list(|r| r.read_object_id(&reply.sizes))
    }

    pub async fn dispose(&self) -> Result<()> {
        self.call_bare(Command::DISPOSE).await.map(drop)
    }

    pub async fn vm_suspend(&self) -> Result<()> {
        self.call_bare(Command::SUSPEND_VM).await.map(drop)
    }

    pub async fn vm_resume(&self) -> Result<()> {
        self.call_bare(Command::RESUME_VM).await.map(drop)
    }

    pub async fn create_string(&self, value: &str) -> Result<ObjectId> {
        let reply = self
            .call(Command::CREATE_STRING, |w, _| w.write_string(value))
            .await?;
        reply.reader().read_object_id(&reply.sizes)
    }

    /// Commands whose only argument is a reference type id.
    async fn on_type(&self, command: Command, class: ReferenceTypeId) -> Result<Reply> {
        self.call(command, |w, sizes| w.write_reference_type_id(class, sizes))
            .await
    }

    /// Commands whose only argument is a thread id.
    async fn on_thread(&self, command: Command, thread: ThreadId) -> Result<Reply> {
        self.call(command, |w, sizes| w.write_object_id(thread, sizes))
            .await
    }

    pub async fn reference_type_signature(&self, class: ReferenceTypeId) -> Result<String> {
        self.on_type(Command::TYPE_SIGNATURE, class)
            .await?
            .reader()
            .read_string()
    }

    pub async fn reference_type_fields(&self, class: ReferenceTypeId) -> Result<Vec<FieldEntry>> {
        let reply = self.on_type(Command::TYPE_FIELDS, class).await?;
        reply.reader().read_list(|r| {
            Ok(FieldEntry {
                field_id: r.read_id(reply.sizes.field_id)?,
                name: r.read_string()?,
                signature: r.read_string()?,
                mod_bits: r.read_u32()?,
            })
        })
    }

    pub async fn reference_type_methods(&self, class: ReferenceTypeId) -> Result<Vec<MethodEntry>> {
        let reply = self.on_type(Command::TYPE_METHODS, class).await?;
        reply.reader().read_list(|r| {
            Ok(MethodEntry {
                method_id: r.read_id(reply.sizes.method_id)?,
                name: r.read_string()?,
                signature: r.read_string()?,
                mod_bits: r.read_u32()?,
            })
        })
    }

    /// Values of static fields.
    pub async fn reference_type_get_values(
        &self,
        class: ReferenceTypeId,
        fields: &[FieldId],
    ) -> Result<Vec<JdwpValue>> {
        let reply = self
            .call(Command::TYPE_STATIC_VALUES, |w, sizes| {
                w.write_reference_type_id(class, sizes);
                w.write_list(fields, |w, field| w.write_id(*field, sizes.field_id));
            })
            .await?;
        reply.reader().read_list(|r| r.read_tagged_value(&reply.sizes))
    }

    pub async fn reference_type_source_file(&self, class: ReferenceTypeId) -> Result<String> {
        self.on_type(Command::TYPE_SOURCE_FILE, class)
            .await?
            .reader()
            .read_string()
    }

    pub async fn reference_type_interfaces(
        &self,
        class: ReferenceTypeId,
    ) -> Result<Vec<ReferenceTypeId>> {
        let reply = self.on_type(Command::TYPE_INTERFACES, class).await?;
        reply
            .reader()
            .read_list(|r| r.read_reference_type_id(&reply.sizes))
    }

    /// `None` for `java.lang.Object` and interfaces.
    pub async fn class_type_superclass(
        &self,
        class: ReferenceTypeId,
    ) -> Result<Option<ReferenceTypeId>> {
        let reply = self.on_type(Command::CLASS_SUPERCLASS, class).await?;
        let superclass = reply.reader().read_reference_type_id(&reply.sizes)?;
        Ok((superclass != 0).then_some(superclass))
    }

    pub async fn class_type_invoke_method(
        &self,
        class: ReferenceTypeId,
        thread: ThreadId,
        method: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeReply> {
        let reply = self
            .call(Command::CLASS_INVOKE, |w, sizes| {
                w.write_reference_type_id(class, sizes);
                w.write_object_id(thread, sizes);
                w.write_id(method, sizes.method_id);
                write_invocation(w, args, options, sizes);
            })
            .await?;
        read_invoke_reply(&reply)
    }

    /// The reply's value is the new object.
    pub async fn class_type_new_instance(
        &self,
        class: ReferenceTypeId,
        thread: ThreadId,
        constructor: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeReply> {
        let reply = self
            .call(Command::CLASS_NEW_INSTANCE, |w, sizes| {
                w.write_reference_type_id(class, sizes);
                w.write_object_id(thread, sizes);
                w.write_id(constructor, sizes.method_id);
                write_invocation(w, args, options, sizes);
            })
            .await?;
        let mut r = reply.reader();
        let (tag, id) = r.read_tagged_object_id(&reply.sizes)?;
        Ok(InvokeReply {
            value: JdwpValue::Object { tag, id },
            exception: r.read_tagged_object_id(&reply.sizes)?,
        })
    }

    pub async fn array_type_new_instance(
        &self,
        array_type: ReferenceTypeId,
        length: i32,
    ) -> Result<ObjectId> {
        let reply = self
            .call(Command::ARRAY_TYPE_NEW_INSTANCE, |w, sizes| {
                w.write_reference_type_id(array_type, sizes);
                w.write_i32(length);
            })
            .await?;
        let (_, array) = reply.reader().read_tagged_object_id(&reply.sizes)?;
        Ok(array)
    }

    async fn on_method(
        &self,
        command: Command,
        class: ReferenceTypeId,
        method: MethodId,
    ) -> Result<Reply> {
        self.call(command, |w, sizes| {
            w.write_reference_type_id(class, sizes);
            w.write_id(method, sizes.method_id);
        })
        .await
    }

    pub async fn method_line_table(
        &self,
        class: ReferenceTypeId,
        method: MethodId,
    ) -> Result<LineTable> {
        let reply = self
            .on_method(Command::METHOD_LINE_TABLE, class, method)
            .await?;
        let mut r = reply.reader();
        let start = r.read_u64()?;
        let end = r.read_u64()?;
        let lines = r.read_list(|r| {
            Ok(LineTableEntry {
                code_index: r.read_u64()?,
                line: r.read_i32()?,
            })
        })?;
        Ok(LineTable { start, end, lines })
    }

    /// Returns the number of argument slots and the variable table.
    pub async fn method_variable_table(
        &self,
        class: ReferenceTypeId,
        method: MethodId,
    ) -> Result<(u32, Vec<VariableEntry>)> {
        let reply = self
            .on_method(Command::METHOD_VARIABLE_TABLE, class, method)
            .await?;
        let mut r = reply.reader();
        let argument_slots = r.read_u32()?;
        let variables = r.read_list(|r| {
            Ok(VariableEntry {
                code_index: r.read_u64()?,
                name: r.read_string()?,
                signature: r.read_string()?,
                length: r.read_u32()?,
                slot: r.read_u32()?,
            })
        })?;
        Ok((argument_slots, variables))
    }

    /// The runtime type of an object as `(type tag, type id)`.
    pub async fn object_reference_reference_type(
        &self,
        object: ObjectId,
    ) -> Result<(u8, ReferenceTypeId)> {
        let reply = self
            .call(Command::OBJECT_TYPE, |w, sizes| w.write_object_id(object, sizes))
            .await?;
        let mut r = reply.reader();
        Ok((r.read_u8()?, r.read_reference_type_id(&reply.sizes)?))
    }

    pub async fn object_reference_get_values(
        &self,
        object: ObjectId,
        fields: &[FieldId],
    ) -> Result<Vec<JdwpValue>> {
        let reply = self
            .call(Command::OBJECT_GET_VALUES, |w, sizes| {
                w.write_object_id(object, sizes);
                w.write_list(fields, |w, field| w.write_id(*field, sizes.field_id));
            })
            .await?;
        reply.reader().read_list(|r| r.read_tagged_value(&reply.sizes))
    }

    pub async fn object_reference_set_values(
        &self,
        object: ObjectId,
        values: &[(FieldId, JdwpValue)],
    ) -> Result<()> {
        self.call(Command::OBJECT_SET_VALUES, |w, sizes| {
            w.write_object_id(object, sizes);
            w.write_list(values, |w, (field, value)| {
                w.write_id(*field, sizes.field_id);
                w.write_untagged_value(value, sizes);
            });
        })
        .await
        .map(drop)
    }

    pub async fn object_reference_invoke_method(
        &self,
        object: ObjectId,
        thread: ThreadId,
        class: ReferenceTypeId,
        method: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeReply> {
        let reply = self
            .call(Command::OBJECT_INVOKE, |w, sizes| {
                w.write_object_id(object, sizes);
                w.write_object_id(thread, sizes);
                w.write_reference_type_id(class, sizes);
                w.write_id(method, sizes.method_id);
                write_invocation(w, args, options, sizes);
            })
            .await?;
        read_invoke_reply(&reply)
    }

    pub async fn string_reference_value(&self, string: ObjectId) -> Result<String> {
        self.call(Command::STRING_VALUE, |w, sizes| w.write_object_id(string, sizes))
            .await?
            .reader()
            .read_string()
    }

    pub async fn thread_name(&self, thread: ThreadId) -> Result<String> {
        self.on_thread(Command::THREAD_NAME, thread)
            .await?
            .reader()
            .read_string()
    }

    pub async fn thread_suspend(&self, thread: ThreadId) -> Result<()> {
        self.on_thread(Command::THREAD_SUSPEND, thread).await.map(drop)
    }

    pub async fn thread_resume(&self, thread: ThreadId) -> Result<()> {
        self.on_thread(Command::THREAD_RESUME, thread).await.map(drop)
    }

    /// Returns `(thread status, suspend status)`.
    pub async fn thread_status(&self, thread: ThreadId) -> Result<(i32, i32)> {
        let reply = self.on_thread(Command::THREAD_STATUS, thread).await?;
        let mut r = reply.reader();
        Ok((r.read_i32()?, r.read_i32()?))
    }

    /// `length == -1` asks for every frame from `start` down.
    pub async fn frames(&self, thread: ThreadId, start: i32, length: i32) -> Result<Vec<FrameEntry>> {
        let reply = self
            .call(Command::THREAD_FRAMES, |w, sizes| {
                w.write_object_id(thread, sizes);
                w.write_i32(start);
                w.write_i32(length);
            })
            .await?;
        let sizes = reply.sizes;
        reply.reader().read_list(|r| {
            Ok(FrameEntry {
                frame_id: r.read_id(sizes.frame_id)?,
                location: r.read_location(&sizes)?,
            })
        })
    }

    pub async fn array_reference_length(&self, array: ObjectId) -> Result<i32> {
        self.call(Command::ARRAY_LENGTH, |w, sizes| w.write_object_id(array, sizes))
            .await?
            .reader()
            .read_i32()
    }

    pub async fn array_reference_get_values(
        &self,
        array: ObjectId,
        first_index: i32,
        length: i32,
    ) -> Result<Vec<JdwpValue>> {
        let reply = self
            .call(Command::ARRAY_GET_VALUES, |w, sizes| {
                w.write_object_id(array, sizes);
                w.write_i32(first_index);
                w.write_i32(length);
            })
            .await?;
        // An array region: one component tag, then untagged primitives or
        // tagged objects.
        let mut r = reply.reader();
        let tag = r.read_u8()?;
        r.read_list(|r| {
            if is_primitive_tag(tag) {
                r.read_value(tag, &reply.sizes)
            } else {
                r.read_tagged_value(&reply.sizes)
            }
        })
    }

    pub async fn array_reference_set_values(
        &self,
        array: ObjectId,
        first_index: i32,
        values: &[JdwpValue],
    ) -> Result<()> {
        self.call(Command::ARRAY_SET_VALUES, |w, sizes| {
            w.write_object_id(array, sizes);
            w.write_i32(first_index);
            w.write_list(values, |w, value| w.write_untagged_value(value, sizes));
        })
        .await
        .map(drop)
    }

    /// Installs an event request and returns its VM-assigned id.
    pub async fn event_request_set(
        &self,
        event_kind: u8,
        suspend_policy: u8,
        modifiers: &[EventModifier],
    ) -> Result<i32> {
        self.call(Command::REQUEST_SET, |w, sizes| {
            w.write_u8(event_kind);
            w.write_u8(suspend_policy);
            w.write_list(modifiers, |w, modifier| modifier.encode(w, sizes));
        })
        .await?
        .reader()
        .read_i32()
    }

    pub async fn event_request_clear(&self, event_kind: u8, request_id: i32) -> Result<()> {
        self.call(Command::REQUEST_CLEAR, |w, _| {
            w.write_u8(event_kind);
            w.write_i32(request_id);
        })
        .await
        .map(drop)
    }

    /// Reads local slots; each slot carries the signature of its declared type.
    pub async fn stack_frame_get_values(
        &self,
        thread: ThreadId,
        frame: FrameId,
        slots: &[(u32, String)],
    ) -> Result<Vec<JdwpValue>> {
        let reply = self
            .call(Command::FRAME_GET_VALUES, |w, sizes| {
                w.write_object_id(thread, sizes);
                w.write_id(frame, sizes.frame_id);
                w.write_list(slots, |w, (slot, signature)| {
                    w.write_u32(*slot);
                    w.write_u8(signature_to_tag(signature));
                });
            })
            .await?;
        reply.reader().read_list(|r| r.read_tagged_value(&reply.sizes))
    }

    pub async fn stack_frame_set_values(
        &self,
        thread: ThreadId,
        frame: FrameId,
        values: &[(u32, JdwpValue)],
    ) -> Result<()> {
        self.call(Command::FRAME_SET_VALUES, |w, sizes| {
            w.write_object_id(thread, sizes);
            w.write_id(frame, sizes.frame_id);
            w.write_list(values, |w, (slot, value)| {
                w.write_u32(*slot);
                w.write_tagged_value(value, sizes);
            });
        })
        .await
        .map(drop)
    }

    /// Static and native frames answer with object id 0.
    pub async fn stack_frame_this_object(
        &self,
        thread: ThreadId,
        frame: FrameId,
    ) -> Result<(u8, ObjectId)> {
        let reply = self
            .call(Command::FRAME_THIS_OBJECT, |w, sizes| {
                w.write_object_id(thread, sizes);
                w.write_id(frame, sizes.frame_id);
            })
            .await?;
        reply.reader().read_tagged_object_id(&reply.sizes)
    }
}

async fn within<T, E>(limit: Duration, fut: impl std::future::Future<Output = Result<T, E>>) -> Result<T>
where
    JdwpError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(JdwpError::Timeout),
    }
}

fn write_invocation(w: &mut PacketWriter, args: &[JdwpValue], options: u32, sizes: &JdwpIdSizes) {
    w.write_list(args, |w, arg| w.write_tagged_value(arg, sizes));
    w.write_u32(options);
}

fn read_invoke_reply(reply: &Reply) -> Result<InvokeReply> {
    let mut r = reply.reader();
    Ok(InvokeReply {
        value: r.read_tagged_value(&reply.sizes)?,
        exception: r.read_tagged_object_id(&reply.sizes)?,
    })
}

/// Filters attached to an `EventRequest.Set` command.
#[derive(Debug, Clone, PartialEq)]
pub enum EventModifier {
    Count {
        count: i32,
    },
    ThreadOnly {
        thread: ThreadId,
    },
    ClassMatch {
        pattern: String,
    },
    LocationOnly {
        location: Location,
    },
    /// A zero class id matches every throwable.
    ExceptionOnly {
        exception_or_null: ReferenceTypeId,
        caught: bool,
        uncaught: bool,
    },
    Step {
        thread: ThreadId,
        size: u32,
        depth: u32,
    },
}

impl EventModifier {
    fn kind(&self) -> u8 {
        match self {
            EventModifier::Count { .. } => 1,
            EventModifier::ThreadOnly { .. } => 3,
            EventModifier::ClassMatch { .. } => 5,
            EventModifier::LocationOnly { .. } => 7,
            EventModifier::ExceptionOnly { .. } => 8,
            EventModifier::Step { .. } => 10,
        }
    }

    fn encode(&self, w: &mut PacketWriter, sizes: &JdwpIdSizes) {
        w.write_u8(self.kind());
        match self {
            EventModifier::Count { count } => w.write_i32(*count),
            EventModifier::ThreadOnly { thread } => w.write_object_id(*thread, sizes),
            EventModifier::ClassMatch { pattern } => w.write_string(pattern),
            EventModifier::LocationOnly { location } => w.write_location(location, sizes),
            EventModifier::ExceptionOnly {
                exception_or_null,
                caught,
                uncaught,
            } => {
                w.write_reference_type_id(*exception_or_null, sizes);
                w.write_bool(*caught);
                w.write_bool(*uncaught);
            }
            EventModifier::Step {
                thread,
                size,
                depth,
            } => {
                w.write_object_id(*thread, sizes);
                w.write_u32(*size);
                w.write_u32(*depth);
            }
        }
    }
}

enum Packet {
    Reply { id: u32, reply: RawReply },
    Command { command: Command, body: Vec<u8> },
}

async fn read_packet(reader: &mut OwnedReadHalf) -> Result<Packet> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let mut head = PacketReader::new(&header);
    let length = head.read_u32()? as usize;
    let id = head.read_u32()?;
    let flags = head.read_u8()?;

    let body_len = length.checked_sub(HEADER_LEN).ok_or_else(|| {
        JdwpError::Protocol(format!("packet length {length} is shorter than its header"))
    })?;
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;

    Ok(if flags & FLAG_REPLY != 0 {
        let error_code = head.read_u16()?;
        Packet::Reply {
            id,
            reply: RawReply { error_code, body },
        }
    } else {
        let command = Command(head.read_u8()?, head.read_u8()?);
        Packet::Command { command, body }
    })
}

/// Reader task: runs until the socket fails or the client shuts down, then
/// fails every command still waiting for a reply.
async fn pump(mut reader: OwnedReadHalf, shared: Arc<Shared>) {
    let stopped: Result<()> = loop {
        let packet = tokio::select! {
            _ = shared.closed.cancelled() => break Ok(()),
            packet = read_packet(&mut reader) => packet,
        };
        match packet {
            Ok(Packet::Reply { id, reply }) => {
                if let Some(tx) = shared.waiting.lock().remove(&id) {
                    let _ = tx.send(Ok(reply));
                }
            }
            Ok(Packet::Command {
                command: Command::COMPOSITE_EVENT,
                body,
            }) => {
                let sizes = *shared.sizes.lock();
                match decode_event_set(&body, &sizes) {
                    // Sending fails only while nobody subscribes.
                    Ok(set) => drop(shared.events.send(set)),
                    Err(err) => break Err(err),
                }
            }
            Ok(Packet::Command { command, .. }) => {
                tracing::debug!(
                    target: "jdbg.jdwp",
                    command_set = command.0,
                    command = command.1,
                    "ignoring command packet from the VM"
                );
            }
            Err(err) => break Err(err),
        }
    };

    match stopped {
        Ok(()) => tracing::debug!(target: "jdbg.jdwp", "JDWP reader stopped"),
        Err(err) => tracing::debug!(target: "jdbg.jdwp", error = %err, "JDWP connection lost"),
    }
    shared.closed.cancel();
    let waiting = std::mem::take(&mut *shared.waiting.lock());
    for tx in waiting.into_values() {
        let _ = tx.send(Err(JdwpError::ConnectionClosed));
    }
}

fn decode_event_set(body: &[u8], sizes: &JdwpIdSizes) -> Result<JdwpEventSet> {
    let mut r = PacketReader::new(body);
    let suspend_policy = r.read_u8()?;
    let declared = r.read_u32()? as usize;
    let mut events = Vec::with_capacity(declared.min(64));
    for _ in 0..declared {
        let kind = r.read_u8()?;
        let request_id = r.read_i32()?;
        let event = match kind {
            1 => JdwpEvent::SingleStep {
                request_id,
                thread: r.read_object_id(sizes)?,
                location: r.read_location(sizes)?,
            },
            2 => JdwpEvent::Breakpoint {
                request_id,
                thread: r.read_object_id(sizes)?,
                location: r.read_location(sizes)?,
            },
            4 => JdwpEvent::Exception {
                request_id,
                thread: r.read_object_id(sizes)?,
                location: r.read_location(sizes)?,
                exception: r.read_tagged_object_id(sizes)?,
                catch_location: Some(r.read_location(sizes)?).filter(|at| !is_null_location(at)),
            },
            6 => JdwpEvent::ThreadStart {
                request_id,
                thread: r.read_object_id(sizes)?,
            },
            7 => JdwpEvent::ThreadDeath {
                request_id,
                thread: r.read_object_id(sizes)?,
            },
            8 => JdwpEvent::ClassPrepare {
                request_id,
                thread: r.read_object_id(sizes)?,
                ref_type_tag: r.read_u8()?,
                type_id: r.read_reference_type_id(sizes)?,
                signature: r.read_string()?,
                status: r.read_u32()?,
            },
            90 => JdwpEvent::VmStart {
                request_id,
                thread: r.read_object_id(sizes)?,
            },
            99 => JdwpEvent::VmDeath,
            other => {
                // Unknown layouts end decoding; earlier events are still delivered.
                tracing::debug!(target: "jdbg.jdwp", kind = other, "unsupported JDWP event kind");
                break;
            }
        };
        events.push(event);
    }
    Ok(JdwpEventSet {
        suspend_policy,
        events,
    })
}

/// Uncaught exceptions report an all-zero catch location.
fn is_null_location(location: &Location) -> bool {
    location.class_id == 0 && location.method_id == 0 && location.index == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::codec::encode_reply;
    use tokio::net::TcpListener;

    /// Plays the VM side of one connection: handshake, 8-byte id sizes, then `script`.
    async fn fake_vm<F, Fut>(script: F) -> SocketAddr
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; HANDSHAKE.len()];
            socket.read_exact(&mut greeting).await.unwrap();
            assert_eq!(&greeting[..], HANDSHAKE);
            socket.write_all(HANDSHAKE).await.unwrap();

            let (id, command, _) = next_command(&mut socket).await;
            assert_eq!(command, Command::ID_SIZES);
            let mut w = PacketWriter::new();
            for _ in 0..5 {
                w.write_u32(8);
            }
            socket.write_all(&encode_reply(id, 0, &w.finish())).await.unwrap();

            script(socket).await;
        });
        addr
    }

    async fn next_command(socket: &mut TcpStream) -> (u32, Command, Vec<u8>) {
        let mut header = [0u8; HEADER_LEN];
        socket.read_exact(&mut header).await.unwrap();
        let mut head = PacketReader::new(&header);
        let length = head.read_u32().unwrap() as usize;
        let id = head.read_u32().unwrap();
        let mut body = vec![0u8; length - HEADER_LEN];
        socket.read_exact(&mut body).await.unwrap();
        (id, Command(header[9], header[10]), body)
    }

    /// Holds the socket open until the client side closes it.
    async fn linger(mut socket: TcpStream) {
        let _ = socket.read_u8().await;
    }

    #[tokio::test]
    async fn replies_reach_the_issuing_command() {
        let addr = fake_vm(|mut socket| async move {
            let (id, command, body) = next_command(&mut socket).await;
            assert_eq!(command, Command::THREAD_NAME);
            assert_eq!(body, 42u64.to_be_bytes());
            let mut w = PacketWriter::new();
            w.write_string("worker-1");
            socket.write_all(&encode_reply(id, 0, &w.finish())).await.unwrap();
            linger(socket).await;
        })
        .await;

        let client = JdwpClient::connect(addr).await.unwrap();
        assert_eq!(client.thread_name(42).await.unwrap(), "worker-1");
    }

    #[tokio::test]
    async fn error_codes_surface_as_vm_errors() {
        let addr = fake_vm(|mut socket| async move {
            let (id, _, _) = next_command(&mut socket).await;
            socket.write_all(&encode_reply(id, 10, &[])).await.unwrap();
            linger(socket).await;
        })
        .await;

        let client = JdwpClient::connect(addr).await.unwrap();
        let err = client.thread_suspend(9).await.unwrap_err();
        assert!(matches!(err, JdwpError::VmError(10)), "unexpected error: {err:?}");
    }

    #[tokio::test]
    async fn silent_vm_times_out_the_command() {
        let addr = fake_vm(|mut socket| async move {
            let _ = next_command(&mut socket).await;
            linger(socket).await;
        })
        .await;

        let options = ClientOptions {
            command_timeout: Duration::from_millis(50),
            ..ClientOptions::default()
        };
        let client = JdwpClient::connect_with_options(addr, options).await.unwrap();
        assert!(matches!(client.all_threads().await, Err(JdwpError::Timeout)));
        assert!(client.shared.waiting.lock().is_empty());
    }

    #[tokio::test]
    async fn event_packets_are_broadcast_whole() {
        let addr = fake_vm(|mut socket| async move {
            // Wait until the client has subscribed and asks to resume.
            let (id, command, _) = next_command(&mut socket).await;
            assert_eq!(command, Command::RESUME_VM);
            socket.write_all(&encode_reply(id, 0, &[])).await.unwrap();

            let mut w = PacketWriter::new();
            w.write_u8(1); // suspend event thread
            w.write_u32(2);
            w.write_u8(7); // thread death
            w.write_i32(5);
            w.write_u64(31);
            w.write_u8(4); // exception, uncaught
            w.write_i32(6);
            w.write_u64(31);
            w.write_u8(1);
            w.write_u64(300);
            w.write_u64(400);
            w.write_u64(12);
            w.write_u8(b'L');
            w.write_u64(900);
            w.write_u8(0);
            w.write_u64(0);
            w.write_u64(0);
            w.write_u64(0);
            socket
                .write_all(&encode_command(1, 64, 100, &w.finish()))
                .await
                .unwrap();
            linger(socket).await;
        })
        .await;

        let client = JdwpClient::connect(addr).await.unwrap();
        let mut events = client.subscribe_events();
        client.vm_resume().await.unwrap();
        let set = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(set.suspend_policy, 1);
        assert_eq!(
            set.events,
            vec![
                JdwpEvent::ThreadDeath {
                    request_id: 5,
                    thread: 31,
                },
                JdwpEvent::Exception {
                    request_id: 6,
                    thread: 31,
                    location: Location {
                        type_tag: 1,
                        class_id: 300,
                        method_id: 400,
                        index: 12,
                    },
                    exception: (b'L', 900),
                    catch_location: None,
                },
            ]
        );
    }

    #[tokio::test]
    async fn hangup_cancels_the_shutdown_token() {
        let addr = fake_vm(|socket| async move { drop(socket) }).await;

        let client = JdwpClient::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), client.shutdown_token().cancelled())
            .await
            .expect("the token is cancelled once the VM hangs up");
        assert!(matches!(
            client.vm_resume().await,
            Err(JdwpError::ConnectionClosed)
        ));
    }
}
