//! Graph serializer.
//!
//! Depth-first over the reachable graph, assigning a monotonically
//! increasing index to each newly-encountered collectable object and
//! emitting a back-reference for repeats. Objects registered in the
//! permanents table are written as their key and never inlined; native
//! closures outside the permanents must at least be built over a
//! persistable registry entry, or serialization fails.

use hashbrown::HashMap;

use ares_io::StreamWriter;

use crate::ares::format::{
    awaiting, payload, status, tag, UserdataCodec, STREAM_MAGIC, STREAM_VERSION,
};
use crate::ares::permanents::Permanents;
use crate::closure::Closure;
use crate::error::{VmError, VmResult};
use crate::heap::{GcRef, Heap};
use crate::native::NativeRegistry;
use crate::thread::{NativeAwait, TaskIdentity, ThreadStatus, Upvalue};
use crate::userdata::{tags, UserdataPayload};
use crate::value::{ProtoRef, ThreadRef, UpvalueRef, Value};

/// Serializes one value graph into a persisted-state stream.
pub struct Serializer<'a> {
    heap: &'a Heap,
    permanents: &'a Permanents,
    natives: &'a NativeRegistry,
    codecs: &'a HashMap<u8, UserdataCodec>,
    writer: StreamWriter,
    memo: HashMap<GcRef, u32>,
    depth: usize,
    depth_limit: usize,
}

impl<'a> Serializer<'a> {
    pub(crate) fn new(
        heap: &'a Heap,
        permanents: &'a Permanents,
        natives: &'a NativeRegistry,
        codecs: &'a HashMap<u8, UserdataCodec>,
        depth_limit: usize,
    ) -> Self {
        Serializer {
            heap,
            permanents,
            natives,
            codecs,
            writer: StreamWriter::with_capacity(256),
            memo: HashMap::new(),
            depth: 0,
            depth_limit,
        }
    }

    /// Writes the stream header and the root value, returning the bytes.
    pub fn serialize(mut self, root: Value) -> VmResult<Vec<u8>> {
        self.writer.write_bytes(&STREAM_MAGIC);
        self.writer.write_u8(STREAM_VERSION);
        self.writer.write_var_u32(self.permanents.len() as u32);
        self.write_value(root)?;
        log::debug!(
            "serialized {} objects into {} bytes",
            self.memo.len(),
            self.writer.len()
        );
        Ok(self.writer.into_bytes())
    }

    fn enter(&mut self) -> VmResult<()> {
        self.depth += 1;
        if self.depth > self.depth_limit {
            return Err(VmError::persist("value graph exceeds depth limit"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// Emits a back-reference or permanent key if the object was seen or
    /// pinned; otherwise assigns its index and returns false so the caller
    /// inlines it.
    fn write_ref_or_claim(&mut self, object: GcRef) -> VmResult<bool> {
        if let Some(key) = self.permanents.key_for(object) {
            self.writer.write_u8(tag::PERMANENT);
            let key = key.to_string();
            self.writer.write_var_bytes(key.as_bytes());
            return Ok(true);
        }
        if let Some(&index) = self.memo.get(&object) {
            self.writer.write_u8(tag::BACKREF);
            self.writer.write_var_u32(index);
            return Ok(true);
        }
        self.memo.insert(object, self.memo.len() as u32);
        Ok(false)
    }

    fn write_value(&mut self, value: Value) -> VmResult<()> {
        self.enter()?;
        let result = self.write_value_inner(value);
        self.leave();
        result
    }

    fn write_value_inner(&mut self, value: Value) -> VmResult<()> {
        match value {
            Value::Nil => self.writer.write_u8(tag::NIL),
            Value::Boolean(false) => self.writer.write_u8(tag::FALSE),
            Value::Boolean(true) => self.writer.write_u8(tag::TRUE),
            Value::Number(n) => {
                self.writer.write_u8(tag::NUMBER);
                self.writer.write_f64(n);
            }
            Value::Vector(v) => {
                self.writer.write_u8(tag::VECTOR);
                for lane in v {
                    self.writer.write_f32(lane);
                }
            }
            Value::LightUserdata { data, tag: t } => {
                // The pointer payload is only meaningful to the embedder;
                // it round-trips bit-exact and nothing more.
                self.writer.write_u8(tag::LIGHT_USERDATA);
                self.writer.write_u64(data);
                self.writer.write_u8(t);
            }
            Value::String(r) => {
                if !self.write_ref_or_claim(GcRef::String(r))? {
                    self.writer.write_u8(tag::STRING);
                    // Claimed the index above; the tag byte follows it in
                    // the reader's numbering, so order matches.
                    let bytes = self.heap.string_bytes(r).to_vec();
                    self.writer.write_var_bytes(&bytes);
                }
            }
            Value::Table(r) => {
                if !self.write_ref_or_claim(GcRef::Table(r))? {
                    self.writer.write_u8(tag::TABLE);
                    self.write_table(r)?;
                }
            }
            Value::Closure(r) => {
                if !self.write_ref_or_claim(GcRef::Closure(r))? {
                    let is_native = self.heap.closure(r).is_native();
                    if is_native {
                        self.writer.write_u8(tag::NATIVE_CLOSURE);
                        self.write_native_closure(r)?;
                    } else {
                        self.writer.write_u8(tag::SCRIPT_CLOSURE);
                        self.write_script_closure(r)?;
                    }
                }
            }
            Value::Thread(r) => {
                if !self.write_ref_or_claim(GcRef::Thread(r))? {
                    self.writer.write_u8(tag::THREAD);
                    self.write_thread(r)?;
                }
            }
            Value::Userdata(r) => {
                if !self.write_ref_or_claim(GcRef::Userdata(r))? {
                    self.writer.write_u8(tag::USERDATA);
                    self.write_userdata(r)?;
                }
            }
            Value::Buffer(r) => {
                if !self.write_ref_or_claim(GcRef::Buffer(r))? {
                    self.writer.write_u8(tag::BUFFER);
                    let bytes = self.heap.buffer(r).as_bytes().to_vec();
                    self.writer.write_var_bytes(&bytes);
                }
            }
        }
        Ok(())
    }

    fn write_table(&mut self, r: crate::value::TableRef) -> VmResult<()> {
        let (array, live_slots, readonly, safe_env, fallback, order) = {
            let table = self.heap.table(r);
            (
                table.array_part().to_vec(),
                table.live_node_slots(),
                table.readonly,
                table.safe_env,
                table.fallback,
                table.serialized_iteration(),
            )
        };
        let node_capacity = self.heap.table(r).node_capacity();

        self.writer.write_var_u32(array.len() as u32);
        self.writer.write_var_u32(node_capacity as u32);
        self.writer.write_var_u32(live_slots.len() as u32);
        for v in &array {
            self.write_value(*v)?;
        }
        for slot in live_slots {
            let (key, value) = self.heap.table(r).node_entry(slot);
            self.write_value(key)?;
            self.write_value(value)?;
        }
        self.writer.write_bool(readonly);
        self.writer.write_bool(safe_env);
        self.write_value(fallback.map(Value::Table).unwrap_or(Value::Nil))?;

        // The explicit iteration-order vector: handle-derived hash buckets
        // differ on the restoring side, so slot order cannot be trusted.
        self.writer.write_var_u32(order.len() as u32);
        for entry in order {
            self.writer
                .write_var_u32(crate::ares::format::encode_order_entry(entry)?);
        }
        Ok(())
    }

    fn write_proto(&mut self, r: ProtoRef) -> VmResult<()> {
        if self.write_ref_or_claim(GcRef::Proto(r))? {
            return Ok(());
        }
        self.writer.write_u8(tag::PROTO);
        let (num_params, num_upvalues, max_stack, flags, code, constants, captures, children, debug_lines, source) = {
            let proto = self.heap.proto(r);
            (
                proto.num_params,
                proto.num_upvalues,
                proto.max_stack,
                proto.flags.bits(),
                proto.code.clone(),
                proto.constants.clone(),
                proto.captures.clone(),
                proto.children.clone(),
                proto.debug_lines.clone(),
                proto.source,
            )
        };
        self.writer.write_u8(num_params);
        self.writer.write_u8(num_upvalues);
        self.writer.write_u8(max_stack);
        self.writer.write_u8(flags);

        self.writer.write_var_u32(code.len() as u32);
        for word in code {
            self.writer.write_u32(word);
        }
        self.writer.write_var_u32(constants.len() as u32);
        for k in constants {
            self.write_value(k)?;
        }
        self.writer.write_var_u32(captures.len() as u32);
        for capture in captures {
            match capture {
                crate::bytecode::Capture::Local(i) => {
                    self.writer.write_u8(0);
                    self.writer.write_u8(i);
                }
                crate::bytecode::Capture::Upvalue(i) => {
                    self.writer.write_u8(1);
                    self.writer.write_u8(i);
                }
            }
        }
        self.writer.write_var_u32(children.len() as u32);
        for child in children {
            self.write_proto(child)?;
        }
        self.writer.write_var_u32(debug_lines.len() as u32);
        for line in debug_lines {
            self.writer.write_var_u32(line);
        }
        self.write_value(source.map(Value::String).unwrap_or(Value::Nil))?;
        Ok(())
    }

    fn write_upvalue(&mut self, r: UpvalueRef) -> VmResult<()> {
        if self.write_ref_or_claim(GcRef::Upvalue(r))? {
            return Ok(());
        }
        self.writer.write_u8(tag::UPVALUE);
        match self.heap.upvalue(r).clone() {
            Upvalue::Closed(value) => {
                self.writer.write_u8(0);
                self.write_value(value)?;
            }
            Upvalue::Open { thread, slot } => {
                self.writer.write_u8(1);
                self.write_value(Value::Thread(thread))?;
                self.writer.write_var_u32(slot as u32);
            }
        }
        Ok(())
    }

    fn write_script_closure(&mut self, r: crate::value::ClosureRef) -> VmResult<()> {
        let (proto, upvalues) = match self.heap.closure(r) {
            Closure::Script(sc) => (sc.proto, sc.upvalues.clone()),
            Closure::Native(_) => unreachable!("dispatched on closure kind"),
        };
        self.write_proto(proto)?;
        self.writer.write_var_u32(upvalues.len() as u32);
        for upvalue in upvalues {
            self.write_upvalue(upvalue)?;
        }
        Ok(())
    }

    fn write_native_closure(&mut self, r: crate::value::ClosureRef) -> VmResult<()> {
        let (func, upvalues) = match self.heap.closure(r) {
            Closure::Native(nc) => (nc.func, nc.upvalues.clone()),
            Closure::Script(_) => unreachable!("dispatched on closure kind"),
        };
        let def = self.natives.get(func);
        if !def.persistable {
            return Err(VmError::ForbiddenNative {
                name: def.name.clone(),
            });
        }
        let name = def.name.clone();
        self.writer.write_var_bytes(name.as_bytes());
        self.writer.write_var_u32(upvalues.len() as u32);
        for upvalue in upvalues {
            self.write_value(upvalue)?;
        }
        Ok(())
    }

    fn write_thread(&mut self, r: ThreadRef) -> VmResult<()> {
        let thread = self.heap.thread(r);
        if thread.identity == TaskIdentity::Kernel {
            return Err(VmError::persist("kernel tasks are not serializable"));
        }
        let status_byte = match thread.status {
            ThreadStatus::Fresh => status::FRESH,
            ThreadStatus::Suspended => status::SUSPENDED,
            ThreadStatus::BreakSuspended => status::BREAK_SUSPENDED,
            ThreadStatus::Finished => status::FINISHED,
            ThreadStatus::Running => {
                return Err(VmError::persist("cannot serialize a running task"))
            }
            ThreadStatus::Error => {
                return Err(VmError::persist("cannot serialize a failed task"))
            }
        };
        let globals = thread.globals;
        let parent = thread.parent;
        let memcat = thread.memcat;
        let stack = thread.stack.clone();
        let frames = thread.frames.clone();
        let open_upvalues = thread.open_upvalues.clone();

        self.writer.write_u8(status_byte);
        self.writer.write_u8(memcat);
        self.write_value(Value::Table(globals))?;
        self.write_value(parent.map(Value::Thread).unwrap_or(Value::Nil))?;

        self.writer.write_var_u32(stack.len() as u32);
        for v in stack {
            self.write_value(v)?;
        }

        self.writer.write_var_u32(frames.len() as u32);
        for frame in frames {
            self.write_value(Value::Closure(frame.closure))?;
            self.writer.write_var_u32(frame.pc as u32);
            self.writer.write_var_u32(frame.base as u32);
            self.writer.write_var_u32(frame.ret_base as u32);
            self.writer.write_u8(frame.nresults);
            self.writer.write_var_u32(frame.vararg_base as u32);
            self.writer.write_var_u32(frame.vararg_count as u32);
            match frame.awaiting {
                None => self.writer.write_u8(awaiting::NONE),
                Some(NativeAwait::Resume) => self.writer.write_u8(awaiting::RESUME),
                Some(NativeAwait::Call {
                    ret_slot,
                    nresults,
                    protected,
                }) => {
                    self.writer.write_u8(awaiting::CALL);
                    self.writer.write_var_u32(ret_slot);
                    self.writer.write_u8(nresults);
                    self.writer.write_bool(protected);
                }
            }
        }

        self.writer.write_var_u32(open_upvalues.len() as u32);
        for upvalue in open_upvalues {
            self.write_upvalue(upvalue)?;
        }
        Ok(())
    }

    fn write_userdata(&mut self, r: crate::value::UserdataRef) -> VmResult<()> {
        let userdata_tag = self.heap.userdata(r).tag;
        if userdata_tag == tags::EVENT_CONTEXT {
            return Err(VmError::persist(
                "transient event context cannot be persisted",
            ));
        }
        self.writer.write_u8(userdata_tag);
        let metatable = self.heap.userdata(r).metatable;
        self.write_value(metatable.map(Value::Table).unwrap_or(Value::Nil))?;

        if let Some(codec) = self.codecs.get(&userdata_tag) {
            let bytes = (codec.encode)(self.heap, self.heap.userdata(r))?;
            self.writer.write_u8(payload::CUSTOM);
            self.writer.write_var_bytes(&bytes);
            return Ok(());
        }

        enum Snapshot {
            Raw(Vec<u8>),
            Events {
                channels: Vec<(String, Vec<crate::events::HandlerEntry>)>,
                next_handle: u64,
                dispatching: bool,
            },
            Timers {
                records: Vec<crate::timers::TimerRecord>,
                next_handle: u64,
                ticking: bool,
            },
        }
        let snapshot = match &self.heap.userdata(r).payload {
            UserdataPayload::Raw(bytes) => Snapshot::Raw(bytes.clone()),
            UserdataPayload::EventManager(m) => Snapshot::Events {
                channels: m.channels().to_vec(),
                next_handle: m.next_handle(),
                dispatching: m.dispatching,
            },
            UserdataPayload::TimerManager(m) => Snapshot::Timers {
                records: m.records().to_vec(),
                next_handle: m.next_handle(),
                ticking: m.ticking,
            },
        };
        match snapshot {
            Snapshot::Raw(bytes) => {
                self.writer.write_u8(payload::RAW);
                self.writer.write_var_bytes(&bytes);
            }
            Snapshot::Events {
                channels,
                next_handle,
                dispatching,
            } => {
                self.writer.write_u8(payload::EVENT_MANAGER);
                self.writer.write_var_u32(channels.len() as u32);
                for (name, entries) in channels {
                    self.writer.write_var_bytes(name.as_bytes());
                    self.writer.write_var_u32(entries.len() as u32);
                    for entry in entries {
                        self.writer.write_u64(entry.handle);
                        self.writer.write_bool(entry.once);
                        self.write_value(entry.func)?;
                    }
                }
                self.writer.write_u64(next_handle);
                self.writer.write_bool(dispatching);
            }
            Snapshot::Timers {
                records,
                next_handle,
                ticking,
            } => {
                self.writer.write_u8(payload::TIMER_MANAGER);
                self.writer.write_var_u32(records.len() as u32);
                for record in records {
                    self.writer.write_u64(record.handle);
                    self.writer.write_f64(record.interval);
                    self.writer.write_f64(record.next_due);
                    self.writer.write_bool(record.one_shot);
                    self.write_value(record.func)?;
                }
                self.writer.write_u64(next_handle);
                self.writer.write_bool(ticking);
            }
        }
        Ok(())
    }
}
