//! Graph deserializer.
//!
//! The reader mirrors the serializer's numbering: each inlining tag
//! reserves the next back-reference index before its payload is read, and
//! shell objects are registered before their contents so cyclic graphs and
//! shared identities resolve. Hash parts are rebuilt from scratch — handle
//! hashes differ on this side — and the explicit iteration-order vector is
//! rebound to the slots re-insertion actually chose.

use hashbrown::HashMap;

use ares_io::StreamReader;

use crate::ares::format::{
    awaiting, decode_order_entry, payload, status, tag, UserdataCodec, STREAM_MAGIC,
    STREAM_VERSION,
};
use crate::ares::permanents::{gcref_to_value, Permanents};
use crate::buffer::Buffer;
use crate::bytecode::proto::{Capture, Proto, ProtoFlags};
use crate::closure::{Closure, NativeClosure, ScriptClosure};
use crate::error::{VmError, VmResult};
use crate::events::{EventManager, HandlerEntry};
use crate::heap::{GcRef, Heap};
use crate::native::NativeRegistry;
use crate::table::Table;
use crate::thread::{Frame, NativeAwait, TaskIdentity, Thread, ThreadStatus, Upvalue};
use crate::timers::{TimerManager, TimerRecord};
use crate::userdata::{Userdata, UserdataPayload};
use crate::value::{ProtoRef, TableRef, ThreadRef, UpvalueRef, Value};

const MAX_ITEMS: u64 = 1 << 24;
const MAX_BYTES: usize = 1 << 26;

/// Reconstructs a value graph from a persisted-state stream.
pub struct Deserializer<'h, 'b> {
    heap: &'h mut Heap,
    permanents: &'h Permanents,
    natives: &'h NativeRegistry,
    codecs: &'h HashMap<u8, UserdataCodec>,
    reader: StreamReader<'b>,
    memo: Vec<Option<GcRef>>,
    scratch_globals: Option<TableRef>,
    timer_catchup: (f64, f64),
    depth: usize,
    depth_limit: usize,
}

fn bad(e: ares_io::IoError) -> VmError {
    VmError::restore(e.to_string())
}

impl<'h, 'b> Deserializer<'h, 'b> {
    pub(crate) fn new(
        heap: &'h mut Heap,
        permanents: &'h Permanents,
        natives: &'h NativeRegistry,
        codecs: &'h HashMap<u8, UserdataCodec>,
        bytes: &'b [u8],
        timer_catchup: (f64, f64),
        depth_limit: usize,
    ) -> Self {
        Deserializer {
            heap,
            permanents,
            natives,
            codecs,
            reader: StreamReader::new(bytes),
            memo: Vec::new(),
            scratch_globals: None,
            timer_catchup,
            depth: 0,
            depth_limit,
        }
    }

    /// Validates the header and reads the root value. Rejects trailing
    /// garbage.
    pub fn deserialize(mut self) -> VmResult<Value> {
        let magic = self.reader.read_bytes(4).map_err(bad)?;
        if magic != STREAM_MAGIC {
            return Err(VmError::restore("bad stream magic"));
        }
        let version = self.reader.read_u8().map_err(bad)?;
        if version != STREAM_VERSION {
            return Err(VmError::restore(format!(
                "unsupported stream version {version}"
            )));
        }
        let expected_permanents = self.reader.read_var_u32().map_err(bad)? as usize;
        if expected_permanents != self.permanents.len() {
            return Err(VmError::restore(format!(
                "permanents table size mismatch: stream expects {expected_permanents}, have {}",
                self.permanents.len()
            )));
        }
        let root = self.read_value()?;
        if self.reader.remaining() != 0 {
            return Err(VmError::restore("trailing bytes after stream root"));
        }
        log::debug!("restored {} objects", self.memo.len());
        Ok(root)
    }

    fn enter(&mut self) -> VmResult<()> {
        self.depth += 1;
        if self.depth > self.depth_limit {
            return Err(VmError::restore("value graph exceeds depth limit"));
        }
        Ok(())
    }

    fn reserve(&mut self) -> usize {
        self.memo.push(None);
        self.memo.len() - 1
    }

    fn fill(&mut self, index: usize, object: GcRef) {
        self.memo[index] = Some(object);
    }

    fn resolve_backref(&mut self) -> VmResult<GcRef> {
        let index = self.reader.read_var_u32().map_err(bad)? as usize;
        self.memo
            .get(index)
            .copied()
            .flatten()
            .ok_or_else(|| VmError::restore(format!("dangling back-reference {index}")))
    }

    fn resolve_permanent(&mut self) -> VmResult<GcRef> {
        let key_bytes = self.reader.read_var_bytes(4096).map_err(bad)?;
        let key = String::from_utf8_lossy(&key_bytes).into_owned();
        self.permanents
            .object_for(&key)
            .ok_or(VmError::UnknownPermanent { key })
    }

    fn scratch_globals(&mut self) -> VmResult<TableRef> {
        if let Some(t) = self.scratch_globals {
            return Ok(t);
        }
        let t = self.heap.new_table(Table::new())?;
        self.scratch_globals = Some(t);
        Ok(t)
    }

    fn read_value(&mut self) -> VmResult<Value> {
        self.enter()?;
        let result = self.read_value_inner();
        self.depth -= 1;
        result
    }

    fn read_value_inner(&mut self) -> VmResult<Value> {
        let kind = self.reader.read_u8().map_err(bad)?;
        match kind {
            tag::NIL => Ok(Value::Nil),
            tag::FALSE => Ok(Value::Boolean(false)),
            tag::TRUE => Ok(Value::Boolean(true)),
            tag::NUMBER => Ok(Value::Number(self.reader.read_f64().map_err(bad)?)),
            tag::VECTOR => {
                let mut v = [0f32; 4];
                for lane in &mut v {
                    *lane = self.reader.read_f32().map_err(bad)?;
                }
                Ok(Value::Vector(v))
            }
            tag::LIGHT_USERDATA => {
                let data = self.reader.read_u64().map_err(bad)?;
                let t = self.reader.read_u8().map_err(bad)?;
                Ok(Value::LightUserdata { data, tag: t })
            }
            tag::PERMANENT => {
                let object = self.resolve_permanent()?;
                gcref_to_value(object)
                    .ok_or_else(|| VmError::restore("permanent key names a non-value object"))
            }
            tag::BACKREF => {
                let object = self.resolve_backref()?;
                gcref_to_value(object)
                    .ok_or_else(|| VmError::restore("back-reference names a non-value object"))
            }
            tag::STRING => {
                let index = self.reserve();
                let bytes = self.reader.read_var_bytes(MAX_BYTES).map_err(bad)?;
                let s = self.heap.intern(&bytes)?;
                self.fill(index, GcRef::String(s));
                Ok(Value::String(s))
            }
            tag::TABLE => self.read_table().map(Value::Table),
            tag::SCRIPT_CLOSURE => self.read_script_closure().map(Value::Closure),
            tag::NATIVE_CLOSURE => self.read_native_closure().map(Value::Closure),
            tag::THREAD => self.read_thread().map(Value::Thread),
            tag::USERDATA => self.read_userdata().map(Value::Userdata),
            tag::BUFFER => {
                let index = self.reserve();
                let bytes = self.reader.read_var_bytes(MAX_BYTES).map_err(bad)?;
                let b = self.heap.new_buffer(Buffer::from_bytes(bytes))?;
                self.fill(index, GcRef::Buffer(b));
                Ok(Value::Buffer(b))
            }
            other => Err(VmError::restore(format!(
                "unknown value discriminator {other:#04x}"
            ))),
        }
    }

    fn read_table(&mut self) -> VmResult<TableRef> {
        let index = self.reserve();
        let shell = self.heap.new_table(Table::new())?;
        self.fill(index, GcRef::Table(shell));

        let array_size = self.reader.read_var_u64(MAX_ITEMS).map_err(bad)? as usize;
        let node_capacity = self.reader.read_var_u64(MAX_ITEMS).map_err(bad)? as usize;
        let live_count = self.reader.read_var_u64(MAX_ITEMS).map_err(bad)? as usize;

        let mut array = Vec::with_capacity(array_size);
        for _ in 0..array_size {
            array.push(self.read_value()?);
        }
        let mut pairs = Vec::with_capacity(live_count);
        for _ in 0..live_count {
            let key = self.read_value()?;
            let value = self.read_value()?;
            pairs.push((key, value));
        }
        let readonly = self.reader.read_bool().map_err(bad)?;
        let safe_env = self.reader.read_bool().map_err(bad)?;
        let fallback = match self.read_value()? {
            Value::Nil => None,
            Value::Table(t) => Some(t),
            other => {
                return Err(VmError::restore(format!(
                    "table fallback must be a table, got {}",
                    other.type_name()
                )))
            }
        };
        let order_len = self.reader.read_var_u64(MAX_ITEMS).map_err(bad)? as usize;
        let mut order = Vec::with_capacity(order_len);
        for _ in 0..order_len {
            order.push(decode_order_entry(self.reader.read_var_u32().map_err(bad)?));
        }

        let table = Table::from_parts(
            array,
            node_capacity,
            pairs,
            Some(order),
            readonly,
            safe_env,
            fallback,
        )?;
        *self.heap.table_mut(shell) = table;
        let size = self.heap.table(shell).byte_size();
        self.heap.recharge(GcRef::Table(shell), size)?;
        Ok(shell)
    }

    fn read_proto(&mut self) -> VmResult<ProtoRef> {
        let kind = self.reader.read_u8().map_err(bad)?;
        match kind {
            tag::PERMANENT => match self.resolve_permanent()? {
                GcRef::Proto(p) => Ok(p),
                _ => Err(VmError::restore("permanent key is not a prototype")),
            },
            tag::BACKREF => match self.resolve_backref()? {
                GcRef::Proto(p) => Ok(p),
                _ => Err(VmError::restore("back-reference is not a prototype")),
            },
            tag::PROTO => {
                let index = self.reserve();
                let num_params = self.reader.read_u8().map_err(bad)?;
                let num_upvalues = self.reader.read_u8().map_err(bad)?;
                let max_stack = self.reader.read_u8().map_err(bad)?;
                let flags = ProtoFlags::from_bits(self.reader.read_u8().map_err(bad)?)
                    .ok_or_else(|| VmError::restore("unknown prototype flag bits"))?;

                let code_len = self.reader.read_var_u64(MAX_ITEMS).map_err(bad)? as usize;
                let mut code = Vec::with_capacity(code_len);
                for _ in 0..code_len {
                    code.push(self.reader.read_u32().map_err(bad)?);
                }
                let const_count = self.reader.read_var_u64(MAX_ITEMS).map_err(bad)? as usize;
                let mut constants = Vec::with_capacity(const_count);
                for _ in 0..const_count {
                    constants.push(self.read_value()?);
                }
                let capture_count = self.reader.read_var_u64(255).map_err(bad)? as usize;
                let mut captures = Vec::with_capacity(capture_count);
                for _ in 0..capture_count {
                    let kind = self.reader.read_u8().map_err(bad)?;
                    let operand = self.reader.read_u8().map_err(bad)?;
                    captures.push(match kind {
                        0 => Capture::Local(operand),
                        1 => Capture::Upvalue(operand),
                        other => {
                            return Err(VmError::restore(format!(
                                "unknown capture kind {other}"
                            )))
                        }
                    });
                }
                let child_count = self.reader.read_var_u64(MAX_ITEMS).map_err(bad)? as usize;
                let mut children = Vec::with_capacity(child_count);
                for _ in 0..child_count {
                    children.push(self.read_proto()?);
                }
                let line_count = self.reader.read_var_u64(MAX_ITEMS).map_err(bad)? as usize;
                let mut debug_lines = Vec::with_capacity(line_count);
                for _ in 0..line_count {
                    debug_lines.push(self.reader.read_var_u32().map_err(bad)?);
                }
                let source = match self.read_value()? {
                    Value::Nil => None,
                    Value::String(s) => Some(s),
                    other => {
                        return Err(VmError::restore(format!(
                            "prototype source must be a string, got {}",
                            other.type_name()
                        )))
                    }
                };

                let proto = Proto {
                    num_params,
                    num_upvalues,
                    max_stack,
                    flags,
                    code,
                    constants,
                    captures,
                    children,
                    debug_lines,
                    source,
                };
                // The same static checks the loader applies; a stream that
                // fails them is rejected, not executed.
                crate::bytecode::loader::verify_proto(&proto)
                    .map_err(|e| VmError::restore(e.to_string()))?;
                let p = self.heap.new_proto(proto)?;
                self.fill(index, GcRef::Proto(p));
                Ok(p)
            }
            other => Err(VmError::restore(format!(
                "expected a prototype, found discriminator {other:#04x}"
            ))),
        }
    }

    fn read_upvalue(&mut self) -> VmResult<UpvalueRef> {
        let kind = self.reader.read_u8().map_err(bad)?;
        match kind {
            tag::BACKREF => match self.resolve_backref()? {
                GcRef::Upvalue(u) => Ok(u),
                _ => Err(VmError::restore("back-reference is not an upvalue")),
            },
            tag::UPVALUE => {
                let index = self.reserve();
                // Shell first: the cell may be reached again through the
                // graph below it.
                let shell = self.heap.new_upvalue(Upvalue::Closed(Value::Nil))?;
                self.fill(index, GcRef::Upvalue(shell));
                let open = self.reader.read_u8().map_err(bad)?;
                match open {
                    0 => {
                        let value = self.read_value()?;
                        *self.heap.upvalue_mut(shell) = Upvalue::Closed(value);
                    }
                    1 => {
                        let owner = match self.read_value()? {
                            Value::Thread(t) => t,
                            other => {
                                return Err(VmError::restore(format!(
                                    "open upvalue owner must be a task, got {}",
                                    other.type_name()
                                )))
                            }
                        };
                        let slot = self.reader.read_var_u32().map_err(bad)? as usize;
                        *self.heap.upvalue_mut(shell) = Upvalue::Open {
                            thread: owner,
                            slot,
                        };
                        self.link_open_upvalue(owner, shell, slot);
                    }
                    other => {
                        return Err(VmError::restore(format!(
                            "unknown upvalue state {other}"
                        )))
                    }
                }
                Ok(shell)
            }
            other => Err(VmError::restore(format!(
                "expected an upvalue, found discriminator {other:#04x}"
            ))),
        }
    }

    /// Relinks a restored open upvalue into its owner's list, keeping the
    /// slot ordering.
    fn link_open_upvalue(&mut self, owner: ThreadRef, cell: UpvalueRef, slot: usize) {
        let position = {
            let t = self.heap.thread(owner);
            if t.open_upvalues.contains(&cell) {
                return;
            }
            t.open_upvalues
                .iter()
                .position(|&other| match self.heap.upvalue(other) {
                    Upvalue::Open { slot: s, .. } => *s > slot,
                    Upvalue::Closed(_) => false,
                })
                .unwrap_or(t.open_upvalues.len())
        };
        self.heap
            .thread_mut(owner)
            .open_upvalues
            .insert(position, cell);
    }

    fn read_script_closure(&mut self) -> VmResult<crate::value::ClosureRef> {
        let index = self.reserve();
        let proto = self.read_proto()?;
        let shell = self.heap.new_closure(Closure::Script(ScriptClosure {
            proto,
            upvalues: Vec::new(),
        }))?;
        self.fill(index, GcRef::Closure(shell));

        let count = self.reader.read_var_u64(255).map_err(bad)? as usize;
        if count != self.heap.proto(proto).num_upvalues as usize {
            return Err(VmError::restore("closure upvalue count mismatch"));
        }
        let mut upvalues = Vec::with_capacity(count);
        for _ in 0..count {
            upvalues.push(self.read_upvalue()?);
        }
        match self.heap.closure_mut(shell) {
            Closure::Script(sc) => sc.upvalues = upvalues,
            Closure::Native(_) => unreachable!("created as script closure"),
        }
        Ok(shell)
    }

    fn read_native_closure(&mut self) -> VmResult<crate::value::ClosureRef> {
        let index = self.reserve();
        let name_bytes = self.reader.read_var_bytes(4096).map_err(bad)?;
        let name = String::from_utf8_lossy(&name_bytes).into_owned();
        let func = self
            .natives
            .lookup(&name)
            .ok_or_else(|| VmError::restore(format!("unknown native function '{name}'")))?;
        let shell = self.heap.new_closure(Closure::Native(NativeClosure {
            func,
            upvalues: Vec::new(),
        }))?;
        self.fill(index, GcRef::Closure(shell));

        let count = self.reader.read_var_u64(255).map_err(bad)? as usize;
        let mut upvalues = Vec::with_capacity(count);
        for _ in 0..count {
            upvalues.push(self.read_value()?);
        }
        match self.heap.closure_mut(shell) {
            Closure::Native(nc) => nc.upvalues = upvalues,
            Closure::Script(_) => unreachable!("created as native closure"),
        }
        Ok(shell)
    }

    fn read_thread(&mut self) -> VmResult<ThreadRef> {
        let index = self.reserve();
        let scratch = self.scratch_globals()?;
        let shell = self
            .heap
            .new_thread(Thread::new(scratch, TaskIdentity::User, None))?;
        self.fill(index, GcRef::Thread(shell));

        let status_byte = self.reader.read_u8().map_err(bad)?;
        let status = match status_byte {
            status::FRESH => ThreadStatus::Fresh,
            status::SUSPENDED => ThreadStatus::Suspended,
            status::BREAK_SUSPENDED => ThreadStatus::BreakSuspended,
            status::FINISHED => ThreadStatus::Finished,
            other => {
                return Err(VmError::restore(format!(
                    "unknown task status {other}"
                )))
            }
        };
        let memcat = self.reader.read_u8().map_err(bad)?;
        let globals = match self.read_value()? {
            Value::Table(t) => t,
            other => {
                return Err(VmError::restore(format!(
                    "task globals must be a table, got {}",
                    other.type_name()
                )))
            }
        };
        let parent = match self.read_value()? {
            Value::Nil => None,
            Value::Thread(t) => Some(t),
            other => {
                return Err(VmError::restore(format!(
                    "task parent must be a task, got {}",
                    other.type_name()
                )))
            }
        };

        let stack_len = self.reader.read_var_u64(MAX_ITEMS).map_err(bad)? as usize;
        let mut stack = Vec::with_capacity(stack_len);
        for _ in 0..stack_len {
            stack.push(self.read_value()?);
        }

        let frame_count = self.reader.read_var_u64(MAX_ITEMS).map_err(bad)? as usize;
        let mut frames = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            let closure = match self.read_value()? {
                Value::Closure(c) => c,
                other => {
                    return Err(VmError::restore(format!(
                        "frame closure must be a function, got {}",
                        other.type_name()
                    )))
                }
            };
            let pc = self.reader.read_var_u32().map_err(bad)? as usize;
            let base = self.reader.read_var_u32().map_err(bad)? as usize;
            let ret_base = self.reader.read_var_u32().map_err(bad)? as usize;
            let nresults = self.reader.read_u8().map_err(bad)?;
            let vararg_base = self.reader.read_var_u32().map_err(bad)? as usize;
            let vararg_count = self.reader.read_var_u32().map_err(bad)? as usize;
            let awaiting_kind = self.reader.read_u8().map_err(bad)?;
            let awaiting_state = match awaiting_kind {
                awaiting::NONE => None,
                awaiting::RESUME => Some(NativeAwait::Resume),
                awaiting::CALL => {
                    let ret_slot = self.reader.read_var_u32().map_err(bad)?;
                    let want = self.reader.read_u8().map_err(bad)?;
                    let protected = self.reader.read_bool().map_err(bad)?;
                    Some(NativeAwait::Call {
                        ret_slot,
                        nresults: want,
                        protected,
                    })
                }
                other => {
                    return Err(VmError::restore(format!(
                        "unknown frame await state {other}"
                    )))
                }
            };

            // Saved counters must land inside the function they suspend.
            if let Closure::Script(sc) = self.heap.closure(closure) {
                if pc > self.heap.proto(sc.proto).code.len() {
                    return Err(VmError::restore("frame program counter out of range"));
                }
            }
            if base > stack.len() || ret_base > stack.len() {
                return Err(VmError::restore("frame base outside the restored stack"));
            }

            frames.push(Frame {
                closure,
                base,
                pc,
                ret_base,
                nresults,
                vararg_base,
                vararg_count,
                awaiting: awaiting_state,
            });
        }

        {
            let t = self.heap.thread_mut(shell);
            t.status = status;
            t.memcat = memcat;
            t.globals = globals;
            t.parent = parent;
            t.stack = stack;
            t.frames = frames;
        }

        // Open upvalues relink themselves into the thread as they are read.
        let upvalue_count = self.reader.read_var_u64(MAX_ITEMS).map_err(bad)? as usize;
        for _ in 0..upvalue_count {
            self.read_upvalue()?;
        }

        let size = self.heap.thread(shell).byte_size();
        self.heap.recharge(GcRef::Thread(shell), size)?;
        Ok(shell)
    }

    fn read_userdata(&mut self) -> VmResult<crate::value::UserdataRef> {
        let index = self.reserve();
        let userdata_tag = self.reader.read_u8().map_err(bad)?;
        let shell = self.heap.new_userdata(Userdata::raw(userdata_tag, Vec::new()))?;
        self.fill(index, GcRef::Userdata(shell));

        let metatable = match self.read_value()? {
            Value::Nil => None,
            Value::Table(t) => Some(t),
            other => {
                return Err(VmError::restore(format!(
                    "userdata metatable must be a table, got {}",
                    other.type_name()
                )))
            }
        };

        let payload_kind = self.reader.read_u8().map_err(bad)?;
        let body = match payload_kind {
            payload::RAW => {
                UserdataPayload::Raw(self.reader.read_var_bytes(MAX_BYTES).map_err(bad)?)
            }
            payload::CUSTOM => {
                let bytes = self.reader.read_var_bytes(MAX_BYTES).map_err(bad)?;
                let codec = self.codecs.get(&userdata_tag).ok_or_else(|| {
                    VmError::restore(format!(
                        "no codec registered for userdata tag {userdata_tag}"
                    ))
                })?;
                (codec.decode)(userdata_tag, bytes)?.payload
            }
            payload::EVENT_MANAGER => {
                let channel_count =
                    self.reader.read_var_u64(MAX_ITEMS).map_err(bad)? as usize;
                let mut channels = Vec::with_capacity(channel_count);
                for _ in 0..channel_count {
                    let name_bytes = self.reader.read_var_bytes(4096).map_err(bad)?;
                    let name = String::from_utf8_lossy(&name_bytes).into_owned();
                    let entry_count =
                        self.reader.read_var_u64(MAX_ITEMS).map_err(bad)? as usize;
                    let mut entries = Vec::with_capacity(entry_count);
                    for _ in 0..entry_count {
                        let handle = self.reader.read_u64().map_err(bad)?;
                        let once = self.reader.read_bool().map_err(bad)?;
                        let func = self.read_value()?;
                        entries.push(HandlerEntry { handle, func, once });
                    }
                    channels.push((name, entries));
                }
                let next_handle = self.reader.read_u64().map_err(bad)?;
                let dispatching = self.reader.read_bool().map_err(bad)?;
                UserdataPayload::EventManager(EventManager::from_parts(
                    channels,
                    next_handle,
                    dispatching,
                ))
            }
            payload::TIMER_MANAGER => {
                let record_count =
                    self.reader.read_var_u64(MAX_ITEMS).map_err(bad)? as usize;
                let mut records = Vec::with_capacity(record_count);
                for _ in 0..record_count {
                    let handle = self.reader.read_u64().map_err(bad)?;
                    let interval = self.reader.read_f64().map_err(bad)?;
                    let next_due = self.reader.read_f64().map_err(bad)?;
                    let one_shot = self.reader.read_bool().map_err(bad)?;
                    let func = self.read_value()?;
                    records.push(TimerRecord {
                        handle,
                        func,
                        interval,
                        next_due,
                        one_shot,
                    });
                }
                let next_handle = self.reader.read_u64().map_err(bad)?;
                let ticking = self.reader.read_bool().map_err(bad)?;
                UserdataPayload::TimerManager(TimerManager::from_parts(
                    records,
                    next_handle,
                    ticking,
                    self.timer_catchup.0,
                    self.timer_catchup.1,
                ))
            }
            other => {
                return Err(VmError::restore(format!(
                    "unknown userdata payload kind {other}"
                )))
            }
        };

        {
            let ud = self.heap.userdata_mut(shell);
            ud.metatable = metatable;
            ud.payload = body;
        }
        let size = self.heap.userdata(shell).byte_size();
        self.heap.recharge(GcRef::Userdata(shell), size)?;
        Ok(shell)
    }
}
