//! The execution engine: dispatch loop, call and return machinery,
//! safepoint interrupts, and the break/yield suspension protocol.
//!
//! One engine owns one heap and is driven by one host thread. Tasks are
//! scheduled cooperatively: the embedder calls [`ExecutionEngine::resume`],
//! and the engine runs until the task yields, is broken by the interrupt
//! callback, finishes, or fails. Native functions participate through
//! [`NativeControl`] and registered continuations, so a task suspended
//! inside a native call is an ordinary, persistable state.

use hashbrown::HashMap;
use once_cell::sync::Lazy;

use crate::ares::Permanents;
use crate::bytecode::{Instr, OpCode, MULTI};
use crate::closure::{Closure, NativeClosure, ScriptClosure};
use crate::config::VmConfig;
use crate::error::{VmError, VmResult, OUT_OF_MEMORY_MESSAGE};
use crate::heap::{GcRef, Heap};
use crate::hooks::{
    Callbacks, InterruptAction, Yieldability, HINT_GC_STEP, HINT_USER,
};
use crate::native::{
    ContinuationFn, ContinuationInput, NativeCall, NativeControl, NativeFn, NativeRegistry,
};
use crate::ops::{self, ArithOp};
use crate::table::Table;
use crate::thread::{NativeAwait, TaskIdentity, Thread, ThreadStatus};
use crate::value::{ClosureRef, TableRef, ThreadRef, UserdataRef, Value};

/// Why `resume` returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Resumption {
    /// The task yielded these values.
    Yield(Vec<Value>),
    /// The host broke the task at a safepoint; no values.
    Break,
    /// The task's initial function returned these values.
    Finished(Vec<Value>),
    /// An uncaught error terminated the task with this value.
    Error(Value),
}

/// Internal control flow of the dispatch machinery.
pub(crate) enum Flow {
    Continue,
    Suspend(Resumption),
}

/// Per-instance service handles, created on fork.
pub(crate) struct InstanceState {
    pub events: UserdataRef,
    pub timers: UserdataRef,
    pub handler: Option<ThreadRef>,
}

/// The virtual machine.
pub struct ExecutionEngine {
    pub(crate) heap: Heap,
    pub(crate) config: VmConfig,
    pub(crate) natives: NativeRegistry,
    pub callbacks: Callbacks,
    pub(crate) permanents: Permanents,
    pub(crate) registry: TableRef,
    pub(crate) grandparent: ThreadRef,
    pub(crate) forker: ThreadRef,
    pub(crate) base_image: Option<ThreadRef>,
    pub(crate) instances: HashMap<ThreadRef, InstanceState>,
    pub(crate) userdata_codecs: HashMap<u8, crate::ares::format::UserdataCodec>,
    current_thread: Option<ThreadRef>,
}

/// Builtin natives installed into every engine. Names with a dot are
/// internal helpers; bare names are also bound as globals.
static BUILTIN_NATIVES: Lazy<
    Vec<(&'static str, NativeFn, Option<ContinuationFn>, Option<&'static str>)>,
> = Lazy::new(|| {
    vec![
        ("task.yield", native_yield as NativeFn, Some(native_yield_cont as ContinuationFn), Some("yield")),
        ("task.wrap", native_wrap_apply, Some(native_wrap_cont), None),
        ("next", native_next, None, Some("next")),
        ("pcall", native_pcall, Some(native_pcall_cont), Some("pcall")),
        ("error", native_error, None, Some("error")),
        ("type", native_type, None, Some("type")),
    ]
});

impl ExecutionEngine {
    /// Creates an engine: heap, builtin globals, the grandparent and forker
    /// kernel tasks, and the default permanents.
    pub fn new(config: VmConfig) -> VmResult<Self> {
        let mut heap = Heap::new(&config);

        // The out-of-memory message must never allocate at raise time.
        let oom = heap.intern(OUT_OF_MEMORY_MESSAGE.as_bytes())?;
        heap.fix_reachable(GcRef::String(oom));

        let mut natives = NativeRegistry::new();
        for (name, func, cont, _) in BUILTIN_NATIVES.iter() {
            natives.register(name, *func, *cont, true)?;
        }
        crate::events::register_natives(&mut natives)?;
        crate::timers::register_natives(&mut natives)?;

        let mut builtin_globals = Table::new();
        builtin_globals.safe_env = true;
        let globals = heap.new_table(builtin_globals)?;

        let grandparent =
            heap.new_thread(Thread::new(globals, TaskIdentity::Kernel, None))?;
        let forker = heap.new_thread(Thread::new(
            globals,
            TaskIdentity::Kernel,
            Some(grandparent),
        ))?;
        let registry = heap.new_table(Table::new())?;

        heap.add_root(GcRef::Thread(grandparent));
        heap.add_root(GcRef::Thread(forker));
        heap.add_root(GcRef::Table(registry));

        let mut engine = ExecutionEngine {
            heap,
            config,
            natives,
            callbacks: Callbacks::default(),
            permanents: Permanents::new(),
            registry,
            grandparent,
            forker,
            base_image: None,
            instances: HashMap::new(),
            userdata_codecs: HashMap::new(),
            current_thread: None,
        };

        engine.register_permanent("globals:builtin", Value::Table(globals))?;
        let (grandparent_ref, forker_ref) = (engine.grandparent, engine.forker);
        engine.register_permanent("thread:builtin", Value::Thread(grandparent_ref))?;
        engine.register_permanent("thread:forker", Value::Thread(forker_ref))?;

        for (name, _, _, global_name) in BUILTIN_NATIVES.iter() {
            let closure = engine.make_native_closure(name, Vec::new())?;
            engine.register_permanent(&format!("fn:{name}"), closure)?;
            if let Some(global) = global_name {
                let key = Value::String(engine.heap.intern(global.as_bytes())?);
                engine.heap.table_set(globals, key, closure)?;
            }
        }
        // The grandparent owns only builtins and never changes again.
        engine.heap.table_mut(globals).readonly = true;
        engine.heap.fix_reachable(GcRef::Table(globals));

        Ok(engine)
    }

    // ---- accessors -----------------------------------------------------

    /// The heap, for reading values back out.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The heap, mutably.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// The engine configuration.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The native registry.
    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    /// The permanents table.
    pub fn permanents(&self) -> &Permanents {
        &self.permanents
    }

    /// The VM-wide registry table, a collection root for embedder
    /// references.
    pub fn registry(&self) -> TableRef {
        self.registry
    }

    /// Registers an additional permanent object. Permanents are pinned:
    /// the well-known objects they name must outlive any stream that
    /// references them.
    pub fn register_permanent(&mut self, key: &str, value: Value) -> VmResult<()> {
        self.permanents.register(key, value)?;
        if let Some(object) = GcRef::from_value(value) {
            self.heap.add_root(object);
        }
        Ok(())
    }

    /// Registers an embedder native function.
    pub fn register_native(
        &mut self,
        name: &str,
        func: NativeFn,
        continuation: Option<ContinuationFn>,
        persistable: bool,
    ) -> VmResult<()> {
        self.natives.register(name, func, continuation, persistable)?;
        Ok(())
    }

    /// Interns a string and returns it as a value.
    pub fn intern_value(&mut self, s: &str) -> VmResult<Value> {
        Ok(Value::String(self.heap.intern(s.as_bytes())?))
    }

    /// Creates a closure over a registered native.
    pub fn make_native_closure(
        &mut self,
        name: &str,
        upvalues: Vec<Value>,
    ) -> VmResult<Value> {
        let func = self
            .natives
            .lookup(name)
            .ok_or_else(|| VmError::internal(format!("unknown native '{name}'")))?;
        let closure = self
            .heap
            .new_closure(Closure::Native(NativeClosure { func, upvalues }))?;
        Ok(Value::Closure(closure))
    }

    /// Wraps a task in a callable that resumes it, per the
    /// serialization-transparent wrapper pattern: the task is the sole
    /// upvalue and the driver is a registered, persistable native.
    pub fn wrap_task(&mut self, task: ThreadRef) -> VmResult<Value> {
        self.make_native_closure("task.wrap", vec![Value::Thread(task)])
    }

    // ---- task management -----------------------------------------------

    /// Creates a task running `entry`, inheriting the parent's globals and
    /// memory category. The task is pinned until [`discard_task`].
    ///
    /// [`discard_task`]: ExecutionEngine::discard_task
    pub fn spawn_task(&mut self, parent: ThreadRef, entry: Value) -> VmResult<ThreadRef> {
        let Value::Closure(_) = entry else {
            return Err(VmError::runtime(format!(
                "cannot spawn a task from a {} value",
                entry.type_name()
            )));
        };
        let (globals, memcat) = {
            let p = self.heap.thread(parent);
            (p.globals, p.memcat)
        };
        let mut thread = Thread::new(globals, TaskIdentity::User, Some(parent));
        thread.memcat = memcat;
        thread.stack.push(entry);
        let handle = self.heap.new_thread(thread)?;
        self.heap.add_root(GcRef::Thread(handle));
        if let Some(cb) = self.callbacks.userthread.as_mut() {
            cb(Some(parent), handle);
        }
        Ok(handle)
    }

    /// Unpins a task; cancellation is dropping the last reference.
    pub fn discard_task(&mut self, task: ThreadRef) {
        self.heap.remove_root(GcRef::Thread(task));
        if let Some(cb) = self.callbacks.userthread.as_mut() {
            cb(None, task);
        }
    }

    /// Current status of a task.
    pub fn task_status(&self, task: ThreadRef) -> ThreadStatus {
        self.heap.thread(task).status
    }

    /// Assigns the memory category charged while a task runs.
    pub fn set_task_memcat(&mut self, task: ThreadRef, memcat: u8) {
        self.heap.thread_mut(task).memcat = memcat;
    }

    /// Reads a global through the instance-to-base fallback chain.
    pub fn get_global(&mut self, task: ThreadRef, name: &str) -> VmResult<Value> {
        let key = Value::String(self.heap.intern(name.as_bytes())?);
        let globals = self.heap.thread(task).globals;
        Ok(self.table_get_chained(globals, key))
    }

    /// Writes a global of the task's own globals table.
    pub fn set_global(&mut self, task: ThreadRef, name: &str, value: Value) -> VmResult<()> {
        let key = Value::String(self.heap.intern(name.as_bytes())?);
        let globals = self.heap.thread(task).globals;
        self.heap.table_set(globals, key, value)
    }

    /// Table read following the fallback chain: instance globals defer to
    /// the base image's, which defer to the builtins. The hop bound guards
    /// against a cyclic chain arriving from a hostile stream.
    pub(crate) fn table_get_chained(&self, table: TableRef, key: Value) -> Value {
        let mut current = table;
        for _ in 0..16 {
            let value = self.heap.table(current).get(key);
            if !value.is_nil() {
                return value;
            }
            match self.heap.table(current).fallback {
                Some(fallback) => current = fallback,
                None => return Value::Nil,
            }
        }
        Value::Nil
    }

    /// Classifies whether a cooperative suspension is safe right now.
    pub fn probe_yieldability(&self, task: ThreadRef) -> Yieldability {
        let thread = self.heap.thread(task);
        let Some(frame) = thread.frames.last() else {
            return Yieldability::BadFrame;
        };
        if thread.frames.len() >= self.config.call_depth_limit {
            return Yieldability::CallDepthTooDeep;
        }
        match self.heap.closure(frame.closure) {
            Closure::Script(sc) => {
                if frame.pc > self.heap.proto(sc.proto).code.len() {
                    Yieldability::InvalidProgramCounter
                } else {
                    Yieldability::Ok
                }
            }
            Closure::Native(nc) => {
                if self.natives.get(nc.func).continuation.is_some() {
                    Yieldability::Ok
                } else {
                    Yieldability::NotScriptFrame
                }
            }
        }
    }

    /// Resets a finished, failed, or suspended task. Returns `(true, None)`
    /// on success and `(false, Some(error))` for a task that died with an
    /// uncaught error.
    pub fn close_task(&mut self, task: ThreadRef) -> VmResult<(bool, Option<Value>)> {
        let status = self.heap.thread(task).status;
        match status {
            ThreadStatus::Running => Err(VmError::invalid_thread_state("close", "running")),
            ThreadStatus::Error => {
                let error = self.heap.thread(task).stack.last().copied();
                let t = self.heap.thread_mut(task);
                t.stack.clear();
                t.frames.clear();
                t.status = ThreadStatus::Finished;
                Ok((false, error))
            }
            _ => {
                self.heap.close_upvalues(task, 0);
                let t = self.heap.thread_mut(task);
                t.stack.clear();
                t.frames.clear();
                t.status = ThreadStatus::Finished;
                Ok((true, None))
            }
        }
    }

    /// Protected call from host code: runs `func` with `args` to
    /// completion on a scratch task under `parent`, catching script
    /// errors. Returns `(true, results)` on success and
    /// `(false, [error])` when the call failed; the failed activation is
    /// unwound back to the depth it started at, with the error object
    /// transferred as a value. A function that tries to suspend across
    /// the call is failed the same way. Only fatal errors propagate.
    pub fn call_protected(
        &mut self,
        parent: ThreadRef,
        func: Value,
        args: &[Value],
    ) -> VmResult<(bool, Vec<Value>)> {
        let task = self.spawn_task(parent, func)?;
        let resumption = match self.resume(task, args) {
            Ok(r) => r,
            Err(e) => {
                self.discard_task(task);
                return Err(e);
            }
        };
        self.discard_task(task);
        match resumption {
            Resumption::Finished(values) => Ok((true, values)),
            Resumption::Error(value) => Ok((false, vec![value])),
            Resumption::Yield(_) | Resumption::Break => {
                let message =
                    self.intern_value("attempt to suspend across a protected call")?;
                Ok((false, vec![message]))
            }
        }
    }

    // ---- resume --------------------------------------------------------

    /// Resumes a task. Fresh tasks start their entry function with `args`;
    /// a task suspended in a native continuation receives `args` as the
    /// resume values; a task suspended at a script safepoint discards them.
    pub fn resume(&mut self, task: ThreadRef, args: &[Value]) -> VmResult<Resumption> {
        let status = self.heap.thread(task).status;
        if !status.is_resumable() {
            return Err(VmError::invalid_thread_state("resume", status.name()));
        }

        let prev_thread = self.current_thread;
        let prev_memcat = self.heap.active_memcat();
        let memcat = self.heap.thread(task).memcat;
        self.current_thread = Some(task);
        self.heap.set_active_thread(Some(task));
        self.heap.set_active_memcat(memcat);
        let newly_rooted = !self.heap.roots.contains(&GcRef::Thread(task));
        if newly_rooted {
            self.heap.add_root(GcRef::Thread(task));
        }

        self.heap.thread_mut(task).status = ThreadStatus::Running;
        let entry = self.deliver_resume(task, status, args);
        let outcome = match entry {
            Ok(Flow::Suspend(resumption)) => Ok(resumption),
            Ok(Flow::Continue) => self.run_loop(task),
            Err(e) => Err(e),
        };

        self.current_thread = prev_thread;
        self.heap.set_active_thread(prev_thread);
        self.heap.set_active_memcat(prev_memcat);
        if newly_rooted {
            self.heap.remove_root(GcRef::Thread(task));
        }

        let resumption = match outcome {
            Ok(r) => r,
            Err(e) => {
                self.heap.thread_mut(task).status = ThreadStatus::Error;
                if let Some(panic) = self.callbacks.panic.as_mut() {
                    if e.is_fatal() {
                        panic(&e.to_string());
                    }
                }
                return Err(e);
            }
        };
        let new_status = match &resumption {
            Resumption::Yield(_) => ThreadStatus::Suspended,
            Resumption::Break => ThreadStatus::BreakSuspended,
            Resumption::Finished(_) => ThreadStatus::Finished,
            Resumption::Error(_) => ThreadStatus::Error,
        };
        self.heap.thread_mut(task).status = new_status;
        Ok(resumption)
    }

    fn deliver_resume(
        &mut self,
        task: ThreadRef,
        status: ThreadStatus,
        args: &[Value],
    ) -> VmResult<Flow> {
        match status {
            ThreadStatus::Fresh => {
                {
                    let t = self.heap.thread_mut(task);
                    if t.stack.is_empty() {
                        return Err(VmError::internal("fresh task without an entry function"));
                    }
                    t.stack.truncate(1);
                    t.stack.extend_from_slice(args);
                }
                self.call_at(task, 0, args.len(), MULTI)
            }
            ThreadStatus::Suspended | ThreadStatus::BreakSuspended => {
                let frame = self
                    .heap
                    .thread(task)
                    .frames
                    .last()
                    .cloned()
                    .ok_or_else(|| VmError::internal("suspended task without frames"))?;
                match frame.awaiting {
                    Some(NativeAwait::Resume) => {
                        // The resume values are appended above the frame's
                        // window — the window itself holds continuation
                        // state that must survive the suspension — and the
                        // continuation pops them with `take_resume_args`.
                        {
                            let t = self.heap.thread_mut(task);
                            let top = t.frames.last_mut().expect("frame vanished");
                            top.awaiting = None;
                            t.stack.extend_from_slice(args);
                        }
                        let continuation = self.continuation_of(frame.closure)?;
                        let ctx = NativeCall {
                            thread: task,
                            base: frame.base,
                            nargs: args.len(),
                        };
                        let input = ContinuationInput::Resumed { nargs: args.len() };
                        self.run_continuation(task, continuation, ctx, input)
                    }
                    // Interrupt-driven suspension in a script frame: the
                    // resume values are discarded by contract.
                    _ => Ok(Flow::Continue),
                }
            }
            other => Err(VmError::invalid_thread_state("resume", other.name())),
        }
    }

    fn continuation_of(&self, closure: ClosureRef) -> VmResult<ContinuationFn> {
        let Closure::Native(nc) = self.heap.closure(closure) else {
            return Err(VmError::internal("continuation requested for script frame"));
        };
        self.natives
            .get(nc.func)
            .continuation
            .ok_or_else(|| VmError::internal("native frame has no continuation"))
    }

    fn run_continuation(
        &mut self,
        task: ThreadRef,
        continuation: ContinuationFn,
        ctx: NativeCall,
        input: ContinuationInput,
    ) -> VmResult<Flow> {
        match continuation(self, ctx, input) {
            Ok(control) => self.handle_native_control(task, control),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => self.raise_vm_error(task, e),
        }
    }

    // ---- stack helpers -------------------------------------------------

    fn reg(&self, task: ThreadRef, index: usize) -> Value {
        self.heap
            .thread(task)
            .stack
            .get(index)
            .copied()
            .unwrap_or(Value::Nil)
    }

    fn set_reg(&mut self, task: ThreadRef, index: usize, value: Value) {
        let t = self.heap.thread_mut(task);
        if index >= t.stack.len() {
            t.stack.resize(index + 1, Value::Nil);
        }
        t.stack[index] = value;
    }

    fn set_pc(&mut self, task: ThreadRef, pc: usize) {
        self.heap
            .thread_mut(task)
            .frames
            .last_mut()
            .expect("no frame for pc writeback")
            .pc = pc;
    }

    /// Replaces a native frame's window with result values.
    pub fn set_native_results(&mut self, ctx: NativeCall, values: &[Value]) {
        let t = self.heap.thread_mut(ctx.thread);
        t.stack.truncate(ctx.base);
        t.stack.extend_from_slice(values);
    }

    /// Pops the resume values delivered to a continuation. They sit above
    /// the frame's preserved window; every `Resumed` continuation must
    /// consume (or discard) them exactly once.
    pub fn take_resume_args(&mut self, ctx: NativeCall, nargs: usize) -> Vec<Value> {
        let t = self.heap.thread_mut(ctx.thread);
        let start = t.stack.len().saturating_sub(nargs);
        let args = t.stack[start..].to_vec();
        t.stack.truncate(start);
        args
    }

    /// Argument of the current native invocation, nil when absent.
    pub fn native_arg(&self, ctx: NativeCall, index: usize) -> Value {
        if index < ctx.nargs {
            self.reg(ctx.thread, ctx.base + index)
        } else {
            Value::Nil
        }
    }

    /// Reads any slot of the current native frame's window, past the
    /// original argument count. Continuation state lives here.
    pub fn native_arg_window(&self, ctx: NativeCall, slot: usize) -> Value {
        self.reg(ctx.thread, ctx.base + slot)
    }

    /// Writes a slot of the current native frame's window.
    pub fn set_native_window(&mut self, ctx: NativeCall, slot: usize, value: Value) {
        self.set_reg(ctx.thread, ctx.base + slot, value);
    }

    /// Upvalues of the native closure on top of the task's frame stack.
    pub fn native_upvalue(&self, task: ThreadRef, index: usize) -> Value {
        let Some(frame) = self.heap.thread(task).frames.last() else {
            return Value::Nil;
        };
        match self.heap.closure(frame.closure) {
            Closure::Native(nc) => nc.upvalues.get(index).copied().unwrap_or(Value::Nil),
            Closure::Script(_) => Value::Nil,
        }
    }

    // ---- interrupts ----------------------------------------------------

    pub(crate) fn interrupt_action(&mut self, task: ThreadRef, hint: i32) -> InterruptAction {
        let probe = self.probe_yieldability(task);
        match self.callbacks.interrupt.as_mut() {
            Some(cb) => cb(task, hint, probe),
            None => InterruptAction::Continue,
        }
    }

    /// Safepoint: collector work first, then the embedder's interrupt.
    fn safepoint(&mut self, task: ThreadRef, hint: i32) -> VmResult<Flow> {
        self.heap.note_safepoint();
        let hint = if self.heap.gc_should_step() {
            self.heap.gc_step();
            HINT_GC_STEP
        } else {
            hint
        };
        match self.interrupt_action(task, hint) {
            InterruptAction::Continue => Ok(Flow::Continue),
            InterruptAction::Break => Ok(Flow::Suspend(Resumption::Break)),
            InterruptAction::Yield => {
                if !self.probe_yieldability(task).is_suspendable(false) {
                    return Err(VmError::internal(
                        "interrupt requested a yield at a non-suspendable point",
                    ));
                }
                Ok(Flow::Suspend(Resumption::Yield(Vec::new())))
            }
        }
    }

    // ---- error handling ------------------------------------------------

    /// Converts an engine error into a script error value (with source
    /// position when available) and unwinds. Fatal errors propagate.
    pub(crate) fn raise_vm_error(&mut self, task: ThreadRef, error: VmError) -> VmResult<Flow> {
        if error.is_fatal() {
            return Err(error);
        }
        let message = match self.current_location(task) {
            Some(location) => format!("{location}: {}", error.script_message()),
            None => error.script_message(),
        };
        let value = Value::String(self.heap.intern(message.as_bytes())?);
        self.raise_value(task, value)
    }

    /// Renders the task's call stack, innermost frame first, resolving
    /// program counters through the debug line tables.
    pub fn traceback(&self, task: ThreadRef) -> String {
        let thread = self.heap.thread(task);
        let mut out = String::from("stack traceback:");
        for frame in thread.frames.iter().rev() {
            match self.heap.closure(frame.closure) {
                Closure::Script(sc) => {
                    let proto = self.heap.proto(sc.proto);
                    let source = proto
                        .source
                        .map(|s| self.heap.string_lossy(s).into_owned())
                        .unwrap_or_else(|| "?".to_string());
                    match proto.line_at(frame.pc.saturating_sub(1)) {
                        Some(line) => {
                            out.push_str(&format!("\n\t{source}:{line}: in function"))
                        }
                        None => out.push_str(&format!("\n\t{source}: in function")),
                    }
                }
                Closure::Native(nc) => {
                    let name = self.natives.name_of(nc.func).to_string();
                    out.push_str(&format!("\n\t[native]: in '{name}'"));
                }
            }
        }
        out
    }

    fn current_location(&self, task: ThreadRef) -> Option<String> {
        let frame = self.heap.thread(task).frames.last()?;
        let Closure::Script(sc) = self.heap.closure(frame.closure) else {
            return None;
        };
        let proto = self.heap.proto(sc.proto);
        let line = proto.line_at(frame.pc.saturating_sub(1))?;
        let source = proto
            .source
            .map(|s| self.heap.string_lossy(s).into_owned())
            .unwrap_or_else(|| "?".to_string());
        Some(format!("{source}:{line}"))
    }

    /// Unwinds the frame stack with an error value. A native frame with a
    /// protected pending call intercepts it; otherwise the task dies with
    /// status `error` and the value on its stack.
    pub(crate) fn raise_value(&mut self, task: ThreadRef, error: Value) -> VmResult<Flow> {
        loop {
            let Some(frame) = self.heap.thread(task).frames.last().cloned() else {
                let t = self.heap.thread_mut(task);
                t.stack.clear();
                t.stack.push(error);
                t.status = ThreadStatus::Error;
                return Ok(Flow::Suspend(Resumption::Error(error)));
            };
            if let Some(NativeAwait::Call {
                protected: true, ..
            }) = frame.awaiting
            {
                self.heap
                    .thread_mut(task)
                    .frames
                    .last_mut()
                    .expect("frame vanished")
                    .awaiting = None;
                let continuation = self.continuation_of(frame.closure)?;
                let ctx = NativeCall {
                    thread: task,
                    base: frame.base,
                    nargs: 0,
                };
                let input = ContinuationInput::CallFailed { error };
                return self.run_continuation(task, continuation, ctx, input);
            }
            self.heap.close_upvalues(task, frame.base);
            self.heap.thread_mut(task).frames.pop();
        }
    }

    // ---- call / return -------------------------------------------------

    /// Calls the value at absolute stack slot `func_slot` with `nargs`
    /// arguments above it; results are copied back over the slot.
    pub(crate) fn call_at(
        &mut self,
        task: ThreadRef,
        func_slot: usize,
        nargs: usize,
        nresults: u8,
    ) -> VmResult<Flow> {
        let func = self.reg(task, func_slot);
        let Value::Closure(closure_ref) = func else {
            return self.raise_vm_error(
                task,
                VmError::runtime(format!("attempt to call a {} value", func.type_name())),
            );
        };
        if self.heap.thread(task).frames.len() >= self.config.call_depth_limit {
            return self.raise_vm_error(task, VmError::runtime("stack overflow"));
        }

        enum Target {
            Script {
                num_params: usize,
                max_stack: usize,
                is_vararg: bool,
            },
            Native(crate::native::NativeRef),
        }
        let target = match self.heap.closure(closure_ref) {
            Closure::Script(sc) => {
                let proto = self.heap.proto(sc.proto);
                Target::Script {
                    num_params: proto.num_params as usize,
                    max_stack: proto.max_stack as usize,
                    is_vararg: proto.is_vararg(),
                }
            }
            Closure::Native(nc) => Target::Native(nc.func),
        };

        match target {
            Target::Script {
                num_params,
                max_stack,
                is_vararg,
            } => {
                let (base, vararg_base, vararg_count) = {
                    let t = self.heap.thread_mut(task);
                    if is_vararg {
                        let base = func_slot + 1 + nargs;
                        t.stack.resize(base + max_stack, Value::Nil);
                        for i in 0..num_params {
                            t.stack[base + i] = if i < nargs {
                                t.stack[func_slot + 1 + i]
                            } else {
                                Value::Nil
                            };
                        }
                        for i in num_params..max_stack {
                            t.stack[base + i] = Value::Nil;
                        }
                        (
                            base,
                            func_slot + 1 + num_params,
                            nargs.saturating_sub(num_params),
                        )
                    } else {
                        let base = func_slot + 1;
                        t.stack.resize(base + max_stack, Value::Nil);
                        for i in nargs.min(num_params)..max_stack {
                            t.stack[base + i] = Value::Nil;
                        }
                        (base, base, 0)
                    }
                };
                let t = self.heap.thread_mut(task);
                t.frames.push(crate::thread::Frame {
                    closure: closure_ref,
                    base,
                    pc: 0,
                    ret_base: func_slot,
                    nresults,
                    vararg_base,
                    vararg_count,
                    awaiting: None,
                });
                if let Err(e) = self.heap.recharge_thread(task) {
                    return self.raise_vm_error(task, e);
                }
                Ok(Flow::Continue)
            }
            Target::Native(native) => {
                let base = func_slot + 1;
                {
                    let t = self.heap.thread_mut(task);
                    t.stack.resize(base + nargs, Value::Nil);
                    t.frames.push(crate::thread::Frame {
                        closure: closure_ref,
                        base,
                        pc: 0,
                        ret_base: func_slot,
                        nresults,
                        vararg_base: base,
                        vararg_count: 0,
                        awaiting: None,
                    });
                }
                let func = self.natives.get(native).func;
                let ctx = NativeCall {
                    thread: task,
                    base,
                    nargs,
                };
                match func(self, ctx) {
                    Ok(control) => self.handle_native_control(task, control),
                    Err(e) if e.is_fatal() => Err(e),
                    Err(e) => self.raise_vm_error(task, e),
                }
            }
        }
    }

    pub(crate) fn handle_native_control(
        &mut self,
        task: ThreadRef,
        control: NativeControl,
    ) -> VmResult<Flow> {
        let frame = self
            .heap
            .thread(task)
            .frames
            .last()
            .cloned()
            .ok_or_else(|| VmError::internal("native control with no frame"))?;
        match control {
            NativeControl::Return(n) => self.finish_return(task, frame.base, n),
            NativeControl::Yield(n) => {
                let values = {
                    let t = self.heap.thread(task);
                    (0..n)
                        .map(|i| t.stack.get(frame.base + i).copied().unwrap_or(Value::Nil))
                        .collect()
                };
                self.heap
                    .thread_mut(task)
                    .frames
                    .last_mut()
                    .expect("frame vanished")
                    .awaiting = Some(NativeAwait::Resume);
                Ok(Flow::Suspend(Resumption::Yield(values)))
            }
            NativeControl::Break => {
                self.heap
                    .thread_mut(task)
                    .frames
                    .last_mut()
                    .expect("frame vanished")
                    .awaiting = Some(NativeAwait::Resume);
                Ok(Flow::Suspend(Resumption::Break))
            }
            NativeControl::Call {
                func_slot,
                nargs,
                nresults,
                protected,
            } => {
                self.heap
                    .thread_mut(task)
                    .frames
                    .last_mut()
                    .expect("frame vanished")
                    .awaiting = Some(NativeAwait::Call {
                    ret_slot: func_slot as u32,
                    nresults,
                    protected,
                });
                self.call_at(task, frame.base + func_slot, nargs, nresults)
            }
            NativeControl::Error(value) => self.raise_value(task, value),
        }
    }

    /// Pops the top frame, copying `count` values starting at absolute slot
    /// `first` into the caller per the frame's result convention.
    pub(crate) fn finish_return(
        &mut self,
        task: ThreadRef,
        first: usize,
        count: usize,
    ) -> VmResult<Flow> {
        let values: Vec<Value> = {
            let t = self.heap.thread(task);
            (0..count)
                .map(|i| t.stack.get(first + i).copied().unwrap_or(Value::Nil))
                .collect()
        };
        let frame = self
            .heap
            .thread_mut(task)
            .frames
            .pop()
            .ok_or_else(|| VmError::internal("return with no frame"))?;
        self.heap.close_upvalues(task, frame.base);

        let n_final = if frame.nresults == MULTI {
            count
        } else {
            frame.nresults as usize
        };
        {
            let t = self.heap.thread_mut(task);
            if t.stack.len() < frame.ret_base + n_final {
                t.stack.resize(frame.ret_base + n_final, Value::Nil);
            }
            for i in 0..n_final {
                t.stack[frame.ret_base + i] = values.get(i).copied().unwrap_or(Value::Nil);
            }
        }

        let caller = self.heap.thread(task).frames.last().cloned();
        let Some(caller) = caller else {
            let t = self.heap.thread_mut(task);
            t.status = ThreadStatus::Finished;
            let results = t.stack[frame.ret_base..frame.ret_base + n_final].to_vec();
            t.stack.clear();
            return Ok(Flow::Suspend(Resumption::Finished(results)));
        };

        match self.heap.closure(caller.closure) {
            Closure::Script(sc) => {
                let caller_max = self.heap.proto(sc.proto).max_stack as usize;
                let t = self.heap.thread_mut(task);
                t.stack.resize(caller.base + caller_max, Value::Nil);
                Ok(Flow::Continue)
            }
            Closure::Native(_) => match caller.awaiting {
                Some(NativeAwait::Call { .. }) => {
                    {
                        let t = self.heap.thread_mut(task);
                        t.frames.last_mut().expect("frame vanished").awaiting = None;
                        t.stack.resize(frame.ret_base + n_final, Value::Nil);
                    }
                    let continuation = self.continuation_of(caller.closure)?;
                    let ctx = NativeCall {
                        thread: task,
                        base: caller.base,
                        nargs: 0,
                    };
                    let input = ContinuationInput::CallReturned { nresults: n_final };
                    self.run_continuation(task, continuation, ctx, input)
                }
                _ => Err(VmError::internal(
                    "script frame returned into a native frame that was not awaiting a call",
                )),
            },
        }
    }

    // ---- the dispatch loop ----------------------------------------------

    fn run_loop(&mut self, task: ThreadRef) -> VmResult<Resumption> {
        'scheduler: loop {
            let (closure_ref, base, mut pc) = {
                let t = self.heap.thread(task);
                let frame = t
                    .frames
                    .last()
                    .ok_or_else(|| VmError::internal("run loop with no frames"))?;
                (frame.closure, frame.base, frame.pc)
            };
            let proto_ref = match self.heap.closure(closure_ref) {
                Closure::Script(sc) => sc.proto,
                Closure::Native(_) => {
                    return Err(VmError::internal("native frame on top of the run loop"))
                }
            };
            let code_len = self.heap.proto(proto_ref).code.len();

            // A frame switch restarts the scheduler loop; a suspension
            // bubbles the resumption out of `resume`.
            macro_rules! suspend_or {
                ($flow:expr) => {
                    match $flow? {
                        Flow::Continue => continue 'scheduler,
                        Flow::Suspend(r) => return Ok(r),
                    }
                };
            }
            macro_rules! try_op {
                ($result:expr) => {
                    match $result {
                        Ok(v) => v,
                        Err(e) => {
                            self.set_pc(task, pc);
                            suspend_or!(self.raise_vm_error(task, e))
                        }
                    }
                };
            }
            macro_rules! raise {
                ($msg:expr) => {{
                    self.set_pc(task, pc);
                    suspend_or!(self.raise_vm_error(task, VmError::runtime($msg)))
                }};
            }
            // A suspension at a back edge resumes at the jump target; the
            // edge itself is not replayed.
            macro_rules! back_edge_safepoint {
                () => {
                    self.set_pc(task, pc);
                    match self.safepoint(task, HINT_USER)? {
                        Flow::Continue => {}
                        Flow::Suspend(r) => return Ok(r),
                    }
                };
            }
            // A suspension at a call or return resumes by replaying the
            // instruction, so the saved counter points at it.
            macro_rules! replay_safepoint {
                () => {
                    self.set_pc(task, pc - 1);
                    match self.safepoint(task, HINT_USER)? {
                        Flow::Continue => {}
                        Flow::Suspend(r) => return Ok(r),
                    }
                };
            }

            loop {
                if pc >= code_len {
                    return Err(VmError::internal("program counter out of range"));
                }
                let instr = Instr(self.heap.proto(proto_ref).code[pc]);
                pc += 1;
                let op = instr
                    .opcode()
                    .map_err(|e| VmError::internal(e.to_string()))?;
                let a = instr.a() as usize;
                match op {
                    OpCode::LoadNil => self.set_reg(task, base + a, Value::Nil),
                    OpCode::LoadBool => {
                        self.set_reg(task, base + a, Value::Boolean(instr.b() != 0))
                    }
                    OpCode::LoadConst => {
                        let k = self.heap.proto(proto_ref).constants[instr.bx() as usize];
                        self.set_reg(task, base + a, k);
                    }
                    OpCode::Move => {
                        let v = self.reg(task, base + instr.b() as usize);
                        self.set_reg(task, base + a, v);
                    }
                    OpCode::GetGlobal => {
                        let key = self.heap.proto(proto_ref).constants[instr.bx() as usize];
                        let globals = self.heap.thread(task).globals;
                        let v = self.table_get_chained(globals, key);
                        self.set_reg(task, base + a, v);
                    }
                    OpCode::SetGlobal => {
                        let key = self.heap.proto(proto_ref).constants[instr.bx() as usize];
                        let globals = self.heap.thread(task).globals;
                        let v = self.reg(task, base + a);
                        try_op!(self.heap.table_set(globals, key, v));
                    }
                    OpCode::GetUpvalue => {
                        let u = match self.heap.closure(closure_ref) {
                            Closure::Script(sc) => sc.upvalues[instr.b() as usize],
                            Closure::Native(_) => unreachable!("script frame"),
                        };
                        let v = self.heap.upvalue_get(u);
                        self.set_reg(task, base + a, v);
                    }
                    OpCode::SetUpvalue => {
                        let u = match self.heap.closure(closure_ref) {
                            Closure::Script(sc) => sc.upvalues[instr.b() as usize],
                            Closure::Native(_) => unreachable!("script frame"),
                        };
                        let v = self.reg(task, base + a);
                        self.heap.upvalue_set(u, v);
                    }
                    OpCode::NewTable => {
                        let table = Table::with_capacity(instr.b() as usize, instr.c() as usize);
                        let t = try_op!(self.heap.new_table(table));
                        self.set_reg(task, base + a, Value::Table(t));
                    }
                    OpCode::GetTable => {
                        let object = self.reg(task, base + instr.b() as usize);
                        let key = self.reg(task, base + instr.c() as usize);
                        let Value::Table(t) = object else {
                            raise!(format!(
                                "attempt to index a {} value",
                                object.type_name()
                            ))
                        };
                        let v = self.table_get_chained(t, key);
                        self.set_reg(task, base + a, v);
                    }
                    OpCode::SetTable => {
                        let object = self.reg(task, base + a);
                        let key = self.reg(task, base + instr.b() as usize);
                        let v = self.reg(task, base + instr.c() as usize);
                        let Value::Table(t) = object else {
                            raise!(format!(
                                "attempt to index a {} value",
                                object.type_name()
                            ))
                        };
                        try_op!(self.heap.table_set(t, key, v));
                    }
                    OpCode::GetField => {
                        let object = self.reg(task, base + instr.b() as usize);
                        let key = self.heap.proto(proto_ref).constants[instr.c() as usize];
                        let Value::Table(t) = object else {
                            raise!(format!(
                                "attempt to index a {} value",
                                object.type_name()
                            ))
                        };
                        let v = self.table_get_chained(t, key);
                        self.set_reg(task, base + a, v);
                    }
                    OpCode::SetField => {
                        let object = self.reg(task, base + a);
                        let key = self.heap.proto(proto_ref).constants[instr.b() as usize];
                        let v = self.reg(task, base + instr.c() as usize);
                        let Value::Table(t) = object else {
                            raise!(format!(
                                "attempt to index a {} value",
                                object.type_name()
                            ))
                        };
                        try_op!(self.heap.table_set(t, key, v));
                    }
                    OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod => {
                        let lhs = self.reg(task, base + instr.b() as usize);
                        let rhs = self.reg(task, base + instr.c() as usize);
                        let arith_op = match op {
                            OpCode::Add => ArithOp::Add,
                            OpCode::Sub => ArithOp::Sub,
                            OpCode::Mul => ArithOp::Mul,
                            OpCode::Div => ArithOp::Div,
                            _ => ArithOp::Mod,
                        };
                        let v = try_op!(ops::arith(arith_op, lhs, rhs));
                        self.set_reg(task, base + a, v);
                    }
                    OpCode::Unm => {
                        let v = try_op!(ops::negate(self.reg(task, base + instr.b() as usize)));
                        self.set_reg(task, base + a, v);
                    }
                    OpCode::Not => {
                        let v = self.reg(task, base + instr.b() as usize);
                        self.set_reg(task, base + a, Value::Boolean(!v.is_truthy()));
                    }
                    OpCode::Concat => {
                        let lhs = self.reg(task, base + instr.b() as usize);
                        let rhs = self.reg(task, base + instr.c() as usize);
                        let v = try_op!(ops::concat(&mut self.heap, lhs, rhs));
                        self.set_reg(task, base + a, v);
                    }
                    OpCode::Len => {
                        let v = try_op!(ops::length(
                            &self.heap,
                            self.reg(task, base + instr.b() as usize)
                        ));
                        self.set_reg(task, base + a, v);
                    }
                    OpCode::Eq => {
                        let lhs = self.reg(task, base + instr.b() as usize);
                        let rhs = self.reg(task, base + instr.c() as usize);
                        self.set_reg(task, base + a, Value::Boolean(lhs == rhs));
                    }
                    OpCode::Lt | OpCode::Le => {
                        let lhs = self.reg(task, base + instr.b() as usize);
                        let rhs = self.reg(task, base + instr.c() as usize);
                        let v = try_op!(ops::less_than(
                            &self.heap,
                            lhs,
                            rhs,
                            op == OpCode::Le
                        ));
                        self.set_reg(task, base + a, Value::Boolean(v));
                    }
                    OpCode::Jump => {
                        let displacement = instr.sbx() as i64;
                        pc = (pc as i64 + displacement) as usize;
                        if displacement < 0 {
                            back_edge_safepoint!();
                        }
                    }
                    OpCode::JumpIf => {
                        if self.reg(task, base + a).is_truthy() {
                            let displacement = instr.sbx() as i64;
                            pc = (pc as i64 + displacement) as usize;
                            if displacement < 0 {
                                back_edge_safepoint!();
                            }
                        }
                    }
                    OpCode::JumpIfNot => {
                        if !self.reg(task, base + a).is_truthy() {
                            let displacement = instr.sbx() as i64;
                            pc = (pc as i64 + displacement) as usize;
                            if displacement < 0 {
                                back_edge_safepoint!();
                            }
                        }
                    }
                    OpCode::Call => {
                        replay_safepoint!();
                        self.set_pc(task, pc);
                        suspend_or!(self.call_at(
                            task,
                            base + a,
                            instr.b() as usize,
                            instr.c()
                        ));
                    }
                    OpCode::Return => {
                        replay_safepoint!();
                        self.set_pc(task, pc);
                        suspend_or!(self.finish_return(task, base + a, instr.b() as usize));
                    }
                    OpCode::Closure => {
                        let child = self.heap.proto(proto_ref).children[instr.bx() as usize];
                        let captures = self.heap.proto(child).captures.clone();
                        let mut upvalues = Vec::with_capacity(captures.len());
                        for capture in captures {
                            let cell = match capture {
                                crate::bytecode::Capture::Local(r) => try_op!(self
                                    .heap
                                    .find_or_create_upvalue(task, base + r as usize)),
                                crate::bytecode::Capture::Upvalue(i) => {
                                    match self.heap.closure(closure_ref) {
                                        Closure::Script(sc) => sc.upvalues[i as usize],
                                        Closure::Native(_) => unreachable!("script frame"),
                                    }
                                }
                            };
                            upvalues.push(cell);
                        }
                        let c = try_op!(self.heap.new_closure(Closure::Script(ScriptClosure {
                            proto: child,
                            upvalues,
                        })));
                        self.set_reg(task, base + a, Value::Closure(c));
                    }
                    OpCode::CloseUpvalues => {
                        self.heap.close_upvalues(task, base + a);
                    }
                    OpCode::ForGenPrep => {
                        let object = self.reg(task, base + a);
                        if !matches!(object, Value::Table(_)) {
                            raise!(format!(
                                "attempt to iterate over a {} value",
                                object.type_name()
                            ))
                        }
                        self.set_reg(task, base + a + 1, Value::Number(-1.0));
                        pc = (pc as i64 + instr.sbx() as i64) as usize;
                    }
                    OpCode::ForGenLoop => {
                        replay_safepoint!();
                        let object = self.reg(task, base + a);
                        let Value::Table(t) = object else {
                            raise!(format!(
                                "attempt to iterate over a {} value",
                                object.type_name()
                            ))
                        };
                        let position = self
                            .reg(task, base + a + 1)
                            .as_number()
                            .unwrap_or(-1.0) as i64;
                        let next = self.heap.table(t).iter_from((position + 1) as usize);
                        if let Some((p, key, value)) = next {
                            self.set_reg(task, base + a + 1, Value::Number(p as f64));
                            self.set_reg(task, base + a + 2, key);
                            self.set_reg(task, base + a + 3, value);
                            pc = (pc as i64 + instr.sbx() as i64) as usize;
                        }
                    }
                    OpCode::Vararg => {
                        let (vararg_base, vararg_count) = {
                            let frame =
                                self.heap.thread(task).frames.last().expect("frame vanished");
                            (frame.vararg_base, frame.vararg_count)
                        };
                        let want = instr.b() as usize;
                        for i in 0..want {
                            let v = if i < vararg_count {
                                self.reg(task, vararg_base + i)
                            } else {
                                Value::Nil
                            };
                            self.set_reg(task, base + a + i, v);
                        }
                    }
                }
            }
        }
    }
}

// ---- builtin natives ----------------------------------------------------

fn native_yield(_engine: &mut ExecutionEngine, ctx: NativeCall) -> VmResult<NativeControl> {
    Ok(NativeControl::Yield(ctx.nargs))
}

fn native_yield_cont(
    engine: &mut ExecutionEngine,
    ctx: NativeCall,
    input: ContinuationInput,
) -> VmResult<NativeControl> {
    match input {
        ContinuationInput::Resumed { nargs } => {
            // The resume values become the yield call's results.
            let args = engine.take_resume_args(ctx, nargs);
            engine.set_native_results(ctx, &args);
            Ok(NativeControl::Return(nargs))
        }
        _ => Err(VmError::internal("yield continuation got a call outcome")),
    }
}

fn native_next(engine: &mut ExecutionEngine, ctx: NativeCall) -> VmResult<NativeControl> {
    let table = engine.native_arg(ctx, 0);
    let key = engine.native_arg(ctx, 1);
    let Value::Table(t) = table else {
        return Err(VmError::runtime(format!(
            "bad argument #1 to 'next' (table expected, got {})",
            table.type_name()
        )));
    };
    match engine.heap.table(t).next_after(key)? {
        Some((k, v)) => {
            engine.set_native_results(ctx, &[k, v]);
            Ok(NativeControl::Return(2))
        }
        None => {
            engine.set_native_results(ctx, &[Value::Nil]);
            Ok(NativeControl::Return(1))
        }
    }
}

fn native_pcall(_engine: &mut ExecutionEngine, ctx: NativeCall) -> VmResult<NativeControl> {
    if ctx.nargs == 0 {
        return Err(VmError::runtime("bad argument #1 to 'pcall' (value expected)"));
    }
    Ok(NativeControl::Call {
        func_slot: 0,
        nargs: ctx.nargs - 1,
        nresults: MULTI,
        protected: true,
    })
}

fn native_pcall_cont(
    engine: &mut ExecutionEngine,
    ctx: NativeCall,
    input: ContinuationInput,
) -> VmResult<NativeControl> {
    match input {
        ContinuationInput::CallReturned { nresults } => {
            let t = engine.heap.thread_mut(ctx.thread);
            t.stack.truncate(ctx.base + nresults);
            t.stack.insert(ctx.base, Value::Boolean(true));
            Ok(NativeControl::Return(nresults + 1))
        }
        ContinuationInput::CallFailed { error } => {
            engine.set_native_results(ctx, &[Value::Boolean(false), error]);
            Ok(NativeControl::Return(2))
        }
        ContinuationInput::Resumed { .. } => {
            Err(VmError::internal("pcall continuation resumed without a call"))
        }
    }
}

fn native_error(engine: &mut ExecutionEngine, ctx: NativeCall) -> VmResult<NativeControl> {
    Ok(NativeControl::Error(engine.native_arg(ctx, 0)))
}

fn native_type(engine: &mut ExecutionEngine, ctx: NativeCall) -> VmResult<NativeControl> {
    let name = engine.native_arg(ctx, 0).type_name();
    let value = engine.intern_value(name)?;
    engine.set_native_results(ctx, &[value]);
    Ok(NativeControl::Return(1))
}

/// Shared driver for the wrapper pattern: resume the task held in the
/// closure's upvalue and surface its yields as return values.
fn wrap_drive(
    engine: &mut ExecutionEngine,
    ctx: NativeCall,
    args: Vec<Value>,
) -> VmResult<NativeControl> {
    let target = engine.native_upvalue(ctx.thread, 0);
    let Value::Thread(task) = target else {
        return Err(VmError::internal("wrapper upvalue is not a task"));
    };
    match engine.resume(task, &args)? {
        Resumption::Yield(values) | Resumption::Finished(values) => {
            engine.set_native_results(ctx, &values);
            Ok(NativeControl::Return(values.len()))
        }
        Resumption::Break => Ok(NativeControl::Break),
        Resumption::Error(error) => Ok(NativeControl::Error(error)),
    }
}

fn native_wrap_apply(engine: &mut ExecutionEngine, ctx: NativeCall) -> VmResult<NativeControl> {
    let args: Vec<Value> = (0..ctx.nargs).map(|i| engine.native_arg(ctx, i)).collect();
    wrap_drive(engine, ctx, args)
}

fn native_wrap_cont(
    engine: &mut ExecutionEngine,
    ctx: NativeCall,
    input: ContinuationInput,
) -> VmResult<NativeControl> {
    match input {
        ContinuationInput::Resumed { nargs } => {
            let args = engine.take_resume_args(ctx, nargs);
            wrap_drive(engine, ctx, args)
        }
        _ => Err(VmError::internal("wrapper continuation got a call outcome")),
    }
}
