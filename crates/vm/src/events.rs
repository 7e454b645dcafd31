//! Named event channel with ordered handlers.
//!
//! Dispatch runs as a native frame with a continuation, so it is an
//! ordinary suspendable activation: the interrupt callback is consulted
//! with the handler-boundary hint between every two handlers, and a yield
//! or break there suspends the whole dispatch mid-flight — including
//! across serialization, since the dispatch cursor lives in the frame's
//! stack window and the in-dispatch flag lives in the manager.

use crate::error::{VmError, VmResult};
use crate::execution_engine::ExecutionEngine;
use crate::heap::GcRef;
use crate::hooks::{InterruptAction, HINT_HANDLER_BOUNDARY};
use crate::native::{
    ContinuationInput, NativeCall, NativeControl, NativeRegistry,
};
use crate::thread::ThreadStatus;
use crate::value::{ThreadRef, UserdataRef, Value};
use crate::bytecode::MULTI;
use crate::closure::Closure;
use crate::execution_engine::Resumption;

/// One subscribed handler.
#[derive(Debug, Clone)]
pub struct HandlerEntry {
    pub handle: u64,
    pub func: Value,
    pub once: bool,
}

/// Mapping from event name to ordered handler list.
#[derive(Debug, Clone, Default)]
pub struct EventManager {
    channels: Vec<(String, Vec<HandlerEntry>)>,
    next_handle: u64,
    /// Re-entrancy guard; also serialized, so a dispatch suspended across
    /// a round trip stays guarded.
    pub(crate) dispatching: bool,
}

impl EventManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        EventManager {
            next_handle: 1,
            ..EventManager::default()
        }
    }

    fn channel_index(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|(n, _)| n == name)
    }

    /// Subscribes a handler, returning its handle.
    pub fn on(&mut self, name: &str, func: Value, once: bool) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        let entry = HandlerEntry { handle, func, once };
        match self.channel_index(name) {
            Some(i) => self.channels[i].1.push(entry),
            None => self.channels.push((name.to_string(), vec![entry])),
        }
        handle
    }

    /// Unsubscribes by handle. Returns whether anything was removed.
    pub fn off(&mut self, name: &str, handle: u64) -> bool {
        let Some(i) = self.channel_index(name) else {
            return false;
        };
        let before = self.channels[i].1.len();
        self.channels[i].1.retain(|e| e.handle != handle);
        self.channels[i].1.len() != before
    }

    /// Names with at least one subscribed handler, in first-subscription
    /// order.
    pub fn names(&self) -> Vec<&str> {
        self.channels
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Handler functions of one event, in registration order.
    pub fn listeners(&self, name: &str) -> Vec<Value> {
        match self.channel_index(name) {
            Some(i) => self.channels[i].1.iter().map(|e| e.func).collect(),
            None => Vec::new(),
        }
    }

    /// Snapshot taken when a dispatch starts: the handlers to invoke this
    /// round. Once-handlers are unsubscribed here, which still leaves them
    /// in the snapshot for this round.
    pub(crate) fn snapshot_for_dispatch(&mut self, name: &str) -> Vec<Value> {
        let Some(i) = self.channel_index(name) else {
            return Vec::new();
        };
        let funcs: Vec<Value> = self.channels[i].1.iter().map(|e| e.func).collect();
        self.channels[i].1.retain(|e| !e.once);
        funcs
    }

    /// Values referenced by this manager, for the collector.
    pub(crate) fn referenced_values(&self) -> Vec<Value> {
        self.channels
            .iter()
            .flat_map(|(_, entries)| entries.iter().map(|e| e.func))
            .collect()
    }

    /// Serialization access to the channel list.
    pub(crate) fn channels(&self) -> &[(String, Vec<HandlerEntry>)] {
        &self.channels
    }

    pub(crate) fn from_parts(
        channels: Vec<(String, Vec<HandlerEntry>)>,
        next_handle: u64,
        dispatching: bool,
    ) -> Self {
        EventManager {
            channels,
            next_handle,
            dispatching,
        }
    }

    pub(crate) fn next_handle(&self) -> u64 {
        self.next_handle
    }

    pub(crate) fn byte_size(&self) -> usize {
        std::mem::size_of::<EventManager>()
            + self
                .channels
                .iter()
                .map(|(n, entries)| n.len() + entries.capacity() * std::mem::size_of::<HandlerEntry>())
                .sum::<usize>()
    }
}

// ---- engine surface -----------------------------------------------------

impl ExecutionEngine {
    pub(crate) fn instance_events(&self, instance: ThreadRef) -> VmResult<UserdataRef> {
        self.instances
            .get(&instance)
            .map(|s| s.events)
            .ok_or_else(|| VmError::internal("task is not a script instance"))
    }

    /// Validates a prospective handler: callable, and not declared
    /// method-style.
    fn check_handler(&self, func: Value) -> VmResult<()> {
        let Value::Closure(closure) = func else {
            return Err(VmError::runtime(format!(
                "event handler must be a function, got {}",
                func.type_name()
            )));
        };
        if let Closure::Script(sc) = self.heap.closure(closure) {
            if self.heap.proto(sc.proto).is_method() {
                return Err(VmError::runtime(
                    "method-style handlers cannot be subscribed",
                ));
            }
        }
        Ok(())
    }

    fn check_registration_allowed(&mut self, instance: ThreadRef, name: &str) -> VmResult<()> {
        if let Some(filter) = self.callbacks.register_filter.as_mut() {
            if !filter(instance, name, true) {
                return Err(VmError::runtime(format!(
                    "event '{name}' is not available for subscription"
                )));
            }
        }
        Ok(())
    }

    /// Subscribes a handler to a named event.
    pub fn event_on(
        &mut self,
        instance: ThreadRef,
        name: &str,
        func: Value,
        once: bool,
    ) -> VmResult<u64> {
        self.check_handler(func)?;
        self.check_registration_allowed(instance, name)?;
        let events = self.instance_events(instance)?;
        let handle = {
            let ud = self.heap.userdata_mut(events);
            let manager = ud
                .event_manager_mut()
                .ok_or_else(|| VmError::internal("event singleton lost its payload"))?;
            manager.on(name, func, once)
        };
        self.heap.write_barrier(GcRef::Userdata(events), func);
        Ok(handle)
    }

    /// Unsubscribes a handler by handle.
    pub fn event_off(&mut self, instance: ThreadRef, name: &str, handle: u64) -> VmResult<bool> {
        let events = self.instance_events(instance)?;
        let ud = self.heap.userdata_mut(events);
        let manager = ud
            .event_manager_mut()
            .ok_or_else(|| VmError::internal("event singleton lost its payload"))?;
        Ok(manager.off(name, handle))
    }

    /// Event names with live subscriptions.
    pub fn event_names(&self, instance: ThreadRef) -> VmResult<Vec<String>> {
        let events = self.instance_events(instance)?;
        let ud = self.heap.userdata(events);
        let manager = ud
            .event_manager()
            .ok_or_else(|| VmError::internal("event singleton lost its payload"))?;
        Ok(manager.names().into_iter().map(str::to_string).collect())
    }

    /// Handlers of one event, in registration order.
    pub fn event_listeners(&self, instance: ThreadRef, name: &str) -> VmResult<Vec<Value>> {
        let events = self.instance_events(instance)?;
        let ud = self.heap.userdata(events);
        let manager = ud
            .event_manager()
            .ok_or_else(|| VmError::internal("event singleton lost its payload"))?;
        Ok(manager.listeners(name))
    }

    /// Externally-triggered dispatch: gated by the may-call hook, run on a
    /// fresh handler thread so the instance itself is never entangled.
    /// Returns the handler thread's resumption — a yield or break here is
    /// a dispatch suspended mid-flight, continued with
    /// [`resume_dispatch`].
    ///
    /// [`resume_dispatch`]: ExecutionEngine::resume_dispatch
    pub fn dispatch_event(
        &mut self,
        instance: ThreadRef,
        name: &str,
        args: &[Value],
    ) -> VmResult<Resumption> {
        if let Some(gate) = self.callbacks.may_handle_event.as_mut() {
            if !gate(instance) {
                return Err(VmError::runtime("event dispatch rejected by host"));
            }
        }
        let events = self.instance_events(instance)?;
        if self
            .heap
            .userdata(events)
            .event_manager()
            .map(|m| m.dispatching)
            .unwrap_or(false)
        {
            return Err(VmError::runtime("recursive event dispatch"));
        }
        let driver = self.make_native_closure("event.handle", vec![Value::Userdata(events)])?;
        let handler = self.spawn_handler(instance, driver)?;

        let mut call_args = Vec::with_capacity(args.len() + 1);
        call_args.push(self.intern_value(name)?);
        call_args.extend_from_slice(args);
        let resumption = self.resume(handler, &call_args)?;
        self.reap_handler(instance, handler);
        Ok(resumption)
    }

    /// Continues a dispatch previously suspended by a yield or break.
    pub fn resume_dispatch(
        &mut self,
        instance: ThreadRef,
        args: &[Value],
    ) -> VmResult<Resumption> {
        let handler = self
            .current_handler(instance)
            .ok_or_else(|| VmError::invalid_thread_state("resume dispatch on", "idle"))?;
        let resumption = self.resume(handler, args)?;
        self.reap_handler(instance, handler);
        Ok(resumption)
    }

    fn reap_handler(&mut self, instance: ThreadRef, handler: ThreadRef) {
        let done = matches!(
            self.heap.thread(handler).status,
            ThreadStatus::Finished | ThreadStatus::Error
        );
        if done {
            if let Some(state) = self.instances.get_mut(&instance) {
                if state.handler == Some(handler) {
                    state.handler = None;
                }
            }
            self.discard_task(handler);
        }
    }
}

// ---- the dispatch driver native ------------------------------------------

// Frame window layout while a dispatch is in flight: slot 0 holds the
// event name, then the cursor state, handlers, and arguments. Everything
// is a plain value on the thread stack, so a suspended dispatch
// serializes with its task.
const SLOT_INDEX: usize = 1;
const SLOT_BOUNDARY_DONE: usize = 2;
const SLOT_COUNT: usize = 3;
const SLOT_NARGS: usize = 4;
const SLOT_HANDLERS: usize = 5;

/// Registers the event natives.
pub(crate) fn register_natives(registry: &mut NativeRegistry) -> VmResult<()> {
    registry.register("event.handle", event_handle_entry, Some(event_handle_cont), true)?;
    Ok(())
}

fn manager_userdata(engine: &ExecutionEngine, ctx: NativeCall) -> VmResult<UserdataRef> {
    match engine.native_upvalue(ctx.thread, 0) {
        Value::Userdata(ud) => Ok(ud),
        _ => Err(VmError::internal("dispatch driver without manager upvalue")),
    }
}

fn event_handle_entry(
    engine: &mut ExecutionEngine,
    ctx: NativeCall,
) -> VmResult<NativeControl> {
    let name_value = engine.native_arg(ctx, 0);
    let Value::String(name_ref) = name_value else {
        return Err(VmError::runtime("event name must be a string"));
    };
    let args: Vec<Value> = (1..ctx.nargs).map(|i| engine.native_arg(ctx, i)).collect();

    let manager_ref = manager_userdata(engine, ctx)?;
    let name = engine.heap.string_lossy(name_ref).into_owned();
    let handlers = {
        let ud = engine.heap.userdata_mut(manager_ref);
        let manager = ud
            .event_manager_mut()
            .ok_or_else(|| VmError::internal("event singleton lost its payload"))?;
        if manager.dispatching {
            return Err(VmError::runtime("recursive event dispatch"));
        }
        manager.dispatching = true;
        manager.snapshot_for_dispatch(&name)
    };

    // Lay the dispatch state out in the frame window, name first.
    let mut state = Vec::with_capacity(SLOT_HANDLERS + handlers.len() + args.len());
    state.push(name_value);
    state.push(Value::Number(0.0));
    state.push(Value::Number(0.0));
    state.push(Value::Number(handlers.len() as f64));
    state.push(Value::Number(args.len() as f64));
    state.extend_from_slice(&handlers);
    state.extend_from_slice(&args);
    engine.set_native_results(ctx, &state);

    dispatch_step(engine, ctx)
}

fn event_handle_cont(
    engine: &mut ExecutionEngine,
    ctx: NativeCall,
    input: ContinuationInput,
) -> VmResult<NativeControl> {
    match input {
        ContinuationInput::Resumed { nargs } => {
            // The dispatch cursor lives in the frame window; values passed
            // to the resume are not part of the protocol and are dropped.
            let _ = engine.take_resume_args(ctx, nargs);
            dispatch_step(engine, ctx)
        }
        ContinuationInput::CallReturned { .. } => dispatch_step(engine, ctx),
        ContinuationInput::CallFailed { error } => {
            // A failing handler interrupts this dispatch but leaves the
            // manager usable for the next one.
            let manager_ref = manager_userdata(engine, ctx)?;
            if let Some(manager) = engine
                .heap
                .userdata_mut(manager_ref)
                .event_manager_mut()
            {
                manager.dispatching = false;
            }
            Ok(NativeControl::Error(error))
        }
    }
}

fn slot_number(engine: &ExecutionEngine, ctx: NativeCall, slot: usize) -> VmResult<usize> {
    match engine.native_arg_window(ctx, slot) {
        Value::Number(n) if n >= 0.0 => Ok(n as usize),
        other => Err(VmError::internal(format!(
            "dispatch state slot {slot} holds {}",
            other.type_name()
        ))),
    }
}

fn dispatch_step(engine: &mut ExecutionEngine, ctx: NativeCall) -> VmResult<NativeControl> {
    let index = slot_number(engine, ctx, SLOT_INDEX)?;
    let boundary_done = slot_number(engine, ctx, SLOT_BOUNDARY_DONE)?;
    let count = slot_number(engine, ctx, SLOT_COUNT)?;
    let nargs = slot_number(engine, ctx, SLOT_NARGS)?;

    if index >= count {
        let manager_ref = manager_userdata(engine, ctx)?;
        if let Some(manager) = engine
            .heap
            .userdata_mut(manager_ref)
            .event_manager_mut()
        {
            manager.dispatching = false;
        }
        return Ok(NativeControl::Return(0));
    }

    // Between every two handlers the scheduler gets a chance to steal
    // control; the flag makes the boundary fire once even if we suspend on
    // it.
    if index > 0 && boundary_done == 0 {
        engine.set_native_window(ctx, SLOT_BOUNDARY_DONE, Value::Number(1.0));
        match engine.interrupt_action(ctx.thread, HINT_HANDLER_BOUNDARY) {
            InterruptAction::Continue => {}
            InterruptAction::Break => return Ok(NativeControl::Break),
            InterruptAction::Yield => return Ok(NativeControl::Yield(0)),
        }
    }

    // Advance the cursor, then stage the call: handler followed by the
    // dispatch arguments, above the saved state.
    engine.set_native_window(ctx, SLOT_INDEX, Value::Number((index + 1) as f64));
    engine.set_native_window(ctx, SLOT_BOUNDARY_DONE, Value::Number(0.0));

    let func = engine.native_arg_window(ctx, SLOT_HANDLERS + index);
    let args: Vec<Value> = (0..nargs)
        .map(|i| engine.native_arg_window(ctx, SLOT_HANDLERS + count + i))
        .collect();
    let scratch = SLOT_HANDLERS + count + nargs;
    engine.set_native_window(ctx, scratch, func);
    for (i, arg) in args.iter().enumerate() {
        engine.set_native_window(ctx, scratch + 1 + i, *arg);
    }
    Ok(NativeControl::Call {
        func_slot: scratch,
        nargs,
        nresults: MULTI,
        protected: true,
    })
}
