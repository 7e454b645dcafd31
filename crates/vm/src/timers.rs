//! One-shot and periodic timers driven by an embedder-provided clock.
//!
//! The driver never reads wall-clock time: `tick` receives "now" from the
//! engine's clock callback, fires every record whose due time has passed,
//! and reschedules periodic records. A record that has fallen far behind
//! snaps its due time to now instead of replaying the backlog. The tick
//! itself arrives as an event — the manager subscribes to a well-known
//! event name at instance creation — so timer handlers run under the same
//! interrupt discipline as event handlers.

use crate::error::{VmError, VmResult};
use crate::execution_engine::ExecutionEngine;
use crate::heap::GcRef;
use crate::hooks::{InterruptAction, HINT_HANDLER_BOUNDARY};
use crate::native::{ContinuationInput, NativeCall, NativeControl, NativeRegistry};
use crate::value::{ThreadRef, UserdataRef, Value};
use crate::bytecode::MULTI;

/// One timer registration.
#[derive(Debug, Clone)]
pub struct TimerRecord {
    pub handle: u64,
    pub func: Value,
    pub interval: f64,
    pub next_due: f64,
    pub one_shot: bool,
}

/// The timer collection of one script instance.
#[derive(Debug, Clone, Default)]
pub struct TimerManager {
    timers: Vec<TimerRecord>,
    next_handle: u64,
    /// Re-entrancy guard for `tick`; serialized with the manager.
    pub(crate) ticking: bool,
    catchup_floor: f64,
    catchup_factor: f64,
}

impl TimerManager {
    /// Creates an empty manager with the given catch-up threshold shape.
    pub fn new(catchup_floor: f64, catchup_factor: f64) -> Self {
        TimerManager {
            timers: Vec::new(),
            next_handle: 1,
            ticking: false,
            catchup_floor,
            catchup_factor,
        }
    }

    /// Registers a timer due at `now + interval`. Negative intervals are
    /// rejected; a zero interval fires at every tick.
    pub fn on(&mut self, interval: f64, func: Value, now: f64, one_shot: bool) -> VmResult<u64> {
        if interval < 0.0 || !interval.is_finite() {
            return Err(VmError::runtime("timer interval must be non-negative"));
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.timers.push(TimerRecord {
            handle,
            func,
            interval,
            next_due: now + interval,
            one_shot,
        });
        Ok(handle)
    }

    /// Removes a timer by handle. Returns whether anything was removed.
    pub fn off(&mut self, handle: u64) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.handle != handle);
        self.timers.len() != before
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Whether no timers are registered.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Earliest due time across all records.
    pub fn earliest_due(&self) -> Option<f64> {
        self.timers
            .iter()
            .map(|t| t.next_due)
            .min_by(|a, b| a.partial_cmp(b).expect("due times are finite"))
    }

    /// Collects the handlers due at `now` — ascending due time, ties in
    /// registration order — and reschedules their records. A periodic
    /// record later than `max(factor × interval, floor)` snaps its due
    /// time to `now` rather than replaying the missed firings.
    pub(crate) fn collect_due(&mut self, now: f64) -> Vec<Value> {
        let mut due: Vec<usize> = (0..self.timers.len())
            .filter(|&i| self.timers[i].next_due <= now)
            .collect();
        due.sort_by(|&a, &b| {
            self.timers[a]
                .next_due
                .partial_cmp(&self.timers[b].next_due)
                .expect("due times are finite")
        });

        let mut fired = Vec::with_capacity(due.len());
        let mut expired: Vec<u64> = Vec::new();
        for &i in &due {
            let record = &mut self.timers[i];
            fired.push(record.func);
            if record.one_shot {
                expired.push(record.handle);
                continue;
            }
            let threshold = (record.interval * self.catchup_factor).max(self.catchup_floor);
            if now - record.next_due > threshold {
                log::trace!(
                    "timer {} late by {:.3}s, snapping to now",
                    record.handle,
                    now - record.next_due
                );
                record.next_due = now;
            } else {
                record.next_due += record.interval;
            }
        }
        self.timers.retain(|t| !expired.contains(&t.handle));
        fired
    }

    /// Values referenced by this manager, for the collector.
    pub(crate) fn referenced_values(&self) -> Vec<Value> {
        self.timers.iter().map(|t| t.func).collect()
    }

    /// Serialization access to the records.
    pub(crate) fn records(&self) -> &[TimerRecord] {
        &self.timers
    }

    pub(crate) fn next_handle(&self) -> u64 {
        self.next_handle
    }

    pub(crate) fn from_parts(
        timers: Vec<TimerRecord>,
        next_handle: u64,
        ticking: bool,
        catchup_floor: f64,
        catchup_factor: f64,
    ) -> Self {
        TimerManager {
            timers,
            next_handle,
            ticking,
            catchup_floor,
            catchup_factor,
        }
    }

    pub(crate) fn byte_size(&self) -> usize {
        std::mem::size_of::<TimerManager>()
            + self.timers.capacity() * std::mem::size_of::<TimerRecord>()
    }
}

// ---- engine surface -----------------------------------------------------

impl ExecutionEngine {
    pub(crate) fn instance_timers(&self, instance: ThreadRef) -> VmResult<UserdataRef> {
        self.instances
            .get(&instance)
            .map(|s| s.timers)
            .ok_or_else(|| VmError::internal("task is not a script instance"))
    }

    fn now(&mut self) -> VmResult<f64> {
        match self.callbacks.clock.as_mut() {
            Some(clock) => Ok(clock()),
            None => Err(VmError::runtime("no clock source installed")),
        }
    }

    /// Registers a periodic (or one-shot) timer on an instance.
    pub fn timer_on(
        &mut self,
        instance: ThreadRef,
        interval: f64,
        func: Value,
        one_shot: bool,
    ) -> VmResult<u64> {
        let Value::Closure(_) = func else {
            return Err(VmError::runtime(format!(
                "timer handler must be a function, got {}",
                func.type_name()
            )));
        };
        let now = self.now()?;
        let timers = self.instance_timers(instance)?;
        let handle = {
            let ud = self.heap.userdata_mut(timers);
            let manager = ud
                .timer_manager_mut()
                .ok_or_else(|| VmError::internal("timer singleton lost its payload"))?;
            manager.on(interval, func, now, one_shot)?
        };
        self.heap.write_barrier(GcRef::Userdata(timers), func);
        self.notify_next_due(instance, now)?;
        Ok(handle)
    }

    /// Removes a timer by handle.
    pub fn timer_off(&mut self, instance: ThreadRef, handle: u64) -> VmResult<bool> {
        let timers = self.instance_timers(instance)?;
        let ud = self.heap.userdata_mut(timers);
        let manager = ud
            .timer_manager_mut()
            .ok_or_else(|| VmError::internal("timer singleton lost its payload"))?;
        Ok(manager.off(handle))
    }

    /// Drives the timer wheel once by raising the well-known tick event.
    pub fn tick_timers(&mut self, instance: ThreadRef) -> VmResult<crate::execution_engine::Resumption> {
        self.dispatch_event(instance, crate::hierarchy::TIMER_TICK_EVENT, &[])
    }

    /// Tells the embedder when the next timer is due, if it asked.
    fn notify_next_due(&mut self, instance: ThreadRef, now: f64) -> VmResult<()> {
        let timers = self.instance_timers(instance)?;
        let earliest = self
            .heap
            .userdata(timers)
            .timer_manager()
            .and_then(|m| m.earliest_due());
        if let (Some(earliest), Some(hook)) = (earliest, self.callbacks.timer_due.as_mut()) {
            hook(instance, (earliest - now).max(0.0));
        }
        Ok(())
    }
}

// ---- the tick driver native ----------------------------------------------

// Frame window layout while a tick is in flight, mirroring the event
// dispatch driver.
const SLOT_INDEX: usize = 0;
const SLOT_BOUNDARY_DONE: usize = 1;
const SLOT_COUNT: usize = 2;
const SLOT_NOW: usize = 3;
const SLOT_HANDLERS: usize = 4;

/// Registers the timer natives.
pub(crate) fn register_natives(registry: &mut NativeRegistry) -> VmResult<()> {
    registry.register("timer.tick", timer_tick_entry, Some(timer_tick_cont), true)?;
    Ok(())
}

fn manager_userdata(engine: &ExecutionEngine, ctx: NativeCall) -> VmResult<UserdataRef> {
    match engine.native_upvalue(ctx.thread, 0) {
        Value::Userdata(ud) => Ok(ud),
        _ => Err(VmError::internal("tick driver without manager upvalue")),
    }
}

fn timer_tick_entry(engine: &mut ExecutionEngine, ctx: NativeCall) -> VmResult<NativeControl> {
    let now = match engine.callbacks.clock.as_mut() {
        Some(clock) => clock(),
        None => return Err(VmError::runtime("no clock source installed")),
    };
    let manager_ref = manager_userdata(engine, ctx)?;
    let fired = {
        let ud = engine.heap.userdata_mut(manager_ref);
        let manager = ud
            .timer_manager_mut()
            .ok_or_else(|| VmError::internal("timer singleton lost its payload"))?;
        if manager.ticking {
            return Err(VmError::runtime("recursive timer tick"));
        }
        manager.ticking = true;
        manager.collect_due(now)
    };

    let mut state = Vec::with_capacity(SLOT_HANDLERS + fired.len());
    state.push(Value::Number(0.0));
    state.push(Value::Number(0.0));
    state.push(Value::Number(fired.len() as f64));
    state.push(Value::Number(now));
    state.extend_from_slice(&fired);
    engine.set_native_results(ctx, &state);

    tick_step(engine, ctx)
}

fn timer_tick_cont(
    engine: &mut ExecutionEngine,
    ctx: NativeCall,
    input: ContinuationInput,
) -> VmResult<NativeControl> {
    match input {
        ContinuationInput::Resumed { nargs } => {
            let _ = engine.take_resume_args(ctx, nargs);
            tick_step(engine, ctx)
        }
        ContinuationInput::CallReturned { .. } => tick_step(engine, ctx),
        ContinuationInput::CallFailed { error } => {
            let manager_ref = manager_userdata(engine, ctx)?;
            if let Some(manager) = engine
                .heap
                .userdata_mut(manager_ref)
                .timer_manager_mut()
            {
                manager.ticking = false;
            }
            Ok(NativeControl::Error(error))
        }
    }
}

fn slot_number(engine: &ExecutionEngine, ctx: NativeCall, slot: usize) -> VmResult<f64> {
    match engine.native_arg_window(ctx, slot) {
        Value::Number(n) => Ok(n),
        other => Err(VmError::internal(format!(
            "tick state slot {slot} holds {}",
            other.type_name()
        ))),
    }
}

fn tick_step(engine: &mut ExecutionEngine, ctx: NativeCall) -> VmResult<NativeControl> {
    let index = slot_number(engine, ctx, SLOT_INDEX)? as usize;
    let boundary_done = slot_number(engine, ctx, SLOT_BOUNDARY_DONE)? as usize;
    let count = slot_number(engine, ctx, SLOT_COUNT)? as usize;
    let now = slot_number(engine, ctx, SLOT_NOW)?;

    if index >= count {
        let manager_ref = manager_userdata(engine, ctx)?;
        let earliest = {
            let ud = engine.heap.userdata_mut(manager_ref);
            let manager = ud
                .timer_manager_mut()
                .ok_or_else(|| VmError::internal("timer singleton lost its payload"))?;
            manager.ticking = false;
            manager.earliest_due()
        };
        if let (Some(earliest), Some(hook)) = (earliest, engine.callbacks.timer_due.as_mut()) {
            hook(ctx.thread, (earliest - now).max(0.0));
        }
        return Ok(NativeControl::Return(0));
    }

    if index > 0 && boundary_done == 0 {
        engine.set_native_window(ctx, SLOT_BOUNDARY_DONE, Value::Number(1.0));
        match engine.interrupt_action(ctx.thread, HINT_HANDLER_BOUNDARY) {
            InterruptAction::Continue => {}
            InterruptAction::Break => return Ok(NativeControl::Break),
            InterruptAction::Yield => return Ok(NativeControl::Yield(0)),
        }
    }

    engine.set_native_window(ctx, SLOT_INDEX, Value::Number((index + 1) as f64));
    engine.set_native_window(ctx, SLOT_BOUNDARY_DONE, Value::Number(0.0));

    let func = engine.native_arg_window(ctx, SLOT_HANDLERS + index);
    let scratch = SLOT_HANDLERS + count;
    engine.set_native_window(ctx, scratch, func);
    Ok(NativeControl::Call {
        func_slot: scratch,
        nargs: 0,
        nresults: MULTI,
        protected: true,
    })
}
