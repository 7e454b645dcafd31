//! The task hierarchy: grandparent, base image, forker, script instances,
//! and handler threads.
//!
//! The grandparent owns only builtin globals and never changes after
//! engine construction. A base image loads compiled bytecode, runs its
//! one-shot initializer, and is then fixed; instances fork from it by
//! reference, owning nothing but their globals table and stacks. Handler
//! threads are short-lived children of an instance, cancellable without
//! tearing the instance down.

use crate::closure::{Closure, ScriptClosure};
use crate::error::{VmError, VmResult};
use crate::events::EventManager;
use crate::execution_engine::{ExecutionEngine, InstanceState, Resumption};
use crate::heap::GcRef;
use crate::table::Table;
use crate::thread::{TaskIdentity, Thread};
use crate::timers::TimerManager;
use crate::userdata::{tags, Userdata, UserdataPayload};
use crate::value::{ProtoRef, ThreadRef, Value};

/// Event name the timer manager listens on; the embedder raises it to
/// drive ticks.
pub const TIMER_TICK_EVENT: &str = "timer";

impl ExecutionEngine {
    /// The immutable root task owning the builtin globals.
    pub fn grandparent(&self) -> ThreadRef {
        self.grandparent
    }

    /// The serialization coordinator task.
    pub fn forker(&self) -> ThreadRef {
        self.forker
    }

    /// The loaded base image, if any.
    pub fn base_image(&self) -> Option<ThreadRef> {
        self.base_image
    }

    /// Loads a compiled module, runs its initializer to completion on a
    /// fresh base-image task, then fixes everything reachable from it and
    /// registers its prototypes and globals as permanents.
    pub fn load_base_image(
        &mut self,
        bytecode: &[u8],
        chunk_name: &str,
    ) -> VmResult<ThreadRef> {
        if self.base_image.is_some() {
            return Err(VmError::invalid_thread_state("load a base image over", "loaded"));
        }
        let main_proto = crate::bytecode::load_module(&mut self.heap, bytecode, chunk_name)?;

        let builtin_globals = self.heap.thread(self.grandparent).globals;
        let mut globals_table = Table::new();
        globals_table.fallback = Some(builtin_globals);
        globals_table.safe_env = true;
        let globals = self.heap.new_table(globals_table)?;

        let mut thread = Thread::new(globals, TaskIdentity::Kernel, Some(self.grandparent));
        let entry = self.heap.new_closure(Closure::Script(ScriptClosure {
            proto: main_proto,
            upvalues: Vec::new(),
        }))?;
        thread.stack.push(Value::Closure(entry));
        let base = self.heap.new_thread(thread)?;
        self.heap.add_root(GcRef::Thread(base));

        match self.resume(base, &[])? {
            Resumption::Finished(_) => {}
            Resumption::Error(value) => {
                self.heap.remove_root(GcRef::Thread(base));
                let message = match value {
                    Value::String(s) => self.heap.string_lossy(s).into_owned(),
                    other => format!("({})", other.type_name()),
                };
                return Err(VmError::runtime(format!(
                    "base image initializer failed: {message}"
                )));
            }
            Resumption::Yield(_) | Resumption::Break => {
                self.heap.remove_root(GcRef::Thread(base));
                return Err(VmError::invalid_thread_state(
                    "suspend",
                    "base image initializer",
                ));
            }
        }

        // Pin the image and everything it defined, and freeze its globals.
        // The prototype tree is pinned separately: the entry closure is
        // gone from the stack once the initializer returns.
        self.heap.fix_reachable(GcRef::Thread(base));
        self.heap.fix_reachable(GcRef::Proto(main_proto));
        self.heap.table_mut(globals).readonly = true;

        self.register_permanent("globals:base", Value::Table(globals))?;
        self.register_permanent("thread:base", Value::Thread(base))?;
        self.register_proto_permanents(main_proto, chunk_name)?;
        self.base_image = Some(base);
        log::debug!("base image '{chunk_name}' loaded and fixed");
        Ok(base)
    }

    /// Registers every prototype of the image under a stable key, in
    /// preorder. Persisted closures reference prototypes through these
    /// keys; on reload they bind to the forker's current base image.
    fn register_proto_permanents(&mut self, main: ProtoRef, chunk_name: &str) -> VmResult<()> {
        let mut order = 0usize;
        let mut work = vec![main];
        while let Some(proto) = work.pop() {
            let key = format!("proto:{chunk_name}:{order}");
            self.permanents
                .register_object(&key, GcRef::Proto(proto))?;
            order += 1;
            let children = self.heap.proto(proto).children.clone();
            // Preorder with children visited in declaration order.
            for child in children.into_iter().rev() {
                work.push(child);
            }
        }
        Ok(())
    }

    /// Forks a script instance from the base image: a fresh globals table
    /// deferring unknown lookups to the image's globals, plus the
    /// per-instance event and timer singletons.
    pub fn fork_instance(&mut self, entry: Option<Value>) -> VmResult<ThreadRef> {
        let base = self
            .base_image
            .ok_or_else(|| VmError::invalid_thread_state("fork from", "missing base image"))?;

        let base_globals = self.heap.thread(base).globals;
        let mut globals_table = Table::new();
        globals_table.fallback = Some(base_globals);
        let globals = self.heap.new_table(globals_table)?;

        let mut thread = Thread::new(globals, TaskIdentity::User, Some(base));
        if let Some(entry) = entry {
            let Value::Closure(_) = entry else {
                return Err(VmError::runtime(format!(
                    "instance entry must be a function, got {}",
                    entry.type_name()
                )));
            };
            thread.stack.push(entry);
        }
        let instance = self.heap.new_thread(thread)?;
        self.heap.add_root(GcRef::Thread(instance));
        if let Some(cb) = self.callbacks.userthread.as_mut() {
            cb(Some(base), instance);
        }

        let events = self.heap.new_userdata(Userdata {
            tag: tags::EVENT_MANAGER,
            payload: UserdataPayload::EventManager(EventManager::new()),
            metatable: None,
        })?;
        let timers = self.heap.new_userdata(Userdata {
            tag: tags::TIMER_MANAGER,
            payload: UserdataPayload::TimerManager(TimerManager::new(
                self.config.timer_catchup_floor,
                self.config.timer_catchup_factor,
            )),
            metatable: None,
        })?;
        self.heap.add_root(GcRef::Userdata(events));
        self.heap.add_root(GcRef::Userdata(timers));

        // The timer wheel participates in event dispatch: it listens on
        // the well-known tick event.
        let tick = self.make_native_closure("timer.tick", vec![Value::Userdata(timers)])?;
        {
            let ud = self.heap.userdata_mut(events);
            let manager = ud
                .event_manager_mut()
                .expect("freshly created event manager");
            manager.on(TIMER_TICK_EVENT, tick, false);
        }
        self.heap.write_barrier(GcRef::Userdata(events), tick);

        self.instances.insert(
            instance,
            InstanceState {
                events,
                timers,
                handler: None,
            },
        );
        Ok(instance)
    }

    /// Tears an instance down: its handler thread, service singletons, and
    /// root pins.
    pub fn drop_instance(&mut self, instance: ThreadRef) {
        if let Some(state) = self.instances.remove(&instance) {
            if let Some(handler) = state.handler {
                self.discard_task(handler);
            }
            self.heap.remove_root(GcRef::Userdata(state.events));
            self.heap.remove_root(GcRef::Userdata(state.timers));
        }
        self.discard_task(instance);
    }

    /// Spawns a handler thread under an instance, discarding any previous
    /// one. This is the state-switch pattern: the old handler is cancelled
    /// without touching the instance.
    pub fn spawn_handler(&mut self, instance: ThreadRef, entry: Value) -> VmResult<ThreadRef> {
        self.cancel_handler(instance);
        let handler = self.spawn_task(instance, entry)?;
        if let Some(state) = self.instances.get_mut(&instance) {
            state.handler = Some(handler);
        }
        Ok(handler)
    }

    /// The instance's current handler thread, if one is live.
    pub fn current_handler(&self, instance: ThreadRef) -> Option<ThreadRef> {
        self.instances.get(&instance).and_then(|s| s.handler)
    }

    /// Discards the instance's handler thread and clears the dispatch
    /// guards its death may have left set.
    pub fn cancel_handler(&mut self, instance: ThreadRef) {
        let Some(state) = self.instances.get_mut(&instance) else {
            return;
        };
        let Some(handler) = state.handler.take() else {
            return;
        };
        let (events, timers) = (state.events, state.timers);
        self.discard_task(handler);
        if let Some(m) = self.heap.userdata_mut(events).event_manager_mut() {
            m.dispatching = false;
        }
        if let Some(m) = self.heap.userdata_mut(timers).timer_manager_mut() {
            m.ticking = false;
        }
    }
}
