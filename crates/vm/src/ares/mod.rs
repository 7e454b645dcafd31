//! Ares — the VM state-serialization subsystem.
//!
//! A single request serializes either an arbitrary value graph or an
//! entire suspended task (call stack, open upvalues, shared cells) into a
//! self-delimiting byte stream, and the inverse reconstructs an
//! observationally equivalent graph. Objects with no portable
//! representation cross the boundary through the bidirectional
//! [`Permanents`] table.

pub mod deserializer;
pub mod format;
pub mod permanents;
pub mod serializer;

pub use deserializer::Deserializer;
pub use format::{UserdataCodec, STREAM_MAGIC};
pub use permanents::Permanents;
pub use serializer::Serializer;

use crate::error::{VmError, VmResult};
use crate::execution_engine::{ExecutionEngine, InstanceState};
use crate::heap::GcRef;
use crate::thread::{TaskIdentity, ThreadStatus};
use crate::value::{ThreadRef, Value};

impl ExecutionEngine {
    /// Registers an embedder codec for one userdata tag, replacing the
    /// default raw-bytes encoding on both sides.
    pub fn register_userdata_codec(&mut self, tag: u8, codec: UserdataCodec) {
        self.userdata_codecs.insert(tag, codec);
    }

    /// Serializes an arbitrary value graph. The collector is held still
    /// for the duration of the walk.
    pub fn persist_value(&mut self, root: Value) -> VmResult<Vec<u8>> {
        self.heap.gc_pause();
        let result = Serializer::new(
            &self.heap,
            &self.permanents,
            &self.natives,
            &self.userdata_codecs,
            self.config.persist_depth_limit,
        )
        .serialize(root);
        self.heap.gc_unpause();
        result
    }

    /// Reconstructs a value graph from a stream. The collector is held
    /// still so the half-built graph cannot be reclaimed before it is
    /// handed back.
    pub fn restore_value(&mut self, bytes: &[u8]) -> VmResult<Value> {
        self.heap.gc_pause();
        let timer_catchup = (
            self.config.timer_catchup_floor,
            self.config.timer_catchup_factor,
        );
        let depth_limit = self.config.persist_depth_limit;
        let result = Deserializer::new(
            &mut self.heap,
            &self.permanents,
            &self.natives,
            &self.userdata_codecs,
            bytes,
            timer_catchup,
            depth_limit,
        )
        .deserialize();
        self.heap.gc_unpause();
        result
    }

    /// Serializes a suspended task: call stack, open upvalues, shared
    /// cells. Only plain (non-kernel) tasks that are not running qualify.
    pub fn persist_task(&mut self, task: ThreadRef) -> VmResult<Vec<u8>> {
        {
            let thread = self.heap.thread(task);
            if thread.identity == TaskIdentity::Kernel {
                return Err(VmError::persist("kernel tasks are not serializable"));
            }
            if thread.status == ThreadStatus::Running {
                return Err(VmError::persist("cannot serialize a running task"));
            }
        }
        self.persist_value(Value::Thread(task))
    }

    /// Restores a task persisted with [`persist_task`], binding prototypes
    /// and fixed objects through the current base image's permanents. The
    /// task is pinned and announced through the userthread callback.
    ///
    /// [`persist_task`]: ExecutionEngine::persist_task
    pub fn restore_task(&mut self, bytes: &[u8]) -> VmResult<ThreadRef> {
        let root = self.restore_value(bytes)?;
        let Value::Thread(task) = root else {
            return Err(VmError::restore(format!(
                "stream root is not a task, got {}",
                root.type_name()
            )));
        };
        self.heap.add_root(GcRef::Thread(task));
        let forker = self.forker;
        if let Some(cb) = self.callbacks.userthread.as_mut() {
            cb(Some(forker), task);
        }
        Ok(task)
    }

    /// Serializes a whole script instance: its thread, both service
    /// singletons, and the in-flight handler thread if any.
    pub fn persist_instance(&mut self, instance: ThreadRef) -> VmResult<Vec<u8>> {
        let state = self
            .instances
            .get(&instance)
            .ok_or_else(|| VmError::persist("task is not a script instance"))?;
        let (events, timers, handler) = (state.events, state.timers, state.handler);

        let bundle = self.heap.new_table(crate::table::Table::new())?;
        self.heap
            .table_set(bundle, Value::Number(1.0), Value::Thread(instance))?;
        self.heap
            .table_set(bundle, Value::Number(2.0), Value::Userdata(events))?;
        self.heap
            .table_set(bundle, Value::Number(3.0), Value::Userdata(timers))?;
        self.heap.table_set(
            bundle,
            Value::Number(4.0),
            handler.map(Value::Thread).unwrap_or(Value::Nil),
        )?;
        self.heap.add_root(GcRef::Table(bundle));
        let result = self.persist_value(Value::Table(bundle));
        self.heap.remove_root(GcRef::Table(bundle));
        result
    }

    /// Restores a script instance persisted with [`persist_instance`]:
    /// re-registers its service singletons and pins everything.
    ///
    /// [`persist_instance`]: ExecutionEngine::persist_instance
    pub fn restore_instance(&mut self, bytes: &[u8]) -> VmResult<ThreadRef> {
        let root = self.restore_value(bytes)?;
        let Value::Table(bundle) = root else {
            return Err(VmError::restore("stream root is not an instance bundle"));
        };
        let instance = match self.heap.table(bundle).get(Value::Number(1.0)) {
            Value::Thread(t) => t,
            other => {
                return Err(VmError::restore(format!(
                    "instance bundle slot 1 must be a task, got {}",
                    other.type_name()
                )))
            }
        };
        let events = match self.heap.table(bundle).get(Value::Number(2.0)) {
            Value::Userdata(u) => u,
            other => {
                return Err(VmError::restore(format!(
                    "instance bundle slot 2 must be a userdata, got {}",
                    other.type_name()
                )))
            }
        };
        let timers = match self.heap.table(bundle).get(Value::Number(3.0)) {
            Value::Userdata(u) => u,
            other => {
                return Err(VmError::restore(format!(
                    "instance bundle slot 3 must be a userdata, got {}",
                    other.type_name()
                )))
            }
        };
        let handler = match self.heap.table(bundle).get(Value::Number(4.0)) {
            Value::Nil => None,
            Value::Thread(t) => Some(t),
            other => {
                return Err(VmError::restore(format!(
                    "instance bundle slot 4 must be a task, got {}",
                    other.type_name()
                )))
            }
        };

        self.heap.add_root(GcRef::Thread(instance));
        self.heap.add_root(GcRef::Userdata(events));
        self.heap.add_root(GcRef::Userdata(timers));
        if let Some(handler) = handler {
            self.heap.add_root(GcRef::Thread(handler));
        }
        self.instances.insert(
            instance,
            InstanceState {
                events,
                timers,
                handler,
            },
        );
        let base = self.base_image;
        if let Some(cb) = self.callbacks.userthread.as_mut() {
            cb(base, instance);
        }
        Ok(instance)
    }
}
