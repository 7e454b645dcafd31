//! Native function registry and continuations.
//!
//! Native functions are plain function pointers registered under stable
//! names; a closure stores the registry handle, never the pointer, so a
//! persisted native closure can be re-bound by name on any host. A native
//! that wants to survive suspension registers a continuation: the resume
//! path after a yield or after a callee it invoked returns. Continuations
//! keep their working state in the frame's stack window, which persists
//! with the thread.

use crate::error::{VmError, VmResult};
use crate::execution_engine::ExecutionEngine;
use crate::value::{ThreadRef, Value};

use hashbrown::HashMap;

/// Handle to a registered native function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeRef(pub(crate) u32);

/// Arguments of one native invocation. `base` is the absolute stack index
/// of the first argument; the frame's window starts there.
#[derive(Debug, Clone, Copy)]
pub struct NativeCall {
    pub thread: ThreadRef,
    pub base: usize,
    pub nargs: usize,
}

/// Why a continuation is being invoked.
#[derive(Debug, Clone, Copy)]
pub enum ContinuationInput {
    /// The task was resumed after this frame yielded or broke; the resume
    /// arguments sit at `base..base+nargs`.
    Resumed { nargs: usize },
    /// A callee requested via [`NativeControl::Call`] returned normally.
    CallReturned { nresults: usize },
    /// A protected callee failed; the error value is passed along.
    CallFailed { error: Value },
}

/// What a native function wants the engine to do next.
#[derive(Debug, Clone, Copy)]
pub enum NativeControl {
    /// Return `n` values located at `base..base+n`.
    Return(usize),
    /// Yield `n` values located at `base..base+n`; the frame is resumed
    /// through its continuation.
    Yield(usize),
    /// Suspend with the break status; no values.
    Break,
    /// Call the value at frame-relative `func_slot` with `nargs` arguments
    /// above it; the continuation receives the outcome.
    Call {
        func_slot: usize,
        nargs: usize,
        nresults: u8,
        protected: bool,
    },
    /// Raise an error value.
    Error(Value),
}

/// A native entry point.
pub type NativeFn = fn(&mut ExecutionEngine, NativeCall) -> VmResult<NativeControl>;
/// A native restart point.
pub type ContinuationFn =
    fn(&mut ExecutionEngine, NativeCall, ContinuationInput) -> VmResult<NativeControl>;

/// One registry entry.
pub struct NativeDef {
    pub name: String,
    pub func: NativeFn,
    pub continuation: Option<ContinuationFn>,
    /// Whether closures over this function may be persisted (by name, with
    /// their upvalues).
    pub persistable: bool,
}

/// Name-keyed registry of native functions.
#[derive(Default)]
pub struct NativeRegistry {
    entries: Vec<NativeDef>,
    by_name: HashMap<String, NativeRef>,
}

impl NativeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        NativeRegistry::default()
    }

    /// Registers a native function under a stable name.
    pub fn register(
        &mut self,
        name: &str,
        func: NativeFn,
        continuation: Option<ContinuationFn>,
        persistable: bool,
    ) -> VmResult<NativeRef> {
        if self.by_name.contains_key(name) {
            return Err(VmError::internal(format!(
                "native '{name}' registered twice"
            )));
        }
        let handle = NativeRef(self.entries.len() as u32);
        self.entries.push(NativeDef {
            name: name.to_string(),
            func,
            continuation,
            persistable,
        });
        self.by_name.insert(name.to_string(), handle);
        Ok(handle)
    }

    /// Resolves a registry handle.
    pub fn get(&self, handle: NativeRef) -> &NativeDef {
        self.entries
            .get(handle.0 as usize)
            .expect("dangling native handle")
    }

    /// Looks a native up by name.
    pub fn lookup(&self, name: &str) -> Option<NativeRef> {
        self.by_name.get(name).copied()
    }

    /// Stable name of a native.
    pub fn name_of(&self, handle: NativeRef) -> &str {
        &self.get(handle).name
    }
}
