//! Embedder callback surface.
//!
//! Pre-emption is modelled as callbacks rather than timer signals: the VM
//! never yields to the OS scheduler, the embedder decides at each safepoint
//! whether the running task breaks, yields, or continues. Allocation hooks
//! live on the heap; everything else is collected here.

use crate::value::ThreadRef;

/// Interrupt hint for a user safepoint (back-edge, call, return).
pub const HINT_USER: i32 = -1;
/// Interrupt hint between two event handlers in one dispatch.
pub const HINT_HANDLER_BOUNDARY: i32 = -2;
/// Interrupt hints at or above zero report collector-step contexts.
pub const HINT_GC_STEP: i32 = 0;

/// What the embedder wants done at a safepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptAction {
    /// Keep running.
    #[default]
    Continue,
    /// Unwind cooperatively with a status distinct from a yield.
    Break,
    /// Suspend exactly as a script-invoked yield with zero arguments.
    Yield,
}

/// Classification of whether a cooperative suspension is safe at the
/// current program point. Only [`Ok`](Yieldability::Ok) (and, for callers
/// accepting the lenient reading, `CallDepthTooDeep`) may be treated as
/// suspendable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Yieldability {
    Ok,
    CallDepthTooDeep,
    BadFrame,
    NotScriptFrame,
    InvalidProgramCounter,
    UnsupportedInstruction,
}

impl Yieldability {
    /// Whether injecting a yield here is permitted.
    pub fn is_suspendable(self, strict: bool) -> bool {
        match self {
            Yieldability::Ok => true,
            Yieldability::CallDepthTooDeep => !strict,
            _ => false,
        }
    }
}

/// Scheduling callback: `(task, hint, probe) -> action`.
pub type InterruptCallback = Box<dyn FnMut(ThreadRef, i32, Yieldability) -> InterruptAction>;
/// Thread lifecycle callback: `(parent, child)`; `parent` is None on
/// destruction.
pub type UserthreadCallback = Box<dyn FnMut(Option<ThreadRef>, ThreadRef)>;
/// Event registration filter: `(task, event name, registering) -> allowed`.
pub type RegisterFilterCallback = Box<dyn FnMut(ThreadRef, &str, bool) -> bool>;
/// Gate on externally-triggered dispatch: `task -> allowed`.
pub type DispatchGateCallback = Box<dyn FnMut(ThreadRef) -> bool>;
/// Monotonic clock returning seconds.
pub type ClockCallback = Box<dyn FnMut() -> f64>;
/// Hint that the next timer is due in the given number of seconds.
pub type TimerDueCallback = Box<dyn FnMut(ThreadRef, f64)>;
/// Fatal-error notification before the VM aborts the operation.
pub type PanicCallback = Box<dyn FnMut(&str)>;

/// All engine-level embedder callbacks. Absent callbacks take the fast
/// path.
#[derive(Default)]
pub struct Callbacks {
    pub interrupt: Option<InterruptCallback>,
    pub userthread: Option<UserthreadCallback>,
    pub register_filter: Option<RegisterFilterCallback>,
    pub may_handle_event: Option<DispatchGateCallback>,
    pub clock: Option<ClockCallback>,
    pub timer_due: Option<TimerDueCallback>,
    pub performance_clock: Option<ClockCallback>,
    pub panic: Option<PanicCallback>,
}
