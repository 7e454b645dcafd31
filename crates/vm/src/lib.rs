//! # Ares VM
//!
//! A bytecode virtual machine built around one contract: the runtime state
//! of any suspended task — call stack, open upvalues, closures, tables,
//! userdata — can be serialized to a portable byte stream, moved to
//! another host, deserialized, and resumed with identical observable
//! behavior.
//!
//! ## Features
//!
//! - **Register-Stack Interpreter**: fixed-width instructions over
//!   per-frame register windows, with a verifying loader
//! - **State Serialization**: the Ares subsystem walks the reachable
//!   graph with back-references and a bidirectional permanents table
//! - **Iteration-Stable Tables**: an explicit iteration-order vector pins
//!   `next` order across hosts whose handle-derived hashes differ
//! - **Cooperative Scheduling**: safepoint interrupts with a load-bearing
//!   distinction between script yields and host-injected breaks
//! - **Task Hierarchy**: base image, forker, script instances, and
//!   cancellable handler threads
//! - **Event & Timer Driver**: ordered dispatch with a between-handlers
//!   interrupt, plus a catch-up-clamped timer wheel
//! - **Incremental Collection**: tri-colour collector with per-category
//!   accounting, byte limits, and a fixed bit for pinned images
//!
//! ## Architecture
//!
//! The crate is organized around a few core components:
//!
//! - **ExecutionEngine**: dispatch loop, call/return machinery, resume
//! - **Heap**: typed arenas, interning, accounting, the collector
//! - **Table**: array part, chained hash part, pinned iteration order
//! - **Ares**: serializer, deserializer, permanents table
//! - **EventManager / TimerManager**: per-instance service singletons
//!
//! ## Example
//!
//! ```rust,no_run
//! use ares_vm::{ExecutionEngine, Resumption, Value, VmConfig};
//!
//! # fn example(bytecode: &[u8]) -> Result<(), ares_vm::VmError> {
//! let mut engine = ExecutionEngine::new(VmConfig::default())?;
//! engine.load_base_image(bytecode, "main")?;
//! let instance = engine.fork_instance(None)?;
//!
//! // Drive an event through the instance's handlers.
//! match engine.dispatch_event(instance, "touch", &[Value::Number(1.0)])? {
//!     Resumption::Finished(_) => {}
//!     Resumption::Yield(values) => {
//!         // The handler suspended; persist it, move it, resume it.
//!         let image = engine.persist_instance(instance)?;
//!         let _ = (values, image);
//!     }
//!     _ => {}
//! }
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

/// State serialization: stream format, permanents, serializer, deserializer
pub mod ares;
/// Mutable byte buffers
pub mod buffer;
/// Opcodes, instruction words, prototypes, loader, builder
pub mod bytecode;
/// Script and native closures
pub mod closure;
/// Engine configuration knobs
pub mod config;
/// VM error types and result handling
pub mod error;
/// Named event channel with ordered dispatch
pub mod events;
/// The dispatch loop and task lifecycle
pub mod execution_engine;
/// Incremental tri-colour collector
pub mod gc;
/// Typed arenas, interning, accounting
pub mod heap;
/// Base image, forker, instances, handler threads
pub mod hierarchy;
/// Embedder callback surface
pub mod hooks;
/// Native function registry and continuations
pub mod native;
/// Arithmetic, comparison, and concatenation helpers
pub mod ops;
/// The iteration-stable table
pub mod table;
/// Threads, frames, upvalue cells
pub mod thread;
/// One-shot and periodic timers
pub mod timers;
/// Userdata objects and reserved tags
pub mod userdata;
/// The tagged value union and heap handles
pub mod value;

pub use ares::{Permanents, Serializer, UserdataCodec, STREAM_MAGIC};
pub use bytecode::{FunctionBuilder, Instr, ModuleBuilder, OpCode};
pub use config::VmConfig;
pub use error::{VmError, VmResult};
pub use events::EventManager;
pub use execution_engine::{ExecutionEngine, Resumption};
pub use heap::{GcRef, Heap};
pub use hierarchy::TIMER_TICK_EVENT;
pub use hooks::{Callbacks, InterruptAction, Yieldability};
pub use native::{ContinuationInput, NativeCall, NativeControl, NativeRegistry};
pub use table::Table;
pub use thread::{TaskIdentity, ThreadStatus};
pub use timers::TimerManager;
pub use value::{ThreadRef, Value, ValueKind};
