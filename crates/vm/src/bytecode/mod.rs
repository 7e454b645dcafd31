//! Bytecode representation for the Ares VM.
//!
//! Instructions are fixed-width 32-bit words over a register window; a
//! compiled module is a length-prefixed container of interned strings and
//! function prototypes. The loader and the builder are exact inverses.

pub mod builder;
pub mod instruction;
pub mod loader;
pub mod op_code;
pub mod proto;

pub use builder::{FunctionBuilder, ModuleBuilder};
pub use instruction::Instr;
pub use loader::load_module;
pub use op_code::OpCode;
pub use proto::{Capture, Constant, Proto, ProtoFlags};

/// Container format version accepted by the loader.
pub const BYTECODE_VERSION: u8 = 1;

/// Result-count marker meaning "all available values".
pub const MULTI: u8 = 0xFF;
