//! Function prototypes.

use bitflags::bitflags;

use crate::value::{ProtoRef, StringRef, Value};

bitflags! {
    /// Prototype attribute flags carried by the container format.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ProtoFlags: u8 {
        /// The function accepts trailing varargs.
        const VARARG = 1 << 0;
        /// The function was declared method-style and takes an implicit
        /// self parameter.
        const SELF_PARAM = 1 << 1;
    }
}

/// How one upvalue of a child closure is produced at `Closure` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// Capture the enclosing frame's register, sharing an open cell.
    Local(u8),
    /// Alias an upvalue of the enclosing closure.
    Upvalue(u8),
}

/// A constant as it appears in the container, before string interning.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Number(f64),
    Vector([f32; 4]),
    /// Index into the module string table.
    String(u32),
}

/// A loaded function prototype: code, constants, capture plan, debug info.
#[derive(Debug, Clone)]
pub struct Proto {
    pub num_params: u8,
    pub num_upvalues: u8,
    /// Register window size of one activation.
    pub max_stack: u8,
    pub flags: ProtoFlags,
    pub code: Vec<u32>,
    /// Constants with strings already interned.
    pub constants: Vec<Value>,
    pub captures: Vec<Capture>,
    pub children: Vec<ProtoRef>,
    /// One source line per instruction; empty when debug info was stripped.
    pub debug_lines: Vec<u32>,
    /// Per-function source name; falls back to the chunk name when absent.
    pub source: Option<StringRef>,
}

impl Proto {
    /// Whether the function accepts varargs.
    pub fn is_vararg(&self) -> bool {
        self.flags.contains(ProtoFlags::VARARG)
    }

    /// Whether the function was declared method-style.
    pub fn is_method(&self) -> bool {
        self.flags.contains(ProtoFlags::SELF_PARAM)
    }

    /// Source line of an instruction, if debug info is present.
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        self.debug_lines.get(pc).copied()
    }

    pub(crate) fn byte_size(&self) -> usize {
        std::mem::size_of::<Proto>()
            + self.code.capacity() * 4
            + self.constants.capacity() * std::mem::size_of::<Value>()
            + self.captures.capacity() * std::mem::size_of::<Capture>()
            + self.children.capacity() * std::mem::size_of::<ProtoRef>()
            + self.debug_lines.capacity() * 4
    }
}
