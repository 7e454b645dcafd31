//! Function closures.
//!
//! A closure is either a script function (prototype plus upvalue cells) or
//! a native function (registry entry plus closed-over values). Script
//! upvalues are independent heap objects so that several closures can alias
//! the same cell; that identity survives persistence.

use crate::native::NativeRef;
use crate::value::{ProtoRef, UpvalueRef, Value};

/// A script closure: prototype and captured upvalue cells.
#[derive(Debug, Clone)]
pub struct ScriptClosure {
    pub proto: ProtoRef,
    pub upvalues: Vec<UpvalueRef>,
}

/// A native closure: registry entry and closed-over values.
#[derive(Debug, Clone)]
pub struct NativeClosure {
    pub func: NativeRef,
    pub upvalues: Vec<Value>,
}

/// A function value.
#[derive(Debug, Clone)]
pub enum Closure {
    Script(ScriptClosure),
    Native(NativeClosure),
}

impl Closure {
    /// Returns the script parts, if this is a script closure.
    pub fn as_script(&self) -> Option<&ScriptClosure> {
        match self {
            Closure::Script(sc) => Some(sc),
            _ => None,
        }
    }

    /// Returns the native parts, if this is a native closure.
    pub fn as_native(&self) -> Option<&NativeClosure> {
        match self {
            Closure::Native(nc) => Some(nc),
            _ => None,
        }
    }

    /// Returns true for native closures.
    pub fn is_native(&self) -> bool {
        matches!(self, Closure::Native(_))
    }

    pub(crate) fn byte_size(&self) -> usize {
        std::mem::size_of::<Closure>()
            + match self {
                Closure::Script(sc) => sc.upvalues.capacity() * std::mem::size_of::<UpvalueRef>(),
                Closure::Native(nc) => nc.upvalues.capacity() * std::mem::size_of::<Value>(),
            }
    }
}
