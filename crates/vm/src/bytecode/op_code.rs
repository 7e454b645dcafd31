//! Opcode definitions for the Ares VM.

use crate::error::{VmError, VmResult};

/// The instruction set: register operations over a per-frame window.
///
/// Field conventions: `A`, `B`, `C` are 8-bit register or small-immediate
/// operands; `Bx` is the unsigned 16-bit field overlapping `B`/`C`; `sBx`
/// is the same field signed (jump displacement in instructions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// R[A] = nil
    LoadNil = 0,
    /// R[A] = bool(B)
    LoadBool = 1,
    /// R[A] = K[Bx]
    LoadConst = 2,
    /// R[A] = R[B]
    Move = 3,
    /// R[A] = globals[K[Bx]], falling back one hop on miss
    GetGlobal = 4,
    /// globals[K[Bx]] = R[A]
    SetGlobal = 5,
    /// R[A] = upvalue[B]
    GetUpvalue = 6,
    /// upvalue[B] = R[A]
    SetUpvalue = 7,
    /// R[A] = new table with array hint B and node hint C
    NewTable = 8,
    /// R[A] = R[B][R[C]]
    GetTable = 9,
    /// R[A][R[B]] = R[C]
    SetTable = 10,
    /// R[A] = R[B][K[C]]
    GetField = 11,
    /// R[A][K[B]] = R[C]
    SetField = 12,
    /// R[A] = R[B] + R[C]
    Add = 13,
    /// R[A] = R[B] - R[C]
    Sub = 14,
    /// R[A] = R[B] * R[C]
    Mul = 15,
    /// R[A] = R[B] / R[C]
    Div = 16,
    /// R[A] = R[B] % R[C]
    Mod = 17,
    /// R[A] = -R[B]
    Unm = 18,
    /// R[A] = not R[B]
    Not = 19,
    /// R[A] = R[B] .. R[C]
    Concat = 20,
    /// R[A] = #R[B]
    Len = 21,
    /// R[A] = R[B] == R[C]
    Eq = 22,
    /// R[A] = R[B] < R[C]
    Lt = 23,
    /// R[A] = R[B] <= R[C]
    Le = 24,
    /// pc += sBx; negative displacement is a safepoint
    Jump = 25,
    /// if R[A] then pc += sBx
    JumpIf = 26,
    /// if not R[A] then pc += sBx
    JumpIfNot = 27,
    /// call R[A] with B args at R[A+1..], C results into R[A..]
    Call = 28,
    /// return B values starting at R[A]
    Return = 29,
    /// R[A] = closure of child prototype Bx, capturing per its capture list
    Closure = 30,
    /// close upvalues for slots >= A
    CloseUpvalues = 31,
    /// check R[A] is a table, clear the control register, pc += sBx
    ForGenPrep = 32,
    /// advance table iteration; on an entry set R[A+2] = key and
    /// R[A+3] = value, then pc += sBx (a back edge)
    ForGenLoop = 33,
    /// copy B varargs into R[A..], padding with nil
    Vararg = 34,
}

impl OpCode {
    /// Number of defined opcodes.
    pub const COUNT: u8 = 35;

    /// Whether executing this opcode consults the interrupt callback.
    /// Backward jumps are handled separately since the displacement sign
    /// decides.
    pub fn is_safepoint(self) -> bool {
        matches!(self, OpCode::Call | OpCode::Return | OpCode::ForGenLoop)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = VmError;

    fn try_from(value: u8) -> VmResult<Self> {
        let op = match value {
            0 => OpCode::LoadNil,
            1 => OpCode::LoadBool,
            2 => OpCode::LoadConst,
            3 => OpCode::Move,
            4 => OpCode::GetGlobal,
            5 => OpCode::SetGlobal,
            6 => OpCode::GetUpvalue,
            7 => OpCode::SetUpvalue,
            8 => OpCode::NewTable,
            9 => OpCode::GetTable,
            10 => OpCode::SetTable,
            11 => OpCode::GetField,
            12 => OpCode::SetField,
            13 => OpCode::Add,
            14 => OpCode::Sub,
            15 => OpCode::Mul,
            16 => OpCode::Div,
            17 => OpCode::Mod,
            18 => OpCode::Unm,
            19 => OpCode::Not,
            20 => OpCode::Concat,
            21 => OpCode::Len,
            22 => OpCode::Eq,
            23 => OpCode::Lt,
            24 => OpCode::Le,
            25 => OpCode::Jump,
            26 => OpCode::JumpIf,
            27 => OpCode::JumpIfNot,
            28 => OpCode::Call,
            29 => OpCode::Return,
            30 => OpCode::Closure,
            31 => OpCode::CloseUpvalues,
            32 => OpCode::ForGenPrep,
            33 => OpCode::ForGenLoop,
            34 => OpCode::Vararg,
            other => {
                return Err(VmError::bad_bytecode(format!(
                    "invalid opcode {other:#04x}"
                )))
            }
        };
        Ok(op)
    }
}
