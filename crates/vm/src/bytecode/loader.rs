//! Container loader and verifier.
//!
//! Loading interns the module's strings, materializes each prototype into
//! the heap, and verifies every instruction against the prototype's
//! register window before anything can execute. Rejected containers leave
//! no partial state behind except already-interned strings, which are
//! harmless.

use ares_io::StreamReader;

use crate::bytecode::instruction::Instr;
use crate::bytecode::op_code::OpCode;
use crate::bytecode::proto::{Capture, Proto, ProtoFlags};
use crate::bytecode::{BYTECODE_VERSION, MULTI};
use crate::error::{VmError, VmResult};
use crate::heap::Heap;
use crate::value::{ProtoRef, StringRef, Value};

const MAX_STRINGS: u64 = 1 << 20;
const MAX_STRING_BYTES: usize = 1 << 24;
const MAX_PROTOS: u64 = 1 << 16;
const MAX_CODE: u64 = 1 << 22;

/// Loads a compiled module, returning the main prototype.
pub fn load_module(heap: &mut Heap, bytes: &[u8], chunk_name: &str) -> VmResult<ProtoRef> {
    let mut r = StreamReader::new(bytes);
    let result = load_inner(heap, &mut r, chunk_name);
    match result {
        Ok(main) => {
            if r.remaining() != 0 {
                return Err(VmError::bad_bytecode("trailing bytes after module"));
            }
            Ok(main)
        }
        Err(e) => Err(e),
    }
}

fn load_inner(heap: &mut Heap, r: &mut StreamReader, chunk_name: &str) -> VmResult<ProtoRef> {
    let version = r
        .read_u8()
        .map_err(|_| VmError::bad_bytecode("empty module"))?;
    if version != BYTECODE_VERSION {
        return Err(VmError::bad_bytecode(format!(
            "unsupported bytecode version {version}"
        )));
    }

    let bad = |e: ares_io::IoError| VmError::bad_bytecode(e.to_string());

    let string_count = r.read_var_u64(MAX_STRINGS).map_err(bad)? as usize;
    let mut strings: Vec<StringRef> = Vec::with_capacity(string_count);
    for _ in 0..string_count {
        let data = r.read_var_bytes(MAX_STRING_BYTES).map_err(bad)?;
        strings.push(heap.intern(&data)?);
    }

    let chunk_source = heap.intern(chunk_name.as_bytes())?;

    let proto_count = r.read_var_u64(MAX_PROTOS).map_err(bad)? as usize;
    if proto_count == 0 {
        return Err(VmError::bad_bytecode("module has no functions"));
    }
    let mut protos: Vec<ProtoRef> = Vec::with_capacity(proto_count);

    for index in 0..proto_count {
        let num_params = r.read_u8().map_err(bad)?;
        let num_upvalues = r.read_u8().map_err(bad)?;
        let max_stack = r.read_u8().map_err(bad)?;
        let flags = ProtoFlags::from_bits(r.read_u8().map_err(bad)?)
            .ok_or_else(|| VmError::bad_bytecode("unknown prototype flag bits"))?;

        if num_params > max_stack {
            return Err(VmError::bad_bytecode("parameter count exceeds registers"));
        }

        let code_len = r.read_var_u64(MAX_CODE).map_err(bad)? as usize;
        let mut code = Vec::with_capacity(code_len);
        for _ in 0..code_len {
            code.push(r.read_u32().map_err(bad)?);
        }

        let const_count = r.read_var_u64(u16::MAX as u64).map_err(bad)? as usize;
        let mut constants = Vec::with_capacity(const_count);
        for _ in 0..const_count {
            let tag = r.read_u8().map_err(bad)?;
            constants.push(match tag {
                0 => Value::Nil,
                1 => Value::Boolean(false),
                2 => Value::Boolean(true),
                3 => Value::Number(r.read_f64().map_err(bad)?),
                4 => {
                    let mut v = [0f32; 4];
                    for lane in &mut v {
                        *lane = r.read_f32().map_err(bad)?;
                    }
                    Value::Vector(v)
                }
                5 => {
                    let string_index = r.read_var_u32().map_err(bad)? as usize;
                    let s = strings.get(string_index).ok_or_else(|| {
                        VmError::bad_bytecode("constant references unknown string")
                    })?;
                    Value::String(*s)
                }
                other => {
                    return Err(VmError::bad_bytecode(format!(
                        "unknown constant tag {other}"
                    )))
                }
            });
        }

        let capture_count = r.read_var_u64(u8::MAX as u64).map_err(bad)? as usize;
        if capture_count != num_upvalues as usize {
            return Err(VmError::bad_bytecode("capture list length != upvalue count"));
        }
        let mut captures = Vec::with_capacity(capture_count);
        for _ in 0..capture_count {
            let kind = r.read_u8().map_err(bad)?;
            let operand = r.read_u8().map_err(bad)?;
            captures.push(match kind {
                0 => Capture::Local(operand),
                1 => Capture::Upvalue(operand),
                other => {
                    return Err(VmError::bad_bytecode(format!(
                        "unknown capture kind {other}"
                    )))
                }
            });
        }

        let child_count = r.read_var_u64(MAX_PROTOS).map_err(bad)? as usize;
        let mut children = Vec::with_capacity(child_count);
        for _ in 0..child_count {
            let child_index = r.read_var_u32().map_err(bad)? as usize;
            if child_index >= index {
                return Err(VmError::bad_bytecode(
                    "child prototype must precede its parent",
                ));
            }
            children.push(protos[child_index]);
        }

        let line_count = r.read_var_u64(MAX_CODE).map_err(bad)? as usize;
        if line_count != 0 && line_count != code_len {
            return Err(VmError::bad_bytecode("debug line table length mismatch"));
        }
        let mut debug_lines = Vec::with_capacity(line_count);
        for _ in 0..line_count {
            debug_lines.push(r.read_var_u32().map_err(bad)?);
        }

        let source_plus1 = r.read_var_u32().map_err(bad)? as usize;
        let source = if source_plus1 == 0 {
            // Single-file bytecode has no per-function source; fall back to
            // the chunk-wide name.
            Some(chunk_source)
        } else {
            let s = strings
                .get(source_plus1 - 1)
                .ok_or_else(|| VmError::bad_bytecode("source references unknown string"))?;
            Some(*s)
        };

        let proto = Proto {
            num_params,
            num_upvalues,
            max_stack,
            flags,
            code,
            constants,
            captures,
            children,
            debug_lines,
            source,
        };
        verify_proto(&proto)?;
        protos.push(heap.new_proto(proto)?);
    }

    let main_index = r.read_var_u32().map_err(bad)? as usize;
    protos
        .get(main_index)
        .copied()
        .ok_or_else(|| VmError::bad_bytecode("main function index out of range"))
}

/// Static verification of one prototype. Every register operand must fit
/// the window, every jump must land on an instruction, and every constant,
/// upvalue, and child reference must resolve. The persistence subsystem
/// runs the same pass over prototypes arriving in a state stream.
pub(crate) fn verify_proto(proto: &Proto) -> VmResult<()> {
    let code_len = proto.code.len();
    let max_stack = proto.max_stack as usize;

    for cap in &proto.captures {
        if let Capture::Local(reg) = cap {
            if *reg as usize >= max_stack {
                return Err(VmError::bad_bytecode("capture register out of range"));
            }
        }
    }

    let reg = |r: u8| -> VmResult<()> {
        if (r as usize) < max_stack {
            Ok(())
        } else {
            Err(VmError::bad_bytecode(format!(
                "register {r} outside window of {max_stack}"
            )))
        }
    };
    let konst = |i: usize| -> VmResult<()> {
        if i < proto.constants.len() {
            Ok(())
        } else {
            Err(VmError::bad_bytecode("constant index out of range"))
        }
    };
    let string_konst = |i: usize| -> VmResult<()> {
        konst(i)?;
        match proto.constants[i] {
            Value::String(_) => Ok(()),
            _ => Err(VmError::bad_bytecode("global name must be a string constant")),
        }
    };
    let target = |pc: usize, sbx: i16| -> VmResult<()> {
        let dest = pc as i64 + 1 + sbx as i64;
        if dest >= 0 && (dest as usize) < code_len {
            Ok(())
        } else {
            Err(VmError::bad_bytecode("jump target out of range"))
        }
    };

    for (pc, word) in proto.code.iter().enumerate() {
        let i = Instr(*word);
        let op = i.opcode()?;
        match op {
            OpCode::LoadNil | OpCode::LoadBool => reg(i.a())?,
            OpCode::LoadConst => {
                reg(i.a())?;
                konst(i.bx() as usize)?;
            }
            OpCode::Move | OpCode::Unm | OpCode::Not | OpCode::Len => {
                reg(i.a())?;
                reg(i.b())?;
            }
            OpCode::GetGlobal | OpCode::SetGlobal => {
                reg(i.a())?;
                string_konst(i.bx() as usize)?;
            }
            OpCode::GetUpvalue | OpCode::SetUpvalue => {
                reg(i.a())?;
                if i.b() >= proto.num_upvalues {
                    return Err(VmError::bad_bytecode("upvalue index out of range"));
                }
            }
            OpCode::NewTable => reg(i.a())?,
            OpCode::GetTable | OpCode::SetTable => {
                reg(i.a())?;
                reg(i.b())?;
                reg(i.c())?;
            }
            OpCode::GetField => {
                reg(i.a())?;
                reg(i.b())?;
                konst(i.c() as usize)?;
            }
            OpCode::SetField => {
                reg(i.a())?;
                konst(i.b() as usize)?;
                reg(i.c())?;
            }
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::Concat
            | OpCode::Eq
            | OpCode::Lt
            | OpCode::Le => {
                reg(i.a())?;
                reg(i.b())?;
                reg(i.c())?;
            }
            OpCode::Jump => target(pc, i.sbx())?,
            OpCode::JumpIf | OpCode::JumpIfNot => {
                reg(i.a())?;
                target(pc, i.sbx())?;
            }
            OpCode::Call => {
                let a = i.a() as usize;
                let nargs = i.b() as usize;
                if i.b() == MULTI || i.c() == MULTI {
                    return Err(VmError::bad_bytecode(
                        "variadic call forms are not encodable",
                    ));
                }
                if a + 1 + nargs > max_stack || a + i.c() as usize > max_stack {
                    return Err(VmError::bad_bytecode("call operands outside window"));
                }
            }
            OpCode::Return => {
                let a = i.a() as usize;
                if i.b() == MULTI {
                    return Err(VmError::bad_bytecode("variadic return is not encodable"));
                }
                if a + i.b() as usize > max_stack {
                    return Err(VmError::bad_bytecode("return operands outside window"));
                }
            }
            OpCode::Closure => {
                reg(i.a())?;
                if i.bx() as usize >= proto.children.len() {
                    return Err(VmError::bad_bytecode("child prototype index out of range"));
                }
            }
            OpCode::CloseUpvalues => {
                if i.a() as usize > max_stack {
                    return Err(VmError::bad_bytecode("close boundary outside window"));
                }
            }
            OpCode::ForGenPrep | OpCode::ForGenLoop => {
                if i.a() as usize + 3 >= max_stack {
                    return Err(VmError::bad_bytecode("iteration registers outside window"));
                }
                target(pc, i.sbx())?;
            }
            OpCode::Vararg => {
                if !proto.is_vararg() {
                    return Err(VmError::bad_bytecode("vararg access in fixed-arity function"));
                }
                let a = i.a() as usize;
                if i.b() == MULTI || a + i.b() as usize > max_stack {
                    return Err(VmError::bad_bytecode("vararg operands outside window"));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::{FunctionBuilder, ModuleBuilder};
    use crate::bytecode::proto::Constant;
    use crate::config::VmConfig;

    fn empty_main() -> (ModuleBuilder, u32) {
        let mut module = ModuleBuilder::new();
        let mut main = FunctionBuilder::new(0, 2);
        main.emit(Instr::abc(OpCode::Return, 0, 0, 0));
        let index = module.add_function(main);
        (module, index)
    }

    #[test]
    fn test_round_trip_minimal_module() {
        let (module, main) = empty_main();
        let bytes = module.build(main);

        let mut heap = Heap::new(&VmConfig::default());
        let proto = load_module(&mut heap, &bytes, "chunk").unwrap();
        let p = heap.proto(proto);
        assert_eq!(p.code.len(), 1);
        assert_eq!(p.num_params, 0);
        // Absent per-function source falls back to the chunk name.
        assert_eq!(heap.string_bytes(p.source.unwrap()), b"chunk");
    }

    #[test]
    fn test_round_trip_constants_and_children() {
        let mut module = ModuleBuilder::new();

        let mut child = FunctionBuilder::new(2, 4);
        child.emit(Instr::abc(OpCode::Add, 2, 0, 1));
        child.emit(Instr::abc(OpCode::Return, 2, 1, 0));
        let child_index = module.add_function(child);

        let mut main = FunctionBuilder::new(0, 4);
        let name = module.string_constant("greeting");
        let k_name = main.constant(name);
        let k_num = main.constant(Constant::Number(42.0));
        main.line(3);
        main.emit(Instr::abx(OpCode::LoadConst, 0, k_name));
        main.emit(Instr::abx(OpCode::LoadConst, 1, k_num));
        let c = main.child(child_index);
        main.emit(Instr::abx(OpCode::Closure, 2, c));
        main.emit(Instr::abc(OpCode::Return, 0, 0, 0));
        let main_index = module.add_function(main);

        let bytes = module.build(main_index);
        let mut heap = Heap::new(&VmConfig::default());
        let proto = load_module(&mut heap, &bytes, "chunk").unwrap();
        let p = heap.proto(proto);
        assert_eq!(p.constants.len(), 2);
        assert_eq!(p.children.len(), 1);
        assert_eq!(p.debug_lines, vec![3, 3, 3, 3]);
        let child = heap.proto(p.children[0]);
        assert_eq!(child.num_params, 2);
    }

    #[test]
    fn test_rejects_bad_version() {
        let (module, main) = empty_main();
        let mut bytes = module.build(main);
        bytes[0] = 99;
        let mut heap = Heap::new(&VmConfig::default());
        assert!(matches!(
            load_module(&mut heap, &bytes, "chunk"),
            Err(VmError::BadBytecode { .. })
        ));
    }

    #[test]
    fn test_rejects_truncated_module() {
        let (module, main) = empty_main();
        let bytes = module.build(main);
        let mut heap = Heap::new(&VmConfig::default());
        assert!(load_module(&mut heap, &bytes[..bytes.len() - 2], "chunk").is_err());
    }

    #[test]
    fn test_rejects_register_out_of_window() {
        let mut module = ModuleBuilder::new();
        let mut main = FunctionBuilder::new(0, 2);
        main.emit(Instr::abc(OpCode::Move, 1, 7, 0)); // r7 outside window of 2
        main.emit(Instr::abc(OpCode::Return, 0, 0, 0));
        let index = module.add_function(main);
        let bytes = module.build(index);
        let mut heap = Heap::new(&VmConfig::default());
        assert!(load_module(&mut heap, &bytes, "chunk").is_err());
    }

    #[test]
    fn test_rejects_jump_out_of_range() {
        let mut module = ModuleBuilder::new();
        let mut main = FunctionBuilder::new(0, 2);
        main.emit(Instr::asbx(OpCode::Jump, 0, 100));
        main.emit(Instr::abc(OpCode::Return, 0, 0, 0));
        let index = module.add_function(main);
        let bytes = module.build(index);
        let mut heap = Heap::new(&VmConfig::default());
        assert!(load_module(&mut heap, &bytes, "chunk").is_err());
    }

    #[test]
    fn test_rejects_vararg_in_fixed_function() {
        let mut module = ModuleBuilder::new();
        let mut main = FunctionBuilder::new(0, 2);
        main.emit(Instr::abc(OpCode::Vararg, 0, 1, 0));
        main.emit(Instr::abc(OpCode::Return, 0, 0, 0));
        let index = module.add_function(main);
        let bytes = module.build(index);
        let mut heap = Heap::new(&VmConfig::default());
        assert!(load_module(&mut heap, &bytes, "chunk").is_err());
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let (module, main) = empty_main();
        let mut bytes = module.build(main);
        bytes.push(0xAB);
        let mut heap = Heap::new(&VmConfig::default());
        assert!(load_module(&mut heap, &bytes, "chunk").is_err());
    }
}
