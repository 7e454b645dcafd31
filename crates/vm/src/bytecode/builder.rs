//! Programmatic bytecode construction.
//!
//! The compiler that produces container files is an external collaborator;
//! embedders and tests assemble modules through these builders instead of
//! hand-packing bytes. [`ModuleBuilder::build`] emits exactly the container
//! format [`crate::bytecode::loader::load_module`] consumes.

use hashbrown::HashMap;

use ares_io::StreamWriter;

use crate::bytecode::instruction::Instr;
use crate::bytecode::op_code::OpCode;
use crate::bytecode::proto::{Capture, Constant, ProtoFlags};
use crate::bytecode::BYTECODE_VERSION;

/// Builder for one function prototype.
#[derive(Debug, Clone)]
pub struct FunctionBuilder {
    pub num_params: u8,
    pub num_upvalues: u8,
    pub max_stack: u8,
    pub flags: ProtoFlags,
    code: Vec<u32>,
    constants: Vec<Constant>,
    captures: Vec<Capture>,
    children: Vec<u32>,
    lines: Vec<u32>,
    current_line: u32,
    source: Option<u32>,
}

impl FunctionBuilder {
    /// Creates a function builder with the given arity and register window.
    pub fn new(num_params: u8, max_stack: u8) -> Self {
        FunctionBuilder {
            num_params,
            num_upvalues: 0,
            max_stack,
            flags: ProtoFlags::empty(),
            code: Vec::new(),
            constants: Vec::new(),
            captures: Vec::new(),
            children: Vec::new(),
            lines: Vec::new(),
            current_line: 0,
            source: None,
        }
    }

    /// Sets the source line attributed to subsequently emitted instructions.
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.current_line = line;
        self
    }

    /// Sets the per-function source name (module string index).
    pub fn source(&mut self, string_index: u32) -> &mut Self {
        self.source = Some(string_index);
        self
    }

    /// Appends an instruction, returning its program counter.
    pub fn emit(&mut self, instr: Instr) -> usize {
        self.code.push(instr.0);
        self.lines.push(self.current_line);
        self.code.len() - 1
    }

    /// Emits a placeholder jump to be resolved with [`patch_jump`].
    ///
    /// [`patch_jump`]: FunctionBuilder::patch_jump
    pub fn emit_jump(&mut self, op: OpCode, a: u8) -> usize {
        self.emit(Instr::asbx(op, a, 0))
    }

    /// Points the jump at `at` to `target`.
    pub fn patch_jump(&mut self, at: usize, target: usize) {
        let displacement = target as i64 - (at as i64 + 1);
        let instr = Instr(self.code[at]);
        let op = instr.opcode().expect("patching an emitted instruction");
        self.code[at] = Instr::asbx(op, instr.a(), displacement as i16).0;
    }

    /// Current position, usable as a backward-jump target.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    /// Interns a constant, returning its index.
    pub fn constant(&mut self, constant: Constant) -> u16 {
        if let Some(found) = self.constants.iter().position(|c| *c == constant) {
            return found as u16;
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as u16
    }

    /// Declares an upvalue capture; call order defines upvalue indices.
    pub fn capture(&mut self, capture: Capture) -> u8 {
        self.captures.push(capture);
        self.num_upvalues = self.captures.len() as u8;
        (self.captures.len() - 1) as u8
    }

    /// Records a child prototype (module function index).
    pub fn child(&mut self, function_index: u32) -> u16 {
        self.children.push(function_index);
        (self.children.len() - 1) as u16
    }
}

/// Builder for a compiled module.
#[derive(Debug, Default)]
pub struct ModuleBuilder {
    strings: Vec<Vec<u8>>,
    string_index: HashMap<Vec<u8>, u32>,
    functions: Vec<FunctionBuilder>,
}

impl ModuleBuilder {
    /// Creates an empty module builder.
    pub fn new() -> Self {
        ModuleBuilder::default()
    }

    /// Interns a string into the module string table.
    pub fn string<S: AsRef<[u8]>>(&mut self, s: S) -> u32 {
        let bytes = s.as_ref().to_vec();
        if let Some(&index) = self.string_index.get(&bytes) {
            return index;
        }
        let index = self.strings.len() as u32;
        self.string_index.insert(bytes.clone(), index);
        self.strings.push(bytes);
        index
    }

    /// Shorthand for a string constant.
    pub fn string_constant<S: AsRef<[u8]>>(&mut self, s: S) -> Constant {
        Constant::String(self.string(s))
    }

    /// Adds a function, returning its module index. Children must be added
    /// before the functions that reference them.
    pub fn add_function(&mut self, function: FunctionBuilder) -> u32 {
        self.functions.push(function);
        (self.functions.len() - 1) as u32
    }

    /// Emits the container with `main_index` as the entry function.
    pub fn build(&self, main_index: u32) -> Vec<u8> {
        let mut w = StreamWriter::with_capacity(256);
        w.write_u8(BYTECODE_VERSION);

        w.write_var_u32(self.strings.len() as u32);
        for s in &self.strings {
            w.write_var_bytes(s);
        }

        w.write_var_u32(self.functions.len() as u32);
        for f in &self.functions {
            w.write_u8(f.num_params);
            w.write_u8(f.num_upvalues);
            w.write_u8(f.max_stack);
            w.write_u8(f.flags.bits());

            w.write_var_u32(f.code.len() as u32);
            for word in &f.code {
                w.write_u32(*word);
            }

            w.write_var_u32(f.constants.len() as u32);
            for c in &f.constants {
                match c {
                    Constant::Nil => w.write_u8(0),
                    Constant::Boolean(false) => w.write_u8(1),
                    Constant::Boolean(true) => w.write_u8(2),
                    Constant::Number(n) => {
                        w.write_u8(3);
                        w.write_f64(*n);
                    }
                    Constant::Vector(v) => {
                        w.write_u8(4);
                        for lane in v {
                            w.write_f32(*lane);
                        }
                    }
                    Constant::String(index) => {
                        w.write_u8(5);
                        w.write_var_u32(*index);
                    }
                }
            }

            w.write_var_u32(f.captures.len() as u32);
            for cap in &f.captures {
                match cap {
                    Capture::Local(reg) => {
                        w.write_u8(0);
                        w.write_u8(*reg);
                    }
                    Capture::Upvalue(index) => {
                        w.write_u8(1);
                        w.write_u8(*index);
                    }
                }
            }

            w.write_var_u32(f.children.len() as u32);
            for child in &f.children {
                w.write_var_u32(*child);
            }

            w.write_var_u32(f.lines.len() as u32);
            for line in &f.lines {
                w.write_var_u32(*line);
            }

            w.write_var_u32(f.source.map(|s| s + 1).unwrap_or(0));
        }

        w.write_var_u32(main_index);
        w.into_bytes()
    }
}
