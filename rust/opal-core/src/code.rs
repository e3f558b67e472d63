//! Compiled module format shared between the compiler back end and the VM.
//!
//! Instructions use a fixed-width encoding: every instruction is an opcode
//! plus one 32-bit operand. Wide literals live in the module constant pool;
//! branch targets are absolute instruction indices patched by the compiler.
//!
//! The opcode numbering is a contract with compiled modules and must not be
//! reshuffled.

use serde::{Deserialize, Serialize};

/// Bytecode opcodes.
///
/// Operand meaning per opcode (unused operands must be 0):
/// - `PushConst`: constant pool index.
/// - `PushInt`: immediate integer, stored as `i32` cast to `u32`.
/// - `PushProgram`: program index within the module.
/// - `PopN`: number of values to pop.
/// - `LoadLocal`/`LvalLocal`: local slot index within the current frame.
/// - `LoadGlobal`/`LvalGlobal`: variable index within the current object.
/// - `Compound`: a `BinaryOp` discriminant.
/// - `Branch`/`BranchIfZero`/`BranchIfNotZero`/`CatchStart`: target pc.
/// - `Switch`: switch table index.
/// - `Aggregate`/`AggregateMultiset`: element count; `AggregateMapping`:
///   key/value pair count.
/// - `CallFun`: function index within the current program.
/// - `CallNative`: index into the module native import table.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    Nop = 0x00,
    PushConst = 0x01,
    PushInt = 0x02,
    Pop = 0x03,
    PopN = 0x04,
    Dup = 0x05,
    Swap = 0x06,
    Mark = 0x07,
    PushProgram = 0x08,

    LoadLocal = 0x10,
    LvalLocal = 0x11,
    LoadGlobal = 0x12,
    LvalGlobal = 0x13,
    Index = 0x14,
    LvalIndex = 0x15,
    Assign = 0x16,
    AssignPop = 0x17,
    Compound = 0x18,

    Add = 0x20,
    Sub = 0x21,
    Mul = 0x22,
    Div = 0x23,
    Mod = 0x24,
    Neg = 0x25,
    Not = 0x26,
    BitAnd = 0x27,
    BitOr = 0x28,
    BitXor = 0x29,

    Lt = 0x30,
    Le = 0x31,
    Gt = 0x32,
    Ge = 0x33,
    Eq = 0x34,
    Ne = 0x35,
    Identical = 0x36,

    Branch = 0x40,
    BranchIfZero = 0x41,
    BranchIfNotZero = 0x42,
    Switch = 0x43,

    Aggregate = 0x50,
    AggregateMapping = 0x51,
    AggregateMultiset = 0x52,

    CallFun = 0x60,
    CallNative = 0x61,
    CallValue = 0x62,
    Return = 0x63,

    CatchStart = 0x70,
    CatchEnd = 0x71,
    Throw = 0x72,
}

/// One fixed-width instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insn {
    pub op: Opcode,
    #[serde(default)]
    pub a: u32,
}

impl Insn {
    pub fn new(op: Opcode, a: u32) -> Self {
        Self { op, a }
    }

    /// Shorthand for an instruction with no operand.
    pub fn op(op: Opcode) -> Self {
        Self { op, a: 0 }
    }

    /// The operand reinterpreted as a signed immediate (for `PushInt`).
    pub fn imm(&self) -> i64 {
        self.a as i32 as i64
    }
}

/// Compile-time constant, converted to a runtime value at load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Constant>),
}

/// A compiled function body.
///
/// Locals layout on the shared stack, starting at the frame base:
/// the `num_args` declared arguments, then (for variadic functions) one
/// slot holding the rest-argument array, then plain locals. `num_locals`
/// counts every slot including arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub num_args: u16,
    pub num_locals: u16,
    #[serde(default)]
    pub variadic: bool,
    pub code: Vec<Insn>,
}

/// A compiled program (class): its functions and per-object variable count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramDef {
    pub name: String,
    #[serde(default)]
    pub num_vars: u16,
    pub functions: Vec<FunctionDef>,
}

/// Jump table for a multi-way dispatch.
///
/// `cases` indexes a constant-pool array the compiler has sorted under the
/// switch ordering. `table` holds `2 * n + 1` target pcs: slot `2i + 1` is
/// taken when the dispatched value equals case `i`, slot `2i` when it falls
/// strictly between cases `i - 1` and `i` (normally the default target).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchTable {
    pub cases: u32,
    pub table: Vec<u32>,
}

/// A complete compiled module: constant pool, programs, switch tables and
/// the native operations it imports by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub constants: Vec<Constant>,
    pub programs: Vec<ProgramDef>,
    #[serde(default)]
    pub switch_tables: Vec<SwitchTable>,
    #[serde(default)]
    pub natives: Vec<String>,
    pub entry_program: u32,
    pub entry_function: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_imm_sign_round_trip() {
        let i = Insn::new(Opcode::PushInt, -7i32 as u32);
        assert_eq!(i.imm(), -7);
        let j = Insn::new(Opcode::PushInt, 300);
        assert_eq!(j.imm(), 300);
    }

    #[test]
    fn test_module_json_round_trip() {
        let module = Module {
            constants: vec![
                Constant::Str("hello".into()),
                Constant::Array(vec![Constant::Int(1), Constant::Float(2.5)]),
            ],
            programs: vec![ProgramDef {
                name: "main".into(),
                num_vars: 0,
                functions: vec![FunctionDef {
                    name: "main".into(),
                    num_args: 0,
                    num_locals: 1,
                    variadic: false,
                    code: vec![Insn::new(Opcode::PushInt, 42), Insn::op(Opcode::Return)],
                }],
            }],
            switch_tables: vec![],
            natives: vec!["write".into()],
            entry_program: 0,
            entry_function: 0,
        };
        let json = serde_json::to_string(&module).unwrap();
        let back: Module = serde_json::from_str(&json).unwrap();
        assert_eq!(back.programs[0].functions[0].code[0].imm(), 42);
        assert_eq!(back.natives, vec!["write".to_string()]);
    }
}
