//! The execution engine: module loading, the decode/execute loop, the
//! lvalue protocol, calls and the recovery-point unwinder.
//!
//! All state lives in the `Engine` value; there are no process globals.
//! The dispatcher runs as one loop over the fixed-width instruction
//! stream. Compiled calls push a frame and keep looping; only native
//! operations that call back into the language re-enter the dispatcher,
//! so Rust stack depth is bounded by the configured call depth.

pub mod ops;
mod recover;

use std::collections::VecDeque;
use std::rc::Rc;

use opal_core::code::{Constant, Module, Opcode, SwitchTable};
use opal_core::strings::StringTable;

use crate::array::ArrayRef;
use crate::config::EngineConfig;
use crate::errors::{Control, FatalError, StackFrame};
use crate::mapping::MappingRef;
use crate::multiset::MultisetRef;
use crate::natives::{default_registry, NativeOp, NativeRegistry};
use crate::object::{Callable, ObjectRef, ProgramRef};
use crate::stack::{Frame, Stack};
use crate::values::{switch_cmp, Value};

use ops::BinaryOp;
use recover::RecoveryPoint;

pub(crate) enum Step {
    Continue,
    Returned(Value),
}

pub struct Engine {
    config: EngineConfig,
    pub(crate) stack: Stack,
    pub(crate) frames: Vec<Frame>,
    pub(crate) recovery: Vec<RecoveryPoint>,
    pub(crate) last_trace: Vec<StackFrame>,
    constants: Vec<Value>,
    programs: Vec<ProgramRef>,
    switch_tables: Vec<SwitchTable>,
    natives: Vec<Rc<NativeOp>>,
    registry: NativeRegistry,
    signals: VecDeque<(Value, Vec<Value>)>,
    strings: StringTable,
    entry: Option<(usize, u16)>,
    executed: u64,
    /// Captured output of the `write` native.
    pub output: Vec<String>,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Engine {
        Engine {
            stack: Stack::new(config.max_stack),
            config,
            frames: Vec::new(),
            recovery: Vec::new(),
            last_trace: Vec::new(),
            constants: Vec::new(),
            programs: Vec::new(),
            switch_tables: Vec::new(),
            natives: Vec::new(),
            registry: default_registry(),
            signals: VecDeque::new(),
            strings: StringTable::new(),
            entry: None,
            executed: 0,
            output: Vec::new(),
        }
    }

    pub fn set_instruction_limit(&mut self, max_instructions: u64) {
        self.config.instruction_limit = Some(max_instructions);
    }

    pub fn instructions_executed(&self) -> u64 {
        self.executed
    }

    /// Register an additional native before loading modules that import it.
    pub fn register_native(&mut self, op: NativeOp) {
        self.registry.register(op);
    }

    // -- loading ------------------------------------------------------------

    /// Validate and install a compiled module.
    pub fn load(&mut self, module: Module) -> Result<(), FatalError> {
        let constants: Vec<Value> = module
            .constants
            .iter()
            .map(|c| resolve_constant(&mut self.strings, c))
            .collect();
        validate(&module, &constants, &self.registry)?;

        let mut natives = Vec::with_capacity(module.natives.len());
        for name in &module.natives {
            // Checked by validate; re-resolve rather than unwrap.
            let op = self
                .registry
                .lookup(name)
                .ok_or_else(|| FatalError::Load(format!("unresolved native: {}", name)))?;
            natives.push(op);
        }
        self.constants = constants;
        self.programs = module
            .programs
            .into_iter()
            .map(|p| ProgramRef::new(p.name, p.num_vars as usize, p.functions))
            .collect();
        self.switch_tables = module.switch_tables;
        self.natives = natives;
        self.entry = Some((
            module.entry_program as usize,
            module.entry_function as u16,
        ));
        Ok(())
    }

    // -- running ------------------------------------------------------------

    /// Instantiate the entry program and run its entry function.
    pub fn run(&mut self) -> Result<Value, FatalError> {
        self.run_entry(None)
    }

    /// As [`Engine::run`], with the entry function overridden by name.
    pub fn run_entry(&mut self, function: Option<&str>) -> Result<Value, FatalError> {
        let (pi, fi) = self.entry.ok_or(FatalError::NoModule)?;
        let program = self
            .programs
            .get(pi)
            .cloned()
            .ok_or(FatalError::NoModule)?;
        let fun = match function {
            Some(name) => program
                .find_function(name)
                .ok_or_else(|| FatalError::UndefinedFunction(name.to_string()))?,
            None => fi,
        };
        let object = ObjectRef::instantiate(&program);
        let base = self.frames.len();
        let result = self
            .enter_function(object, fun, 0, 0)
            .and_then(|_| self.dispatch(base));
        match result {
            Ok(v) => Ok(v),
            Err(Control::Raise(v)) => Err(FatalError::Uncaught(format!("{}", v))
                .with_stack_trace(std::mem::take(&mut self.last_trace))),
            Err(Control::Fatal(e)) => Err(e),
        }
    }

    /// Call a callable value with `args`, re-entering the dispatcher for
    /// compiled functions. Exposed for natives and signal delivery.
    pub fn apply(&mut self, callable: &Callable, args: Vec<Value>) -> Result<Value, Control> {
        match callable {
            Callable::Native(op) => {
                let op = op.clone();
                if args.len() < op.min_args {
                    return Err(too_few_args(op.name));
                }
                let argc = args.len();
                let before = self.stack.len();
                for v in args {
                    self.push_value(v)?;
                }
                (op.func)(self, argc)?;
                self.settle_native_result(before)?;
                Ok(self.stack.pop()?)
            }
            Callable::Bound { object, fun } => {
                let base = self.frames.len();
                let argc = args.len();
                for v in args {
                    self.push_value(v)?;
                }
                self.enter_function(object.clone(), *fun, argc, 0)?;
                self.dispatch(base)
            }
        }
    }

    /// Queue a deferred call; it is delivered at the next safe point
    /// (branches and returns) as an ordinary call into `handler`.
    pub fn queue_signal(&mut self, handler: Value, args: Vec<Value>) {
        self.signals.push_back((handler, args));
    }

    // -- dispatcher ---------------------------------------------------------

    fn dispatch(&mut self, base_depth: usize) -> Result<Value, Control> {
        loop {
            match self.step(base_depth) {
                Ok(Step::Continue) => {}
                Ok(Step::Returned(v)) => return Ok(v),
                Err(Control::Raise(v)) => self.handle_raise(v, base_depth)?,
                Err(Control::Fatal(e)) => {
                    return Err(Control::Fatal(e.with_stack_trace(self.backtrace())));
                }
            }
        }
    }

    fn step(&mut self, base_depth: usize) -> Result<Step, Control> {
        self.executed += 1;
        if let Some(limit) = self.config.instruction_limit {
            if self.executed > limit {
                return Err(FatalError::InstructionLimitExceeded(limit).into());
            }
        }
        let insn = {
            let frame = self
                .frames
                .last()
                .ok_or_else(|| FatalError::Invariant("dispatch with no frame".to_string()))?;
            let program = frame.object.program();
            let def = program.function(frame.fun).ok_or_else(|| {
                FatalError::Invariant("frame names a missing function".to_string())
            })?;
            def.code.get(frame.pc).copied()
        };
        let Some(insn) = insn else {
            // Ran off the end of the body: implicit zero return.
            return self.do_return(Value::zero(), base_depth);
        };
        if let Some(frame) = self.frames.last_mut() {
            frame.pc += 1;
        }
        let a = insn.a as usize;

        match insn.op {
            Opcode::Nop => {}
            Opcode::PushConst => {
                let v = self
                    .constants
                    .get(a)
                    .cloned()
                    .ok_or_else(|| invariant("constant index out of range"))?;
                self.push_value(v)?;
            }
            Opcode::PushInt => self.push_value(Value::Int(insn.imm()))?,
            Opcode::Pop => {
                self.stack.pop()?;
            }
            Opcode::PopN => self.stack.discard(a)?,
            Opcode::Dup => {
                let v = self.stack.peek(0)?.clone();
                self.push_value(v)?;
            }
            Opcode::Swap => {
                let y = self.stack.pop()?;
                let x = self.stack.pop()?;
                self.push_value(y)?;
                self.push_value(x)?;
            }
            Opcode::Mark => self.stack.push_mark(),
            Opcode::PushProgram => {
                let p = self
                    .programs
                    .get(a)
                    .cloned()
                    .ok_or_else(|| invariant("program index out of range"))?;
                self.push_value(Value::Program(p))?;
            }

            Opcode::LoadLocal => {
                let slot = self.local_slot(a)?;
                let v = self.stack.get(slot)?.clone();
                self.push_value(v)?;
            }
            Opcode::LvalLocal => {
                let slot = self.local_slot(a)?;
                self.push_value(Value::LvalLocal(slot))?;
                self.push_value(Value::Void)?;
            }
            Opcode::LoadGlobal => {
                let object = self.current_object()?;
                let v = object
                    .get_var(a)
                    .ok_or_else(|| raise("cannot access a variable in a destructed object"))?;
                self.push_value(v)?;
            }
            Opcode::LvalGlobal => {
                let object = self.current_object()?;
                self.push_value(Value::Object(object))?;
                self.push_value(Value::Int(a as i64))?;
            }
            Opcode::Index => {
                let index = self.stack.pop()?;
                let container = self.stack.pop()?;
                let v = self.index_value(container, index)?;
                self.push_value(v)?;
            }
            Opcode::LvalIndex => {
                let index = self.stack.pop()?;
                let container = self.stack.pop()?;
                match container {
                    Value::Array(_) | Value::Mapping(_) | Value::Multiset(_) => {}
                    other => {
                        return Err(raise(format!(
                            "cannot assign an index of a {}",
                            ops::type_name(&other)
                        )));
                    }
                }
                self.push_value(container)?;
                self.push_value(index)?;
            }
            Opcode::Assign => {
                let value = self.stack.pop()?;
                let (lv1, lv2) = self.pop_lvalue()?;
                self.write_lvalue(lv1, lv2, value.clone())?;
                self.push_value(value)?;
            }
            Opcode::AssignPop => {
                let value = self.stack.pop()?;
                let (lv1, lv2) = self.pop_lvalue()?;
                self.write_lvalue(lv1, lv2, value)?;
            }
            Opcode::Compound => {
                let op = BinaryOp::from_u32(insn.a)
                    .ok_or_else(|| invariant("bad compound operator"))?;
                let rhs = self.stack.pop()?;
                let (lv1, lv2) = self.pop_lvalue()?;
                // Taking (not copying) the current value releases the slot's
                // handle so a uniquely held container can mutate in place.
                let current = self.take_lvalue(&lv1, &lv2)?;
                let result = ops::binary(op, current, rhs)?;
                self.write_lvalue(lv1, lv2, result.clone())?;
                self.push_value(result)?;
            }

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::BitAnd
            | Opcode::BitOr
            | Opcode::BitXor => {
                let rhs = self.stack.pop()?;
                let lhs = self.stack.pop()?;
                let op = match insn.op {
                    Opcode::Add => BinaryOp::Add,
                    Opcode::Sub => BinaryOp::Sub,
                    Opcode::Mul => BinaryOp::Mul,
                    Opcode::Div => BinaryOp::Div,
                    Opcode::Mod => BinaryOp::Mod,
                    Opcode::BitAnd => BinaryOp::BitAnd,
                    Opcode::BitOr => BinaryOp::BitOr,
                    _ => BinaryOp::BitXor,
                };
                let v = ops::binary(op, lhs, rhs)?;
                self.push_value(v)?;
            }
            Opcode::Neg => {
                let v = self.stack.pop()?;
                let v = ops::negate(v)?;
                self.push_value(v)?;
            }
            Opcode::Not => {
                let v = self.stack.pop()?;
                self.push_value(Value::Int(v.is_zero() as i64))?;
            }

            Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                let rhs = self.stack.pop()?;
                let lhs = self.stack.pop()?;
                let ord = ops::compare(&lhs, &rhs)?;
                use std::cmp::Ordering::*;
                let truth = match insn.op {
                    Opcode::Lt => ord == Less,
                    Opcode::Le => ord != Greater,
                    Opcode::Gt => ord == Greater,
                    _ => ord != Less,
                };
                self.push_value(Value::Int(truth as i64))?;
            }
            Opcode::Eq | Opcode::Ne => {
                let rhs = self.stack.pop()?;
                let lhs = self.stack.pop()?;
                let mut v = ops::equals(&lhs, &rhs);
                if insn.op == Opcode::Ne {
                    v = Value::Int(v.is_zero() as i64);
                }
                self.push_value(v)?;
            }
            Opcode::Identical => {
                let rhs = self.stack.pop()?;
                let lhs = self.stack.pop()?;
                self.push_value(ops::structurally_equal(&lhs, &rhs))?;
            }

            Opcode::Branch => {
                self.poll_signals()?;
                self.set_pc(a)?;
            }
            Opcode::BranchIfZero | Opcode::BranchIfNotZero => {
                self.poll_signals()?;
                let mut v = self.stack.pop()?;
                // A handle to a destructed object tests as zero.
                v.check_destructed();
                let taken = v.is_zero() == (insn.op == Opcode::BranchIfZero);
                if taken {
                    self.set_pc(a)?;
                }
            }
            Opcode::Switch => {
                let v = self.stack.pop()?;
                let table = self
                    .switch_tables
                    .get(a)
                    .ok_or_else(|| invariant("switch table index out of range"))?;
                let cases = match self.constants.get(table.cases as usize) {
                    Some(Value::Array(cases)) => cases.clone(),
                    _ => return Err(invariant("switch table without a case array")),
                };
                let target = match cases.switch_lookup(&v) {
                    Ok(i) => table.table[2 * i + 1],
                    Err(p) => table.table[2 * p],
                };
                self.set_pc(target as usize)?;
            }

            Opcode::Aggregate => {
                let items = self.stack.pop_n(a)?;
                check_no_markers(&items)?;
                self.push_value(Value::Array(ArrayRef::from_items(items)))?;
            }
            Opcode::AggregateMapping => {
                let flat = self.stack.pop_n(a * 2)?;
                check_no_markers(&flat)?;
                let mut pairs = Vec::with_capacity(a);
                let mut it = flat.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    pairs.push((k, v));
                }
                self.push_value(Value::Mapping(MappingRef::from_pairs(pairs)))?;
            }
            Opcode::AggregateMultiset => {
                let items = self.stack.pop_n(a)?;
                check_no_markers(&items)?;
                self.push_value(Value::Multiset(MultisetRef::from_items(items)))?;
            }

            Opcode::CallFun => {
                let mark = self.stack.pop_mark()?;
                let argc = self.args_above(mark)?;
                let object = self.current_object()?;
                let ret_pc = self.current_pc()?;
                self.enter_function(object, a as u16, argc, ret_pc)?;
            }
            Opcode::CallNative => {
                let mark = self.stack.pop_mark()?;
                let argc = self.args_above(mark)?;
                let op = self
                    .natives
                    .get(a)
                    .cloned()
                    .ok_or_else(|| invariant("native index out of range"))?;
                if argc < op.min_args {
                    return Err(too_few_args(op.name));
                }
                let before = self.stack.len() - argc;
                (op.func)(self, argc)?;
                self.settle_native_result(before)?;
            }
            Opcode::CallValue => {
                let mark = self.stack.pop_mark()?;
                let argc = self
                    .args_above(mark)?
                    .checked_sub(1)
                    .ok_or_else(|| invariant("mark above the live stack"))?;
                let args = self.stack.pop_n(argc)?;
                let callable = self.stack.pop()?;
                match callable {
                    Value::Function(Callable::Bound { object, fun }) => {
                        let ret_pc = self.current_pc()?;
                        let argc = args.len();
                        for v in args {
                            self.push_value(v)?;
                        }
                        self.enter_function(object, fun, argc, ret_pc)?;
                    }
                    Value::Function(Callable::Native(op)) => {
                        if args.len() < op.min_args {
                            return Err(too_few_args(op.name));
                        }
                        let argc = args.len();
                        let before = self.stack.len();
                        for v in args {
                            self.push_value(v)?;
                        }
                        (op.func)(self, argc)?;
                        self.settle_native_result(before)?;
                    }
                    Value::Program(program) => {
                        let v = self.instantiate(&program, args)?;
                        self.push_value(v)?;
                    }
                    other => {
                        if other.is_destructed_handle() {
                            return Err(raise("call to a destructed object"));
                        }
                        return Err(raise(format!(
                            "a {} is not callable",
                            ops::type_name(&other)
                        )));
                    }
                }
            }
            Opcode::Return => {
                self.poll_signals()?;
                let v = self.stack.pop()?;
                return self.do_return(v, base_depth);
            }

            Opcode::CatchStart => {
                self.recovery.push(RecoveryPoint {
                    frames: self.frames.len(),
                    stack: self.stack.len(),
                    marks: self.stack.mark_count(),
                    handler: a,
                });
            }
            Opcode::CatchEnd => {
                let point = self
                    .recovery
                    .pop()
                    .ok_or_else(|| invariant("catch end without a recovery point"))?;
                if point.frames != self.frames.len() {
                    return Err(invariant("catch end in the wrong frame"));
                }
            }
            Opcode::Throw => {
                let v = self.stack.pop()?;
                return Err(Control::Raise(v));
            }
        }
        Ok(Step::Continue)
    }

    // -- calls and returns --------------------------------------------------

    fn enter_function(
        &mut self,
        object: ObjectRef,
        fun: u16,
        argc: usize,
        ret_pc: usize,
    ) -> Result<(), Control> {
        if self.frames.len() >= self.config.max_call_depth {
            return Err(raise("too deep recursion"));
        }
        if object.is_destructed() {
            return Err(raise("call to a destructed object"));
        }
        let (num_args, num_locals, variadic) = {
            let def = object.program().function(fun).ok_or_else(|| {
                FatalError::UndefinedFunction(format!(
                    "function #{} in {}",
                    fun,
                    object.program_name()
                ))
            })?;
            (def.num_args as usize, def.num_locals as usize, def.variadic)
        };
        if self.stack.len() < argc {
            return Err(invariant("call with more arguments than stack values"));
        }
        let locals_base = self.stack.len() - argc;

        // Missing arguments read as the undefined zero.
        let mut have = argc;
        while have < num_args {
            self.push_value(Value::Undefined)?;
            have += 1;
        }
        if variadic {
            let rest = self.stack.pop_n(have - num_args)?;
            self.push_value(Value::Array(ArrayRef::from_items(rest)))?;
            have = num_args + 1;
        } else if have > num_args {
            self.stack.discard(have - num_args)?;
            have = num_args;
        }
        while have < num_locals {
            self.push_value(Value::zero())?;
            have += 1;
        }

        self.frames.push(Frame {
            object,
            fun,
            locals_base,
            ret_pc,
            saved_marks: self.stack.mark_count(),
            pc: 0,
        });
        Ok(())
    }

    fn do_return(&mut self, value: Value, base_depth: usize) -> Result<Step, Control> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| invariant("return with no frame"))?;
        self.stack.truncate(frame.locals_base);
        self.stack.truncate_marks(frame.saved_marks);
        while self
            .recovery
            .last()
            .is_some_and(|p| p.frames > self.frames.len())
        {
            self.recovery.pop();
        }
        if self.frames.len() == base_depth {
            return Ok(Step::Returned(value));
        }
        if let Some(caller) = self.frames.last_mut() {
            caller.pc = frame.ret_pc;
        }
        self.push_value(value)?;
        Ok(Step::Continue)
    }

    fn instantiate(&mut self, program: &ProgramRef, args: Vec<Value>) -> Result<Value, Control> {
        let object = ObjectRef::instantiate(program);
        if let Some(fun) = program.find_function("create") {
            self.apply(
                &Callable::Bound {
                    object: object.clone(),
                    fun,
                },
                args,
            )?;
        } else if !args.is_empty() {
            return Err(raise(format!(
                "too many arguments to {}()",
                program.name()
            )));
        }
        Ok(Value::Object(object))
    }

    fn poll_signals(&mut self) -> Result<(), Control> {
        while let Some((handler, args)) = self.signals.pop_front() {
            match handler {
                Value::Function(c) => {
                    self.apply(&c, args)?;
                }
                _ => return Err(raise("signal handler is not callable")),
            }
        }
        Ok(())
    }

    /// Enforce the one-result contract after a native returns: no result
    /// synthesizes a zero, extras are dropped below the last one.
    fn settle_native_result(&mut self, base_sp: usize) -> Result<(), Control> {
        let sp = self.stack.len();
        if sp < base_sp {
            return Err(invariant("native consumed beyond its arguments"));
        }
        if sp == base_sp {
            self.push_value(Value::zero())?;
        } else if sp > base_sp + 1 {
            let top = self.stack.pop()?;
            self.stack.truncate(base_sp);
            self.push_value(top)?;
        }
        Ok(())
    }

    // -- lvalues and indexing -----------------------------------------------

    fn pop_lvalue(&mut self) -> Result<(Value, Value), Control> {
        let lv2 = self.stack.pop()?;
        let lv1 = self.stack.pop()?;
        Ok((lv1, lv2))
    }

    fn write_lvalue(&mut self, lv1: Value, lv2: Value, value: Value) -> Result<(), Control> {
        match (lv1, lv2) {
            (Value::LvalLocal(slot), Value::Void) => {
                self.stack.set(slot, value)?;
            }
            (Value::Array(arr), index) => {
                let i = array_index(arr.len(), &index)?;
                arr.set_index(i, value);
            }
            (Value::Mapping(m), key) => m.insert(key, value),
            (Value::Multiset(s), key) => {
                if value.is_zero() {
                    s.delete(&key);
                } else if !s.member(&key) {
                    s.insert(key);
                }
            }
            (Value::Object(o), Value::Int(i)) => {
                if !o.set_var(i as usize, value) {
                    return Err(raise("cannot assign a variable in a destructed object"));
                }
            }
            _ => return Err(invariant("malformed lvalue on the stack")),
        }
        Ok(())
    }

    /// Read an lvalue's current value, leaving a zero in its place so the
    /// old value's handle count drops to the holder alone.
    fn take_lvalue(&mut self, lv1: &Value, lv2: &Value) -> Result<Value, Control> {
        match (lv1, lv2) {
            (Value::LvalLocal(slot), Value::Void) => {
                let current = self.stack.get(*slot)?.clone();
                self.stack.set(*slot, Value::zero())?;
                Ok(current)
            }
            (Value::Array(arr), index) => {
                let i = array_index(arr.len(), index)?;
                arr.take_index(i)
                    .ok_or_else(|| invariant("array slot vanished under an lvalue"))
            }
            (Value::Mapping(m), key) => {
                let current = m.index_value(key);
                m.insert(key.clone(), Value::zero());
                Ok(current)
            }
            (Value::Multiset(s), key) => Ok(if s.member(key) {
                Value::Int(1)
            } else {
                Value::Undefined
            }),
            (Value::Object(o), Value::Int(i)) => {
                let current = o
                    .get_var(*i as usize)
                    .ok_or_else(|| raise("cannot access a variable in a destructed object"))?;
                o.set_var(*i as usize, Value::zero());
                Ok(current)
            }
            _ => Err(invariant("malformed lvalue on the stack")),
        }
    }

    fn index_value(&mut self, container: Value, index: Value) -> Result<Value, Control> {
        match container {
            Value::Array(arr) => {
                let i = array_index(arr.len(), &index)?;
                arr.get(i)
                    .ok_or_else(|| invariant("array slot vanished under an index"))
            }
            Value::Str(s) => {
                let n = s.chars().count();
                let i = array_index(n, &index)?;
                let c = s.chars().nth(i).unwrap_or('\0');
                Ok(Value::Int(c as i64))
            }
            Value::Mapping(m) => Ok(m.index_value(&index)),
            Value::Multiset(s) => Ok(if s.member(&index) {
                Value::Int(1)
            } else {
                Value::Undefined
            }),
            Value::Object(o) => {
                if o.is_destructed() {
                    return Err(raise("indexing a destructed object"));
                }
                let name = match &index {
                    Value::Str(s) => s.clone(),
                    other => {
                        return Err(raise(format!(
                            "cannot index an object with a {}",
                            ops::type_name(other)
                        )))
                    }
                };
                match o.program().find_function(&name) {
                    Some(fun) => Ok(Value::Function(Callable::Bound { object: o, fun })),
                    None => Err(raise(format!(
                        "no identifier \"{}\" in {}",
                        name,
                        o.program_name()
                    ))),
                }
            }
            other => Err(raise(format!(
                "cannot index a {}",
                ops::type_name(&other)
            ))),
        }
    }

    // -- frame helpers ------------------------------------------------------

    fn current_object(&self) -> Result<ObjectRef, FatalError> {
        self.frames
            .last()
            .map(|f| f.object.clone())
            .ok_or_else(|| FatalError::Invariant("no active frame".to_string()))
    }

    fn current_pc(&self) -> Result<usize, FatalError> {
        self.frames
            .last()
            .map(|f| f.pc)
            .ok_or_else(|| FatalError::Invariant("no active frame".to_string()))
    }

    fn local_slot(&self, index: usize) -> Result<usize, FatalError> {
        self.frames
            .last()
            .map(|f| f.locals_base + index)
            .ok_or_else(|| FatalError::Invariant("no active frame".to_string()))
    }

    fn set_pc(&mut self, target: usize) -> Result<(), FatalError> {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.pc = target;
                Ok(())
            }
            None => Err(FatalError::Invariant("no active frame".to_string())),
        }
    }

    pub(crate) fn backtrace(&self) -> Vec<StackFrame> {
        self.frames
            .iter()
            .map(|f| StackFrame {
                function_name: f
                    .object
                    .program()
                    .function(f.fun)
                    .map(|d| d.name.clone())
                    .unwrap_or_else(|| "?".to_string()),
                ip: f.pc,
            })
            .collect()
    }

    // -- native support -----------------------------------------------------

    /// Pop `argc` arguments in call order.
    pub fn pop_args(&mut self, argc: usize) -> Result<Vec<Value>, FatalError> {
        self.stack.pop_n(argc)
    }

    /// Values above `mark`. A mark above the live stack means the code
    /// popped through its own call frame setup.
    fn args_above(&self, mark: usize) -> Result<usize, Control> {
        self.stack
            .len()
            .checked_sub(mark)
            .ok_or_else(|| invariant("mark above the live stack"))
    }

    /// Push one value, converting stack exhaustion into the catchable
    /// "stack overflow" error.
    pub fn push_value(&mut self, value: Value) -> Result<(), Control> {
        self.stack.push(value).map_err(|e| match e {
            FatalError::StackOverflow(_) => Control::Raise(Value::string("stack overflow")),
            other => Control::Fatal(other),
        })
    }

    pub fn emit(&mut self, text: String) {
        self.output.push(text);
    }
}

fn resolve_constant(strings: &mut StringTable, c: &Constant) -> Value {
    match c {
        Constant::Int(n) => Value::Int(*n),
        Constant::Float(x) => Value::Float(*x),
        Constant::Str(s) => Value::Str(strings.intern(s)),
        Constant::Array(items) => Value::Array(ArrayRef::from_items(
            items.iter().map(|c| resolve_constant(strings, c)).collect(),
        )),
    }
}

/// Resolve an array/string subscript: integers only, negatives count from
/// the end, out of range raises with the index and the valid span.
fn array_index(len: usize, index: &Value) -> Result<usize, Control> {
    let n = match index.as_int() {
        Some(n) => n,
        None => {
            return Err(raise(format!(
                "index must be an int, not a {}",
                ops::type_name(index)
            )))
        }
    };
    let resolved = if n < 0 { n + len as i64 } else { n };
    if resolved < 0 || resolved >= len as i64 {
        return Err(raise(format!(
            "index {} out of range 0..{}",
            n,
            len as i64 - 1
        )));
    }
    Ok(resolved as usize)
}

fn raise(message: impl Into<String>) -> Control {
    Control::Raise(Value::string(&message.into()))
}

fn invariant(message: &str) -> Control {
    Control::Fatal(FatalError::Invariant(message.to_string()))
}

fn too_few_args(name: &str) -> Control {
    raise(format!("too few arguments to {}", name))
}

/// Lvalue markers must never be aggregated into a container, where they
/// would outlive the instruction that pushed them.
fn check_no_markers(items: &[Value]) -> Result<(), Control> {
    if items
        .iter()
        .any(|v| matches!(v, Value::LvalLocal(_) | Value::Void))
    {
        return Err(invariant("lvalue marker escaped the evaluation stack"));
    }
    Ok(())
}

fn validate(
    module: &Module,
    constants: &[Value],
    registry: &NativeRegistry,
) -> Result<(), FatalError> {
    let load = |msg: String| FatalError::Load(msg);

    let entry = module
        .programs
        .get(module.entry_program as usize)
        .ok_or_else(|| load(format!("entry program #{} missing", module.entry_program)))?;
    if entry.functions.get(module.entry_function as usize).is_none() {
        return Err(load(format!(
            "entry function #{} missing in {}",
            module.entry_function, entry.name
        )));
    }

    for name in &module.natives {
        if registry.lookup(name).is_none() {
            return Err(load(format!("unresolved native: {}", name)));
        }
    }

    for table in &module.switch_tables {
        let cases = match constants.get(table.cases as usize) {
            Some(Value::Array(cases)) => cases.clone(),
            _ => return Err(load("switch table cases must be a constant array".to_string())),
        };
        if table.table.len() != 2 * cases.len() + 1 {
            return Err(load(format!(
                "switch table has {} targets for {} cases",
                table.table.len(),
                cases.len()
            )));
        }
        let items = cases.iter_cloned();
        for pair in items.windows(2) {
            if switch_cmp(&pair[0], &pair[1]) != std::cmp::Ordering::Less {
                return Err(load("switch cases not strictly sorted".to_string()));
            }
        }
    }

    for program in &module.programs {
        if program.functions.len() > u16::MAX as usize {
            return Err(load(format!("{}: too many functions", program.name)));
        }
        for def in &program.functions {
            let floor = def.num_args as usize + def.variadic as usize;
            if (def.num_locals as usize) < floor {
                return Err(load(format!(
                    "{}.{}: {} locals cannot hold {} argument slots",
                    program.name, def.name, def.num_locals, floor
                )));
            }
            let code_len = def.code.len();
            for insn in &def.code {
                let a = insn.a as usize;
                let ok = match insn.op {
                    Opcode::PushConst => a < constants.len(),
                    Opcode::PushProgram => a < module.programs.len(),
                    Opcode::LoadLocal | Opcode::LvalLocal => a < def.num_locals as usize,
                    Opcode::LoadGlobal | Opcode::LvalGlobal => a < program.num_vars as usize,
                    Opcode::Compound => BinaryOp::from_u32(insn.a).is_some(),
                    Opcode::Branch
                    | Opcode::BranchIfZero
                    | Opcode::BranchIfNotZero
                    | Opcode::CatchStart => a <= code_len,
                    Opcode::Switch => match module.switch_tables.get(a) {
                        // Target pcs follow the branch rule: one past the
                        // end is the implicit zero return.
                        Some(t) => t.table.iter().all(|&pc| pc as usize <= code_len),
                        None => false,
                    },
                    Opcode::CallFun => a < program.functions.len(),
                    Opcode::CallNative => a < module.natives.len(),
                    _ => true,
                };
                if !ok {
                    return Err(load(format!(
                        "{}.{}: bad operand {} for {:?}",
                        program.name, def.name, insn.a, insn.op
                    )));
                }
            }
        }
    }
    Ok(())
}
