// vesper-vm - Bytecode compiler and virtual machine for the Vesper programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Stack-based virtual machine for executing Vesper bytecode.

pub mod error;
pub mod frame;
pub mod stack;

use std::fmt;
use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::compiler::{self, Diagnostic};
use crate::object::{Closure, Heap, Native, NativeFn, Obj, ObjId, Upvalue};
use crate::opcode::OpCode;
use crate::table::Table;
use crate::value::Value;

pub use error::{RuntimeError, TraceLine};
pub use frame::CallFrame;
pub use stack::ValueStack;

/// Maximum call depth.
pub const FRAMES_MAX: usize = 64;
/// Value stack slots preallocated at startup.
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Why `interpret` failed.
#[derive(Debug)]
pub enum InterpretError {
    /// One diagnostic per compile error found before end-of-file.
    Compile(Vec<Diagnostic>),
    Runtime(RuntimeError),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretError::Compile(diagnostics) => {
                let mut first = true;
                for diagnostic in diagnostics {
                    if !first {
                        writeln!(f)?;
                    }
                    first = false;
                    write!(f, "{}", diagnostic)?;
                }
                Ok(())
            }
            InterpretError::Runtime(error) => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for InterpretError {}

/// The Vesper virtual machine.
///
/// Owns the heap, the globals, and the output sink `print` writes to.
/// One `Vm` is one isolated interpreter; several can coexist in a
/// process. `interpret` may be called repeatedly and the globals
/// persist across calls, which is what a REPL wants.
pub struct Vm {
    heap: Heap,
    globals: Table,
    frames: Vec<CallFrame>,
    stack: ValueStack,
    /// Upvalues still pointing into the stack, sorted by descending
    /// slot so closing everything at or above a slot is a prefix walk.
    open_upvalues: Vec<ObjId>,
    out: Box<dyn Write>,
}

impl Vm {
    /// A VM that prints to stdout.
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// A VM that prints somewhere else (tests use a shared buffer).
    pub fn with_output(out: Box<dyn Write>) -> Self {
        let mut vm = Vm {
            heap: Heap::new(),
            globals: Table::new(),
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: ValueStack::new(),
            open_upvalues: Vec::new(),
            out,
        };
        vm.define_native("clock", 0, clock_native);
        vm
    }

    /// Compile and run a program.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function =
            compiler::compile(source, &mut self.heap).map_err(InterpretError::Compile)?;

        let closure = self.heap.new_closure(Closure {
            function,
            upvalues: Vec::new(),
        });
        self.stack.push(Value::Obj(closure));
        self.call_closure(closure, 0)
            .map_err(InterpretError::Runtime)?;

        self.run().map_err(InterpretError::Runtime)
    }

    /// The object heap; read-only, for inspection.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Register a host function under a global name.
    pub fn define_native(&mut self, name: &str, arity: u8, function: NativeFn) {
        let name = self.heap.intern(name);
        let hash = self.heap.string(name).hash;
        let native = self.heap.new_native(Native { function, arity });
        self.globals.set(name, hash, Value::Obj(native));
    }

    // ========================================================================
    // Dispatch loop
    // ========================================================================

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            #[cfg(feature = "trace")]
            self.trace_instruction();

            let op = match OpCode::try_from(self.read_byte()) {
                Ok(op) => op,
                Err(byte) => {
                    return Err(self.runtime_error(format!("Unknown opcode {}.", byte)));
                }
            };

            match op {
                OpCode::Constant | OpCode::ConstantLong => {
                    let index = self.read_index(op == OpCode::ConstantLong);
                    let constant = self.constant(index);
                    self.stack.push(constant);
                }
                OpCode::Nil => self.stack.push(Value::Nil),
                OpCode::True => self.stack.push(Value::Bool(true)),
                OpCode::False => self.stack.push(Value::Bool(false)),

                OpCode::Pop => {
                    self.stack.pop();
                }
                OpCode::PopN => {
                    let count = self.read_byte() as usize;
                    let len = self.stack.len();
                    self.stack.truncate(len - count);
                }

                OpCode::GetLocal | OpCode::GetLocalLong => {
                    let slot = self.read_index(op == OpCode::GetLocalLong) as usize;
                    let base = self.frame().base;
                    let value = self.stack.get(base + slot);
                    self.stack.push(value);
                }
                OpCode::SetLocal | OpCode::SetLocalLong => {
                    let slot = self.read_index(op == OpCode::SetLocalLong) as usize;
                    let base = self.frame().base;
                    let value = self.stack.peek(0);
                    self.stack.set(base + slot, value);
                }

                OpCode::GetGlobal | OpCode::GetGlobalLong => {
                    let index = self.read_index(op == OpCode::GetGlobalLong);
                    let name = self.constant_string(index);
                    let hash = self.heap.string(name).hash;
                    match self.globals.get(name, hash) {
                        Some(value) => self.stack.push(value),
                        None => return Err(self.undefined_variable(name)),
                    }
                }
                OpCode::DefineGlobal | OpCode::DefineGlobalLong => {
                    let index = self.read_index(op == OpCode::DefineGlobalLong);
                    let name = self.constant_string(index);
                    let hash = self.heap.string(name).hash;
                    let value = self.stack.peek(0);
                    self.globals.set(name, hash, value);
                    self.stack.pop();
                }
                OpCode::SetGlobal | OpCode::SetGlobalLong => {
                    let index = self.read_index(op == OpCode::SetGlobalLong);
                    let name = self.constant_string(index);
                    let hash = self.heap.string(name).hash;
                    let value = self.stack.peek(0);
                    // Assignment must not create the global; undo the
                    // insert the probe just made.
                    if self.globals.set(name, hash, value) {
                        self.globals.delete(name, hash);
                        return Err(self.undefined_variable(name));
                    }
                }

                OpCode::GetUpvalue | OpCode::GetUpvalueLong => {
                    let index = self.read_index(op == OpCode::GetUpvalueLong) as usize;
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[index];
                    let value = match *self.heap.upvalue(upvalue) {
                        Upvalue::Open(slot) => self.stack.get(slot),
                        Upvalue::Closed(value) => value,
                    };
                    self.stack.push(value);
                }
                OpCode::SetUpvalue | OpCode::SetUpvalueLong => {
                    let index = self.read_index(op == OpCode::SetUpvalueLong) as usize;
                    let closure = self.frame().closure;
                    let upvalue = self.heap.closure(closure).upvalues[index];
                    let value = self.stack.peek(0);
                    match *self.heap.upvalue(upvalue) {
                        Upvalue::Open(slot) => self.stack.set(slot, value),
                        Upvalue::Closed(_) => {
                            *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(value);
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.stack.pop();
                }

                OpCode::EqualEqual => {
                    let b = self.stack.pop();
                    let a = self.stack.pop();
                    self.stack.push(Value::Bool(a == b));
                }
                OpCode::NotEqual => {
                    let b = self.stack.pop();
                    let a = self.stack.pop();
                    self.stack.push(Value::Bool(a != b));
                }
                OpCode::Greater
                | OpCode::GreaterEqual
                | OpCode::Less
                | OpCode::LessEqual
                | OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide => self.binary_number_op(op)?,

                OpCode::Add => {
                    let b = self.stack.peek(0);
                    let a = self.stack.peek(1);
                    match (a, b) {
                        (Value::Number(x), Value::Number(y)) => {
                            self.stack.pop();
                            self.stack.pop();
                            self.stack.push(Value::Number(x + y));
                        }
                        (Value::Obj(x), Value::Obj(y))
                            if a.is_string(&self.heap) && b.is_string(&self.heap) =>
                        {
                            self.stack.pop();
                            self.stack.pop();
                            let joined = self.heap.concat(x, y);
                            self.stack.push(Value::Obj(joined));
                        }
                        _ => {
                            return Err(self.runtime_error(
                                "Operands must be two numbers or two strings".to_string(),
                            ));
                        }
                    }
                }

                OpCode::Not => {
                    let value = self.stack.pop();
                    self.stack.push(Value::Bool(!value.is_truthy()));
                }
                OpCode::Negate => match self.stack.peek(0) {
                    Value::Number(n) => {
                        let top = self.stack.len() - 1;
                        self.stack.set(top, Value::Number(-n));
                    }
                    _ => {
                        return Err(self.runtime_error("Operand must be a number.".to_string()));
                    }
                },

                OpCode::Print => {
                    let value = self.stack.pop();
                    let text = value.display(&self.heap);
                    let _ = writeln!(self.out, "{}", text);
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfTrue => {
                    let offset = self.read_u16() as usize;
                    if self.stack.peek(0).is_truthy() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if !self.stack.peek(0).is_truthy() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }

                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.stack.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                OpCode::Return => {
                    let result = self.stack.pop();
                    let frame = self.frames.pop().expect("no active frame");
                    self.close_upvalues(frame.base);

                    if self.frames.is_empty() {
                        // The script function itself still sits in slot 0.
                        self.stack.pop();
                        return Ok(());
                    }

                    self.stack.truncate(frame.base);
                    self.stack.push(result);
                }

                OpCode::Closure | OpCode::ClosureLong => {
                    let index = self.read_index(op == OpCode::ClosureLong);
                    let function = self.constant_function(index);
                    let count = self.heap.function(function).upvalue_count as usize;

                    let mut upvalues = Vec::with_capacity(count);
                    for _ in 0..count {
                        let is_local = self.read_byte() != 0;
                        let capture_index = self.read_u16() as usize;
                        if is_local {
                            let base = self.frame().base;
                            upvalues.push(self.capture_upvalue(base + capture_index));
                        } else {
                            let enclosing = self.frame().closure;
                            upvalues.push(self.heap.closure(enclosing).upvalues[capture_index]);
                        }
                    }

                    let closure = self.heap.new_closure(Closure { function, upvalues });
                    self.stack.push(Value::Obj(closure));
                }
            }
        }
    }

    // ========================================================================
    // Instruction reading
    // ========================================================================

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let byte = self.heap.function(frame.function).chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    /// Read a constant-pool or slot index in its short or long form.
    fn read_index(&mut self, long: bool) -> u16 {
        if long {
            self.read_u16()
        } else {
            self.read_byte() as u16
        }
    }

    fn constant(&self, index: u16) -> Value {
        self.heap.function(self.frame().function).chunk.constants[index as usize]
    }

    fn constant_string(&self, index: u16) -> ObjId {
        match self.constant(index) {
            Value::Obj(id) => id,
            other => panic!("name constant is not an object: {:?}", other),
        }
    }

    fn constant_function(&self, index: u16) -> ObjId {
        match self.constant(index) {
            Value::Obj(id) => id,
            other => panic!("closure constant is not an object: {:?}", other),
        }
    }

    // ========================================================================
    // Calls
    // ========================================================================

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        if let Value::Obj(id) = callee {
            match self.heap.get(id) {
                Obj::Closure(_) => {
                    return self.call_closure(id, argc);
                }
                Obj::Native(native) => {
                    let function = native.function;
                    let arity = native.arity;
                    if arity != argc {
                        return Err(self.runtime_error(format!(
                            "Expected {} arguments but got {}.",
                            arity, argc
                        )));
                    }
                    let start = self.stack.len() - argc as usize;
                    let result = function(self.stack.slice_from(start));
                    // Drop the arguments and the callee, keep the result.
                    self.stack.truncate(start - 1);
                    self.stack.push(result);
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(self.runtime_error("Can only call functions and classes.".to_string()))
    }

    fn call_closure(&mut self, closure: ObjId, argc: u8) -> Result<(), RuntimeError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if argc != arity {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                arity, argc
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }

        let base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame::new(closure, function, base));
        Ok(())
    }

    // ========================================================================
    // Upvalues
    // ========================================================================

    /// Get or create the open upvalue for a stack slot. The open list
    /// stays sorted by descending slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjId {
        let mut index = 0;
        while index < self.open_upvalues.len() {
            match *self.heap.upvalue(self.open_upvalues[index]) {
                Upvalue::Open(existing) if existing > slot => index += 1,
                Upvalue::Open(existing) if existing == slot => {
                    return self.open_upvalues[index];
                }
                _ => break,
            }
        }

        let upvalue = self.heap.new_upvalue(Upvalue::Open(slot));
        self.open_upvalues.insert(index, upvalue);
        upvalue
    }

    /// Close every open upvalue at or above `from`: move the stack
    /// value into the upvalue cell, which owns it from now on.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let slot = match *self.heap.upvalue(upvalue) {
                Upvalue::Open(slot) if slot >= from => slot,
                _ => break,
            };
            let value = self.stack.get(slot);
            *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // ========================================================================
    // Errors
    // ========================================================================

    /// Build a runtime error with the stack trace of the live frames,
    /// then unwind the VM so the next `interpret` starts clean.
    fn runtime_error(&mut self, message: String) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            let line = function.chunk.line_at(frame.ip.saturating_sub(1));
            let name = function
                .name
                .map(|id| self.heap.string(id).chars.to_string());
            trace.push(TraceLine { line, name });
        }

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        RuntimeError { message, trace }
    }

    fn undefined_variable(&mut self, name: ObjId) -> RuntimeError {
        let name = self.heap.string(name).chars.to_string();
        self.runtime_error(format!("Undefined variable '{}'.", name))
    }

    fn binary_number_op(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let b = self.stack.pop();
        let a = self.stack.pop();
        let (a, b) = match (a, b) {
            (Value::Number(a), Value::Number(b)) => (a, b),
            _ => return Err(self.runtime_error("Operands must be numbers.".to_string())),
        };

        let result = match op {
            OpCode::Greater => Value::Bool(a > b),
            OpCode::GreaterEqual => Value::Bool(a >= b),
            OpCode::Less => Value::Bool(a < b),
            OpCode::LessEqual => Value::Bool(a <= b),
            OpCode::Subtract => Value::Number(a - b),
            OpCode::Multiply => Value::Number(a * b),
            OpCode::Divide => Value::Number(a / b),
            _ => unreachable!("not a binary numeric opcode: {:?}", op),
        };
        self.stack.push(result);
        Ok(())
    }

    #[cfg(feature = "trace")]
    fn trace_instruction(&self) {
        use std::fmt::Write as _;

        let frame = self.frame();
        let mut slots = String::from("          ");
        for slot in frame.base..self.stack.len() {
            let _ = write!(slots, "[ {} ]", self.stack.get(slot).display(&self.heap));
        }
        eprintln!("{}", slots);

        let function = self.heap.function(frame.function);
        let (text, _) =
            crate::debug::disassemble_instruction(&self.heap, &function.chunk, frame.ip);
        eprint!("{}", text);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// The one built-in native: seconds since the Unix epoch.
fn clock_native(_args: &[Value]) -> Value {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0);
    Value::Number(seconds)
}
