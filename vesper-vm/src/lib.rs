// vesper-vm - Bytecode compiler and virtual machine for the Vesper programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Bytecode compiler and stack-based virtual machine for Vesper.
//!
//! Source code goes through a single pass: a Pratt parser that emits
//! bytecode as it parses, with no AST in between. The VM executes the
//! resulting chunks over a value stack and a fixed-depth frame stack.
//! All heap objects live in one arena owned by the VM and are freed
//! together when it is dropped.

pub mod chunk;
pub mod compiler;
pub mod debug;
pub mod object;
pub mod opcode;
pub mod table;
pub mod value;
pub mod vm;

pub use chunk::Chunk;
pub use compiler::{compile, Diagnostic};
pub use object::{Heap, Obj, ObjId};
pub use opcode::OpCode;
pub use value::Value;
pub use vm::{InterpretError, RuntimeError, Vm};
