// vesper-vm - Bytecode compiler and virtual machine for the Vesper programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Shared types for the bytecode compiler.

use std::fmt;

use crate::chunk::Chunk;
use crate::object::ObjId;

/// Where in the source a diagnostic points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorLocation {
    /// The offending lexeme.
    At(String),
    /// The end of the source.
    AtEnd,
    /// No usable location (the token itself was a scan error).
    None,
}

/// One compile error, formatted `[line L] Error at 'x': message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: u32,
    pub location: ErrorLocation,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.location {
            ErrorLocation::At(lexeme) => write!(f, " at '{}'", lexeme)?,
            ErrorLocation::AtEnd => write!(f, " at end")?,
            ErrorLocation::None => {}
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for Diagnostic {}

/// A local variable slot during compilation.
///
/// `depth` is −1 between declaration and initialisation, which is what
/// makes `var x = x;` detectable.
#[derive(Debug, Clone)]
pub(crate) struct Local<'src> {
    pub name: &'src str,
    pub depth: i32,
    /// Set when a nested function captures this slot; scope exit then
    /// closes it instead of popping it.
    pub is_captured: bool,
}

/// A captured-variable reference recorded on the function that does
/// the capturing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UpvalueRef {
    /// Slot in the enclosing function's locals (`is_local`) or index
    /// into its own upvalues.
    pub index: u16,
    pub is_local: bool,
}

/// The innermost enclosing loop, for `continue` and back-edges.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopContext {
    /// Bytecode offset the back-edge returns to.
    pub start: usize,
    /// Scope depth at the loop; `continue` unwinds to here.
    pub scope_depth: i32,
}

/// What kind of function a state is compiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FunctionKind {
    /// The implicit function wrapping the whole program.
    Script,
    Function,
}

/// Per-function compilation state. Nested function declarations stack
/// these; the predecessor is the enclosing function.
#[derive(Debug)]
pub(crate) struct FunctionState<'src> {
    pub kind: FunctionKind,
    /// Interned function name; `None` for the script.
    pub name: Option<ObjId>,
    pub arity: u8,
    pub chunk: Chunk,
    pub locals: Vec<Local<'src>>,
    /// High-water mark of `locals.len()`, recorded on the function.
    pub max_locals: u32,
    pub upvalues: Vec<UpvalueRef>,
    pub scope_depth: i32,
    pub loop_ctx: Option<LoopContext>,
}

impl<'src> FunctionState<'src> {
    pub fn new(kind: FunctionKind, name: Option<ObjId>) -> Self {
        // Slot 0 belongs to the callee itself; the empty name can never
        // collide with an identifier.
        let slot_zero = Local {
            name: "",
            depth: 0,
            is_captured: false,
        };
        FunctionState {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![slot_zero],
            max_locals: 1,
            upvalues: Vec::new(),
            scope_depth: 0,
            loop_ctx: None,
        }
    }
}
