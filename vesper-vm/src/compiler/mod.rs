// vesper-vm - Bytecode compiler and virtual machine for the Vesper programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Single-pass bytecode compiler.
//!
//! A Pratt expression parser fused with a recursive-descent statement
//! parser; there is no AST. Parsing a construct emits its bytecode
//! directly into the chunk of the function currently being compiled.
//! Nested `fun` declarations push a fresh [`FunctionState`]; the one
//! below it on the stack is the enclosing function, which is what
//! upvalue resolution walks.

pub mod types;

use vesper_syntax::{Scanner, Token, TokenKind};

use crate::object::{Function, Heap, ObjId};
use crate::opcode::OpCode;
use crate::value::Value;

pub use types::{Diagnostic, ErrorLocation};
use types::{FunctionKind, FunctionState, Local, LoopContext, UpvalueRef};

/// Local slots per function: indices must fit in two bytes.
const MAX_LOCALS: usize = u16::MAX as usize + 1;
/// Captured variables per function: the count is stored in a u16.
const MAX_UPVALUES: usize = u16::MAX as usize;

/// Compile a program into its top-level script function.
///
/// On failure every diagnostic found before end-of-file is returned;
/// the parser synchronizes after each error rather than stopping.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjId, Vec<Diagnostic>> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function, _) = compiler.end_function();

    if compiler.had_error {
        Err(compiler.diagnostics)
    } else {
        Ok(function)
    }
}

/// Operator precedence, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Ternary,    // ?:
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // ()
    Primary,
}

impl Precedence {
    /// One level tighter; used for left-associative binary operators.
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Ternary,
            Precedence::Ternary => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

/// The parse rule for a token: its prefix parser, infix parser, and
/// infix precedence. Tokens absent from the table parse as nothing.
fn rule<'src, 'h>(kind: TokenKind) -> ParseRule<'src, 'h> {
    use TokenKind::*;

    let (prefix, infix, precedence): (
        Option<ParseFn<'src, 'h>>,
        Option<ParseFn<'src, 'h>>,
        Precedence,
    ) = match kind {
        LeftParen => (Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        Minus => (Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => (None, Some(Compiler::binary), Precedence::Term),
        Slash | Star => (None, Some(Compiler::binary), Precedence::Factor),
        Question => (None, Some(Compiler::ternary), Precedence::Ternary),
        Bang => (Some(Compiler::unary), None, Precedence::None),
        BangEqual | EqualEqual => (None, Some(Compiler::binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            (None, Some(Compiler::binary), Precedence::Comparison)
        }
        Identifier => (Some(Compiler::variable), None, Precedence::None),
        String => (Some(Compiler::string), None, Precedence::None),
        Number => (Some(Compiler::number), None, Precedence::None),
        And => (None, Some(Compiler::and), Precedence::And),
        Or => (None, Some(Compiler::or), Precedence::Or),
        False | Nil | True => (Some(Compiler::literal), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };

    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    /// Function compilation states; the last one is the function being
    /// compiled, its predecessor the enclosing function.
    states: Vec<FunctionState<'src>>,
    heap: &'h mut Heap,
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Self {
        Compiler {
            scanner: Scanner::new(source),
            current: Token::empty(),
            previous: Token::empty(),
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            states: vec![FunctionState::new(FunctionKind::Script, None)],
            heap,
        }
    }

    // ========================================================================
    // Token plumbing
    // ========================================================================

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // ========================================================================
    // Error reporting
    // ========================================================================

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let location = match token.kind {
            TokenKind::Eof => ErrorLocation::AtEnd,
            TokenKind::Error => ErrorLocation::None,
            _ => ErrorLocation::At(token.lexeme.to_string()),
        };
        self.diagnostics.push(Diagnostic {
            line: token.line,
            location,
            message: message.to_string(),
        });
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    /// Skip tokens until a statement boundary so one mistake does not
    /// cascade into a wall of diagnostics.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::If
                | TokenKind::For
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ========================================================================
    // State access & emission
    // ========================================================================

    fn state(&mut self) -> &mut FunctionState<'src> {
        self.states.last_mut().expect("no function state")
    }

    fn state_ref(&self) -> &FunctionState<'src> {
        self.states.last().expect("no function state")
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.state().chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_u16(&mut self, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.emit_byte(hi);
        self.emit_byte(lo);
    }

    /// Emit the short form when the index fits in one byte, otherwise
    /// the long form with a two-byte operand.
    fn emit_with_operand(&mut self, short: OpCode, long: OpCode, index: u16) {
        if index <= u8::MAX as u16 {
            self.emit_op(short);
            self.emit_byte(index as u8);
        } else {
            self.emit_op(long);
            self.emit_u16(index);
        }
    }

    fn emit_return(&mut self) {
        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        match self.state().chunk.add_constant(value) {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_with_operand(OpCode::Constant, OpCode::ConstantLong, index);
    }

    /// Emit a jump with a placeholder offset; returns the offset of the
    /// placeholder for patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.state_ref().chunk.code.len() - 2
    }

    /// Back-patch a jump to land at the current end of code.
    fn patch_jump(&mut self, offset: usize) {
        let jump = self.state_ref().chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump.");
        }
        let [hi, lo] = (jump as u16).to_be_bytes();
        let code = &mut self.state().chunk.code;
        code[offset] = hi;
        code[offset + 1] = lo;
    }

    /// Emit a backward jump to `start`.
    fn emit_loop(&mut self, start: usize) {
        self.emit_op(OpCode::Loop);

        // +2 so the offset is measured from past its own operand.
        let offset = self.state_ref().chunk.code.len() - start + 2;
        if offset > u16::MAX as usize {
            self.error("The loop body is too large");
        }
        self.emit_u16(offset as u16);
    }

    // ========================================================================
    // Scopes & variables
    // ========================================================================

    fn begin_scope(&mut self) {
        self.state().scope_depth += 1;
    }

    /// Leave a scope: discard its locals and emit matching stack
    /// cleanup. Runs of plain locals collapse into POPN; a captured
    /// local instead closes its upvalue, after any pending pops.
    fn end_scope(&mut self) {
        self.state().scope_depth -= 1;
        let scope_depth = self.state_ref().scope_depth;

        let mut pending: u32 = 0;
        loop {
            let captured = match self.state_ref().locals.last() {
                Some(local) if local.depth > scope_depth => local.is_captured,
                _ => break,
            };
            if captured {
                self.flush_pops(pending);
                pending = 0;
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                pending += 1;
            }
            self.state().locals.pop();
        }
        self.flush_pops(pending);
    }

    fn flush_pops(&mut self, mut count: u32) {
        if count == 0 {
            return;
        }
        if count == 1 {
            self.emit_op(OpCode::Pop);
            return;
        }
        while count > 0 {
            let n = count.min(u8::MAX as u32);
            self.emit_op(OpCode::PopN);
            self.emit_byte(n as u8);
            count -= n;
        }
    }

    /// Reuse the constant slot if this name is already in the pool.
    fn identifier_constant(&mut self, name: &str) -> u16 {
        let id = self.heap.intern(name);
        for (index, value) in self.state_ref().chunk.constants.iter().enumerate() {
            if *value == Value::Obj(id) {
                return index as u16;
            }
        }
        self.make_constant(Value::Obj(id))
    }

    fn add_local(&mut self, name: &'src str) {
        if self.state_ref().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function");
            return;
        }
        let state = self.state();
        state.locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
        state.max_locals = state.max_locals.max(state.locals.len() as u32);
    }

    /// Record the just-parsed identifier as a local, rejecting a
    /// duplicate in the same scope. Globals are late-bound by name and
    /// skip this entirely.
    fn declare_variable(&mut self) {
        if self.state_ref().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let scope_depth = self.state_ref().scope_depth;

        let mut duplicate = false;
        for local in self.state_ref().locals.iter().rev() {
            if local.depth != -1 && local.depth < scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("There is already a variable with this name in the current scope");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u16 {
        self.consume(TokenKind::Identifier, message);

        self.declare_variable();
        if self.state_ref().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        let state = self.state();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, index: u16) {
        if self.state_ref().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_with_operand(OpCode::DefineGlobal, OpCode::DefineGlobalLong, index);
    }

    /// Find `name` among the locals of `states[state_idx]`, innermost
    /// first. A hit on a still-uninitialized slot means the variable's
    /// own initializer is reading it.
    fn resolve_local(&mut self, state_idx: usize, name: &str) -> Option<u16> {
        let mut uninitialized = false;
        let mut found = None;
        for (index, local) in self.states[state_idx].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    uninitialized = true;
                }
                found = Some(index as u16);
                break;
            }
        }
        if uninitialized {
            self.error("Can't read variable in its own initializer");
        }
        found
    }

    /// Resolve `name` as a capture of an enclosing function. Marks the
    /// captured local and records the upvalue chain through every
    /// intermediate function.
    fn resolve_upvalue(&mut self, state_idx: usize, name: &str) -> Option<u16> {
        if state_idx == 0 {
            return None;
        }
        let enclosing = state_idx - 1;

        if let Some(local) = self.resolve_local(enclosing, name) {
            self.states[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(
                state_idx,
                UpvalueRef {
                    index: local,
                    is_local: true,
                },
            ));
        }

        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(
                state_idx,
                UpvalueRef {
                    index: upvalue,
                    is_local: false,
                },
            ));
        }

        None
    }

    fn add_upvalue(&mut self, state_idx: usize, upvalue: UpvalueRef) -> u16 {
        if let Some(existing) = self.states[state_idx]
            .upvalues
            .iter()
            .position(|u| *u == upvalue)
        {
            return existing as u16;
        }
        if self.states[state_idx].upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function");
            return 0;
        }
        let upvalues = &mut self.states[state_idx].upvalues;
        upvalues.push(upvalue);
        (upvalues.len() - 1) as u16
    }

    /// Compile a read of, or assignment to, a named variable:
    /// local, then upvalue, then global.
    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let innermost = self.states.len() - 1;
        let (get_short, get_long, set_short, set_long, index);

        if let Some(slot) = self.resolve_local(innermost, name.lexeme) {
            get_short = OpCode::GetLocal;
            get_long = OpCode::GetLocalLong;
            set_short = OpCode::SetLocal;
            set_long = OpCode::SetLocalLong;
            index = slot;
        } else if let Some(slot) = self.resolve_upvalue(innermost, name.lexeme) {
            get_short = OpCode::GetUpvalue;
            get_long = OpCode::GetUpvalueLong;
            set_short = OpCode::SetUpvalue;
            set_long = OpCode::SetUpvalueLong;
            index = slot;
        } else {
            get_short = OpCode::GetGlobal;
            get_long = OpCode::GetGlobalLong;
            set_short = OpCode::SetGlobal;
            set_long = OpCode::SetGlobalLong;
            index = self.identifier_constant(name.lexeme);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_with_operand(set_short, set_long, index);
        } else {
            self.emit_with_operand(get_short, get_long, index);
        }
    }

    // ========================================================================
    // Declarations & statements
    // ========================================================================

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expected variable name.");

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expected ';' after variable declaration",
        );

        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expected function name.");
        // Initialized before the body compiles, so the function can
        // call itself.
        self.mark_initialized();
        self.function();
        self.define_variable(global);
    }

    /// Compile a function body into its own chunk, then emit the
    /// closure wrapper and its capture records into the enclosing one.
    fn function(&mut self) {
        let name = self.heap.intern(self.previous.lexeme);
        self.states
            .push(FunctionState::new(FunctionKind::Function, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expected '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.state_ref().arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.state().arity += 1;
                }
                let constant = self.parse_variable("Expected parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expected '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_function();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_with_operand(OpCode::Closure, OpCode::ClosureLong, constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_u16(upvalue.index);
        }
    }

    /// Seal the innermost function: implicit return, then build the
    /// Function object. Returns it with the upvalue references the
    /// caller needs for the capture records.
    fn end_function(&mut self) -> (ObjId, Vec<UpvalueRef>) {
        self.emit_return();

        let state = self.states.pop().expect("no function state");
        let function = Function {
            arity: state.arity,
            upvalue_count: state.upvalues.len() as u16,
            local_count: state.max_locals,
            chunk: state.chunk,
            name: state.name,
        };
        (self.heap.new_function(function), state.upvalues)
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after block");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' at the end of statement");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' at the end of statement");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expected '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition.");

        // The jump peeks at the condition; each branch pops it itself.
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn return_statement(&mut self) {
        if self.state_ref().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn while_statement(&mut self) {
        let enclosing = self.state_ref().loop_ctx;
        let loop_start = self.state_ref().chunk.code.len();

        self.consume(TokenKind::LeftParen, "Expected '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        let scope_depth = self.state_ref().scope_depth;
        self.state().loop_ctx = Some(LoopContext {
            start: loop_start,
            scope_depth,
        });
        self.statement();

        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.state().loop_ctx = enclosing;
    }

    fn for_statement(&mut self) {
        let enclosing = self.state_ref().loop_ctx;
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'for'.");

        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.state_ref().chunk.code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after condition.");

            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            // The increment textually precedes the body but runs after
            // it: jump over it now, loop back to it from the body, and
            // make it the `continue` target.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.state_ref().chunk.code.len();

            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expected ')' after 'for' clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let scope_depth = self.state_ref().scope_depth;
        self.state().loop_ctx = Some(LoopContext {
            start: loop_start,
            scope_depth,
        });
        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
        self.state().loop_ctx = enclosing;
    }

    /// Compile `continue;`: unwind scopes to the loop's depth with real
    /// cleanup code (pops and upvalue closes), jump to the loop start,
    /// then restore the compile-time scope so the rest of the block
    /// still sees its locals.
    fn continue_statement(&mut self) {
        let ctx = match self.state_ref().loop_ctx {
            Some(ctx) => ctx,
            None => {
                self.error("Cannot use continue outside of loop");
                return;
            }
        };
        self.consume(TokenKind::Semicolon, "Expected ';'.");

        let saved_depth = self.state_ref().scope_depth;
        let saved_locals = self.state_ref().locals.clone();

        while self.state_ref().scope_depth > ctx.scope_depth {
            self.end_scope();
        }
        self.emit_loop(ctx.start);

        let state = self.state();
        state.scope_depth = saved_depth;
        state.locals = saved_locals;
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// The Pratt core: one prefix rule, then infix rules while the next
    /// token binds at least as tightly.
    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();

        let prefix = match rule(self.previous.kind).prefix {
            Some(prefix) => prefix,
            None => {
                self.error("Expected expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        // An `=` still sitting here means the left side was not a
        // variable (or we were too deep to assign).
        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after expression");
    }

    fn number(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        // Underscores are digit separators: 1_000 is 1000.
        let parsed = if lexeme.contains('_') {
            lexeme.replace('_', "").parse::<f64>()
        } else {
            lexeme.parse::<f64>()
        };
        match parsed {
            Ok(value) => self.emit_constant(Value::Number(value)),
            Err(_) => self.error("Invalid number literal."),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let contents = &lexeme[1..lexeme.len() - 1];
        let id = self.heap.intern(contents);
        self.emit_constant(Value::Obj(id));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;

        self.parse_precedence(Precedence::Unary);

        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let precedence = rule(operator).precedence;
        self.parse_precedence(precedence.next());

        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::BangEqual => self.emit_op(OpCode::NotEqual),
            TokenKind::EqualEqual => self.emit_op(OpCode::EqualEqual),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_op(OpCode::GreaterEqual),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_op(OpCode::LessEqual),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn ternary(&mut self, _can_assign: bool) {
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        self.parse_precedence(Precedence::Ternary);

        let else_jump = self.emit_jump(OpCode::Jump);
        self.emit_op(OpCode::Pop);
        self.patch_jump(then_jump);

        self.consume(TokenKind::Colon, "Expected ':' in ternary expression");
        self.parse_precedence(Precedence::Ternary);
        self.patch_jump(else_jump);
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);

        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfTrue);

        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);

        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == u8::MAX as u32 {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    count += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after arguments.");
        count as u8
    }
}
