// vesper-vm - Bytecode compiler and virtual machine for the Vesper programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Read-only views of compiled bytecode: a structured instruction
//! decoder and the disassembler built on top of it.
//!
//! `Instruction::decode` / `encode` are exact inverses on well-formed
//! chunks, so decoding a whole chunk and re-encoding it reproduces the
//! byte stream — the property the bytecode tests lean on.

use std::fmt::Write as _;

use crate::chunk::Chunk;
use crate::object::{Heap, Obj};
use crate::opcode::OpCode;
use crate::value::Value;

/// One captured-variable record trailing a closure instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRecord {
    /// True when capturing a local slot of the enclosing function,
    /// false when re-capturing one of its upvalues.
    pub is_local: bool,
    pub index: u16,
}

/// A decoded bytecode instruction, preserving the short/long operand
/// form it was encoded with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Constant(u8),
    ConstantLong(u16),
    Nil,
    True,
    False,
    Pop,
    PopN(u8),
    GetLocal(u8),
    GetLocalLong(u16),
    SetLocal(u8),
    SetLocalLong(u16),
    GetGlobal(u8),
    GetGlobalLong(u16),
    DefineGlobal(u8),
    DefineGlobalLong(u16),
    SetGlobal(u8),
    SetGlobalLong(u16),
    GetUpvalue(u8),
    GetUpvalueLong(u16),
    SetUpvalue(u8),
    SetUpvalueLong(u16),
    CloseUpvalue,
    EqualEqual,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
    Not,
    Negate,
    Print,
    Jump(u16),
    JumpIfTrue(u16),
    JumpIfFalse(u16),
    Loop(u16),
    Call(u8),
    Return,
    Closure { constant: u8, upvalues: Vec<CaptureRecord> },
    ClosureLong { constant: u16, upvalues: Vec<CaptureRecord> },
}

/// A malformed instruction stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnknownOpcode { byte: u8, offset: usize },
    /// The stream ended in the middle of an instruction.
    Truncated { offset: usize },
    /// A closure instruction referenced a constant that is not a function.
    BadClosureConstant { offset: usize },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnknownOpcode { byte, offset } => {
                write!(f, "unknown opcode {} at offset {}", byte, offset)
            }
            DecodeError::Truncated { offset } => {
                write!(f, "truncated instruction at offset {}", offset)
            }
            DecodeError::BadClosureConstant { offset } => {
                write!(f, "closure constant at offset {} is not a function", offset)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl Instruction {
    /// Decode the instruction starting at `offset`. Returns it together
    /// with the offset of the next instruction.
    ///
    /// The heap is needed for closure instructions, whose trailing
    /// capture records are counted by the referenced function.
    pub fn decode(
        heap: &Heap,
        chunk: &Chunk,
        offset: usize,
    ) -> Result<(Instruction, usize), DecodeError> {
        let code = &chunk.code;
        let byte = |at: usize| code.get(at).copied().ok_or(DecodeError::Truncated { offset });
        let short = |at: usize| -> Result<u16, DecodeError> {
            Ok(u16::from_be_bytes([byte(at)?, byte(at + 1)?]))
        };

        let op = OpCode::try_from(byte(offset)?)
            .map_err(|byte| DecodeError::UnknownOpcode { byte, offset })?;

        let instruction = match op {
            OpCode::Constant => (Instruction::Constant(byte(offset + 1)?), offset + 2),
            OpCode::ConstantLong => (Instruction::ConstantLong(short(offset + 1)?), offset + 3),
            OpCode::Nil => (Instruction::Nil, offset + 1),
            OpCode::True => (Instruction::True, offset + 1),
            OpCode::False => (Instruction::False, offset + 1),
            OpCode::Pop => (Instruction::Pop, offset + 1),
            OpCode::PopN => (Instruction::PopN(byte(offset + 1)?), offset + 2),
            OpCode::GetLocal => (Instruction::GetLocal(byte(offset + 1)?), offset + 2),
            OpCode::GetLocalLong => (Instruction::GetLocalLong(short(offset + 1)?), offset + 3),
            OpCode::SetLocal => (Instruction::SetLocal(byte(offset + 1)?), offset + 2),
            OpCode::SetLocalLong => (Instruction::SetLocalLong(short(offset + 1)?), offset + 3),
            OpCode::GetGlobal => (Instruction::GetGlobal(byte(offset + 1)?), offset + 2),
            OpCode::GetGlobalLong => (Instruction::GetGlobalLong(short(offset + 1)?), offset + 3),
            OpCode::DefineGlobal => (Instruction::DefineGlobal(byte(offset + 1)?), offset + 2),
            OpCode::DefineGlobalLong => {
                (Instruction::DefineGlobalLong(short(offset + 1)?), offset + 3)
            }
            OpCode::SetGlobal => (Instruction::SetGlobal(byte(offset + 1)?), offset + 2),
            OpCode::SetGlobalLong => (Instruction::SetGlobalLong(short(offset + 1)?), offset + 3),
            OpCode::GetUpvalue => (Instruction::GetUpvalue(byte(offset + 1)?), offset + 2),
            OpCode::GetUpvalueLong => {
                (Instruction::GetUpvalueLong(short(offset + 1)?), offset + 3)
            }
            OpCode::SetUpvalue => (Instruction::SetUpvalue(byte(offset + 1)?), offset + 2),
            OpCode::SetUpvalueLong => {
                (Instruction::SetUpvalueLong(short(offset + 1)?), offset + 3)
            }
            OpCode::CloseUpvalue => (Instruction::CloseUpvalue, offset + 1),
            OpCode::EqualEqual => (Instruction::EqualEqual, offset + 1),
            OpCode::NotEqual => (Instruction::NotEqual, offset + 1),
            OpCode::Greater => (Instruction::Greater, offset + 1),
            OpCode::GreaterEqual => (Instruction::GreaterEqual, offset + 1),
            OpCode::Less => (Instruction::Less, offset + 1),
            OpCode::LessEqual => (Instruction::LessEqual, offset + 1),
            OpCode::Add => (Instruction::Add, offset + 1),
            OpCode::Subtract => (Instruction::Subtract, offset + 1),
            OpCode::Multiply => (Instruction::Multiply, offset + 1),
            OpCode::Divide => (Instruction::Divide, offset + 1),
            OpCode::Not => (Instruction::Not, offset + 1),
            OpCode::Negate => (Instruction::Negate, offset + 1),
            OpCode::Print => (Instruction::Print, offset + 1),
            OpCode::Jump => (Instruction::Jump(short(offset + 1)?), offset + 3),
            OpCode::JumpIfTrue => (Instruction::JumpIfTrue(short(offset + 1)?), offset + 3),
            OpCode::JumpIfFalse => (Instruction::JumpIfFalse(short(offset + 1)?), offset + 3),
            OpCode::Loop => (Instruction::Loop(short(offset + 1)?), offset + 3),
            OpCode::Call => (Instruction::Call(byte(offset + 1)?), offset + 2),
            OpCode::Return => (Instruction::Return, offset + 1),
            OpCode::Closure => {
                let constant = byte(offset + 1)?;
                let (upvalues, next) =
                    decode_captures(heap, chunk, offset, constant as u16, offset + 2)?;
                (Instruction::Closure { constant, upvalues }, next)
            }
            OpCode::ClosureLong => {
                let constant = short(offset + 1)?;
                let (upvalues, next) = decode_captures(heap, chunk, offset, constant, offset + 4)?;
                (Instruction::ClosureLong { constant, upvalues }, next)
            }
        };
        Ok(instruction)
    }

    /// Append this instruction's exact byte encoding.
    pub fn encode(&self, code: &mut Vec<u8>) {
        fn op(code: &mut Vec<u8>, op: OpCode) {
            code.push(op as u8);
        }
        fn op_u8(code: &mut Vec<u8>, o: OpCode, operand: u8) {
            code.push(o as u8);
            code.push(operand);
        }
        fn op_u16(code: &mut Vec<u8>, o: OpCode, operand: u16) {
            code.push(o as u8);
            code.extend_from_slice(&operand.to_be_bytes());
        }
        fn captures(code: &mut Vec<u8>, upvalues: &[CaptureRecord]) {
            for record in upvalues {
                code.push(record.is_local as u8);
                code.extend_from_slice(&record.index.to_be_bytes());
            }
        }

        match self {
            Instruction::Constant(n) => op_u8(code, OpCode::Constant, *n),
            Instruction::ConstantLong(n) => op_u16(code, OpCode::ConstantLong, *n),
            Instruction::Nil => op(code, OpCode::Nil),
            Instruction::True => op(code, OpCode::True),
            Instruction::False => op(code, OpCode::False),
            Instruction::Pop => op(code, OpCode::Pop),
            Instruction::PopN(n) => op_u8(code, OpCode::PopN, *n),
            Instruction::GetLocal(n) => op_u8(code, OpCode::GetLocal, *n),
            Instruction::GetLocalLong(n) => op_u16(code, OpCode::GetLocalLong, *n),
            Instruction::SetLocal(n) => op_u8(code, OpCode::SetLocal, *n),
            Instruction::SetLocalLong(n) => op_u16(code, OpCode::SetLocalLong, *n),
            Instruction::GetGlobal(n) => op_u8(code, OpCode::GetGlobal, *n),
            Instruction::GetGlobalLong(n) => op_u16(code, OpCode::GetGlobalLong, *n),
            Instruction::DefineGlobal(n) => op_u8(code, OpCode::DefineGlobal, *n),
            Instruction::DefineGlobalLong(n) => op_u16(code, OpCode::DefineGlobalLong, *n),
            Instruction::SetGlobal(n) => op_u8(code, OpCode::SetGlobal, *n),
            Instruction::SetGlobalLong(n) => op_u16(code, OpCode::SetGlobalLong, *n),
            Instruction::GetUpvalue(n) => op_u8(code, OpCode::GetUpvalue, *n),
            Instruction::GetUpvalueLong(n) => op_u16(code, OpCode::GetUpvalueLong, *n),
            Instruction::SetUpvalue(n) => op_u8(code, OpCode::SetUpvalue, *n),
            Instruction::SetUpvalueLong(n) => op_u16(code, OpCode::SetUpvalueLong, *n),
            Instruction::CloseUpvalue => op(code, OpCode::CloseUpvalue),
            Instruction::EqualEqual => op(code, OpCode::EqualEqual),
            Instruction::NotEqual => op(code, OpCode::NotEqual),
            Instruction::Greater => op(code, OpCode::Greater),
            Instruction::GreaterEqual => op(code, OpCode::GreaterEqual),
            Instruction::Less => op(code, OpCode::Less),
            Instruction::LessEqual => op(code, OpCode::LessEqual),
            Instruction::Add => op(code, OpCode::Add),
            Instruction::Subtract => op(code, OpCode::Subtract),
            Instruction::Multiply => op(code, OpCode::Multiply),
            Instruction::Divide => op(code, OpCode::Divide),
            Instruction::Not => op(code, OpCode::Not),
            Instruction::Negate => op(code, OpCode::Negate),
            Instruction::Print => op(code, OpCode::Print),
            Instruction::Jump(n) => op_u16(code, OpCode::Jump, *n),
            Instruction::JumpIfTrue(n) => op_u16(code, OpCode::JumpIfTrue, *n),
            Instruction::JumpIfFalse(n) => op_u16(code, OpCode::JumpIfFalse, *n),
            Instruction::Loop(n) => op_u16(code, OpCode::Loop, *n),
            Instruction::Call(n) => op_u8(code, OpCode::Call, *n),
            Instruction::Return => op(code, OpCode::Return),
            Instruction::Closure { constant, upvalues } => {
                op_u8(code, OpCode::Closure, *constant);
                captures(code, upvalues);
            }
            Instruction::ClosureLong { constant, upvalues } => {
                op_u16(code, OpCode::ClosureLong, *constant);
                captures(code, upvalues);
            }
        }
    }
}

fn decode_captures(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    constant: u16,
    mut at: usize,
) -> Result<(Vec<CaptureRecord>, usize), DecodeError> {
    let function = match chunk.constants.get(constant as usize) {
        Some(Value::Obj(id)) => match heap.get(*id) {
            Obj::Function(f) => f,
            _ => return Err(DecodeError::BadClosureConstant { offset }),
        },
        _ => return Err(DecodeError::BadClosureConstant { offset }),
    };

    let mut upvalues = Vec::with_capacity(function.upvalue_count as usize);
    for _ in 0..function.upvalue_count {
        let bytes = chunk
            .code
            .get(at..at + 3)
            .ok_or(DecodeError::Truncated { offset })?;
        upvalues.push(CaptureRecord {
            is_local: bytes[0] != 0,
            index: u16::from_be_bytes([bytes[1], bytes[2]]),
        });
        at += 3;
    }
    Ok((upvalues, at))
}

/// Decode a whole chunk into instructions.
pub fn decode_chunk(heap: &Heap, chunk: &Chunk) -> Result<Vec<Instruction>, DecodeError> {
    let mut instructions = Vec::new();
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (instruction, next) = Instruction::decode(heap, chunk, offset)?;
        instructions.push(instruction);
        offset = next;
    }
    Ok(instructions)
}

/// Render a whole chunk, one instruction per line, under a header.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (text, next) = disassemble_instruction(heap, chunk, offset);
        out.push_str(&text);
        offset = next;
    }
    out
}

/// Render the instruction at `offset`; returns the text (newline
/// terminated) and the next offset.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut out = format!("{:04} ", offset);

    let line = chunk.line_at(offset);
    if offset > 0 && line == chunk.line_at(offset - 1) {
        out.push_str("   | ");
    } else {
        let _ = write!(out, "{:4} ", line);
    }

    let (instruction, next) = match Instruction::decode(heap, chunk, offset) {
        Ok(decoded) => decoded,
        Err(err) => {
            let _ = writeln!(out, "{}", err);
            return (out, offset + 1);
        }
    };

    let mnemonic = |op: OpCode| op.mnemonic();
    match &instruction {
        Instruction::Constant(n) => constant_line(&mut out, heap, chunk, mnemonic(OpCode::Constant), *n as u16),
        Instruction::ConstantLong(n) => {
            constant_line(&mut out, heap, chunk, mnemonic(OpCode::ConstantLong), *n)
        }
        Instruction::GetGlobal(n) => constant_line(&mut out, heap, chunk, mnemonic(OpCode::GetGlobal), *n as u16),
        Instruction::GetGlobalLong(n) => {
            constant_line(&mut out, heap, chunk, mnemonic(OpCode::GetGlobalLong), *n)
        }
        Instruction::DefineGlobal(n) => {
            constant_line(&mut out, heap, chunk, mnemonic(OpCode::DefineGlobal), *n as u16)
        }
        Instruction::DefineGlobalLong(n) => {
            constant_line(&mut out, heap, chunk, mnemonic(OpCode::DefineGlobalLong), *n)
        }
        Instruction::SetGlobal(n) => constant_line(&mut out, heap, chunk, mnemonic(OpCode::SetGlobal), *n as u16),
        Instruction::SetGlobalLong(n) => {
            constant_line(&mut out, heap, chunk, mnemonic(OpCode::SetGlobalLong), *n)
        }
        Instruction::PopN(n) => operand_line(&mut out, mnemonic(OpCode::PopN), *n as u16),
        Instruction::GetLocal(n) => operand_line(&mut out, mnemonic(OpCode::GetLocal), *n as u16),
        Instruction::GetLocalLong(n) => operand_line(&mut out, mnemonic(OpCode::GetLocalLong), *n),
        Instruction::SetLocal(n) => operand_line(&mut out, mnemonic(OpCode::SetLocal), *n as u16),
        Instruction::SetLocalLong(n) => operand_line(&mut out, mnemonic(OpCode::SetLocalLong), *n),
        Instruction::GetUpvalue(n) => operand_line(&mut out, mnemonic(OpCode::GetUpvalue), *n as u16),
        Instruction::GetUpvalueLong(n) => {
            operand_line(&mut out, mnemonic(OpCode::GetUpvalueLong), *n)
        }
        Instruction::SetUpvalue(n) => operand_line(&mut out, mnemonic(OpCode::SetUpvalue), *n as u16),
        Instruction::SetUpvalueLong(n) => {
            operand_line(&mut out, mnemonic(OpCode::SetUpvalueLong), *n)
        }
        Instruction::Call(n) => operand_line(&mut out, mnemonic(OpCode::Call), *n as u16),
        Instruction::Jump(n) => jump_line(&mut out, mnemonic(OpCode::Jump), offset, 1, *n),
        Instruction::JumpIfTrue(n) => jump_line(&mut out, mnemonic(OpCode::JumpIfTrue), offset, 1, *n),
        Instruction::JumpIfFalse(n) => {
            jump_line(&mut out, mnemonic(OpCode::JumpIfFalse), offset, 1, *n)
        }
        Instruction::Loop(n) => jump_line(&mut out, mnemonic(OpCode::Loop), offset, -1, *n),
        Instruction::Closure { constant, upvalues } => {
            closure_lines(&mut out, heap, chunk, mnemonic(OpCode::Closure), offset, *constant as u16, upvalues)
        }
        Instruction::ClosureLong { constant, upvalues } => {
            closure_lines(&mut out, heap, chunk, mnemonic(OpCode::ClosureLong), offset, *constant, upvalues)
        }
        simple => {
            let op = match simple {
                Instruction::Nil => OpCode::Nil,
                Instruction::True => OpCode::True,
                Instruction::False => OpCode::False,
                Instruction::Pop => OpCode::Pop,
                Instruction::CloseUpvalue => OpCode::CloseUpvalue,
                Instruction::EqualEqual => OpCode::EqualEqual,
                Instruction::NotEqual => OpCode::NotEqual,
                Instruction::Greater => OpCode::Greater,
                Instruction::GreaterEqual => OpCode::GreaterEqual,
                Instruction::Less => OpCode::Less,
                Instruction::LessEqual => OpCode::LessEqual,
                Instruction::Add => OpCode::Add,
                Instruction::Subtract => OpCode::Subtract,
                Instruction::Multiply => OpCode::Multiply,
                Instruction::Divide => OpCode::Divide,
                Instruction::Not => OpCode::Not,
                Instruction::Negate => OpCode::Negate,
                Instruction::Print => OpCode::Print,
                Instruction::Return => OpCode::Return,
                _ => unreachable!("instruction with operands handled above"),
            };
            let _ = writeln!(out, "{}", op.mnemonic());
        }
    }

    (out, next)
}

fn operand_line(out: &mut String, name: &str, operand: u16) {
    let _ = writeln!(out, "{:<16} {:4}", name, operand);
}

fn constant_line(out: &mut String, heap: &Heap, chunk: &Chunk, name: &str, index: u16) {
    let value = chunk
        .constants
        .get(index as usize)
        .map(|v| v.display(heap))
        .unwrap_or_else(|| "<bad constant>".to_string());
    let _ = writeln!(out, "{:<16} {:4} '{}'", name, index, value);
}

fn jump_line(out: &mut String, name: &str, offset: usize, sign: i64, distance: u16) {
    let target = offset as i64 + 3 + sign * distance as i64;
    let _ = writeln!(out, "{:<16} {:4} -> {}", name, offset, target);
}

fn closure_lines(
    out: &mut String,
    heap: &Heap,
    chunk: &Chunk,
    name: &str,
    offset: usize,
    constant: u16,
    upvalues: &[CaptureRecord],
) {
    constant_line(out, heap, chunk, name, constant);
    for record in upvalues {
        let kind = if record.is_local { "local" } else { "upvalue" };
        let _ = writeln!(
            out,
            "{:04}      |                     {} {}",
            offset, kind, record.index
        );
    }
}

/// Walk a chunk and check the law every compiled chunk obeys: all
/// jump and loop targets land inside `[0, code.len]`.
pub fn check_jump_targets(heap: &Heap, chunk: &Chunk) -> Result<(), String> {
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (instruction, next) =
            Instruction::decode(heap, chunk, offset).map_err(|e| e.to_string())?;
        match instruction {
            Instruction::Jump(d) | Instruction::JumpIfTrue(d) | Instruction::JumpIfFalse(d) => {
                let target = offset + 3 + d as usize;
                if target > chunk.code.len() {
                    return Err(format!("jump at {} targets {} past the end", offset, target));
                }
            }
            Instruction::Loop(d) => {
                let from = offset + 3;
                if (d as usize) > from {
                    return Err(format!("loop at {} targets before the start", offset));
                }
            }
            _ => {}
        }
        offset = next;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_all(chunk: &mut Chunk, bytes: &[u8]) {
        for &byte in bytes {
            chunk.write(byte, 1);
        }
    }

    #[test]
    fn decode_encode_round_trip() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.add_constant(Value::Number(1.0));

        write_all(
            &mut chunk,
            &[
                OpCode::Constant as u8,
                0,
                OpCode::Negate as u8,
                OpCode::JumpIfFalse as u8,
                0,
                2,
                OpCode::Pop as u8,
                OpCode::Nil as u8,
                OpCode::Loop as u8,
                0,
                8,
                OpCode::Return as u8,
            ],
        );

        let instructions = decode_chunk(&heap, &chunk).unwrap();
        assert_eq!(
            instructions,
            vec![
                Instruction::Constant(0),
                Instruction::Negate,
                Instruction::JumpIfFalse(2),
                Instruction::Pop,
                Instruction::Nil,
                Instruction::Loop(8),
                Instruction::Return,
            ]
        );

        let mut encoded = Vec::new();
        for instruction in &instructions {
            instruction.encode(&mut encoded);
        }
        assert_eq!(encoded, chunk.code);
        assert!(check_jump_targets(&heap, &chunk).is_ok());
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        write_all(&mut chunk, &[OpCode::Jump as u8, 0]);
        assert_eq!(
            Instruction::decode(&heap, &chunk, 0),
            Err(DecodeError::Truncated { offset: 0 })
        );
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        write_all(&mut chunk, &[0xfe]);
        assert_eq!(
            Instruction::decode(&heap, &chunk, 0),
            Err(DecodeError::UnknownOpcode {
                byte: 0xfe,
                offset: 0
            })
        );
    }

    #[test]
    fn out_of_range_jump_is_caught() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        write_all(&mut chunk, &[OpCode::Jump as u8, 0, 200, OpCode::Return as u8]);
        assert!(check_jump_targets(&heap, &chunk).is_err());
    }

    #[test]
    fn disassembly_shows_lines_and_mnemonics() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.add_constant(Value::Number(7.0));
        chunk.write(OpCode::Constant as u8, 1);
        chunk.write(0, 1);
        chunk.write(OpCode::Print as u8, 1);
        chunk.write(OpCode::Return as u8, 2);

        let text = disassemble_chunk(&heap, &chunk, "test");
        assert!(text.starts_with("== test ==\n"));
        assert!(text.contains("OP_CONSTANT"));
        assert!(text.contains("'7'"));
        // Same-line instructions display the pipe continuation.
        assert!(text.contains("   | "));
        assert!(text.contains("OP_PRINT"));
        assert!(text.contains("OP_RETURN"));
    }
}
