// vesper-vm - Shared test helpers
// Copyright (c) 2025 Tom Waddington. MIT licensed.

#![allow(dead_code)]

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use vesper_vm::{InterpretError, Vm};

/// A clonable in-memory sink so tests can hand the VM an output and
/// still read it afterwards.
#[derive(Clone, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A VM wired to a capturable output buffer.
pub fn capture_vm() -> (Vm, SharedBuffer) {
    let buffer = SharedBuffer::new();
    (Vm::with_output(Box::new(buffer.clone())), buffer)
}

/// Run a program and return everything it printed.
pub fn run(source: &str) -> String {
    let (mut vm, buffer) = capture_vm();
    match vm.interpret(source) {
        Ok(()) => buffer.contents(),
        Err(e) => panic!("unexpected error: {}\nfor source: {}", e, source),
    }
}

/// Run a program that must fail; returns what it printed before the
/// failure and the error itself.
pub fn run_expecting_error(source: &str) -> (String, InterpretError) {
    let (mut vm, buffer) = capture_vm();
    match vm.interpret(source) {
        Ok(()) => panic!("expected an error for source: {}", source),
        Err(e) => (buffer.contents(), e),
    }
}

/// The error's display text, for message assertions.
pub fn error_text(source: &str) -> String {
    let (_, error) = run_expecting_error(source);
    error.to_string()
}
