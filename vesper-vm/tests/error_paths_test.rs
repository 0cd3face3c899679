// vesper-vm - Compile and runtime error tests
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Error reporting: diagnostics, panic-mode recovery, runtime messages
//! and stack traces.

mod common;

use common::{error_text, run_expecting_error};
use vesper_vm::InterpretError;

fn expect_compile_error(source: &str, expected: &str) {
    let (_, error) = run_expecting_error(source);
    match &error {
        InterpretError::Compile(diagnostics) => {
            assert!(
                diagnostics.iter().any(|d| d.to_string().contains(expected)),
                "diagnostics {:?} should contain '{}' for source: {}",
                diagnostics.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
                expected,
                source
            );
        }
        other => panic!("expected compile error, got {:?} for: {}", other, source),
    }
}

fn expect_runtime_error(source: &str, expected: &str) {
    let (_, error) = run_expecting_error(source);
    match &error {
        InterpretError::Runtime(e) => {
            assert!(
                e.message.contains(expected),
                "runtime error '{}' should contain '{}' for source: {}",
                e.message,
                expected,
                source
            );
        }
        other => panic!("expected runtime error, got {:?} for: {}", other, source),
    }
}

// =============================================================================
// Compile errors
// =============================================================================

#[test]
fn reading_variable_in_own_initializer() {
    expect_compile_error(
        "{ var x = x; }",
        "Can't read variable in its own initializer",
    );
}

#[test]
fn self_read_diagnostic_format() {
    let text = error_text("{\nvar x = x;\n}");
    assert_eq!(
        text,
        "[line 2] Error at 'x': Can't read variable in its own initializer"
    );
}

#[test]
fn global_self_initializer_is_allowed_to_compile() {
    // Globals are late-bound, so `var x = x;` at top level is a
    // *runtime* undefined-variable error instead.
    expect_runtime_error("var x = x;", "Undefined variable 'x'.");
}

#[test]
fn invalid_assignment_target() {
    expect_compile_error("1 = 2;", "Invalid assignment target.");
    expect_compile_error("var a; var b; a + b = 3;", "Invalid assignment target.");
    expect_compile_error("var a; (a) = 3;", "Invalid assignment target.");
}

#[test]
fn duplicate_declaration_in_scope() {
    expect_compile_error(
        "{ var a = 1; var a = 2; }",
        "There is already a variable with this name in the current scope",
    );
}

#[test]
fn continue_outside_loop() {
    expect_compile_error("continue;", "Cannot use continue outside of loop");
    expect_compile_error(
        "while (true) {} continue;",
        "Cannot use continue outside of loop",
    );
    // A loop in an enclosing function does not reach into a nested one.
    expect_compile_error(
        "while (true) { fun f() { continue; } }",
        "Cannot use continue outside of loop",
    );
}

#[test]
fn return_outside_function() {
    expect_compile_error("return 1;", "Can't return from top-level code.");
}

#[test]
fn missing_semicolon() {
    expect_compile_error("print 1", "Expected ';' at the end of statement");
}

#[test]
fn unterminated_string() {
    expect_compile_error("print \"oops;", "Unterminated string.");
}

#[test]
fn unexpected_character() {
    expect_compile_error("print 1 @ 2;", "Unexpected character.");
}

#[test]
fn expected_expression() {
    expect_compile_error("print ;", "Expected expression.");
    expect_compile_error("1 + ;", "Expected expression.");
}

#[test]
fn too_many_parameters() {
    let params: Vec<String> = (0..=255).map(|i| format!("p{}", i)).collect();
    let source = format!("fun f({}) {{}}", params.join(", "));
    expect_compile_error(&source, "Can't have more than 255 parameters.");
}

#[test]
fn too_many_arguments() {
    let args: Vec<String> = (0..=255).map(|i| i.to_string()).collect();
    let source = format!("fun f() {{}} f({});", args.join(", "));
    expect_compile_error(&source, "Can't have more than 255 arguments.");
}

#[test]
fn parser_recovers_and_reports_multiple_errors() {
    let (_, error) = run_expecting_error("var 1 = 2;\nprint \"ok\"\nvar y = ;\n");
    match error {
        InterpretError::Compile(diagnostics) => {
            assert!(
                diagnostics.len() >= 2,
                "expected several diagnostics, got {:?}",
                diagnostics
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
            );
        }
        other => panic!("expected compile errors, got {:?}", other),
    }
}

#[test]
fn panic_mode_suppresses_cascades() {
    // One broken statement yields one diagnostic, not one per token.
    let (_, error) = run_expecting_error("var = = = = 1;");
    match error {
        InterpretError::Compile(diagnostics) => assert_eq!(diagnostics.len(), 1),
        other => panic!("expected compile errors, got {:?}", other),
    }
}

// =============================================================================
// Runtime errors
// =============================================================================

#[test]
fn adding_number_and_string() {
    expect_runtime_error("1 + \"a\";", "Operands must be two numbers or two strings");
    expect_runtime_error("\"a\" + 1;", "Operands must be two numbers or two strings");
    expect_runtime_error("nil + nil;", "Operands must be two numbers or two strings");
}

#[test]
fn arithmetic_on_non_numbers() {
    expect_runtime_error("1 - \"a\";", "Operands must be numbers.");
    expect_runtime_error("true * 2;", "Operands must be numbers.");
    expect_runtime_error("\"a\" < \"b\";", "Operands must be numbers.");
}

#[test]
fn negating_non_number() {
    expect_runtime_error("-\"a\";", "Operand must be a number.");
    expect_runtime_error("-nil;", "Operand must be a number.");
}

#[test]
fn undefined_variable_read_and_write() {
    expect_runtime_error("print missing;", "Undefined variable 'missing'.");
    // Assignment must not create a global.
    expect_runtime_error("missing = 1;", "Undefined variable 'missing'.");
    expect_runtime_error(
        "fun f() { ghost = 1; } f(); print ghost;",
        "Undefined variable 'ghost'.",
    );
}

#[test]
fn calling_non_callable() {
    expect_runtime_error("var x = 1; x();", "Can only call functions and classes.");
    expect_runtime_error("\"str\"();", "Can only call functions and classes.");
    expect_runtime_error("nil();", "Can only call functions and classes.");
}

#[test]
fn arity_mismatch() {
    expect_runtime_error(
        "fun two(a, b) {} two(1);",
        "Expected 2 arguments but got 1.",
    );
    expect_runtime_error(
        "fun none() {} none(1, 2, 3);",
        "Expected 0 arguments but got 3.",
    );
    expect_runtime_error("clock(1);", "Expected 0 arguments but got 1.");
}

#[test]
fn unbounded_recursion_overflows_frames() {
    expect_runtime_error("fun f() { f(); } f();", "Stack overflow.");
}

#[test]
fn runtime_error_carries_stack_trace() {
    let (_, error) = run_expecting_error(
        "fun inner() { return 1 + nil; }\nfun outer() { return inner(); }\nouter();",
    );
    let text = error.to_string();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "Operands must be two numbers or two strings");
    assert_eq!(lines[1], "[line 1] in inner()");
    assert_eq!(lines[2], "[line 2] in outer()");
    assert_eq!(lines[3], "[line 3] in script");
}

#[test]
fn output_before_error_is_kept() {
    let (output, _) = run_expecting_error("print \"before\"; 1 + nil;");
    assert_eq!(output, "before\n");
}

#[test]
fn vm_is_usable_after_runtime_error() {
    let (mut vm, buffer) = common::capture_vm();
    assert!(vm.interpret("1 + nil;").is_err());
    vm.interpret("print \"recovered\";").unwrap();
    assert_eq!(buffer.contents(), "recovered\n");
}
