// vesper-vm - End-to-end interpreter tests
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Whole-pipeline tests: source in, printed output out.

mod common;

use common::run;

// =============================================================================
// Expressions
// =============================================================================

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("print 1 + 2 * 3;"), "7\n");
    assert_eq!(run("print (1 + 2) * 3;"), "9\n");
    assert_eq!(run("print 10 - 4 / 2;"), "8\n");
    assert_eq!(run("print 1 - 2 - 3;"), "-4\n");
    assert_eq!(run("print 2.5 * 2;"), "5\n");
}

#[test]
fn unary_operators() {
    assert_eq!(run("print -3;"), "-3\n");
    assert_eq!(run("print --3;"), "3\n");
    assert_eq!(run("print !true;"), "false\n");
    assert_eq!(run("print !nil;"), "true\n");
    assert_eq!(run("print !0;"), "false\n");
    assert_eq!(run("print !!\"\";"), "true\n");
}

#[test]
fn comparison_and_equality() {
    assert_eq!(run("print 1 < 2;"), "true\n");
    assert_eq!(run("print 2 <= 2;"), "true\n");
    assert_eq!(run("print 3 > 4;"), "false\n");
    assert_eq!(run("print 4 >= 5;"), "false\n");
    assert_eq!(run("print 1 == 1;"), "true\n");
    assert_eq!(run("print 1 != 1;"), "false\n");
    assert_eq!(run("print nil == false;"), "false\n");
    assert_eq!(run("print true == 1;"), "false\n");
    assert_eq!(run("print nil == nil;"), "true\n");
}

#[test]
fn string_literals_and_concatenation() {
    assert_eq!(run("print \"hello\";"), "hello\n");
    assert_eq!(run("print \"foo\" + \"bar\";"), "foobar\n");
    assert_eq!(run("print \"a\" + \"b\" + \"c\";"), "abc\n");
    // Strings may span lines.
    assert_eq!(run("print \"one\ntwo\";"), "one\ntwo\n");
}

#[test]
fn interned_strings_compare_by_identity() {
    assert_eq!(run("var a = \"hi\"; var b = \"hi\"; print a == b;"), "true\n");
    assert_eq!(run("print \"ab\" == \"a\" + \"b\";"), "true\n");
    assert_eq!(run("print \"ab\" == \"ba\";"), "false\n");
}

#[test]
fn number_literals_allow_underscores() {
    assert_eq!(run("print 1_000;"), "1000\n");
    assert_eq!(run("print 1_000_000 + 1;"), "1000001\n");
    assert_eq!(run("print 1_0.2_5;"), "10.25\n");
}

#[test]
fn ternary_expression() {
    assert_eq!(run("print true ? 1 : 2;"), "1\n");
    assert_eq!(run("print false ? 1 : 2;"), "2\n");
    // Right-associative nesting.
    assert_eq!(run("print false ? 1 : true ? 2 : 3;"), "2\n");
    assert_eq!(run("print 1 < 2 ? \"yes\" : \"no\";"), "yes\n");
}

#[test]
fn and_or_short_circuit() {
    assert_eq!(run("print true and 2;"), "2\n");
    assert_eq!(run("print false and 2;"), "false\n");
    assert_eq!(run("print nil or \"fallback\";"), "fallback\n");
    assert_eq!(run("print 1 or 2;"), "1\n");
    // The right side must not run when short-circuited.
    assert_eq!(
        run("var ran = false; fun mark() { ran = true; return true; } \
             false and mark(); print ran;"),
        "false\n"
    );
    assert_eq!(
        run("var ran = false; fun mark() { ran = true; return true; } \
             true or mark(); print ran;"),
        "false\n"
    );
}

// =============================================================================
// Variables & scope
// =============================================================================

#[test]
fn globals_define_and_assign() {
    assert_eq!(run("var x; print x;"), "nil\n");
    assert_eq!(run("var x = 1; x = 2; print x;"), "2\n");
    assert_eq!(run("var x = 1; print x = 3;"), "3\n");
    // Redefinition of a global is allowed.
    assert_eq!(run("var x = 1; var x = 2; print x;"), "2\n");
}

#[test]
fn locals_and_shadowing() {
    assert_eq!(run("{ var x = 1; { var x = 2; print x; } print x; }"), "2\n1\n");
    assert_eq!(run("var x = \"global\"; { var x = \"local\"; print x; } print x;"),
        "local\nglobal\n");
    assert_eq!(run("{ var a = 1; var b = 2; var c = a + b; print c; }"), "3\n");
}

#[test]
fn many_locals_in_one_scope() {
    // Exercises the POPN collapsing path on scope exit.
    let mut source = String::from("{");
    for i in 0..40 {
        source.push_str(&format!("var v{} = {};", i, i));
    }
    source.push_str("print v39;}print \"done\";");
    assert_eq!(run(&source), "39\ndone\n");
}

#[test]
fn stack_discipline_across_statements() {
    // Locals are addressed by stack slot, so any per-statement or
    // per-iteration stack leak scrambles them.
    let source = "
        var total = 0;
        {
            var x = 1;
            for (var i = 0; i < 100; i = i + 1) {
                1 + 2 * 3;
                true and false;
                total = total + x;
            }
            print total;
            print x;
        }
        print total;
    ";
    assert_eq!(run(source), "100\n1\n100\n");
}

// =============================================================================
// Control flow
// =============================================================================

#[test]
fn if_else() {
    assert_eq!(run("if (true) print 1; else print 2;"), "1\n");
    assert_eq!(run("if (false) print 1; else print 2;"), "2\n");
    assert_eq!(run("if (false) print 1; print 3;"), "3\n");
    assert_eq!(run("if (1 > 0) { print \"pos\"; } else { print \"neg\"; }"), "pos\n");
}

#[test]
fn while_loop() {
    assert_eq!(
        run("var i = 0; while (i < 3) { print i; i = i + 1; }"),
        "0\n1\n2\n"
    );
    assert_eq!(run("while (false) print 1; print 2;"), "2\n");
}

#[test]
fn for_loop() {
    assert_eq!(
        run("var a = 0; for (var i = 0; i < 3; i = i + 1) a = a + i; print a;"),
        "3\n"
    );
    assert_eq!(
        run("for (var i = 0; i < 3; i = i + 1) print i;"),
        "0\n1\n2\n"
    );
    // All three clauses optional; break out via the condition.
    assert_eq!(
        run("var i = 0; for (; i < 2;) { print i; i = i + 1; }"),
        "0\n1\n"
    );
}

#[test]
fn continue_in_while() {
    assert_eq!(
        run("var i = 0; while (i < 5) { i = i + 1; if (i == 3) continue; print i; }"),
        "1\n2\n4\n5\n"
    );
}

#[test]
fn continue_in_for_runs_increment() {
    assert_eq!(
        run("for (var i = 0; i < 5; i = i + 1) { if (i == 2) continue; print i; }"),
        "0\n1\n3\n4\n"
    );
}

#[test]
fn continue_discards_block_locals() {
    // The locals declared before the continue are popped at the
    // back-edge, so slots line up again on the next iteration.
    assert_eq!(
        run("var out = 0;
             for (var i = 0; i < 4; i = i + 1) {
                 var doubled = i * 2;
                 if (i == 1) continue;
                 out = out + doubled;
             }
             print out;"),
        "10\n"
    );
}

#[test]
fn nested_loops_with_continue() {
    assert_eq!(
        run("for (var i = 0; i < 2; i = i + 1) {
                 for (var j = 0; j < 3; j = j + 1) {
                     if (j == 1) continue;
                     print i * 10 + j;
                 }
             }"),
        "0\n2\n10\n12\n"
    );
}

// =============================================================================
// Functions
// =============================================================================

#[test]
fn function_declaration_and_call() {
    assert_eq!(run("fun greet() { print \"hi\"; } greet();"), "hi\n");
    assert_eq!(run("fun add(a, b) { return a + b; } print add(1, 2);"), "3\n");
    assert_eq!(run("fun id(x) { return x; } print id(id(42));"), "42\n");
}

#[test]
fn function_values_print() {
    assert_eq!(run("fun f() {} print f;"), "<fn f>\n");
    assert_eq!(run("print clock;"), "<native fn>\n");
}

#[test]
fn implicit_return_is_nil() {
    assert_eq!(run("fun f() {} print f();"), "nil\n");
    assert_eq!(run("fun f() { return; } print f();"), "nil\n");
}

#[test]
fn recursion() {
    assert_eq!(
        run("fun fact(n) { if (n <= 1) return 1; return n * fact(n - 1); } print fact(5);"),
        "120\n"
    );
    assert_eq!(
        run("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);"),
        "55\n"
    );
}

#[test]
fn functions_as_arguments() {
    assert_eq!(
        run("fun twice(f, x) { return f(f(x)); } fun inc(n) { return n + 1; } \
             print twice(inc, 5);"),
        "7\n"
    );
}

#[test]
fn clock_native() {
    assert_eq!(run("print clock() >= 0;"), "true\n");
    assert_eq!(run("var before = clock(); var after = clock(); print after >= before;"), "true\n");
}

#[test]
fn counter_closure() {
    assert_eq!(
        run("fun make() { var x = 0; fun inc() { x = x + 1; return x; } return inc; } \
             var c = make(); print c(); print c();"),
        "1\n2\n"
    );
}

#[test]
fn string_uniqueness_in_heap() {
    use vesper_vm::Obj;

    let (mut vm, _buffer) = common::capture_vm();
    vm.interpret(
        "var a = \"dup\"; var b = \"dup\"; var c = \"d\" + \"up\"; print a == c;",
    )
    .unwrap();

    let mut seen = std::collections::HashSet::new();
    for obj in vm.heap().iter() {
        if let Obj::Str(s) = obj {
            assert!(
                seen.insert(s.chars.to_string()),
                "duplicate interned string: {:?}",
                s.chars
            );
        }
    }
}

#[test]
fn globals_persist_across_interpret_calls() {
    let (mut vm, buffer) = common::capture_vm();
    vm.interpret("var x = 41;").unwrap();
    vm.interpret("x = x + 1;").unwrap();
    vm.interpret("print x;").unwrap();
    assert_eq!(buffer.contents(), "42\n");
}
