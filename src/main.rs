// vesper - A small scripting language with a bytecode VM, written in Rust
// Copyright (c) 2025 Tom Waddington. MIT licensed.

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::process;

use vesper_vm::{InterpretError, Vm};

/// Exit code for a compile error, after sysexits EX_DATAERR.
const EXIT_COMPILE_ERROR: i32 = 65;
/// Exit code for a runtime error, after sysexits EX_SOFTWARE.
const EXIT_RUNTIME_ERROR: i32 = 70;

fn main() {
    let args: Vec<String> = env::args().collect();

    // Handle --version flag
    if args.len() == 2 && (args[1] == "--version" || args[1] == "-v") {
        println!("Vesper v0.1.0");
        return;
    }

    match args.len() {
        1 => run_repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: vesper [script]");
            process::exit(64);
        }
    }
}

/// Run a single source file, mapping errors to exit codes.
fn run_file(file_path: &str) {
    let path = Path::new(file_path);

    // Validate file extension
    match path.extension().and_then(|e| e.to_str()) {
        Some("vsp") => {}
        Some(ext) => {
            eprintln!(
                "Error: unsupported file extension '.{}' for '{}'",
                ext, file_path
            );
            process::exit(64);
        }
        None => {
            eprintln!(
                "Error: file '{}' has no extension (expected .vsp)",
                file_path
            );
            process::exit(64);
        }
    }

    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Error reading '{}': {}", file_path, e);
            process::exit(74);
        }
    };

    let mut vm = Vm::new();
    if let Err(e) = vm.interpret(&source) {
        eprintln!("{}", e);
        process::exit(match e {
            InterpretError::Compile(_) => EXIT_COMPILE_ERROR,
            InterpretError::Runtime(_) => EXIT_RUNTIME_ERROR,
        });
    }
}

/// Run the interactive REPL. One VM serves the whole session, so
/// globals defined on earlier lines stay visible.
fn run_repl() {
    println!("Vesper v0.1.0");

    let mut vm = Vm::new();
    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            break;
        }

        let mut input = String::new();
        match io::stdin().read_line(&mut input) {
            Ok(0) => {
                println!();
                break;
            }
            Ok(_) => {
                let input = input.trim();
                if input.is_empty() {
                    continue;
                }
                if let Err(e) = vm.interpret(input) {
                    eprintln!("{}", e);
                }
            }
            Err(e) => {
                eprintln!("Read error: {}", e);
                break;
            }
        }
    }
}
