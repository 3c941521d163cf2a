// File: src/main.rs
//
// Entry point for the Aria interpreter. With a file argument the script
// is interpreted; without one an interactive REPL starts. Exit codes:
// 0 success, 64 usage error, 65 compile error, 70 runtime error,
// 74 unreadable source file.

mod ast;
mod builtins;
mod bytecode;
mod compiler;
mod disassembler;
mod errors;
mod heap;
mod lexer;
mod module;
mod object;
mod parser;
mod repl;
mod table;
mod value;
mod vm;

use clap::error::ErrorKind;
use clap::Parser as ClapParser;
use std::fs;
use std::path::PathBuf;

use errors::InterpretResult;

#[derive(ClapParser)]
#[command(
    name = "aria",
    about = "Aria: a small dynamically-typed scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Path to the .aria script; omit to start the REPL.
    file: Option<PathBuf>,
}

fn run_file(path: &PathBuf) -> ! {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Could not read '{}': {}", path.display(), e);
            std::process::exit(74);
        }
    };
    let mut vm = vm::Vm::new();
    let result = vm.interpret_file(&path.to_string_lossy(), &source);
    match result {
        InterpretResult::Success => std::process::exit(0),
        InterpretResult::CompileError => std::process::exit(65),
        InterpretResult::RuntimeError => std::process::exit(70),
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(64);
        }
    };

    match cli.file {
        Some(file) => run_file(&file),
        None => match repl::Repl::new() {
            Ok(mut repl) => {
                if let Err(e) = repl.run() {
                    eprintln!("REPL error: {}", e);
                    std::process::exit(70);
                }
            }
            Err(e) => {
                eprintln!("Failed to start REPL: {}", e);
                std::process::exit(70);
            }
        },
    }
}
