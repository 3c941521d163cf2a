// File: src/errors.rs
//
// Error types and reporting for the Aria interpreter.
// Compile-time errors carry a source line and render in the
// `[line N] Error: message` format shared by the scanner, parser and
// bytecode compiler; the VM reports runtime errors itself because it
// owns the call-frame backtrace.

use colored::Colorize;
use std::fmt;

/// Outcome of one `interpret` call, mapped to process exit codes by `main`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Success,
    CompileError,
    RuntimeError,
}

/// An error raised while lowering source to bytecode (scanner, parser or
/// compiler). Parsing keeps going after reporting these; code generation
/// aborts on the first one.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub line: usize,
}

impl CompileError {
    pub fn new(message: impl Into<String>, line: usize) -> Self {
        Self { message: message.into(), line }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[line {}] {}: {}", self.line, "Error".red().bold(), self.message)
    }
}

impl std::error::Error for CompileError {}

/// Formats a parse error the way the parser reports it while synchronising:
/// `[line N] Error at 'token': message`.
pub fn report_parse_error(line: usize, lexeme: &str, message: &str) {
    eprintln!("[line {}] {} at '{}': {}", line, "Error".red().bold(), lexeme, message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_display_carries_line() {
        colored::control::set_override(false);
        let err = CompileError::new("Expect ')' after expression.", 3);
        assert_eq!(err.to_string(), "[line 3] Error: Expect ')' after expression.");
    }
}
