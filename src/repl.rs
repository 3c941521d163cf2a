// File: src/repl.rs
//
// Interactive shell for Aria. Each submitted unit compiles against a
// persistent global table so definitions survive across lines; input is
// buffered until braces, brackets and parentheses balance, which makes
// multi-line functions and classes usable at the prompt.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::Vm;

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(), editor })
    }

    fn show_banner(&self) {
        println!("{}", format!("Aria {} - interactive shell", env!("CARGO_PKG_VERSION")).cyan());
        println!("{}", "Ctrl+D exits; unbalanced braces continue on the next line.".dimmed());
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();
        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() {
                "> ".green().to_string()
            } else {
                ". ".blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());
                    buffer.push_str(&line);
                    buffer.push('\n');
                    if is_input_complete(&buffer) {
                        if !buffer.trim().is_empty() {
                            self.vm.interpret_line(&buffer);
                        }
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".red(), err);
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Input is complete once every opener has its closer. Strings are
/// skipped so braces inside literals do not keep the prompt open.
fn is_input_complete(input: &str) -> bool {
    let mut depth: i32 = 0;
    let mut chars = input.chars().peekable();
    let mut in_string: Option<char> = None;
    while let Some(c) = chars.next() {
        match in_string {
            Some(quote) => {
                if c == '\\' {
                    chars.next();
                } else if c == quote {
                    in_string = None;
                }
            }
            None => match c {
                '"' | '\'' => in_string = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                _ => {}
            },
        }
    }
    depth <= 0 && in_string.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_input_is_complete() {
        assert!(is_input_complete("print 1;"));
        assert!(is_input_complete("fun f() { return 1; }"));
    }

    #[test]
    fn open_braces_keep_reading() {
        assert!(!is_input_complete("fun f() {"));
        assert!(!is_input_complete("var l = [1, 2,"));
    }

    #[test]
    fn braces_inside_strings_do_not_count() {
        assert!(is_input_complete("var s = \"{[(\";"));
        assert!(!is_input_complete("var s = \"unterminated"));
    }
}
