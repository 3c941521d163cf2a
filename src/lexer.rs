// File: src/lexer.rs
//
// Scanner for the Aria language: source text to a flat token vector.
// One deliberate context sensitivity: a '-' directly after a comparison,
// assignment, opener or compound-assignment token that is followed by a
// digit (or '.' digit) is absorbed into a negative numeric literal;
// everywhere else '-' is the operator token.

use ahash::AHashMap;
use colored::Colorize;
use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Single-character tokens.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Colon,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,
    Percent,
    Ellipsis,
    PlusPlus,
    MinusMinus,

    // One- or two-character operators.
    NotEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    PlusEqual,
    MinusEqual,
    StarEqual,
    SlashEqual,
    PercentEqual,

    // Literals.
    Identifier,
    Str,
    Number,

    // Keywords.
    And,
    As,
    Break,
    Catch,
    Class,
    Continue,
    Else,
    False,
    For,
    Fun,
    If,
    In,
    Import,
    Nil,
    Not,
    Or,
    Print,
    Return,
    Super,
    This,
    Throw,
    True,
    Try,
    Var,
    While,

    Error,
    Eof,
}

static KEYWORDS: Lazy<AHashMap<&'static str, TokenKind>> = Lazy::new(|| {
    let mut map = AHashMap::new();
    map.insert("and", TokenKind::And);
    map.insert("as", TokenKind::As);
    map.insert("break", TokenKind::Break);
    map.insert("catch", TokenKind::Catch);
    map.insert("class", TokenKind::Class);
    map.insert("continue", TokenKind::Continue);
    map.insert("else", TokenKind::Else);
    map.insert("false", TokenKind::False);
    map.insert("for", TokenKind::For);
    map.insert("fun", TokenKind::Fun);
    map.insert("if", TokenKind::If);
    map.insert("in", TokenKind::In);
    map.insert("import", TokenKind::Import);
    map.insert("nil", TokenKind::Nil);
    map.insert("not", TokenKind::Not);
    map.insert("or", TokenKind::Or);
    map.insert("print", TokenKind::Print);
    map.insert("return", TokenKind::Return);
    map.insert("super", TokenKind::Super);
    map.insert("this", TokenKind::This);
    map.insert("throw", TokenKind::Throw);
    map.insert("true", TokenKind::True);
    map.insert("try", TokenKind::Try);
    map.insert("var", TokenKind::Var);
    map.insert("while", TokenKind::While);
    map
});

/// Token kinds after which a '-' may begin a negative numeric literal.
fn allows_negative_literal(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::EqualEqual
            | TokenKind::NotEqual
            | TokenKind::Less
            | TokenKind::LessEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Equal
            | TokenKind::LeftBrace
            | TokenKind::LeftParen
            | TokenKind::LeftBracket
            | TokenKind::PlusEqual
            | TokenKind::MinusEqual
            | TokenKind::StarEqual
            | TokenKind::SlashEqual
            | TokenKind::PercentEqual
    )
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>, line: usize) -> Self {
        Self { kind, text: text.into(), line }
    }
}

pub struct Scanner {
    source: Vec<char>,
    start: usize,
    current: usize,
    line: usize,
    had_error: bool,
}

fn is_alpha(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_digit(c: char) -> bool {
    c.is_ascii_digit()
}

impl Scanner {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.chars().collect(),
            start: 0,
            current: 0,
            line: 1,
            had_error: false,
        }
    }

    pub fn had_error(&self) -> bool {
        self.had_error
    }

    /// Scans the whole source. Stops at the first error token after
    /// reporting it, mirroring a hard lexical failure.
    pub fn scan(&mut self) -> Vec<Token> {
        let mut tokens: Vec<Token> = Vec::new();
        // Seed kind so the first token never sees the negative-literal rule.
        let mut previous = TokenKind::Str;
        loop {
            let token = self.scan_token(previous);
            previous = token.kind;
            let stop = matches!(token.kind, TokenKind::Eof | TokenKind::Error);
            if token.kind == TokenKind::Error {
                self.report(&token);
            }
            tokens.push(token);
            if stop {
                break;
            }
        }
        tokens
    }

    fn report(&mut self, token: &Token) {
        self.had_error = true;
        eprintln!("[line {}] {}: '{}'", token.line, "Error".red().bold(), token.text);
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> char {
        self.current += 1;
        self.source[self.current - 1]
    }

    fn peek(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.source[self.current]
        }
    }

    fn peek_next(&self) -> char {
        if self.current + 1 >= self.source.len() {
            '\0'
        } else {
            self.source[self.current + 1]
        }
    }

    fn matches(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.source[self.current] != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn make_token(&self, kind: TokenKind, text: impl Into<String>) -> Token {
        Token::new(kind, text, self.line)
    }

    fn lexeme(&self) -> String {
        self.source[self.start..self.current].iter().collect()
    }

    fn make_number(&mut self) -> Token {
        while is_digit(self.peek()) {
            self.advance();
        }
        if self.peek() == '.' && is_digit(self.peek_next()) {
            self.advance();
            while is_digit(self.peek()) {
                self.advance();
            }
        }
        self.make_token(TokenKind::Number, self.lexeme())
    }

    /// Digits after a leading '.' (or '-.').
    fn make_decimal(&mut self) -> Token {
        while is_digit(self.peek()) {
            self.advance();
        }
        self.make_token(TokenKind::Number, self.lexeme())
    }

    fn make_string(&mut self, quote: char) -> Token {
        let mut value = String::new();
        while self.peek() != quote && !self.is_at_end() {
            if self.peek() == '\n' {
                self.line += 1;
            }
            if self.peek() == '\\' {
                self.advance();
                match self.peek() {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    '\\' => value.push('\\'),
                    '"' => value.push('"'),
                    other => {
                        value.push('\\');
                        value.push(other);
                    }
                }
            } else {
                value.push(self.peek());
            }
            self.advance();
        }
        if self.is_at_end() {
            return self.make_token(TokenKind::Error, "Unterminated string.");
        }
        self.advance(); // closing quote
        self.make_token(TokenKind::Str, value)
    }

    fn make_identifier(&mut self) -> Token {
        while is_alpha(self.peek()) || is_digit(self.peek()) {
            self.advance();
        }
        let text = self.lexeme();
        let kind = KEYWORDS.get(text.as_str()).copied().unwrap_or(TokenKind::Identifier);
        self.make_token(kind, text)
    }

    /// Skips whitespace and comments; returns an error token for an
    /// unterminated block comment.
    fn skip_whitespace(&mut self) -> Option<Token> {
        loop {
            match self.peek() {
                ' ' | '\r' | '\t' => {
                    self.advance();
                }
                '\n' => {
                    self.line += 1;
                    self.advance();
                }
                '#' => {
                    while self.peek() != '\n' && !self.is_at_end() {
                        self.advance();
                    }
                }
                '/' => {
                    if self.peek_next() == '/' {
                        while self.peek() != '\n' && !self.is_at_end() {
                            self.advance();
                        }
                    } else if self.peek_next() == '*' {
                        self.advance();
                        self.advance();
                        loop {
                            if self.is_at_end() {
                                return Some(
                                    self.make_token(TokenKind::Error, "Unterminated comment."),
                                );
                            }
                            if self.peek() == '\n' {
                                self.line += 1;
                            }
                            if self.peek() == '*' && self.peek_next() == '/' {
                                self.advance();
                                self.advance();
                                break;
                            }
                            self.advance();
                        }
                    } else {
                        return None;
                    }
                }
                _ => return None,
            }
        }
    }

    fn scan_token(&mut self, previous: TokenKind) -> Token {
        if let Some(err) = self.skip_whitespace() {
            return err;
        }
        self.start = self.current;
        if self.is_at_end() {
            return self.make_token(TokenKind::Eof, "end");
        }

        let c = self.advance();
        if is_alpha(c) {
            return self.make_identifier();
        }
        if is_digit(c) {
            return self.make_number();
        }

        match c {
            '(' => self.make_token(TokenKind::LeftParen, "("),
            ')' => self.make_token(TokenKind::RightParen, ")"),
            '[' => self.make_token(TokenKind::LeftBracket, "["),
            ']' => self.make_token(TokenKind::RightBracket, "]"),
            '{' => self.make_token(TokenKind::LeftBrace, "{"),
            '}' => self.make_token(TokenKind::RightBrace, "}"),
            ';' => self.make_token(TokenKind::Semicolon, ";"),
            ',' => self.make_token(TokenKind::Comma, ","),
            ':' => self.make_token(TokenKind::Colon, ":"),
            '.' => {
                if is_digit(self.peek()) {
                    return self.make_decimal();
                }
                if self.peek() == '.' && self.peek_next() == '.' {
                    self.advance();
                    self.advance();
                    return self.make_token(TokenKind::Ellipsis, "...");
                }
                self.make_token(TokenKind::Dot, ".")
            }
            '-' => {
                if self.matches('-') {
                    return self.make_token(TokenKind::MinusMinus, "--");
                }
                if self.matches('=') {
                    return self.make_token(TokenKind::MinusEqual, "-=");
                }
                if allows_negative_literal(previous) {
                    if is_digit(self.peek()) {
                        return self.make_number();
                    }
                    if self.matches('.') {
                        return self.make_decimal();
                    }
                }
                self.make_token(TokenKind::Minus, "-")
            }
            '+' => {
                if self.matches('+') {
                    self.make_token(TokenKind::PlusPlus, "++")
                } else if self.matches('=') {
                    self.make_token(TokenKind::PlusEqual, "+=")
                } else {
                    self.make_token(TokenKind::Plus, "+")
                }
            }
            '/' => {
                if self.matches('=') {
                    self.make_token(TokenKind::SlashEqual, "/=")
                } else {
                    self.make_token(TokenKind::Slash, "/")
                }
            }
            '*' => {
                if self.matches('=') {
                    self.make_token(TokenKind::StarEqual, "*=")
                } else {
                    self.make_token(TokenKind::Star, "*")
                }
            }
            '%' => {
                if self.matches('=') {
                    self.make_token(TokenKind::PercentEqual, "%=")
                } else {
                    self.make_token(TokenKind::Percent, "%")
                }
            }
            '!' => {
                if self.matches('=') {
                    self.make_token(TokenKind::NotEqual, "!=")
                } else {
                    self.make_token(TokenKind::Not, "!")
                }
            }
            '=' => {
                if self.matches('=') {
                    self.make_token(TokenKind::EqualEqual, "==")
                } else {
                    self.make_token(TokenKind::Equal, "=")
                }
            }
            '<' => {
                if self.matches('=') {
                    self.make_token(TokenKind::LessEqual, "<=")
                } else {
                    self.make_token(TokenKind::Less, "<")
                }
            }
            '>' => {
                if self.matches('=') {
                    self.make_token(TokenKind::GreaterEqual, ">=")
                } else {
                    self.make_token(TokenKind::Greater, ">")
                }
            }
            '|' => {
                if self.matches('|') {
                    self.make_token(TokenKind::Or, "||")
                } else {
                    self.make_token(TokenKind::Error, "unexpected character: |")
                }
            }
            '&' => {
                if self.matches('&') {
                    self.make_token(TokenKind::And, "&&")
                } else {
                    self.make_token(TokenKind::Error, "unexpected character: &")
                }
            }
            '"' => self.make_string('"'),
            '\'' => self.make_string('\''),
            other => self.make_token(TokenKind::Error, format!("unexpected character: {}", other)),
        }
    }
}

/// Convenience wrapper: scan `source` into tokens (ending in Eof or Error).
pub fn tokenize(source: &str) -> Vec<Token> {
    Scanner::new(source).scan()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scans_operators_and_delimiters() {
        assert_eq!(
            kinds("( ) { } [ ] , . : ; ..."),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::LeftBracket,
                TokenKind::RightBracket,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Colon,
                TokenKind::Semicolon,
                TokenKind::Ellipsis,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn keywords_and_identifiers() {
        let tokens = tokenize("var foo = nil;");
        assert_eq!(tokens[0].kind, TokenKind::Var);
        assert_eq!(tokens[1].kind, TokenKind::Identifier);
        assert_eq!(tokens[1].text, "foo");
        assert_eq!(tokens[3].kind, TokenKind::Nil);
    }

    #[test]
    fn negative_literal_after_assignment() {
        let tokens = tokenize("var x = -5;");
        assert_eq!(tokens[3].kind, TokenKind::Number);
        assert_eq!(tokens[3].text, "-5");
    }

    #[test]
    fn minus_stays_binary_between_operands() {
        let tokens = tokenize("a -5");
        assert_eq!(tokens[1].kind, TokenKind::Minus);
        assert_eq!(tokens[2].kind, TokenKind::Number);
        assert_eq!(tokens[2].text, "5");
    }

    #[test]
    fn negative_decimal_after_opener() {
        let tokens = tokenize("(-.5)");
        assert_eq!(tokens[1].kind, TokenKind::Number);
        assert_eq!(tokens[1].text, "-.5");
    }

    #[test]
    fn string_escapes() {
        let tokens = tokenize(r#""a\nb\t\"c\"""#);
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].text, "a\nb\t\"c\"");
    }

    #[test]
    fn single_quoted_strings() {
        let tokens = tokenize("'hi'");
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].text, "hi");
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let tokens = tokenize("\"oops");
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Error);
        assert_eq!(tokens.last().unwrap().text, "Unterminated string.");
    }

    #[test]
    fn comments_are_skipped_and_lines_counted() {
        let tokens = tokenize("// one\n# two\n/* three\nfour */ x");
        assert_eq!(tokens[0].kind, TokenKind::Identifier);
        assert_eq!(tokens[0].line, 4);
    }

    #[test]
    fn unterminated_block_comment_is_an_error() {
        let tokens = tokenize("/* never ends");
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Error);
        assert_eq!(tokens.last().unwrap().text, "Unterminated comment.");
    }

    #[test]
    fn compound_operators() {
        assert_eq!(
            kinds("+= -= *= /= %= ++ -- == != <= >= && ||"),
            vec![
                TokenKind::PlusEqual,
                TokenKind::MinusEqual,
                TokenKind::StarEqual,
                TokenKind::SlashEqual,
                TokenKind::PercentEqual,
                TokenKind::PlusPlus,
                TokenKind::MinusMinus,
                TokenKind::EqualEqual,
                TokenKind::NotEqual,
                TokenKind::LessEqual,
                TokenKind::GreaterEqual,
                TokenKind::And,
                TokenKind::Or,
                TokenKind::Eof,
            ]
        );
    }
}
