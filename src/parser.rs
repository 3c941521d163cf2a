// File: src/parser.rs
//
// Recursive-descent parser for the Aria language. Statements synchronise
// on errors (panic mode) so one mistake produces one message; expression
// errors yield Expr::Error placeholders and code generation is skipped
// whenever had_error is set.
//
// Assignment is parsed by first reading the left side as an lvalue form;
// if an assignment operator follows, the same token window is re-parsed
// as an rvalue for the right-hand side of the compound operator. This is
// also why `m[k()] += 1` evaluates `k()` twice.

use crate::ast::{Expr, Stmt};
use crate::errors::report_parse_error;
use crate::lexer::{Token, TokenKind};

const MAX_CALL_ARGS: usize = 255;
const MAX_LIST_INIT: usize = u16::MAX as usize;
const MAX_MAP_INIT_PAIRS: usize = 1024;

pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    had_error: bool,
    panic_mode: bool,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, current: 0, had_error: false, panic_mode: false }
    }

    pub fn has_error(&self) -> bool {
        self.had_error
    }

    // program → declaration*
    pub fn parse(&mut self) -> Vec<Stmt> {
        let mut declarations = Vec::new();
        while !self.check(TokenKind::Eof) && !self.check(TokenKind::Error) {
            if let Some(decl) = self.parse_declaration() {
                declarations.push(decl);
            }
        }
        declarations
    }

    // ---- token plumbing ----------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn kind_at(&self, offset: usize) -> TokenKind {
        self.tokens
            .get(self.current + offset)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    fn prev(&self) -> &Token {
        &self.tokens[self.current - 1]
    }

    fn advance(&mut self) {
        if self.current < self.tokens.len() - 1 {
            self.current += 1;
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            return true;
        }
        false
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> bool {
        if self.matches(kind) {
            return true;
        }
        self.error_at_current(message);
        false
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.peek().clone();
        self.error_at(&token, message);
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        self.had_error = true;
        self.panic_mode = true;
        report_parse_error(token.line, &token.text, message);
    }

    /// Skips to the next statement boundary after a parse error.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        if self.current > 0 && self.prev().kind == TokenKind::Semicolon {
            return;
        }
        loop {
            match self.peek_kind() {
                TokenKind::Eof | TokenKind::Error => return,
                TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Break
                | TokenKind::Continue
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ---- declarations ------------------------------------------------------

    // declaration → funDecl | classDecl | varDecl | statement
    fn parse_declaration(&mut self) -> Option<Stmt> {
        let declaration = if self.matches(TokenKind::Var) {
            self.parse_var_decl()
        } else if self.matches(TokenKind::Fun) {
            self.parse_fun_decl()
        } else if self.matches(TokenKind::Class) {
            self.parse_class_decl()
        } else {
            self.parse_statement()
        };
        if self.panic_mode {
            self.synchronize();
        }
        declaration
    }

    // funDecl → "fun" IDENTIFIER "(" parameters? ")" block
    fn parse_fun_decl(&mut self) -> Option<Stmt> {
        let line = self.peek().line;
        if !self.consume(TokenKind::Identifier, "Expect function name.") {
            return None;
        }
        let name = self.prev().text.clone();
        let mut params = Vec::new();
        let mut accepts_varargs = false;
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if params.len() >= MAX_CALL_ARGS {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                if self.matches(TokenKind::Ellipsis) {
                    accepts_varargs = true;
                    self.consume(TokenKind::Identifier, "Expect parameter name.");
                    params.push(self.prev().text.clone());
                    break;
                }
                if !self.consume(TokenKind::Identifier, "Expect parameter name.") {
                    break;
                }
                params.push(self.prev().text.clone());
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        let body = self.parse_block()?;
        let end_line = self.prev().line;
        Some(Stmt::FunDecl {
            name,
            params,
            body: Box::new(body),
            accepts_varargs,
            line,
            end_line,
        })
    }

    // classDecl → "class" IDENTIFIER ( ":" IDENTIFIER )? "{" method* "}"
    fn parse_class_decl(&mut self) -> Option<Stmt> {
        let line = self.prev().line;
        if !self.consume(TokenKind::Identifier, "Expect class name.") {
            return None;
        }
        let name = self.prev().text.clone();
        let mut super_name = None;
        if self.matches(TokenKind::Colon) {
            if !self.consume(TokenKind::Identifier, "Expect superclass name.") {
                return None;
            }
            let text = self.prev().text.clone();
            if text == name {
                let token = self.prev().clone();
                self.error_at(&token, "A class can't inherit from itself.");
            }
            super_name = Some(text);
        }

        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        let mut methods = Vec::new();
        while !self.check(TokenKind::RightBrace)
            && !self.check(TokenKind::Eof)
            && !self.check(TokenKind::Error)
        {
            if !self.check(TokenKind::Identifier) {
                self.error_at_current("Expect method name.");
                break;
            }
            if let Some(method) = self.parse_fun_decl() {
                methods.push(method);
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        let end_line = self.prev().line;
        Some(Stmt::ClassDecl { name, super_name, methods, line, end_line })
    }

    // varDecl → "var" IDENTIFIER ( "=" expression )?
    //           ( "," IDENTIFIER ( "=" expression )? )* ";"
    fn parse_var_decl(&mut self) -> Option<Stmt> {
        let line = self.prev().line;
        let mut names = Vec::new();
        let mut inits = Vec::new();
        loop {
            if !self.consume(TokenKind::Identifier, "Expect a variable name.") {
                return None;
            }
            names.push(self.prev().text.clone());
            let current_line = self.prev().line;
            if self.matches(TokenKind::Equal) {
                inits.push(self.parse_expression());
            } else {
                inits.push(Expr::Nil(current_line));
            }
            if self.matches(TokenKind::Comma) {
                continue;
            }
            if self.matches(TokenKind::Semicolon) {
                break;
            }
            self.error_at_current("Expected ',' or ';' here.");
            break;
        }
        Some(Stmt::VarDecl { names, inits, line })
    }

    // ---- statements --------------------------------------------------------

    fn parse_statement(&mut self) -> Option<Stmt> {
        if self.matches(TokenKind::Print) {
            return self.parse_print_stmt();
        }
        if self.matches(TokenKind::Import) {
            return self.parse_import_stmt();
        }
        if self.matches(TokenKind::If) {
            return self.parse_if_stmt();
        }
        if self.matches(TokenKind::While) {
            return self.parse_while_stmt();
        }
        if self.matches(TokenKind::For) {
            return self.parse_for_stmt();
        }
        if self.matches(TokenKind::Try) {
            return self.parse_try_catch_stmt();
        }
        if self.matches(TokenKind::Throw) {
            return self.parse_throw_stmt();
        }
        if self.matches(TokenKind::Break) {
            let line = self.prev().line;
            self.consume(TokenKind::Semicolon, "Expected ';' after 'break'.");
            return Some(Stmt::Break { line });
        }
        if self.matches(TokenKind::Continue) {
            let line = self.prev().line;
            self.consume(TokenKind::Semicolon, "Expected ';' after 'continue'.");
            return Some(Stmt::Continue { line });
        }
        if self.matches(TokenKind::Return) {
            return self.parse_return_stmt();
        }
        if self.matches(TokenKind::LeftBrace) {
            return self.parse_block();
        }
        if self.check(TokenKind::RightBrace) {
            self.error_at_current("unexpected token at the begin of statement");
            self.advance();
            return None;
        }
        self.parse_expr_stmt()
    }

    fn parse_print_stmt(&mut self) -> Option<Stmt> {
        let line = self.prev().line;
        let expr = self.parse_expression();
        self.consume(TokenKind::Semicolon, "Expected ';'.");
        Some(Stmt::Print { expr, line })
    }

    // importStmt → "import" IDENTIFIER ( "as" IDENTIFIER )? ";"
    //            | "import" STRING "as" IDENTIFIER ";"
    fn parse_import_stmt(&mut self) -> Option<Stmt> {
        let line = self.prev().line;
        if self.matches(TokenKind::Identifier) {
            let input = self.prev().text.clone();
            let mut alias = input.clone();
            if self.matches(TokenKind::As) {
                self.consume(TokenKind::Identifier, "Expect a new module name.");
                alias = self.prev().text.clone();
            }
            self.consume(TokenKind::Semicolon, "Expected ';' after module name.");
            return Some(Stmt::Import { input, alias, line });
        }
        if self.matches(TokenKind::Str) {
            let input = self.prev().text.clone();
            let mut alias = String::new();
            if self.matches(TokenKind::As) {
                self.consume(TokenKind::Identifier, "Expect a new module name.");
                alias = self.prev().text.clone();
            } else {
                self.error_at_current("Expected a module name for imported module.");
            }
            self.consume(TokenKind::Semicolon, "Expected ';' after module name.");
            return Some(Stmt::Import { input, alias, line });
        }
        self.error_at_current("Expected identifier or string as module name.");
        None
    }

    fn parse_if_stmt(&mut self) -> Option<Stmt> {
        let line = self.prev().line;
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        let condition = self.parse_expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let then_branch = Box::new(self.parse_statement()?);
        let else_branch = if self.matches(TokenKind::Else) {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Some(Stmt::If { condition, then_branch, else_branch, line })
    }

    fn parse_while_stmt(&mut self) -> Option<Stmt> {
        let line = self.prev().line;
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        let condition = self.parse_expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let body = Box::new(self.parse_statement()?);
        let end_line = self.prev().line;
        Some(Stmt::While { condition, body, line, end_line })
    }

    // forStmt → "for" "(" ( varDecl | exprStmt | ";" ) expression? ";"
    //           expression? ")" statement
    fn parse_for_stmt(&mut self) -> Option<Stmt> {
        let line = self.prev().line;
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.check(TokenKind::Var)
            && self.kind_at(1) == TokenKind::Identifier
            && self.kind_at(2) == TokenKind::In
        {
            return self.parse_for_in_stmt(line);
        }

        let init = if self.matches(TokenKind::Semicolon) {
            None
        } else if self.matches(TokenKind::Var) {
            Some(Box::new(self.parse_var_decl()?))
        } else {
            Some(Box::new(self.parse_expr_stmt()?))
        };

        let condition = if self.matches(TokenKind::Semicolon) {
            None
        } else {
            let cond = self.parse_expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            Some(cond)
        };

        let step = if self.matches(TokenKind::RightParen) {
            None
        } else {
            let step = self.parse_expression();
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            Some(step)
        };

        let body = Box::new(self.parse_statement()?);
        let end_line = self.prev().line;
        Some(Stmt::For { init, condition, step, body, line, end_line })
    }

    // forInStmt → "for" "(" "var" IDENTIFIER "in" expression ")" statement
    fn parse_for_in_stmt(&mut self, line: usize) -> Option<Stmt> {
        self.consume(TokenKind::Var, "Expect 'var' in for-in loop.");
        self.consume(TokenKind::Identifier, "Expect a variable name.");
        let var_name = self.prev().text.clone();
        self.consume(TokenKind::In, "Expect 'in' after loop variable.");
        let iterable = self.parse_expression();
        self.consume(TokenKind::RightParen, "Expect ')' after for expression.");
        let body = Box::new(self.parse_statement()?);
        let end_line = self.prev().line;
        Some(Stmt::ForIn { var_name, iterable, body, line, end_line })
    }

    // tryCatchStmt → "try" block "catch" "(" IDENTIFIER ")" block
    fn parse_try_catch_stmt(&mut self) -> Option<Stmt> {
        let line = self.prev().line;
        self.consume(TokenKind::LeftBrace, "Expect '{' after 'try'.");
        let try_body = Box::new(self.parse_block()?);
        self.consume(TokenKind::Catch, "Expect 'catch' after try body.");
        let catch_line = self.prev().line;
        self.consume(TokenKind::LeftParen, "Expect '(' after 'catch'.");
        self.consume(TokenKind::Identifier, "Expect a exception name after '('.");
        let exception_name = self.prev().text.clone();
        self.consume(TokenKind::RightParen, "Expect ')' after exception name.");
        self.consume(TokenKind::LeftBrace, "Expect '{' after ')'.");
        let catch_body = Box::new(self.parse_block()?);
        let end_line = self.prev().line;
        Some(Stmt::TryCatch { try_body, catch_body, exception_name, line, catch_line, end_line })
    }

    fn parse_throw_stmt(&mut self) -> Option<Stmt> {
        let line = self.prev().line;
        let expr = self.parse_expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        Some(Stmt::Throw { expr, line })
    }

    // returnStmt → "return" expression? ";"
    fn parse_return_stmt(&mut self) -> Option<Stmt> {
        let line = self.prev().line;
        if self.matches(TokenKind::Semicolon) {
            return Some(Stmt::Return { expr: None, line });
        }
        let expr = self.parse_expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
        Some(Stmt::Return { expr: Some(expr), line })
    }

    fn parse_expr_stmt(&mut self) -> Option<Stmt> {
        let line = self.peek().line;
        let expr = self.parse_expression();
        self.consume(TokenKind::Semicolon, "Expected ';'.");
        Some(Stmt::Expression { expr, line })
    }

    // block → "{" declaration* "}"
    fn parse_block(&mut self) -> Option<Stmt> {
        let line = self.prev().line;
        let mut declarations = Vec::new();
        while !self.check(TokenKind::RightBrace)
            && !self.check(TokenKind::Eof)
            && !self.check(TokenKind::Error)
        {
            if let Some(decl) = self.parse_declaration() {
                declarations.push(decl);
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
        let end_line = self.prev().line;
        Some(Stmt::Block { decls: declarations, line, end_line })
    }

    // ---- expressions -------------------------------------------------------

    pub fn parse_expression(&mut self) -> Expr {
        self.parse_assignment()
    }

    fn is_store_form(expr: &Option<Expr>) -> bool {
        matches!(
            expr,
            Some(Expr::StoreVar(..))
                | Some(Expr::StoreProperty { .. })
                | Some(Expr::StoreSubscr { .. })
        )
    }

    // assignment → lvalue ( "=" | "+=" | "-=" | "*=" | "/=" | "%=" | "++" | "--" )
    //              assignment | logic_or
    fn parse_assignment(&mut self) -> Expr {
        let backup = self.current;
        let lvalue = self.parse_lvalue();

        let compound = [
            TokenKind::PlusEqual,
            TokenKind::MinusEqual,
            TokenKind::StarEqual,
            TokenKind::SlashEqual,
            TokenKind::PercentEqual,
            TokenKind::PlusPlus,
            TokenKind::MinusMinus,
        ];
        if compound.iter().any(|&k| self.matches(k)) {
            let op = self.prev().kind;
            let line = self.prev().line;
            if !Self::is_store_form(&lvalue) {
                let token = self.prev().clone();
                self.error_at(&token, "Invalid assignment target");
            }

            // Re-parse the same token window as the load half of the
            // compound expression.
            let after_op = self.current;
            self.current = backup;
            let left = self.parse_rvalue();
            self.current = after_op;
            let right = if matches!(op, TokenKind::PlusPlus | TokenKind::MinusMinus) {
                Expr::Number(1.0, line)
            } else {
                self.parse_assignment()
            };
            let value = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
                line,
            };
            return Expr::Assign {
                target: Box::new(lvalue.unwrap_or(Expr::Error(line))),
                value: Box::new(value),
                line,
            };
        }

        if self.matches(TokenKind::Equal) {
            let line = self.prev().line;
            if !Self::is_store_form(&lvalue) {
                let token = self.prev().clone();
                self.error_at(&token, "Invalid assignment target");
            }
            let value = self.parse_assignment();
            return Expr::Assign {
                target: Box::new(lvalue.unwrap_or(Expr::Error(line))),
                value: Box::new(value),
                line,
            };
        }

        self.current = backup;
        self.parse_logic_or()
    }

    // lvalue → IDENTIFIER | lproperty | lthis
    fn parse_lvalue(&mut self) -> Option<Expr> {
        if self.check(TokenKind::Identifier) {
            let token = self.peek().clone();
            self.advance();
            if self.check(TokenKind::Dot)
                || self.check(TokenKind::LeftBracket)
                || self.check(TokenKind::LeftParen)
            {
                let instance = Expr::LoadVar(token.text, token.line);
                return Some(self.parse_lproperty(instance));
            }
            return Some(Expr::StoreVar(token.text, token.line));
        }
        if self.matches(TokenKind::This) {
            return Some(self.parse_lthis());
        }
        None
    }

    // lproperty → ( "." invokeMethod | "." IDENTIFIER | "[" expression "]" | args )+
    fn parse_lproperty(&mut self, instance: Expr) -> Expr {
        if self.matches(TokenKind::Dot) {
            self.consume(TokenKind::Identifier, "Expect a property name after '.'.");
            let name = self.prev().text.clone();
            let line = self.prev().line;

            if self.matches(TokenKind::LeftParen) {
                let invoked = self.parse_invoke_method(instance, name);
                if self.check(TokenKind::Dot)
                    || self.check(TokenKind::LeftBracket)
                    || self.check(TokenKind::LeftParen)
                {
                    return self.parse_lproperty(invoked);
                }
                // A bare call chain is not assignable.
                return Expr::Error(self.prev().line);
            }

            if self.check(TokenKind::Dot)
                || self.check(TokenKind::LeftBracket)
                || self.check(TokenKind::LeftParen)
            {
                let load = Expr::LoadProperty { object: Box::new(instance), name, line };
                return self.parse_lproperty(load);
            }
            return Expr::StoreProperty { object: Box::new(instance), name, line };
        }

        if self.matches(TokenKind::LeftBracket) {
            let line = self.prev().line;
            let index = self.parse_expression();
            self.consume(TokenKind::RightBracket, "Expect ']' after index.");
            if self.check(TokenKind::Dot)
                || self.check(TokenKind::LeftBracket)
                || self.check(TokenKind::LeftParen)
            {
                let load = Expr::LoadSubscr {
                    object: Box::new(instance),
                    index: Box::new(index),
                    line,
                };
                return self.parse_lproperty(load);
            }
            return Expr::StoreSubscr {
                object: Box::new(instance),
                index: Box::new(index),
                line,
            };
        }

        if self.matches(TokenKind::LeftParen) {
            let call = self.parse_call(instance);
            if self.check(TokenKind::Dot) || self.check(TokenKind::LeftBracket) {
                return self.parse_lproperty(call);
            }
            return Expr::Error(self.prev().line);
        }

        self.error_at_current("error in parsing lproperty");
        Expr::Error(self.peek().line)
    }

    // lthis → "this" "." IDENTIFIER | "this" "." lproperty
    fn parse_lthis(&mut self) -> Expr {
        let load_this = Expr::LoadVar("this".to_string(), self.prev().line);
        if !self.matches(TokenKind::Dot) {
            return Expr::Error(self.peek().line);
        }
        if !self.consume(TokenKind::Identifier, "Expect a property name after '.'.") {
            return Expr::Error(self.peek().line);
        }
        let name = self.prev().text.clone();
        let line = self.prev().line;
        if self.check(TokenKind::Dot)
            || self.check(TokenKind::LeftBracket)
            || self.check(TokenKind::LeftParen)
        {
            let load = Expr::LoadProperty { object: Box::new(load_this), name, line };
            return self.parse_lproperty(load);
        }
        Expr::StoreProperty { object: Box::new(load_this), name, line }
    }

    // logic_or → logic_and ( ( "or" | "||" ) logic_and )*
    fn parse_logic_or(&mut self) -> Expr {
        let mut left = self.parse_logic_and();
        while self.check(TokenKind::Or) {
            let line = self.peek().line;
            self.advance();
            let right = self.parse_logic_and();
            left = Expr::Binary {
                left: Box::new(left),
                op: TokenKind::Or,
                right: Box::new(right),
                line,
            };
        }
        left
    }

    // logic_and → equality ( ( "and" | "&&" ) equality )*
    fn parse_logic_and(&mut self) -> Expr {
        let mut left = self.parse_equality();
        while self.check(TokenKind::And) {
            let line = self.peek().line;
            self.advance();
            let right = self.parse_equality();
            left = Expr::Binary {
                left: Box::new(left),
                op: TokenKind::And,
                right: Box::new(right),
                line,
            };
        }
        left
    }

    // equality → comparison ( ( "!=" | "==" ) comparison )*
    fn parse_equality(&mut self) -> Expr {
        let mut left = self.parse_comparison();
        while matches!(self.peek_kind(), TokenKind::NotEqual | TokenKind::EqualEqual) {
            let op = self.peek_kind();
            let line = self.peek().line;
            self.advance();
            let right = self.parse_comparison();
            left = Expr::Binary { left: Box::new(left), op, right: Box::new(right), line };
        }
        left
    }

    // comparison → term ( ( ">" | ">=" | "<" | "<=" ) term )*
    fn parse_comparison(&mut self) -> Expr {
        let mut left = self.parse_term();
        while matches!(
            self.peek_kind(),
            TokenKind::Greater | TokenKind::GreaterEqual | TokenKind::Less | TokenKind::LessEqual
        ) {
            let op = self.peek_kind();
            let line = self.peek().line;
            self.advance();
            let right = self.parse_term();
            left = Expr::Binary { left: Box::new(left), op, right: Box::new(right), line };
        }
        left
    }

    // term → factor ( ( "-" | "+" ) factor )*
    fn parse_term(&mut self) -> Expr {
        let mut left = self.parse_factor();
        while matches!(self.peek_kind(), TokenKind::Plus | TokenKind::Minus) {
            let op = self.peek_kind();
            let line = self.peek().line;
            self.advance();
            let right = self.parse_factor();
            left = Expr::Binary { left: Box::new(left), op, right: Box::new(right), line };
        }
        left
    }

    // factor → unary ( ( "/" | "*" | "%" ) unary )*
    fn parse_factor(&mut self) -> Expr {
        let mut left = self.parse_unary();
        while matches!(
            self.peek_kind(),
            TokenKind::Star | TokenKind::Slash | TokenKind::Percent
        ) {
            let op = self.peek_kind();
            let line = self.peek().line;
            self.advance();
            let right = self.parse_unary();
            left = Expr::Binary { left: Box::new(left), op, right: Box::new(right), line };
        }
        left
    }

    // unary → ( "-" | "!" | "not" ) unary | value
    fn parse_unary(&mut self) -> Expr {
        let kind = self.peek_kind();
        let line = self.peek().line;
        if matches!(kind, TokenKind::Not | TokenKind::Minus) {
            self.advance();
            let operand = self.parse_unary();
            return Expr::Unary { op: kind, operand: Box::new(operand), line };
        }
        self.parse_value()
    }

    // value → rvalue | primary
    fn parse_value(&mut self) -> Expr {
        if self.check(TokenKind::Identifier)
            || self.check(TokenKind::This)
            || self.check(TokenKind::Super)
        {
            return self.parse_rvalue();
        }
        self.parse_primary()
    }

    // rvalue → IDENTIFIER | rproperty | rthis | super
    fn parse_rvalue(&mut self) -> Expr {
        if self.matches(TokenKind::This) {
            return self.parse_rthis();
        }
        if self.matches(TokenKind::Super) {
            return self.parse_super();
        }
        let token = self.peek().clone();
        self.advance();
        let load = Expr::LoadVar(token.text, token.line);
        if self.check(TokenKind::Dot)
            || self.check(TokenKind::LeftBracket)
            || self.check(TokenKind::LeftParen)
        {
            return self.parse_rproperty(load);
        }
        load
    }

    // args → ( "(" ( expression ("," expression)* )? ")" )+
    fn parse_call(&mut self, callee: Expr) -> Expr {
        let mut args = Vec::new();
        loop {
            if self.check(TokenKind::RightParen) {
                break;
            }
            if args.len() >= MAX_CALL_ARGS {
                self.error_at_current("Can't have more than 255 arguments.");
            }
            args.push(self.parse_expression());
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        let call = Expr::Call { callee: Box::new(callee), args, line: self.prev().line };
        if self.matches(TokenKind::LeftParen) {
            return self.parse_call(call);
        }
        call
    }

    // rproperty → ( "." callMethod | "." IDENTIFIER | "[" expression "]" | args )+
    fn parse_rproperty(&mut self, instance: Expr) -> Expr {
        if self.matches(TokenKind::Dot) {
            self.consume(TokenKind::Identifier, "Expect a property name after '.'.");
            let name = self.prev().text.clone();
            let line = self.prev().line;

            let load = if self.matches(TokenKind::LeftParen) {
                self.parse_invoke_method(instance, name)
            } else {
                Expr::LoadProperty { object: Box::new(instance), name, line }
            };

            if self.check(TokenKind::Dot)
                || self.check(TokenKind::LeftBracket)
                || self.check(TokenKind::LeftParen)
            {
                return self.parse_rproperty(load);
            }
            return load;
        }

        if self.matches(TokenKind::LeftBracket) {
            let line = self.prev().line;
            let index = self.parse_expression();
            self.consume(TokenKind::RightBracket, "Expect ']' after index.");
            let load = Expr::LoadSubscr {
                object: Box::new(instance),
                index: Box::new(index),
                line,
            };
            if self.check(TokenKind::Dot)
                || self.check(TokenKind::LeftBracket)
                || self.check(TokenKind::LeftParen)
            {
                return self.parse_rproperty(load);
            }
            return load;
        }

        if self.matches(TokenKind::LeftParen) {
            let call = self.parse_call(instance);
            if self.check(TokenKind::Dot)
                || self.check(TokenKind::LeftBracket)
                || self.check(TokenKind::LeftParen)
            {
                return self.parse_rproperty(call);
            }
            return call;
        }

        self.error_at_current("error in parsing rproperty");
        Expr::Error(self.peek().line)
    }

    // callMethod → IDENTIFIER args+
    fn parse_invoke_method(&mut self, instance: Expr, method: String) -> Expr {
        let line = self.peek().line;
        let mut args = Vec::new();
        loop {
            if self.check(TokenKind::RightParen) {
                break;
            }
            if args.len() >= MAX_CALL_ARGS {
                self.error_at_current("Can't have more than 255 arguments.");
            }
            args.push(self.parse_expression());
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        let invoke = Expr::Invoke { receiver: Box::new(instance), method, args, line };
        if self.matches(TokenKind::LeftParen) {
            return self.parse_call(invoke);
        }
        invoke
    }

    // rthis → "this" ( "." IDENTIFIER | "." rproperty | "." call )?
    fn parse_rthis(&mut self) -> Expr {
        let load_this = Expr::LoadVar("this".to_string(), self.prev().line);
        if !self.matches(TokenKind::Dot) {
            return load_this;
        }
        self.consume(TokenKind::Identifier, "Expect a property name after '.'.");
        let name = self.prev().text.clone();
        let line = self.prev().line;
        if self.matches(TokenKind::LeftParen) {
            return self.parse_invoke_method(load_this, name);
        }
        let load = Expr::LoadProperty { object: Box::new(load_this), name, line };
        if self.check(TokenKind::Dot) || self.check(TokenKind::LeftBracket) {
            return self.parse_rproperty(load);
        }
        load
    }

    // super → "super" "." IDENTIFIER args?
    fn parse_super(&mut self) -> Expr {
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name after '.'.");
        let method = self.prev().text.clone();
        let line = self.prev().line;
        let load = Expr::LoadSuperMethod { method, line };
        if self.matches(TokenKind::LeftParen) {
            return self.parse_call(load);
        }
        load
    }

    // primary → NUMBER | "nil" | "false" | "true" | parenExpr | visitable
    fn parse_primary(&mut self) -> Expr {
        let line = self.peek().line;
        match self.peek_kind() {
            TokenKind::Number => {
                let value = self.peek().text.parse::<f64>().unwrap_or(0.0);
                self.advance();
                Expr::Number(value, line)
            }
            TokenKind::True => {
                self.advance();
                Expr::True(line)
            }
            TokenKind::False => {
                self.advance();
                Expr::False(line)
            }
            TokenKind::Str | TokenKind::LeftBracket | TokenKind::LeftBrace => {
                self.parse_visitable()
            }
            TokenKind::LeftParen => {
                self.advance();
                let expr = self.parse_expression();
                self.consume(TokenKind::RightParen, "Expect ')' after expression.");
                expr
            }
            TokenKind::Nil => {
                self.advance();
                Expr::Nil(line)
            }
            _ => Expr::Nil(line),
        }
    }

    // listExpr → "[" ( expression ("," expression)* )? "]"
    fn parse_list(&mut self) -> Expr {
        let line = self.peek().line;
        let mut elements = Vec::new();
        loop {
            if self.check(TokenKind::RightBracket) {
                break;
            }
            if elements.len() >= MAX_LIST_INIT {
                self.error_at_current(
                    "Can't have more than 65535 elements in a list initialization.",
                );
            }
            elements.push(self.parse_expression());
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after elements.");
        Expr::List(elements, line)
    }

    // mapExpr → "{" ( expression ":" expression ("," ...)* )? "}"
    fn parse_map(&mut self) -> Expr {
        let line = self.peek().line;
        let mut pairs = Vec::new();
        loop {
            if self.check(TokenKind::RightBrace) {
                break;
            }
            if pairs.len() / 2 >= MAX_MAP_INIT_PAIRS {
                self.error_at_current(
                    "Can't have more than 1024 key-value pairs in a map initialization.",
                );
            }
            pairs.push(self.parse_expression());
            self.consume(TokenKind::Colon, "Expect ':' after key.");
            pairs.push(self.parse_expression());
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after key-value pairs.");
        Expr::Map(pairs, line)
    }

    // visitable → ( STRING | listExpr | mapExpr )
    //             ( "." callMethod | "." IDENTIFIER | "[" expression "]" )*
    fn parse_visitable(&mut self) -> Expr {
        let instance = if self.matches(TokenKind::LeftBrace) {
            self.parse_map()
        } else if self.matches(TokenKind::LeftBracket) {
            self.parse_list()
        } else if self.matches(TokenKind::Str) {
            Expr::Str(self.prev().text.clone(), self.prev().line)
        } else {
            self.error_at_current("error in parsing visitable");
            return Expr::Error(self.peek().line);
        };

        if self.matches(TokenKind::Dot) {
            self.consume(TokenKind::Identifier, "Expect a property name after '.'.");
            let name = self.prev().text.clone();
            let line = self.prev().line;
            let load = if self.matches(TokenKind::LeftParen) {
                self.parse_invoke_method(instance, name)
            } else {
                Expr::LoadProperty { object: Box::new(instance), name, line }
            };
            if self.check(TokenKind::Dot) || self.check(TokenKind::LeftBracket) {
                return self.parse_rproperty(load);
            }
            return load;
        }

        if self.matches(TokenKind::LeftBracket) {
            let line = self.prev().line;
            let index = self.parse_expression();
            self.consume(TokenKind::RightBracket, "Expect ']' after index.");
            let load = Expr::LoadSubscr {
                object: Box::new(instance),
                index: Box::new(index),
                line,
            };
            if self.check(TokenKind::Dot) || self.check(TokenKind::LeftBracket) {
                return self.parse_rproperty(load);
            }
            return load;
        }

        instance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse_ok(source: &str) -> Vec<Stmt> {
        let mut parser = Parser::new(tokenize(source));
        let program = parser.parse();
        assert!(!parser.has_error(), "unexpected parse error for: {}", source);
        program
    }

    fn parse_err(source: &str) -> bool {
        let mut parser = Parser::new(tokenize(source));
        parser.parse();
        parser.has_error()
    }

    #[test]
    fn parses_var_declarations_with_lists() {
        let program = parse_ok("var a = 1, b, c = \"x\";");
        match &program[0] {
            Stmt::VarDecl { names, inits, .. } => {
                assert_eq!(names, &["a", "b", "c"]);
                assert!(matches!(inits[1], Expr::Nil(_)));
            }
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn precedence_binds_multiplication_tighter() {
        let program = parse_ok("1 + 2 * 3;");
        match &program[0] {
            Stmt::Expression { expr: Expr::Binary { op, right, .. }, .. } => {
                assert_eq!(*op, TokenKind::Plus);
                assert!(matches!(**right, Expr::Binary { op: TokenKind::Star, .. }));
            }
            other => panic!("expected binary expr, got {:?}", other),
        }
    }

    #[test]
    fn assignment_produces_store_form() {
        let program = parse_ok("x = 1;");
        match &program[0] {
            Stmt::Expression { expr: Expr::Assign { target, .. }, .. } => {
                assert!(matches!(**target, Expr::StoreVar(..)));
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn compound_assignment_reparses_left_side() {
        let program = parse_ok("a.b += 2;");
        match &program[0] {
            Stmt::Expression { expr: Expr::Assign { target, value, .. }, .. } => {
                assert!(matches!(**target, Expr::StoreProperty { .. }));
                match &**value {
                    Expr::Binary { left, op, .. } => {
                        assert_eq!(*op, TokenKind::PlusEqual);
                        assert!(matches!(**left, Expr::LoadProperty { .. }));
                    }
                    other => panic!("expected binary rhs, got {:?}", other),
                }
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn increment_desugars_to_plus_one() {
        let program = parse_ok("i++;");
        match &program[0] {
            Stmt::Expression { expr: Expr::Assign { value, .. }, .. } => match &**value {
                Expr::Binary { op, right, .. } => {
                    assert_eq!(*op, TokenKind::PlusPlus);
                    assert!(matches!(**right, Expr::Number(n, _) if n == 1.0));
                }
                other => panic!("expected binary rhs, got {:?}", other),
            },
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn for_in_consumes_prefix() {
        let program = parse_ok("for (var x in [1, 2]) print x;");
        assert!(matches!(&program[0], Stmt::ForIn { var_name, .. } if var_name == "x"));
    }

    #[test]
    fn method_calls_become_invoke_nodes() {
        let program = parse_ok("list.append(1);");
        match &program[0] {
            Stmt::Expression { expr: Expr::Invoke { method, args, .. }, .. } => {
                assert_eq!(method, "append");
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected invoke, got {:?}", other),
        }
    }

    #[test]
    fn class_with_superclass_and_methods() {
        let program = parse_ok("class B : A { init(n) { this.n = n; } go() { return 1; } }");
        match &program[0] {
            Stmt::ClassDecl { name, super_name, methods, .. } => {
                assert_eq!(name, "B");
                assert_eq!(super_name.as_deref(), Some("A"));
                assert_eq!(methods.len(), 2);
            }
            other => panic!("expected class decl, got {:?}", other),
        }
    }

    #[test]
    fn invalid_assignment_target_is_reported() {
        assert!(parse_err("a + b = 1;"));
    }

    #[test]
    fn self_inheritance_is_rejected() {
        assert!(parse_err("class A : A {}"));
    }

    #[test]
    fn string_import_requires_alias() {
        assert!(parse_err("import \"lib/util.aria\";"));
        let program = parse_ok("import \"lib/util.aria\" as util;");
        assert!(matches!(&program[0], Stmt::Import { alias, .. } if alias == "util"));
    }

    #[test]
    fn error_recovery_continues_at_statement_boundary() {
        let mut parser = Parser::new(tokenize("var = 1; print 2;"));
        let program = parser.parse();
        assert!(parser.has_error());
        // The second statement still parses after synchronisation.
        assert!(program.iter().any(|s| matches!(s, Stmt::Print { .. })));
    }
}
