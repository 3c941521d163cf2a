// File: src/compiler.rs
//
// Single-pass bytecode compiler: walks the AST once and emits straight
// into the chunk of the function under construction. Each nested function
// gets a FunctionContext tracking locals, upvalue descriptors, scope depth
// and the break/continue patch lists of enclosing loops. No IR exists
// between the AST and the bytecode.

use std::cell::RefCell;
use std::rc::Rc;

use crate::ast::{Expr, Stmt};
use crate::bytecode::{Chunk, OpCode};
use crate::errors::CompileError;
use crate::heap::{Heap, ObjRef};
use crate::lexer::{Scanner, TokenKind};
use crate::object::{FunctionKind, FunctionObj, ObjPayload};
use crate::parser::Parser;
use crate::table::ValueTable;
use crate::value::Value;

const MAX_LOCALS: usize = u16::MAX as usize;
const MAX_UPVALUES: usize = u16::MAX as usize;

#[derive(Debug)]
struct Local {
    name: String,
    /// -1 marks a declared-but-uninitialised local.
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy)]
struct UpvalueDesc {
    index: u16,
    is_local: bool,
}

struct ClassContext {
    has_super_class: bool,
}

/// Result of resolving a name against the locals of one function.
enum LocalSlot {
    NotFound,
    /// Read of a local inside its own initialiser.
    Uninitialized,
    Slot(usize),
}

/// Per-function compilation state. The enclosing relationship is the
/// position in the compiler's context stack.
struct FunctionContext {
    function: ObjRef,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    loop_depths: Vec<i32>,
    loop_breaks: Vec<Vec<usize>>,
    loop_continues: Vec<Vec<usize>>,
}

impl FunctionContext {
    fn new(function: ObjRef, kind: FunctionKind) -> Self {
        // Slot 0 belongs to the callee; methods expose it as `this`.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::InitMethod => "this",
            _ => "",
        };
        Self {
            function,
            kind,
            locals: vec![Local { name: slot_zero.to_string(), depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loop_depths: Vec::new(),
            loop_breaks: Vec::new(),
            loop_continues: Vec::new(),
        }
    }

    fn add_local(&mut self, name: String, line: usize) -> Result<(), CompileError> {
        if self.locals.len() == MAX_LOCALS {
            return Err(CompileError::new(
                "Too many local variables have been declared within the current scope",
                line,
            ));
        }
        self.locals.push(Local { name, depth: -1, is_captured: false });
        Ok(())
    }

    fn mark_initialized(&mut self) {
        if self.scope_depth == 0 {
            return;
        }
        if let Some(local) = self.locals.last_mut() {
            local.depth = self.scope_depth;
        }
    }

    fn find_variable_in_same_depth(&self, name: &str) -> bool {
        for local in self.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.scope_depth {
                return false;
            }
            if local.name == name {
                return true;
            }
        }
        false
    }

    fn find_local(&self, name: &str) -> LocalSlot {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return LocalSlot::Uninitialized;
                }
                return LocalSlot::Slot(i);
            }
        }
        LocalSlot::NotFound
    }

    /// Locals above the innermost loop's depth; break/continue pop these.
    fn locals_above_loop(&self) -> usize {
        let loop_depth = *self.loop_depths.last().expect("not inside a loop");
        self.locals.iter().rev().take_while(|l| l.depth > loop_depth).count()
    }
}

/// Scope-exit actions, pops merged into runs.
enum ExitOp {
    Pops(usize),
    Close,
}

pub struct Compiler<'h> {
    heap: &'h mut Heap,
    contexts: Vec<FunctionContext>,
    class_contexts: Vec<ClassContext>,
}

/// Compiles a standalone script. None on any scan/parse/compile error
/// (which has already been reported to stderr).
pub fn compile(heap: &mut Heap, source: &str) -> Option<ObjRef> {
    compile_with(heap, source, Rc::new(RefCell::new(ValueTable::new())), None)
}

/// Compiles an imported module; the function is named after the module
/// and owns a fresh global table that doubles as the module namespace.
pub fn compile_module(heap: &mut Heap, source: &str, module_name: &str) -> Option<ObjRef> {
    compile_with(
        heap,
        source,
        Rc::new(RefCell::new(ValueTable::new())),
        Some(module_name),
    )
}

/// Compiles one REPL line against the session's persistent global table.
pub fn compile_repl(
    heap: &mut Heap,
    source: &str,
    globals: Rc<RefCell<ValueTable>>,
) -> Option<ObjRef> {
    compile_with(heap, source, globals, None)
}

fn compile_with(
    heap: &mut Heap,
    source: &str,
    globals: Rc<RefCell<ValueTable>>,
    module_name: Option<&str>,
) -> Option<ObjRef> {
    let mut scanner = Scanner::new(source);
    let tokens = scanner.scan();
    if scanner.had_error() {
        return None;
    }

    let mut parser = Parser::new(tokens);
    let program = parser.parse();
    if parser.has_error() {
        return None;
    }

    let mut compiler = Compiler { heap, contexts: Vec::new(), class_contexts: Vec::new() };
    let result = compiler.compile_program(&program, globals, module_name);
    match result {
        Ok(function) => {
            if std::env::var("ARIA_DUMP_CODE").is_ok() {
                let name = module_name.unwrap_or("script").to_string();
                crate::disassembler::disassemble(compiler.heap, function, &name);
            }
            Some(function)
        }
        Err(e) => {
            eprintln!("{}", e);
            None
        }
    }
}

impl<'h> Compiler<'h> {
    fn compile_program(
        &mut self,
        program: &[Stmt],
        globals: Rc<RefCell<ValueTable>>,
        module_name: Option<&str>,
    ) -> Result<ObjRef, CompileError> {
        let name = match module_name {
            Some(n) => Some(self.heap.intern(n)),
            None => None,
        };
        let function = self.heap.alloc(ObjPayload::Function(FunctionObj {
            kind: FunctionKind::Script,
            name,
            arity: 0,
            accepts_varargs: false,
            chunk: Chunk::new(globals),
            upvalues: Vec::new(),
            upvalue_count: 0,
        }));
        self.heap.cache_push(Value::Obj(function));
        self.contexts.push(FunctionContext::new(function, FunctionKind::Script));

        let mut last_line = program.first().map(|s| s.line()).unwrap_or(1);
        let body = (|| -> Result<(), CompileError> {
            for stmt in program {
                self.gen_stmt(stmt)?;
                last_line = stmt.line();
            }
            Ok(())
        })();
        // Unwind compiler state even on error so the cache stack balances.
        let result = body.map(|_| {
            self.chunk_mut().write_op(OpCode::LoadNil, last_line);
            self.chunk_mut().write_op(OpCode::Return, last_line);
            function
        });
        self.contexts.pop();
        self.heap.cache_pop(1);
        result
    }

    // ---- context plumbing --------------------------------------------------

    fn ctx(&self) -> &FunctionContext {
        self.contexts.last().expect("no active function context")
    }

    fn ctx_mut(&mut self) -> &mut FunctionContext {
        self.contexts.last_mut().expect("no active function context")
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        let function = self.ctx().function;
        match self.heap.payload_mut(function) {
            ObjPayload::Function(f) => &mut f.chunk,
            _ => unreachable!("context function is not a function"),
        }
    }

    fn current_globals(&self) -> Rc<RefCell<ValueTable>> {
        let function = self.ctx().function;
        match self.heap.payload(function) {
            ObjPayload::Function(f) => f.chunk.globals.clone(),
            _ => unreachable!(),
        }
    }

    /// Interns `name` and writes it as a u16 constant operand.
    fn write_name_constant(&mut self, name: &str, line: usize) -> Result<(), CompileError> {
        let name_ref = self.heap.intern(name);
        self.chunk_mut().write_constant(Value::Obj(name_ref), line)?;
        Ok(())
    }

    fn begin_scope(&mut self) {
        self.ctx_mut().scope_depth += 1;
    }

    /// Pops one lexical scope, emitting POPs for plain locals and
    /// CLOSE_UPVALUE for captured ones, innermost first.
    fn end_scope(&mut self, line: usize) {
        let ctx = self.ctx_mut();
        ctx.scope_depth -= 1;
        let depth = ctx.scope_depth;
        let mut ops: Vec<ExitOp> = Vec::new();
        while let Some(local) = ctx.locals.last() {
            if local.depth <= depth {
                break;
            }
            if local.is_captured {
                ops.push(ExitOp::Close);
            } else {
                match ops.last_mut() {
                    Some(ExitOp::Pops(n)) => *n += 1,
                    _ => ops.push(ExitOp::Pops(1)),
                }
            }
            ctx.locals.pop();
        }
        for op in ops {
            match op {
                ExitOp::Pops(n) => self.chunk_mut().gen_pops(n, line),
                ExitOp::Close => {
                    self.chunk_mut().write_op(OpCode::CloseUpvalue, line);
                }
            }
        }
    }

    // ---- variable resolution -----------------------------------------------

    fn add_upvalue(
        &mut self,
        ctx: usize,
        index: u16,
        is_local: bool,
        line: usize,
    ) -> Result<u16, CompileError> {
        for (i, existing) in self.contexts[ctx].upvalues.iter().enumerate() {
            if existing.index == index && existing.is_local == is_local {
                return Ok(i as u16);
            }
        }
        if self.contexts[ctx].upvalues.len() == MAX_UPVALUES {
            return Err(CompileError::new("Too many closure variables in function.", line));
        }
        self.contexts[ctx].upvalues.push(UpvalueDesc { index, is_local });
        Ok((self.contexts[ctx].upvalues.len() - 1) as u16)
    }

    /// Resolves `name` as an upvalue of context `ctx`, promoting captured
    /// locals along the way. None means the name is global.
    fn resolve_upvalue(
        &mut self,
        ctx: usize,
        name: &str,
        line: usize,
    ) -> Result<Option<u16>, CompileError> {
        if ctx == 0 {
            return Ok(None);
        }
        let parent = ctx - 1;
        if let LocalSlot::Slot(slot) = self.contexts[parent].find_local(name) {
            self.contexts[parent].locals[slot].is_captured = true;
            return self.add_upvalue(ctx, slot as u16, true, line).map(Some);
        }
        if let Some(upvalue) = self.resolve_upvalue(parent, name, line)? {
            return self.add_upvalue(ctx, upvalue, false, line).map(Some);
        }
        Ok(None)
    }

    fn gen_load_var(&mut self, name: &str, line: usize) -> Result<(), CompileError> {
        if name == "this" && self.class_contexts.is_empty() {
            return Err(CompileError::new("Can't use 'this' outside of a class.", line));
        }
        self.gen_var_access(name, line, OpCode::LoadLocal, OpCode::LoadUpvalue, OpCode::LoadGlobal)
    }

    fn gen_store_var(&mut self, name: &str, line: usize) -> Result<(), CompileError> {
        self.gen_var_access(
            name,
            line,
            OpCode::StoreLocal,
            OpCode::StoreUpvalue,
            OpCode::StoreGlobal,
        )
    }

    fn gen_var_access(
        &mut self,
        name: &str,
        line: usize,
        local_op: OpCode,
        upvalue_op: OpCode,
        global_op: OpCode,
    ) -> Result<(), CompileError> {
        match self.ctx().find_local(name) {
            LocalSlot::Slot(slot) => {
                self.chunk_mut().write_op(local_op, line);
                self.chunk_mut().write_u16(slot as u16, line);
                Ok(())
            }
            LocalSlot::Uninitialized => Err(CompileError::new(
                format!("at '{}': Can't read local variable in its own initializer.", name),
                line,
            )),
            LocalSlot::NotFound => {
                let ctx = self.contexts.len() - 1;
                if let Some(index) = self.resolve_upvalue(ctx, name, line)? {
                    self.chunk_mut().write_op(upvalue_op, line);
                    self.chunk_mut().write_u16(index, line);
                    return Ok(());
                }
                self.chunk_mut().write_op(global_op, line);
                self.write_name_constant(name, line)
            }
        }
    }

    // ---- functions and classes ---------------------------------------------

    /// Compiles a function body into a fresh FunctionContext and emits the
    /// constant (plus CLOSURE descriptors when it captures anything) into
    /// the enclosing chunk. The caller handles the name binding.
    #[allow(clippy::too_many_arguments)]
    fn gen_function(
        &mut self,
        kind: FunctionKind,
        name: &str,
        params: &[String],
        body: &Stmt,
        accepts_varargs: bool,
        line: usize,
        end_line: usize,
    ) -> Result<ObjRef, CompileError> {
        let name_ref = self.heap.intern(name);
        let globals = self.current_globals();
        let function = self.heap.alloc(ObjPayload::Function(FunctionObj {
            kind,
            name: Some(name_ref),
            arity: params.len(),
            accepts_varargs,
            chunk: Chunk::new(globals),
            upvalues: Vec::new(),
            upvalue_count: 0,
        }));

        // The constant lands in the enclosing (protected) chunk before the
        // body is compiled, so the new function is reachable throughout.
        self.chunk_mut().load_constant(Value::Obj(function), line)?;

        self.heap.cache_push(Value::Obj(function));
        self.contexts.push(FunctionContext::new(function, kind));

        let body_result = (|| -> Result<(), CompileError> {
            self.begin_scope();
            for param in params {
                if self.ctx().find_variable_in_same_depth(param) {
                    return Err(CompileError::new(
                        format!("at '{}': the parameter has been used before.", param),
                        line,
                    ));
                }
                self.ctx_mut().add_local(param.clone(), line)?;
                self.ctx_mut().mark_initialized();
            }
            self.gen_stmt(body)?;
            if kind == FunctionKind::InitMethod {
                self.chunk_mut().write_op(OpCode::LoadLocal, end_line);
                self.chunk_mut().write_u16(0, end_line);
            } else {
                self.chunk_mut().write_op(OpCode::LoadNil, end_line);
            }
            self.chunk_mut().write_op(OpCode::Return, end_line);
            Ok(())
        })();

        let context = self.contexts.pop().expect("function context");
        self.heap.cache_pop(1);
        body_result?;

        let upvalues = context.upvalues;
        match self.heap.payload_mut(function) {
            ObjPayload::Function(f) => f.upvalue_count = upvalues.len(),
            _ => unreachable!(),
        }
        if !upvalues.is_empty() {
            self.chunk_mut().write_op(OpCode::Closure, end_line);
            self.chunk_mut().write_constant(Value::Obj(function), end_line)?;
            for desc in &upvalues {
                self.chunk_mut().write_byte(desc.is_local as u8, end_line);
                self.chunk_mut().write_u16(desc.index, end_line);
            }
        }

        if std::env::var("ARIA_DUMP_CODE").is_ok() {
            crate::disassembler::disassemble(self.heap, function, name);
        }
        Ok(function)
    }

    fn gen_fun_decl(
        &mut self,
        name: &str,
        params: &[String],
        body: &Stmt,
        accepts_varargs: bool,
        line: usize,
        end_line: usize,
    ) -> Result<(), CompileError> {
        // Bind the name before compiling the body so the function can
        // recurse through it.
        if self.ctx().scope_depth > 0 {
            if self.ctx().find_variable_in_same_depth(name) {
                return Err(CompileError::new(
                    format!("at '{}': Already a variable with this name in this scope.", name),
                    line,
                ));
            }
            self.ctx_mut().add_local(name.to_string(), line)?;
            self.ctx_mut().mark_initialized();
            self.gen_function(
                FunctionKind::Function,
                name,
                params,
                body,
                accepts_varargs,
                line,
                end_line,
            )?;
        } else {
            self.gen_function(
                FunctionKind::Function,
                name,
                params,
                body,
                accepts_varargs,
                line,
                end_line,
            )?;
            self.chunk_mut().write_op(OpCode::DefGlobal, line);
            self.write_name_constant(name, line)?;
        }
        Ok(())
    }

    fn gen_class_decl(
        &mut self,
        name: &str,
        super_name: Option<&str>,
        methods: &[Stmt],
        line: usize,
        end_line: usize,
    ) -> Result<(), CompileError> {
        self.chunk_mut().write_op(OpCode::MakeClass, line);
        self.write_name_constant(name, line)?;

        self.class_contexts.push(ClassContext { has_super_class: false });
        let result = (|| -> Result<(), CompileError> {
            if let Some(super_name) = super_name {
                self.gen_load_var(super_name, line)?;
                self.chunk_mut().write_op(OpCode::Inherit, line);
                self.class_contexts.last_mut().unwrap().has_super_class = true;
            }

            let mut local_slot = None;
            if self.ctx().scope_depth > 0 {
                if self.ctx().find_variable_in_same_depth(name) {
                    return Err(CompileError::new(
                        format!("at '{}': Already a variable with this name in this scope.", name),
                        line,
                    ));
                }
                self.ctx_mut().add_local(name.to_string(), line)?;
                self.ctx_mut().mark_initialized();
                local_slot = Some(self.ctx().locals.len() - 1);
            } else {
                self.chunk_mut().write_op(OpCode::DefGlobal, line);
                self.write_name_constant(name, line)?;
            }

            // Reload the class for method installation.
            match local_slot {
                Some(slot) => {
                    self.chunk_mut().write_op(OpCode::LoadLocal, line);
                    self.chunk_mut().write_u16(slot as u16, line);
                }
                None => {
                    self.chunk_mut().write_op(OpCode::LoadGlobal, line);
                    self.write_name_constant(name, line)?;
                }
            }

            for method in methods {
                let (method_name, params, body, accepts_varargs, m_line, m_end) = match method {
                    Stmt::FunDecl { name, params, body, accepts_varargs, line, end_line } => {
                        (name, params, body, *accepts_varargs, *line, *end_line)
                    }
                    _ => unreachable!("class bodies hold only methods"),
                };
                let kind = if method_name == "init" {
                    FunctionKind::InitMethod
                } else {
                    FunctionKind::Method
                };
                self.gen_function(kind, method_name, params, body, accepts_varargs, m_line, m_end)?;
                if kind == FunctionKind::InitMethod {
                    self.chunk_mut().write_op(OpCode::MakeInitMethod, m_line);
                } else {
                    self.chunk_mut().write_op(OpCode::MakeMethod, m_line);
                    self.write_name_constant(method_name, m_line)?;
                }
            }

            self.chunk_mut().write_op(OpCode::Pop, end_line);
            Ok(())
        })();
        self.class_contexts.pop();
        result
    }

    // ---- statements --------------------------------------------------------

    fn gen_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::FunDecl { name, params, body, accepts_varargs, line, end_line } => {
                self.gen_fun_decl(name, params, body, *accepts_varargs, *line, *end_line)
            }
            Stmt::ClassDecl { name, super_name, methods, line, end_line } => {
                self.gen_class_decl(name, super_name.as_deref(), methods, *line, *end_line)
            }
            Stmt::VarDecl { names, inits, line } => self.gen_var_decl(names, inits, *line),
            Stmt::Block { decls, end_line, .. } => {
                self.begin_scope();
                for decl in decls {
                    self.gen_stmt(decl)?;
                }
                self.end_scope(*end_line);
                Ok(())
            }
            Stmt::Print { expr, line } => {
                self.gen_expr(expr)?;
                self.chunk_mut().write_op(OpCode::Print, *line);
                Ok(())
            }
            Stmt::Import { input, alias, line } => {
                self.chunk_mut().write_op(OpCode::Import, *line);
                self.write_name_constant(input, *line)?;
                self.write_name_constant(alias, *line)?;
                self.chunk_mut().write_op(OpCode::Pop, *line);
                Ok(())
            }
            Stmt::If { condition, then_branch, else_branch, line } => {
                self.gen_expr(condition)?;
                let false_jump = self.chunk_mut().emit_jump(OpCode::JumpFalse, *line);
                self.gen_stmt(then_branch)?;
                if let Some(else_branch) = else_branch {
                    let end_jump = self.chunk_mut().emit_jump(OpCode::JumpBwd, else_branch.line());
                    self.chunk_mut().patch_jump(false_jump)?;
                    self.gen_stmt(else_branch)?;
                    self.chunk_mut().patch_jump(end_jump)?;
                } else {
                    self.chunk_mut().patch_jump(false_jump)?;
                }
                Ok(())
            }
            Stmt::While { condition, body, line, end_line } => {
                self.push_loop();
                let loop_start = self.chunk_mut().len();
                self.gen_expr(condition)?;
                let exit_jump = self.chunk_mut().emit_jump(OpCode::JumpFalse, *line);
                self.gen_stmt(body)?;
                self.chunk_mut().emit_loop(loop_start, *end_line)?;
                self.chunk_mut().patch_jump(exit_jump)?;
                self.pop_loop(loop_start, loop_start)?;
                Ok(())
            }
            Stmt::For { init, condition, step, body, line, end_line } => {
                self.begin_scope();
                if let Some(init) = init {
                    self.gen_stmt(init)?;
                }
                self.push_loop();
                let loop_start = self.chunk_mut().len();
                let exit_jump = match condition {
                    Some(condition) => {
                        self.gen_expr(condition)?;
                        Some(self.chunk_mut().emit_jump(OpCode::JumpFalse, *line))
                    }
                    None => None,
                };
                self.gen_stmt(body)?;
                let increment_start = self.chunk_mut().len();
                if let Some(step) = step {
                    self.gen_expr(step)?;
                    self.chunk_mut().write_op(OpCode::Pop, *line);
                }
                self.chunk_mut().emit_loop(loop_start, *line)?;
                if let Some(exit_jump) = exit_jump {
                    self.chunk_mut().patch_jump(exit_jump)?;
                }
                self.pop_loop(loop_start, increment_start)?;
                self.end_scope(*end_line);
                Ok(())
            }
            Stmt::ForIn { var_name, iterable, body, line, end_line } => {
                self.gen_for_in(var_name, iterable, body, *line, *end_line)
            }
            Stmt::TryCatch { try_body, catch_body, exception_name, line, catch_line, end_line } => {
                let begin = self.chunk_mut().emit_jump(OpCode::BeginTry, *line);
                self.gen_stmt(try_body)?;
                self.chunk_mut().write_op(OpCode::EndTry, *line);
                let exit_jump = self.chunk_mut().emit_jump(OpCode::JumpBwd, *catch_line);
                self.chunk_mut().patch_jump(begin)?;

                // The thrown value sits on the stack; it becomes the
                // handler's first local.
                self.begin_scope();
                self.ctx_mut().add_local(exception_name.clone(), *catch_line)?;
                self.ctx_mut().mark_initialized();
                self.gen_stmt(catch_body)?;
                self.end_scope(*end_line);

                self.chunk_mut().patch_jump(exit_jump)?;
                Ok(())
            }
            Stmt::Throw { expr, line } => {
                self.gen_expr(expr)?;
                self.chunk_mut().write_op(OpCode::Throw, *line);
                Ok(())
            }
            Stmt::Break { line } => {
                if self.ctx().loop_depths.is_empty() {
                    return Err(CompileError::new("break statement should inside a loop", *line));
                }
                let count = self.ctx().locals_above_loop();
                self.chunk_mut().gen_pops(count, *line);
                let jump = self.chunk_mut().emit_jump(OpCode::JumpBwd, *line);
                self.ctx_mut().loop_breaks.last_mut().unwrap().push(jump);
                Ok(())
            }
            Stmt::Continue { line } => {
                if self.ctx().loop_depths.is_empty() {
                    return Err(CompileError::new(
                        "continue statement should inside a loop",
                        *line,
                    ));
                }
                let count = self.ctx().locals_above_loop();
                self.chunk_mut().gen_pops(count, *line);
                // Direction depends on the loop form; patched via
                // patch_jump_to which rewrites the opcode byte.
                let jump = self.chunk_mut().emit_jump(OpCode::JumpBwd, *line);
                self.ctx_mut().loop_continues.last_mut().unwrap().push(jump);
                Ok(())
            }
            Stmt::Return { expr, line } => {
                match self.ctx().kind {
                    FunctionKind::Script => {
                        return Err(CompileError::new("Can't return from top-level code.", *line));
                    }
                    FunctionKind::InitMethod => {
                        if expr.is_some() {
                            return Err(CompileError::new(
                                "Can't return a value from an initializer.",
                                *line,
                            ));
                        }
                        self.chunk_mut().write_op(OpCode::LoadLocal, *line);
                        self.chunk_mut().write_u16(0, *line);
                    }
                    _ => match expr {
                        Some(expr) => self.gen_expr(expr)?,
                        None => {
                            self.chunk_mut().write_op(OpCode::LoadNil, *line);
                        }
                    },
                }
                self.chunk_mut().write_op(OpCode::Return, *line);
                Ok(())
            }
            Stmt::Expression { expr, line } => {
                self.gen_expr(expr)?;
                self.chunk_mut().write_op(OpCode::Pop, *line);
                Ok(())
            }
        }
    }

    fn gen_var_decl(
        &mut self,
        names: &[String],
        inits: &[Expr],
        line: usize,
    ) -> Result<(), CompileError> {
        for (name, init) in names.iter().zip(inits) {
            if self.ctx().scope_depth > 0 {
                if self.ctx().find_variable_in_same_depth(name) {
                    return Err(CompileError::new(
                        format!("at '{}': Already a variable with this name in this scope.", name),
                        line,
                    ));
                }
                self.ctx_mut().add_local(name.clone(), line)?;
                self.gen_expr(init)?;
                self.ctx_mut().mark_initialized();
            } else {
                self.gen_expr(init)?;
                self.chunk_mut().write_op(OpCode::DefGlobal, line);
                self.write_name_constant(name, line)?;
            }
        }
        Ok(())
    }

    fn gen_for_in(
        &mut self,
        var_name: &str,
        iterable: &Expr,
        body: &Stmt,
        line: usize,
        end_line: usize,
    ) -> Result<(), CompileError> {
        let iter_name = format!("__{}__ITER__", var_name);
        self.begin_scope();

        // Two synthetic locals: the iterator, then the loop variable.
        self.ctx_mut().add_local(iter_name.clone(), line)?;
        self.gen_expr(iterable)?;
        self.chunk_mut().write_op(OpCode::GetIter, line);
        self.ctx_mut().mark_initialized();
        self.ctx_mut().add_local(var_name.to_string(), line)?;
        self.chunk_mut().write_op(OpCode::LoadNil, line);
        self.ctx_mut().mark_initialized();

        self.push_loop();
        let loop_start = self.chunk_mut().len();

        let iter_slot = match self.ctx().find_local(&iter_name) {
            LocalSlot::Slot(slot) => slot as u16,
            _ => unreachable!("iterator local just declared"),
        };
        let var_slot = match self.ctx().find_local(var_name) {
            LocalSlot::Slot(slot) => slot as u16,
            _ => unreachable!("loop variable just declared"),
        };

        self.chunk_mut().write_op(OpCode::LoadLocal, line);
        self.chunk_mut().write_u16(iter_slot, line);
        self.chunk_mut().write_op(OpCode::IterHasNext, line);
        let exit_jump = self.chunk_mut().emit_jump(OpCode::JumpFalse, line);

        self.chunk_mut().write_op(OpCode::LoadLocal, line);
        self.chunk_mut().write_u16(iter_slot, line);
        self.chunk_mut().write_op(OpCode::IterGetNext, line);
        self.chunk_mut().write_op(OpCode::StoreLocal, line);
        self.chunk_mut().write_u16(var_slot, line);
        self.chunk_mut().write_op(OpCode::Pop, line);

        self.gen_stmt(body)?;

        let increment_start = self.chunk_mut().len();
        self.chunk_mut().emit_loop(loop_start, line)?;
        self.chunk_mut().patch_jump(exit_jump)?;
        self.pop_loop(loop_start, increment_start)?;

        self.end_scope(end_line);
        Ok(())
    }

    fn push_loop(&mut self) {
        let depth = self.ctx().scope_depth;
        let ctx = self.ctx_mut();
        ctx.loop_depths.push(depth);
        ctx.loop_breaks.push(Vec::new());
        ctx.loop_continues.push(Vec::new());
    }

    /// Back-patches the pending break jumps to the current end of code and
    /// the continue jumps to `continue_target`.
    fn pop_loop(&mut self, _loop_start: usize, continue_target: usize) -> Result<(), CompileError> {
        let ctx = self.ctx_mut();
        ctx.loop_depths.pop();
        let breaks = ctx.loop_breaks.pop().unwrap_or_default();
        let continues = ctx.loop_continues.pop().unwrap_or_default();
        for src in breaks {
            self.chunk_mut().patch_jump(src)?;
        }
        for src in continues {
            self.chunk_mut().patch_jump_to(continue_target, src)?;
        }
        Ok(())
    }

    // ---- expressions -------------------------------------------------------

    fn gen_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Number(value, line) => self.chunk_mut().load_constant(Value::Number(*value), *line),
            Expr::True(line) => {
                self.chunk_mut().write_op(OpCode::LoadTrue, *line);
                Ok(())
            }
            Expr::False(line) => {
                self.chunk_mut().write_op(OpCode::LoadFalse, *line);
                Ok(())
            }
            Expr::Nil(line) => {
                self.chunk_mut().write_op(OpCode::LoadNil, *line);
                Ok(())
            }
            Expr::Str(text, line) => {
                let s = self.heap.intern(text);
                self.chunk_mut().load_constant(Value::Obj(s), *line)
            }
            Expr::List(elements, line) => {
                for element in elements {
                    self.gen_expr(element)?;
                }
                self.chunk_mut().write_op(OpCode::MakeList, *line);
                self.chunk_mut().write_u16(elements.len() as u16, *line);
                Ok(())
            }
            Expr::Map(pairs, line) => {
                for pair in pairs {
                    self.gen_expr(pair)?;
                }
                self.chunk_mut().write_op(OpCode::MakeMap, *line);
                self.chunk_mut().write_u16((pairs.len() / 2) as u16, *line);
                Ok(())
            }
            Expr::LoadVar(name, line) => self.gen_load_var(name, *line),
            Expr::StoreVar(name, line) => self.gen_store_var(name, *line),
            Expr::LoadProperty { object, name, line } => {
                self.gen_expr(object)?;
                self.chunk_mut().write_op(OpCode::LoadProperty, *line);
                self.write_name_constant(name, *line)
            }
            Expr::StoreProperty { object, name, line } => {
                self.gen_expr(object)?;
                self.chunk_mut().write_op(OpCode::StoreProperty, *line);
                self.write_name_constant(name, *line)
            }
            Expr::LoadSubscr { object, index, line } => {
                self.gen_expr(object)?;
                self.gen_expr(index)?;
                self.chunk_mut().write_op(OpCode::LoadSubscr, *line);
                Ok(())
            }
            Expr::StoreSubscr { object, index, line } => {
                self.gen_expr(object)?;
                self.gen_expr(index)?;
                self.chunk_mut().write_op(OpCode::StoreSubscr, *line);
                Ok(())
            }
            Expr::LoadSuperMethod { method, line } => {
                if self.class_contexts.is_empty() {
                    return Err(CompileError::new("Can't use 'super' outside of a class.", *line));
                }
                if !self.class_contexts.last().unwrap().has_super_class {
                    return Err(CompileError::new(
                        "Can't use 'super' in a class with no superclass.",
                        *line,
                    ));
                }
                self.gen_load_var("this", *line)?;
                self.chunk_mut().write_op(OpCode::LoadSuperMethod, *line);
                self.write_name_constant(method, *line)
            }
            Expr::Assign { target, value, .. } => {
                self.gen_expr(value)?;
                self.gen_expr(target)
            }
            Expr::Binary { left, op, right, line } => self.gen_binary(left, *op, right, *line),
            Expr::Unary { op, operand, line } => {
                self.gen_expr(operand)?;
                match op {
                    TokenKind::Minus => {
                        self.chunk_mut().write_op(OpCode::Negate, *line);
                    }
                    TokenKind::Not => {
                        self.chunk_mut().write_op(OpCode::Not, *line);
                    }
                    _ => return Err(CompileError::new("Unknown unary operation.", *line)),
                }
                Ok(())
            }
            Expr::Call { callee, args, line } => {
                self.gen_expr(callee)?;
                for arg in args {
                    self.gen_expr(arg)?;
                }
                self.chunk_mut().write_op(OpCode::Call, *line);
                self.chunk_mut().write_byte(args.len() as u8, *line);
                Ok(())
            }
            Expr::Invoke { receiver, method, args, line } => {
                self.gen_expr(receiver)?;
                for arg in args {
                    self.gen_expr(arg)?;
                }
                self.chunk_mut().write_op(OpCode::InvokeMethod, *line);
                self.write_name_constant(method, *line)?;
                self.chunk_mut().write_byte(args.len() as u8, *line);
                Ok(())
            }
            Expr::Error(line) => {
                Err(CompileError::new("cannot compile malformed expression", *line))
            }
        }
    }

    fn gen_binary(
        &mut self,
        left: &Expr,
        op: TokenKind,
        right: &Expr,
        line: usize,
    ) -> Result<(), CompileError> {
        match op {
            TokenKind::And => {
                self.gen_expr(left)?;
                let end_jump = self.chunk_mut().emit_jump(OpCode::JumpFalseNoPop, line);
                self.chunk_mut().write_op(OpCode::Pop, line);
                self.gen_expr(right)?;
                self.chunk_mut().patch_jump(end_jump)
            }
            TokenKind::Or => {
                self.gen_expr(left)?;
                let end_jump = self.chunk_mut().emit_jump(OpCode::JumpTrueNoPop, line);
                self.chunk_mut().write_op(OpCode::Pop, line);
                self.gen_expr(right)?;
                self.chunk_mut().patch_jump(end_jump)
            }
            // ++/-- skip their literal 1 and use the dedicated ops.
            TokenKind::PlusPlus => {
                self.gen_expr(left)?;
                self.chunk_mut().write_op(OpCode::Inc, line);
                Ok(())
            }
            TokenKind::MinusMinus => {
                self.gen_expr(left)?;
                self.chunk_mut().write_op(OpCode::Dec, line);
                Ok(())
            }
            _ => {
                self.gen_expr(left)?;
                self.gen_expr(right)?;
                let opcode = match op {
                    TokenKind::Plus | TokenKind::PlusEqual => OpCode::Add,
                    TokenKind::Minus | TokenKind::MinusEqual => OpCode::Subtract,
                    TokenKind::Star | TokenKind::StarEqual => OpCode::Multiply,
                    TokenKind::Slash | TokenKind::SlashEqual => OpCode::Divide,
                    TokenKind::Percent | TokenKind::PercentEqual => OpCode::Mod,
                    TokenKind::EqualEqual => OpCode::Equal,
                    TokenKind::NotEqual => OpCode::NotEqual,
                    TokenKind::Greater => OpCode::Greater,
                    TokenKind::GreaterEqual => OpCode::GreaterEqual,
                    TokenKind::Less => OpCode::Less,
                    TokenKind::LessEqual => OpCode::LessEqual,
                    _ => return Err(CompileError::new("Unknown binary operation.", line)),
                };
                self.chunk_mut().write_op(opcode, line);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_source(source: &str) -> (Heap, Option<ObjRef>) {
        let mut heap = Heap::new();
        let function = compile(&mut heap, source);
        (heap, function)
    }

    fn chunk_ops(heap: &Heap, function: ObjRef) -> Vec<OpCode> {
        let chunk = match heap.payload(function) {
            ObjPayload::Function(f) => &f.chunk,
            _ => panic!("not a function"),
        };
        let mut ops = Vec::new();
        let mut i = 0;
        while i < chunk.code.len() {
            let op = OpCode::try_from(chunk.code[i]).expect("valid opcode");
            ops.push(op);
            i += 1 + operand_len(op, chunk, i, heap);
        }
        ops
    }

    fn operand_len(op: OpCode, chunk: &Chunk, at: usize, heap: &Heap) -> usize {
        match op {
            OpCode::PopN | OpCode::Call => 1,
            OpCode::LoadConst
            | OpCode::LoadLocal
            | OpCode::StoreLocal
            | OpCode::LoadUpvalue
            | OpCode::StoreUpvalue
            | OpCode::DefGlobal
            | OpCode::LoadGlobal
            | OpCode::StoreGlobal
            | OpCode::LoadProperty
            | OpCode::StoreProperty
            | OpCode::MakeClass
            | OpCode::MakeMethod
            | OpCode::LoadSuperMethod
            | OpCode::MakeList
            | OpCode::MakeMap
            | OpCode::JumpFwd
            | OpCode::JumpBwd
            | OpCode::JumpTrue
            | OpCode::JumpTrueNoPop
            | OpCode::JumpFalse
            | OpCode::JumpFalseNoPop
            | OpCode::BeginTry => 2,
            OpCode::InvokeMethod => 3,
            OpCode::Import => 4,
            OpCode::Closure => {
                let constant = chunk.read_u16(at + 1) as usize;
                let function = match chunk.constants[constant] {
                    Value::Obj(r) => r,
                    _ => panic!("closure constant is not an object"),
                };
                let count = match heap.payload(function) {
                    ObjPayload::Function(f) => f.upvalue_count,
                    _ => panic!("closure constant is not a function"),
                };
                2 + count * 3
            }
            _ => 0,
        }
    }

    #[test]
    fn globals_compile_to_def_global() {
        let (heap, function) = compile_source("var a = 1;");
        let ops = chunk_ops(&heap, function.unwrap());
        assert_eq!(
            ops,
            vec![OpCode::LoadConst, OpCode::DefGlobal, OpCode::LoadNil, OpCode::Return]
        );
    }

    #[test]
    fn block_locals_compile_to_slots() {
        let (heap, function) = compile_source("{ var a = 1; print a; }");
        let ops = chunk_ops(&heap, function.unwrap());
        assert_eq!(
            ops,
            vec![
                OpCode::LoadConst,
                OpCode::LoadLocal,
                OpCode::Print,
                OpCode::Pop,
                OpCode::LoadNil,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn reading_local_in_own_initializer_fails() {
        let (_, function) = compile_source("{ var a = 1; { var a = a; } }");
        assert!(function.is_none());
    }

    #[test]
    fn duplicate_local_in_same_scope_fails() {
        let (_, function) = compile_source("{ var a = 1; var a = 2; }");
        assert!(function.is_none());
    }

    #[test]
    fn duplicate_global_is_allowed_at_compile_time() {
        // Redeclaration of globals is a runtime failure of DEF_GLOBAL.
        let (_, function) = compile_source("var a = 1; var a = 2;");
        assert!(function.is_some());
    }

    #[test]
    fn top_level_return_is_rejected() {
        let (_, function) = compile_source("return 1;");
        assert!(function.is_none());
    }

    #[test]
    fn return_value_from_init_is_rejected() {
        let (_, function) = compile_source("class A { init() { return 1; } }");
        assert!(function.is_none());
    }

    #[test]
    fn bare_return_from_init_is_allowed() {
        let (_, function) = compile_source("class A { init() { return; } }");
        assert!(function.is_some());
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let (_, function) = compile_source("break;");
        assert!(function.is_none());
        let (_, function) = compile_source("continue;");
        assert!(function.is_none());
    }

    #[test]
    fn this_outside_class_is_rejected() {
        let (_, function) = compile_source("print this;");
        assert!(function.is_none());
    }

    #[test]
    fn super_outside_subclass_is_rejected() {
        let (_, function) = compile_source("class A { m() { return super.m(); } }");
        assert!(function.is_none());
    }

    #[test]
    fn closure_emits_descriptors() {
        let (heap, function) = compile_source(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
        );
        let function = function.unwrap();
        // outer is constant 0 of the script chunk.
        let outer = match heap.payload(function) {
            ObjPayload::Function(f) => match f.chunk.constants[0] {
                Value::Obj(r) => r,
                _ => panic!("expected function constant"),
            },
            _ => panic!("expected function"),
        };
        let ops = chunk_ops(&heap, outer);
        assert!(ops.contains(&OpCode::Closure));
        // inner captures exactly one upvalue.
        let inner = match heap.payload(outer) {
            ObjPayload::Function(f) => f
                .chunk
                .constants
                .iter()
                .find_map(|c| match c {
                    Value::Obj(r) => match heap.payload(*r) {
                        ObjPayload::Function(inner) if inner.upvalue_count > 0 => Some(*r),
                        _ => None,
                    },
                    _ => None,
                })
                .expect("inner function constant"),
            _ => unreachable!(),
        };
        match heap.payload(inner) {
            ObjPayload::Function(f) => assert_eq!(f.upvalue_count, 1),
            _ => unreachable!(),
        }
    }

    #[test]
    fn short_circuit_and_uses_nopop_jump() {
        let (heap, function) = compile_source("var a = true and false;");
        let ops = chunk_ops(&heap, function.unwrap());
        assert!(ops.contains(&OpCode::JumpFalseNoPop));
    }

    #[test]
    fn increment_uses_inc_op() {
        let (heap, function) = compile_source("var i = 0; i++;");
        let ops = chunk_ops(&heap, function.unwrap());
        assert!(ops.contains(&OpCode::Inc));
    }

    #[test]
    fn for_in_reserves_iterator_local() {
        let (heap, function) = compile_source("for (var x in [1, 2]) print x;");
        let ops = chunk_ops(&heap, function.unwrap());
        assert!(ops.contains(&OpCode::GetIter));
        assert!(ops.contains(&OpCode::IterHasNext));
        assert!(ops.contains(&OpCode::IterGetNext));
    }

    #[test]
    fn try_catch_brackets_the_protected_region() {
        let (heap, function) = compile_source("try { print 1; } catch (e) { print e; }");
        let ops = chunk_ops(&heap, function.unwrap());
        let begin = ops.iter().position(|&o| o == OpCode::BeginTry).unwrap();
        let end = ops.iter().position(|&o| o == OpCode::EndTry).unwrap();
        assert!(begin < end);
    }
}
