// File: src/vm.rs
//
// The bytecode interpreter: a value stack, a call-frame stack, a
// try-frame stack for exception unwinding, the open-upvalue list and the
// module cache. The VM also owns the heap and is the only component that
// starts a garbage collection, because every root the collector needs
// lives here.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use colored::Colorize;

use crate::bytecode::OpCode;
use crate::builtins;
use crate::compiler;
use crate::errors::InterpretResult;
use crate::heap::{Heap, ObjRef};
use crate::module;
use crate::object::{
    BoundMethodObj, FunctionKind, InstanceObj, IterObj, IterState, ListObj, MapObj, ModuleObj,
    ObjPayload, UpvalueObj, UpvalueState,
};
use crate::table::ValueTable;
use crate::value::{is_falsey, value_type_string, values_same, Value};

pub const FRAMES_MAX: usize = 256;

#[derive(Debug, Clone, Copy)]
struct CallFrame {
    function: ObjRef,
    ip: usize,
    /// Stack index of slot 0 (the callee or receiver).
    slots: usize,
}

/// Snapshot taken by BEGIN_TRY and consumed by THROW.
#[derive(Debug, Clone, Copy)]
struct TryFrame {
    handler_ip: usize,
    stack_size: usize,
    frame_count: usize,
}

/// Per-VM builtin method tables for the primitive container types.
#[derive(Default)]
pub struct Builtins {
    pub string: ValueTable,
    pub list: ValueTable,
    pub map: ValueTable,
    pub iterator: ValueTable,
}

enum Flow {
    Continue,
    Done,
}

pub struct Vm {
    pub heap: Heap,
    pub(crate) stack: Vec<Value>,
    frames: Vec<CallFrame>,
    try_frames: Vec<TryFrame>,
    /// Open upvalues sorted by ascending stack slot; closing walks from
    /// the back, which holds the highest address.
    open_upvalues: Vec<ObjRef>,
    pub(crate) natives: ValueTable,
    /// Absolute path string -> Module object.
    modules: ValueTable,
    repl_globals: Option<Rc<RefCell<ValueTable>>>,
    pub builtins: Builtins,
    /// Globals of the most recent top-level chunk; REPL state inspection.
    last_globals: Option<Rc<RefCell<ValueTable>>>,
    file_name: String,
    file_directory: PathBuf,
    line: usize,
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Self {
            heap: Heap::new(),
            stack: Vec::new(),
            frames: Vec::new(),
            try_frames: Vec::new(),
            open_upvalues: Vec::new(),
            natives: ValueTable::new(),
            modules: ValueTable::new(),
            repl_globals: None,
            builtins: Builtins::default(),
            last_globals: None,
            file_name: String::new(),
            file_directory: PathBuf::new(),
            line: 0,
        };
        builtins::install(&mut vm);
        vm
    }

    // ---- public entry points ----------------------------------------------

    /// Interprets a whole source text as a script.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        if self.file_name.is_empty() {
            self.file_name = "__tmp_aria_file__".to_string();
            self.file_directory =
                std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        }
        let function = match compiler::compile(&mut self.heap, source) {
            Some(f) => f,
            None => return InterpretResult::CompileError,
        };
        self.run_toplevel(function)
    }

    /// Interprets a script read from `path`; imports resolve relative to
    /// its directory.
    pub fn interpret_file(&mut self, path: &str, source: &str) -> InterpretResult {
        self.file_name = path.to_string();
        self.file_directory = module::file_directory(path);
        self.interpret(source)
    }

    /// Interprets one REPL line; globals persist across calls.
    pub fn interpret_line(&mut self, source: &str) -> InterpretResult {
        self.reset();
        if self.repl_globals.is_none() {
            self.file_name = "__tmp_aria_file__".to_string();
            self.file_directory =
                std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            self.repl_globals = Some(Rc::new(RefCell::new(ValueTable::new())));
        }
        let globals = self.repl_globals.clone().unwrap();
        let function = match compiler::compile_repl(&mut self.heap, source, globals) {
            Some(f) => f,
            None => return InterpretResult::CompileError,
        };
        self.run_toplevel(function)
    }

    fn run_toplevel(&mut self, function: ObjRef) -> InterpretResult {
        if let ObjPayload::Function(f) = self.heap.payload(function) {
            self.last_globals = Some(f.chunk.globals.clone());
        }
        self.stack.push(Value::Obj(function));
        if let Err(msg) = self.call_function(function, 0) {
            self.report_runtime_error(&msg);
            return InterpretResult::RuntimeError;
        }
        self.run()
    }

    /// Looks a name up in the globals of the last interpreted chunk.
    /// Used by the REPL and by tests to observe program results.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let globals = self.last_globals.as_ref()?;
        let globals = globals.borrow();
        for (key, value) in globals.iter() {
            if let Value::Obj(r) = key {
                if let ObjPayload::String(s) = self.heap.payload(r) {
                    if s.chars == name {
                        return Some(value);
                    }
                }
            }
        }
        None
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.try_frames.clear();
        self.open_upvalues.clear();
    }

    // ---- allocation and collection ----------------------------------------

    /// Allocates through the VM so a collection can run first; everything
    /// the new object should reference must be reachable from the roots
    /// (stack, frames, tables, heap cache stack) at this point.
    pub fn alloc(&mut self, payload: ObjPayload) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(payload)
    }

    /// Interning counterpart of `alloc`.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern(text)
    }

    fn collect_garbage(&mut self) {
        for i in 0..self.stack.len() {
            let v = self.stack[i];
            self.heap.mark_value(v);
        }
        for i in 0..self.frames.len() {
            let f = self.frames[i].function;
            self.heap.mark_object(f);
        }
        for i in 0..self.open_upvalues.len() {
            let u = self.open_upvalues[i];
            self.heap.mark_object(u);
        }
        self.heap.mark_table(&self.natives);
        self.heap.mark_table(&self.modules);
        if let Some(globals) = self.repl_globals.clone() {
            self.heap.mark_table(&globals.borrow());
        }
        if let Some(globals) = self.last_globals.clone() {
            self.heap.mark_table(&globals.borrow());
        }
        self.heap.mark_table(&self.builtins.string);
        self.heap.mark_table(&self.builtins.list);
        self.heap.mark_table(&self.builtins.map);
        self.heap.mark_table(&self.builtins.iterator);
        self.heap.mark_cache();

        self.heap.trace_references();
        self.heap.purge_intern_pool();
        self.heap.sweep();
    }

    // ---- stack and frame helpers ------------------------------------------

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn pop_n(&mut self, n: usize) {
        let len = self.stack.len() - n;
        self.stack.truncate(len);
    }

    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    pub(crate) fn stack_at(&self, index: usize) -> Value {
        self.stack[index]
    }

    pub(crate) fn stack_len(&self) -> usize {
        self.stack.len()
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let byte = match self.heap.payload(frame.function) {
            ObjPayload::Function(f) => f.chunk.code[frame.ip],
            _ => unreachable!("frame function is not a function"),
        };
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let lo = self.read_byte() as u16;
        let hi = self.read_byte() as u16;
        lo | (hi << 8)
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_u16() as usize;
        let frame = self.frames.last().expect("no active call frame");
        match self.heap.payload(frame.function) {
            ObjPayload::Function(f) => f.chunk.constants[index],
            _ => unreachable!(),
        }
    }

    fn read_string(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(r) => r,
            _ => unreachable!("name constant is not a string"),
        }
    }

    fn current_globals(&self) -> Rc<RefCell<ValueTable>> {
        match self.heap.payload(self.frame().function) {
            ObjPayload::Function(f) => f.chunk.globals.clone(),
            _ => unreachable!(),
        }
    }

    // ---- calling ----------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), String> {
        if let Value::Obj(r) = callee {
            match self.heap.payload(r) {
                ObjPayload::Function(_) => return self.call_function(r, argc),
                ObjPayload::Native(_) => return self.call_native(r, argc),
                ObjPayload::Class(_) => return self.call_class(r, argc),
                ObjPayload::BoundMethod(_) => return self.call_bound_method(r, argc),
                _ => {}
            }
        }
        Err("Can only call functions and classes.".to_string())
    }

    /// Packs surplus varargs into a list occupying the last formal slot.
    fn pack_varargs(&mut self, argc: usize, arity: usize) {
        let count = argc - arity + 1;
        let start = self.stack.len() - count;
        let items: Vec<Value> = self.stack[start..].to_vec();
        let list = self.alloc(ObjPayload::List(ListObj { items }));
        self.stack.truncate(start);
        self.push(Value::Obj(list));
    }

    fn call_function(&mut self, function: ObjRef, argc: usize) -> Result<(), String> {
        let (arity, accepts_varargs) = match self.heap.payload(function) {
            ObjPayload::Function(f) => (f.arity, f.accepts_varargs),
            _ => unreachable!(),
        };
        if accepts_varargs && argc >= arity {
            self.pack_varargs(argc, arity);
        } else if argc != arity {
            return Err(format!("Expected {} arguments but got {}.", arity, argc));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        let slots = self.stack.len() - arity - 1;
        self.frames.push(CallFrame { function, ip: 0, slots });
        Ok(())
    }

    fn call_native(&mut self, native: ObjRef, argc: usize) -> Result<(), String> {
        let (arity, accepts_varargs, function) = match self.heap.payload(native) {
            ObjPayload::Native(n) => (n.arity, n.accepts_varargs, n.function),
            _ => unreachable!(),
        };
        if accepts_varargs && argc >= arity {
            self.pack_varargs(argc, arity);
        } else if argc != arity {
            return Err(format!("Expected {} arguments but got {}.", arity, argc));
        }
        let base = self.stack.len() - arity;
        let result = function(self, argc, base)?;
        self.stack.truncate(base - 1);
        self.push(result);
        Ok(())
    }

    fn call_class(&mut self, class: ObjRef, argc: usize) -> Result<(), String> {
        let fields = Rc::new(RefCell::new(ValueTable::new()));
        let instance = self.alloc(ObjPayload::Instance(InstanceObj { class, fields }));
        let callee_slot = self.stack.len() - argc - 1;
        self.stack[callee_slot] = Value::Obj(instance);
        let init = match self.heap.payload(class) {
            ObjPayload::Class(c) => c.init_method,
            _ => unreachable!(),
        };
        match init {
            Some(init) => self.call_function(init, argc),
            None if argc != 0 => Err(format!("Expected 0 arguments but got {}.", argc)),
            None => Ok(()),
        }
    }

    fn call_bound_method(&mut self, bound: ObjRef, argc: usize) -> Result<(), String> {
        let (receiver, method) = match self.heap.payload(bound) {
            ObjPayload::BoundMethod(b) => (b.receiver, b.method),
            _ => unreachable!(),
        };
        let callee_slot = self.stack.len() - argc - 1;
        self.stack[callee_slot] = receiver;
        match self.heap.payload(method) {
            ObjPayload::Function(_) => self.call_function(method, argc),
            ObjPayload::Native(_) => self.call_native(method, argc),
            _ => Err("Unknown bound method type".to_string()),
        }
    }

    // ---- attributes -------------------------------------------------------

    /// Attribute lookup on any object: instance fields before class
    /// methods; the container types consult their builtin method tables;
    /// modules expose their global table.
    fn get_attribute(&self, object: ObjRef, name: ObjRef) -> Option<Value> {
        let key = Value::Obj(name);
        match self.heap.payload(object) {
            ObjPayload::Instance(instance) => {
                if let Some(v) = instance.fields.borrow().get(key, &self.heap) {
                    return Some(v);
                }
                match self.heap.payload(instance.class) {
                    ObjPayload::Class(class) => class.methods.borrow().get(key, &self.heap),
                    _ => None,
                }
            }
            ObjPayload::String(_) => self.builtins.string.get(key, &self.heap),
            ObjPayload::List(_) => self.builtins.list.get(key, &self.heap),
            ObjPayload::Map(_) => self.builtins.map.get(key, &self.heap),
            ObjPayload::Iterator(_) => self.builtins.iterator.get(key, &self.heap),
            ObjPayload::Module(module) => module.globals.borrow().get(key, &self.heap),
            _ => None,
        }
    }

    /// Wraps functions of method kind (and native methods) into a
    /// BoundMethod so a later call still sees its receiver.
    fn bind_method_if_needed(&mut self, receiver: Value, value: Value) -> Value {
        let method = match value {
            Value::Obj(r) => r,
            _ => return value,
        };
        let needs_binding = match self.heap.payload(method) {
            ObjPayload::Function(f) => {
                matches!(f.kind, FunctionKind::Method | FunctionKind::InitMethod)
            }
            ObjPayload::Native(n) => n.kind == FunctionKind::Method,
            _ => false,
        };
        if !needs_binding {
            return value;
        }
        let bound = self.alloc(ObjPayload::BoundMethod(BoundMethodObj { receiver, method }));
        Value::Obj(bound)
    }

    // ---- upvalues ---------------------------------------------------------

    fn open_upvalue_slot(&self, upvalue: ObjRef) -> usize {
        match self.heap.payload(upvalue) {
            ObjPayload::Upvalue(UpvalueObj { state: UpvalueState::Open(s) }) => *s,
            _ => unreachable!("open upvalue list holds only open upvalues"),
        }
    }

    /// Finds or creates the open upvalue for an absolute stack slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        // The list is sorted ascending; search from the high end where
        // recently pushed slots live.
        for i in (0..self.open_upvalues.len()).rev() {
            let existing = self.open_upvalues[i];
            let s = self.open_upvalue_slot(existing);
            if s == slot {
                return existing;
            }
            if s < slot {
                let created = self
                    .alloc(ObjPayload::Upvalue(UpvalueObj { state: UpvalueState::Open(slot) }));
                self.open_upvalues.insert(i + 1, created);
                return created;
            }
        }
        let created =
            self.alloc(ObjPayload::Upvalue(UpvalueObj { state: UpvalueState::Open(slot) }));
        self.open_upvalues.insert(0, created);
        created
    }

    /// Closes every open upvalue whose slot is at or above `threshold`:
    /// the stack value moves into the upvalue object.
    fn close_upvalues(&mut self, threshold: usize) {
        while let Some(&u) = self.open_upvalues.last() {
            let slot = self.open_upvalue_slot(u);
            if slot < threshold {
                break;
            }
            let value = self.stack[slot];
            match self.heap.payload_mut(u) {
                ObjPayload::Upvalue(up) => up.state = UpvalueState::Closed(value),
                _ => unreachable!(),
            }
            self.open_upvalues.pop();
        }
    }

    fn upvalue_location(&self, upvalue: ObjRef) -> UpvalueState {
        match self.heap.payload(upvalue) {
            ObjPayload::Upvalue(u) => u.state,
            _ => unreachable!(),
        }
    }

    // ---- exceptions -------------------------------------------------------

    /// Unwinds to the innermost try frame: rewinds the call stack, closes
    /// upvalues above the restored height, restores the value stack and
    /// pushes the thrown value for the handler.
    fn unwind(&mut self, thrown: Value) -> Result<(), String> {
        let tf = match self.try_frames.pop() {
            Some(tf) => tf,
            None => {
                return Err(format!(
                    "Uncaught exception: {}",
                    self.raw_value_string(thrown)
                ))
            }
        };
        self.heap.cache_push(thrown);
        self.frames.truncate(tf.frame_count);
        let frame = self.frames.last_mut().expect("try frame without call frame");
        frame.ip = tf.handler_ip;
        self.close_upvalues(tf.stack_size);
        self.stack.truncate(tf.stack_size);
        self.push(thrown);
        self.heap.cache_pop(1);
        Ok(())
    }

    fn report_runtime_error(&self, message: &str) {
        eprintln!("{}", message);
        for frame in self.frames.iter().rev() {
            let (line, name) = match self.heap.payload(frame.function) {
                ObjPayload::Function(f) => {
                    let line = f.chunk.line_at(frame.ip.saturating_sub(1));
                    let name = match f.name {
                        Some(n) => self.heap.string(n).to_string(),
                        None => "script".to_string(),
                    };
                    (line, name)
                }
                _ => (0, "script".to_string()),
            };
            eprintln!("[line {}] in {}", line, name);
        }
    }

    // ---- the dispatch loop ------------------------------------------------

    fn run(&mut self) -> InterpretResult {
        loop {
            match self.execute_instruction() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done) => return InterpretResult::Success,
                Err(message) => {
                    if self.try_frames.is_empty() {
                        let full = format!("[line {}] {}: {}", self.line, "Error".red(), message);
                        self.report_runtime_error(&full);
                        return InterpretResult::RuntimeError;
                    }
                    // An active try frame turns the error into a throw of
                    // the message string.
                    let thrown = Value::Obj(self.heap.intern(&message));
                    if let Err(fatal) = self.unwind(thrown) {
                        self.report_runtime_error(&fatal);
                        return InterpretResult::RuntimeError;
                    }
                }
            }
        }
    }

    fn execute_instruction(&mut self) -> Result<Flow, String> {
        {
            let frame = *self.frame();
            self.line = match self.heap.payload(frame.function) {
                ObjPayload::Function(f) => f.chunk.line_at(frame.ip),
                _ => 0,
            };
        }
        if std::env::var("ARIA_TRACE").is_ok() {
            let frame = *self.frame();
            crate::disassembler::trace_instruction(self, frame.function, frame.ip);
        }

        let op = OpCode::try_from(self.read_byte()).map_err(|_| "Invalid opcode.".to_string())?;
        match op {
            OpCode::LoadConst => {
                let constant = self.read_constant();
                self.push(constant);
            }
            OpCode::LoadNil => self.push(Value::Nil),
            OpCode::LoadTrue => self.push(Value::Bool(true)),
            OpCode::LoadFalse => self.push(Value::Bool(false)),
            OpCode::Pop => {
                self.pop();
            }
            OpCode::PopN => {
                let n = self.read_byte() as usize;
                self.pop_n(n);
            }
            OpCode::LoadLocal => {
                let slot = self.read_u16() as usize;
                let base = self.frame().slots;
                self.push(self.stack[base + slot]);
            }
            OpCode::StoreLocal => {
                let slot = self.read_u16() as usize;
                let base = self.frame().slots;
                self.stack[base + slot] = self.peek(0);
            }
            OpCode::LoadUpvalue => {
                let index = self.read_u16() as usize;
                let upvalue = match self.heap.payload(self.frame().function) {
                    ObjPayload::Function(f) => f.upvalues[index],
                    _ => unreachable!(),
                };
                let value = match self.upvalue_location(upvalue) {
                    UpvalueState::Open(slot) => self.stack[slot],
                    UpvalueState::Closed(value) => value,
                };
                self.push(value);
            }
            OpCode::StoreUpvalue => {
                let index = self.read_u16() as usize;
                let upvalue = match self.heap.payload(self.frame().function) {
                    ObjPayload::Function(f) => f.upvalues[index],
                    _ => unreachable!(),
                };
                let value = self.peek(0);
                match self.upvalue_location(upvalue) {
                    UpvalueState::Open(slot) => self.stack[slot] = value,
                    UpvalueState::Closed(_) => match self.heap.payload_mut(upvalue) {
                        ObjPayload::Upvalue(u) => u.state = UpvalueState::Closed(value),
                        _ => unreachable!(),
                    },
                }
            }
            OpCode::CloseUpvalue => {
                self.close_upvalues(self.stack.len() - 1);
                self.pop();
            }
            OpCode::DefGlobal => {
                let name = self.read_string();
                let globals = self.current_globals();
                let is_new = globals.borrow_mut().insert(Value::Obj(name), self.peek(0), &self.heap);
                if !is_new {
                    return Err(format!("Existed variable '{}'.", self.heap.string(name)));
                }
                self.pop();
            }
            OpCode::LoadGlobal => {
                let name = self.read_string();
                let key = Value::Obj(name);
                let globals = self.current_globals();
                let found = globals.borrow().get(key, &self.heap);
                let value = match found {
                    Some(v) => v,
                    None => match self.natives.get(key, &self.heap) {
                        Some(v) => v,
                        None => {
                            return Err(format!(
                                "Undefined variable '{}'.",
                                self.heap.string(name)
                            ))
                        }
                    },
                };
                self.push(value);
            }
            OpCode::StoreGlobal => {
                let name = self.read_string();
                let key = Value::Obj(name);
                let globals = self.current_globals();
                let mut table = globals.borrow_mut();
                if !table.has(key, &self.heap) {
                    return Err(format!("Undefined variable '{}'.", self.heap.string(name)));
                }
                let value = self.peek(0);
                table.insert(key, value, &self.heap);
            }
            OpCode::LoadProperty => {
                let name = self.read_string();
                let receiver = self.peek(0);
                let object = match receiver {
                    Value::Obj(r) => r,
                    _ => return Err("Only objects have properties.".to_string()),
                };
                let value = match self.get_attribute(object, name) {
                    Some(v) => v,
                    None => {
                        return Err(format!(
                            "'{}' object has no attribute '{}'.",
                            value_type_string(receiver, &self.heap),
                            self.heap.string(name)
                        ))
                    }
                };
                let value = self.bind_method_if_needed(receiver, value);
                self.pop();
                self.push(value);
            }
            OpCode::StoreProperty => {
                let name = self.read_string();
                let instance = match self.peek(0) {
                    Value::Obj(r) if matches!(self.heap.payload(r), ObjPayload::Instance(_)) => r,
                    _ => return Err("Only instances have fields.".to_string()),
                };
                self.pop();
                let value = self.peek(0);
                let fields = match self.heap.payload(instance) {
                    ObjPayload::Instance(i) => i.fields.clone(),
                    _ => unreachable!(),
                };
                fields.borrow_mut().insert(Value::Obj(name), value, &self.heap);
                self.heap.recharge(instance);
            }
            OpCode::LoadSubscr => {
                let index = self.peek(0);
                let target = self.peek(1);
                let value = self.subscript_get(target, index)?;
                self.pop_n(2);
                self.push(value);
            }
            OpCode::StoreSubscr => {
                let index = self.peek(0);
                let target = self.peek(1);
                let value = self.peek(2);
                self.subscript_set(target, index, value)?;
                self.pop_n(2);
            }
            OpCode::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(values_same(a, b)));
            }
            OpCode::NotEqual => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(!values_same(a, b)));
            }
            OpCode::Greater => self.binary_compare(|a, b| a > b)?,
            OpCode::GreaterEqual => self.binary_compare(|a, b| a >= b)?,
            OpCode::Less => self.binary_compare(|a, b| a < b)?,
            OpCode::LessEqual => self.binary_compare(|a, b| a <= b)?,
            OpCode::Add => self.op_add()?,
            OpCode::Subtract => self.binary_arith(|a, b| a - b)?,
            OpCode::Multiply => self.binary_arith(|a, b| a * b)?,
            OpCode::Divide => {
                if !self.peek(0).is_number() || !self.peek(1).is_number() {
                    return Err("Operands must be numbers.".to_string());
                }
                let b = self.pop().as_number();
                if b == 0.0 {
                    return Err("Divide by zero.".to_string());
                }
                let a = self.pop().as_number();
                self.push(Value::Number(a / b));
            }
            OpCode::Mod => self.binary_arith(|a, b| a % b)?,
            OpCode::Not => {
                let value = self.pop();
                self.push(Value::Bool(is_falsey(value)));
            }
            OpCode::Negate => {
                if !self.peek(0).is_number() {
                    return Err("Operand must be a number.".to_string());
                }
                let n = self.pop().as_number();
                self.push(Value::Number(-n));
            }
            OpCode::Inc => {
                if !self.peek(0).is_number() {
                    return Err("Operand must be a number.".to_string());
                }
                let n = self.pop().as_number();
                self.push(Value::Number(n + 1.0));
            }
            OpCode::Dec => {
                if !self.peek(0).is_number() {
                    return Err("Operand must be a number.".to_string());
                }
                let n = self.pop().as_number();
                self.push(Value::Number(n - 1.0));
            }
            OpCode::Print => {
                let value = self.pop();
                println!("{}", self.format_value(value));
            }
            OpCode::Nop => {}
            OpCode::JumpFwd => {
                let offset = self.read_u16() as usize;
                self.frames.last_mut().unwrap().ip -= offset;
            }
            OpCode::JumpBwd => {
                let offset = self.read_u16() as usize;
                self.frames.last_mut().unwrap().ip += offset;
            }
            OpCode::JumpTrue => {
                let offset = self.read_u16() as usize;
                let value = self.pop();
                if !is_falsey(value) {
                    self.frames.last_mut().unwrap().ip += offset;
                }
            }
            OpCode::JumpTrueNoPop => {
                let offset = self.read_u16() as usize;
                if !is_falsey(self.peek(0)) {
                    self.frames.last_mut().unwrap().ip += offset;
                }
            }
            OpCode::JumpFalse => {
                let offset = self.read_u16() as usize;
                let value = self.pop();
                if is_falsey(value) {
                    self.frames.last_mut().unwrap().ip += offset;
                }
            }
            OpCode::JumpFalseNoPop => {
                let offset = self.read_u16() as usize;
                if is_falsey(self.peek(0)) {
                    self.frames.last_mut().unwrap().ip += offset;
                }
            }
            OpCode::Call => {
                let argc = self.read_byte() as usize;
                self.call_value(self.peek(argc), argc)?;
            }
            OpCode::Closure => {
                let function = match self.read_constant() {
                    Value::Obj(r) => r,
                    _ => unreachable!("closure constant is not a function"),
                };
                let count = match self.heap.payload(function) {
                    ObjPayload::Function(f) => f.upvalue_count,
                    _ => unreachable!(),
                };
                let mut upvalues = Vec::with_capacity(count);
                for _ in 0..count {
                    let is_local = self.read_byte() != 0;
                    let index = self.read_u16() as usize;
                    if is_local {
                        let base = self.frame().slots;
                        upvalues.push(self.capture_upvalue(base + index));
                    } else {
                        let enclosing = self.frame().function;
                        let upvalue = match self.heap.payload(enclosing) {
                            ObjPayload::Function(f) => f.upvalues[index],
                            _ => unreachable!(),
                        };
                        upvalues.push(upvalue);
                    }
                }
                match self.heap.payload_mut(function) {
                    ObjPayload::Function(f) => f.upvalues = upvalues,
                    _ => unreachable!(),
                }
            }
            OpCode::MakeClass => {
                let name = self.read_string();
                let class = self.alloc(ObjPayload::Class(crate::object::ClassObj {
                    name,
                    methods: Rc::new(RefCell::new(ValueTable::new())),
                    super_class: None,
                    init_method: None,
                }));
                self.push(Value::Obj(class));
            }
            OpCode::Inherit => {
                let super_class = match self.peek(0) {
                    Value::Obj(r) if matches!(self.heap.payload(r), ObjPayload::Class(_)) => r,
                    _ => return Err("Superclass must be a class.".to_string()),
                };
                self.pop();
                let class = self.peek(0).as_obj();
                let (super_methods, class_methods) =
                    match (self.heap.payload(super_class), self.heap.payload(class)) {
                        (ObjPayload::Class(s), ObjPayload::Class(c)) => {
                            (s.methods.clone(), c.methods.clone())
                        }
                        _ => unreachable!(),
                    };
                class_methods.borrow_mut().copy_from(&super_methods.borrow(), &self.heap);
                match self.heap.payload_mut(class) {
                    ObjPayload::Class(c) => c.super_class = Some(super_class),
                    _ => unreachable!(),
                }
                self.heap.recharge(class);
            }
            OpCode::MakeMethod => {
                let name = self.read_string();
                let method = self.peek(0);
                let class = self.peek(1).as_obj();
                let methods = match self.heap.payload(class) {
                    ObjPayload::Class(c) => c.methods.clone(),
                    _ => unreachable!(),
                };
                methods.borrow_mut().insert(Value::Obj(name), method, &self.heap);
                self.heap.recharge(class);
                self.pop();
            }
            OpCode::MakeInitMethod => {
                // Intern before popping so a collection here cannot free
                // the method.
                let name = self.intern("init");
                let method = self.pop();
                let class = self.peek(0).as_obj();
                let methods = match self.heap.payload(class) {
                    ObjPayload::Class(c) => c.methods.clone(),
                    _ => unreachable!(),
                };
                methods.borrow_mut().insert(Value::Obj(name), method, &self.heap);
                match self.heap.payload_mut(class) {
                    ObjPayload::Class(c) => c.init_method = Some(method.as_obj()),
                    _ => unreachable!(),
                }
            }
            OpCode::InvokeMethod => {
                let name = self.read_string();
                let argc = self.read_byte() as usize;
                self.invoke(name, argc)?;
            }
            OpCode::LoadSuperMethod => {
                let name = self.read_string();
                self.op_load_super_method(name)?;
            }
            OpCode::MakeList => {
                let count = self.read_u16() as usize;
                let start = self.stack.len() - count;
                let items: Vec<Value> = self.stack[start..].to_vec();
                let list = self.alloc(ObjPayload::List(ListObj { items }));
                self.stack.truncate(start);
                self.push(Value::Obj(list));
            }
            OpCode::MakeMap => {
                let pairs = self.read_u16() as usize;
                let start = self.stack.len() - pairs * 2;
                let map = self.alloc(ObjPayload::Map(MapObj {
                    table: Rc::new(RefCell::new(ValueTable::new())),
                }));
                let table = match self.heap.payload(map) {
                    ObjPayload::Map(m) => m.table.clone(),
                    _ => unreachable!(),
                };
                for i in 0..pairs {
                    let key = self.stack[start + i * 2];
                    let value = self.stack[start + i * 2 + 1];
                    table.borrow_mut().insert(key, value, &self.heap);
                }
                self.heap.recharge(map);
                self.stack.truncate(start);
                self.push(Value::Obj(map));
            }
            OpCode::Import => {
                let input = self.read_string();
                let alias = self.read_string();
                self.op_import(input, alias)?;
            }
            OpCode::GetIter => {
                let iterator = self.create_iterator(self.peek(0))?;
                self.pop();
                self.push(iterator);
            }
            OpCode::IterHasNext => {
                let iterator = self.expect_iterator()?;
                let has_next = self.iterator_has_next(iterator);
                self.pop();
                self.push(Value::Bool(has_next));
            }
            OpCode::IterGetNext => {
                let iterator = self.expect_iterator()?;
                let value = self.iterator_next(iterator)?;
                self.pop();
                self.push(value);
            }
            OpCode::BeginTry => {
                let offset = self.read_u16() as usize;
                if self.try_frames.len() == FRAMES_MAX {
                    return Err("Stack overflow.".to_string());
                }
                let frame = *self.frame();
                self.try_frames.push(TryFrame {
                    handler_ip: frame.ip + offset,
                    stack_size: self.stack.len(),
                    frame_count: self.frames.len(),
                });
            }
            OpCode::EndTry => {
                self.try_frames.pop();
            }
            OpCode::Throw => {
                let thrown = self.pop();
                self.unwind(thrown)?;
            }
            OpCode::Return => {
                let result = self.pop();
                let frame = *self.frame();
                self.close_upvalues(frame.slots);
                self.frames.pop();
                if self.frames.is_empty() {
                    self.pop(); // the script function itself
                    return Ok(Flow::Done);
                }
                self.stack.truncate(frame.slots);
                self.push(result);
            }
        }
        Ok(Flow::Continue)
    }

    // ---- individual operations --------------------------------------------

    fn binary_compare(&mut self, op: fn(f64, f64) -> bool) -> Result<(), String> {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            return Err("Operands must be numbers.".to_string());
        }
        let b = self.pop().as_number();
        let a = self.pop().as_number();
        self.push(Value::Bool(op(a, b)));
        Ok(())
    }

    fn binary_arith(&mut self, op: fn(f64, f64) -> f64) -> Result<(), String> {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            return Err("Operands must be numbers.".to_string());
        }
        let b = self.pop().as_number();
        let a = self.pop().as_number();
        self.push(Value::Number(op(a, b)));
        Ok(())
    }

    /// ADD: numeric addition or string concatenation.
    fn op_add(&mut self) -> Result<(), String> {
        let b = self.peek(0);
        let a = self.peek(1);
        if let (Value::Obj(ra), Value::Obj(rb)) = (a, b) {
            if matches!(self.heap.payload(ra), ObjPayload::String(_))
                && matches!(self.heap.payload(rb), ObjPayload::String(_))
            {
                let joined = format!("{}{}", self.heap.string(ra), self.heap.string(rb));
                let result = self.intern(&joined);
                self.pop_n(2);
                self.push(Value::Obj(result));
                return Ok(());
            }
        }
        if a.is_number() && b.is_number() {
            self.pop_n(2);
            self.push(Value::Number(a.as_number() + b.as_number()));
            return Ok(());
        }
        Err("Operands must be numbers or strings.".to_string())
    }

    fn invoke(&mut self, name: ObjRef, argc: usize) -> Result<(), String> {
        let receiver = self.peek(argc);
        if let Value::Obj(object) = receiver {
            if let Some(value) = self.get_attribute(object, name) {
                // Plain functions stored as attributes replace the
                // receiver slot; methods keep it as `this`.
                if let Value::Obj(f) = value {
                    if matches!(
                        self.heap.payload(f),
                        ObjPayload::Function(func) if func.kind == FunctionKind::Function
                    ) {
                        let slot = self.stack.len() - argc - 1;
                        self.stack[slot] = value;
                    }
                }
                return self.call_value(value, argc);
            }
        }
        Err(format!(
            "'{}' object has not attribute '{}'.",
            value_type_string(receiver, &self.heap),
            self.heap.string(name)
        ))
    }

    fn op_load_super_method(&mut self, name: ObjRef) -> Result<(), String> {
        let instance = self.pop();
        let class = match instance {
            Value::Obj(r) => match self.heap.payload(r) {
                ObjPayload::Instance(i) => i.class,
                _ => return Err("Only instances have superclasses.".to_string()),
            },
            _ => return Err("Only instances have superclasses.".to_string()),
        };
        let super_class = match self.heap.payload(class) {
            ObjPayload::Class(c) => match c.super_class {
                Some(s) => s,
                None => return Err("Class has no superclass.".to_string()),
            },
            _ => unreachable!(),
        };
        let (methods, init_method, super_name) = match self.heap.payload(super_class) {
            ObjPayload::Class(c) => (c.methods.clone(), c.init_method, c.name),
            _ => unreachable!(),
        };
        let found = methods.borrow().get(Value::Obj(name), &self.heap);
        let method = match found {
            Some(Value::Obj(m)) => m,
            _ => {
                if self.heap.string(name) == "init" {
                    match init_method {
                        Some(m) => m,
                        None => {
                            return Err(format!(
                                "superclass '{}' has no method '{}'",
                                self.heap.string(super_name),
                                self.heap.string(name)
                            ))
                        }
                    }
                } else {
                    return Err(format!(
                        "superclass '{}' has no method '{}'",
                        self.heap.string(super_name),
                        self.heap.string(name)
                    ));
                }
            }
        };
        self.heap.cache_push(instance);
        let bound = self.alloc(ObjPayload::BoundMethod(BoundMethodObj {
            receiver: instance,
            method,
        }));
        self.heap.cache_pop(1);
        self.push(Value::Obj(bound));
        Ok(())
    }

    fn subscript_get(&mut self, target: Value, index: Value) -> Result<Value, String> {
        let object = match target {
            Value::Obj(r) => r,
            _ => return Err("Only objects support subscript access.".to_string()),
        };
        // Character extraction needs a fresh allocation, so borrow the
        // payload only long enough to decide what to produce.
        let char_hit = match self.heap.payload(object) {
            ObjPayload::List(list) => {
                let i = integer_index(index, "index of list")?;
                if i < 0 || i as usize >= list.items.len() {
                    return Err("index out of range".to_string());
                }
                return Ok(list.items[i as usize]);
            }
            ObjPayload::Map(map) => {
                return match map.table.borrow().get(index, &self.heap) {
                    Some(v) => Ok(v),
                    None => Err(format!(
                        "'{}' object does not support subscript access with index '{}'.",
                        value_type_string(target, &self.heap),
                        self.raw_value_string(index)
                    )),
                };
            }
            ObjPayload::String(s) => {
                let i = integer_index(index, "index of string")?;
                match s.chars.chars().nth(i.max(0) as usize) {
                    Some(c) if i >= 0 => c,
                    _ => return Err("index out of range".to_string()),
                }
            }
            _ => {
                return Err(format!(
                    "'{}' object does not support subscript access with index '{}'.",
                    value_type_string(target, &self.heap),
                    self.raw_value_string(index)
                ))
            }
        };
        let s = self.intern(&char_hit.to_string());
        Ok(Value::Obj(s))
    }

    fn subscript_set(&mut self, target: Value, index: Value, value: Value) -> Result<(), String> {
        let object = match target {
            Value::Obj(r) => r,
            _ => return Err("Only objects support subscript assignment.".to_string()),
        };
        match self.heap.payload(object) {
            ObjPayload::List(list) => {
                let i = integer_index(index, "index of list")?;
                if i < 0 || i as usize >= list.items.len() {
                    return Err("index out of range".to_string());
                }
                match self.heap.payload_mut(object) {
                    ObjPayload::List(list) => list.items[i as usize] = value,
                    _ => unreachable!(),
                }
                Ok(())
            }
            ObjPayload::Map(map) => {
                let table = map.table.clone();
                table.borrow_mut().insert(index, value, &self.heap);
                self.heap.recharge(object);
                Ok(())
            }
            _ => Err(format!(
                "'{}' object does not support subscript assignment with index '{}'.",
                value_type_string(target, &self.heap),
                self.raw_value_string(index)
            )),
        }
    }

    /// Builds the single-use iterator object for a list, map or string.
    /// The caller is responsible for keeping `value` reachable.
    pub(crate) fn create_iterator(&mut self, value: Value) -> Result<Value, String> {
        let target = match value {
            Value::Obj(r) => r,
            _ => return Err("Expected an iterable object".to_string()),
        };
        let state = match self.heap.payload(target) {
            ObjPayload::List(_) => IterState::List { next: 0 },
            ObjPayload::String(_) => IterState::Str { next: 0 },
            ObjPayload::Map(m) => IterState::Map { next: m.table.borrow().next_index(None) },
            _ => return Err("Expected an iterable object".to_string()),
        };
        let iterator = self.alloc(ObjPayload::Iterator(IterObj { target, state }));
        Ok(Value::Obj(iterator))
    }

    fn expect_iterator(&self) -> Result<ObjRef, String> {
        match self.peek(0) {
            Value::Obj(r) if matches!(self.heap.payload(r), ObjPayload::Iterator(_)) => Ok(r),
            _ => Err("Expected an iterator object".to_string()),
        }
    }

    pub(crate) fn iterator_has_next(&self, iterator: ObjRef) -> bool {
        let (target, state) = match self.heap.payload(iterator) {
            ObjPayload::Iterator(it) => (it.target, it.state),
            _ => unreachable!(),
        };
        match state {
            IterState::List { next } => match self.heap.payload(target) {
                ObjPayload::List(l) => next < l.items.len(),
                _ => false,
            },
            IterState::Map { next } => next.is_some(),
            IterState::Str { next } => match self.heap.payload(target) {
                ObjPayload::String(s) => next < s.chars.chars().count(),
                _ => false,
            },
        }
    }

    /// Advances the iterator, returning the element (nil when exhausted).
    /// A map element is a fresh two-element [key, value] list.
    pub(crate) fn iterator_next(&mut self, iterator: ObjRef) -> Result<Value, String> {
        let (target, state) = match self.heap.payload(iterator) {
            ObjPayload::Iterator(it) => (it.target, it.state),
            _ => unreachable!(),
        };
        match state {
            IterState::List { next } => {
                let value = match self.heap.payload(target) {
                    ObjPayload::List(l) => l.items.get(next).copied().unwrap_or(Value::Nil),
                    _ => Value::Nil,
                };
                self.set_iter_state(iterator, IterState::List { next: next + 1 });
                Ok(value)
            }
            IterState::Str { next } => {
                let ch = match self.heap.payload(target) {
                    ObjPayload::String(s) => s.chars.chars().nth(next),
                    _ => None,
                };
                self.set_iter_state(iterator, IterState::Str { next: next + 1 });
                match ch {
                    Some(c) => {
                        let s = self.intern(&c.to_string());
                        Ok(Value::Obj(s))
                    }
                    None => Ok(Value::Nil),
                }
            }
            IterState::Map { next } => {
                let index = match next {
                    Some(i) => i,
                    None => return Ok(Value::Nil),
                };
                let table = match self.heap.payload(target) {
                    ObjPayload::Map(m) => m.table.clone(),
                    _ => return Ok(Value::Nil),
                };
                let (key, value) = match table.borrow().pair_at(index) {
                    Some(pair) => pair,
                    None => (Value::Nil, Value::Nil),
                };
                let following = table.borrow().next_index(Some(index));
                self.set_iter_state(iterator, IterState::Map { next: following });
                let pair = self.alloc(ObjPayload::List(ListObj { items: vec![key, value] }));
                Ok(Value::Obj(pair))
            }
        }
    }

    fn set_iter_state(&mut self, iterator: ObjRef, state: IterState) {
        match self.heap.payload_mut(iterator) {
            ObjPayload::Iterator(it) => it.state = state,
            _ => unreachable!(),
        }
    }

    fn op_import(&mut self, input: ObjRef, alias: ObjRef) -> Result<(), String> {
        let input_str = self.heap.string(input).to_string();
        let alias_str = self.heap.string(alias).to_string();
        let path = module::resolve_module_path(&input_str, &self.file_directory)
            .map_err(|_| format!("unable to import module '{}'", alias_str))?;
        if std::env::var("ARIA_TRACE_IMPORT").is_ok() {
            println!("input module: {}", input_str);
            println!("running file directory: {}", self.file_directory.display());
            println!("absolute module path: {}", path.display());
        }
        let path_str = path.to_string_lossy().to_string();
        let path_obj = self.intern(&path_str);
        let path_key = Value::Obj(path_obj);
        self.heap.cache_push(path_key);

        if let Some(module) = self.modules.get(path_key, &self.heap) {
            let globals = self.current_globals();
            globals.borrow_mut().insert(Value::Obj(alias), module, &self.heap);
            self.heap.cache_pop(1);
            // Balance the POP the compiler emits after IMPORT.
            self.push(module);
            return Ok(());
        }

        let source = std::fs::read_to_string(&path)
            .map_err(|_| format!("unable to import module '{}'", alias_str))?;
        let function = match compiler::compile_module(&mut self.heap, &source, &alias_str) {
            Some(f) => f,
            None => {
                self.heap.cache_pop(1);
                return Err(format!("Error in import module '{}'", input_str));
            }
        };
        self.push(Value::Obj(function));
        let module_globals = match self.heap.payload(function) {
            ObjPayload::Function(f) => f.chunk.globals.clone(),
            _ => unreachable!(),
        };
        let module = self.alloc(ObjPayload::Module(ModuleObj {
            name: alias,
            globals: module_globals,
        }));
        let module_value = Value::Obj(module);
        self.heap.cache_push(module_value);
        // Cache before running so circular imports see the (partially
        // populated) namespace instead of recursing forever.
        self.modules.insert(path_key, module_value, &self.heap);
        let globals = self.current_globals();
        globals.borrow_mut().insert(Value::Obj(alias), module_value, &self.heap);
        self.heap.cache_pop(2);
        self.call_function(function, 0)
    }

    // ---- value rendering ---------------------------------------------------

    /// Colourised rendering used by `print` and the REPL.
    pub fn format_value(&self, value: Value) -> String {
        let mut seen = Vec::new();
        self.render_value(value, &mut seen, true)
    }

    /// Plain rendering used by `str`, string conversion and messages.
    pub fn raw_value_string(&self, value: Value) -> String {
        let mut seen = Vec::new();
        self.render_value(value, &mut seen, false)
    }

    fn render_value(&self, value: Value, seen: &mut Vec<ObjRef>, colored: bool) -> String {
        let paint = |text: String, color: &str| -> String {
            if !colored {
                return text;
            }
            match color {
                "green" => text.green().to_string(),
                "yellow" => text.yellow().to_string(),
                "magenta" => text.magenta().to_string(),
                "blue" => text.blue().to_string(),
                _ => text,
            }
        };
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => paint(b.to_string(), "magenta"),
            Value::Number(n) => paint(format_number(n), "green"),
            Value::Obj(r) => match self.heap.payload(r) {
                ObjPayload::String(s) => paint(s.chars.clone(), "yellow"),
                ObjPayload::Function(f) => {
                    let name = match f.name {
                        Some(n) => format!("<fn {}>", self.heap.string(n)),
                        None => "<script>".to_string(),
                    };
                    paint(name, "blue")
                }
                ObjPayload::Native(n) => {
                    paint(format!("<native fn {}>", self.heap.string(n.name)), "blue")
                }
                ObjPayload::Upvalue(_) => "upvalue".to_string(),
                ObjPayload::Class(c) => self.heap.string(c.name).to_string(),
                ObjPayload::Instance(i) => {
                    let class_name = match self.heap.payload(i.class) {
                        ObjPayload::Class(c) => self.heap.string(c.name),
                        _ => "?",
                    };
                    format!("{} instance", class_name)
                }
                ObjPayload::BoundMethod(b) => self.render_value(
                    Value::Obj(b.method),
                    seen,
                    colored,
                ),
                ObjPayload::List(list) => {
                    if seen.contains(&r) {
                        return "[...]".to_string();
                    }
                    seen.push(r);
                    let parts: Vec<String> = list
                        .items
                        .iter()
                        .map(|&v| self.render_value(v, seen, colored))
                        .collect();
                    seen.pop();
                    format!("[{}]", parts.join(","))
                }
                ObjPayload::Map(map) => {
                    if seen.contains(&r) {
                        return "{...}".to_string();
                    }
                    seen.push(r);
                    let parts: Vec<String> = map
                        .table
                        .borrow()
                        .iter()
                        .map(|(k, v)| {
                            format!(
                                "{}:{}",
                                self.render_value(k, seen, colored),
                                self.render_value(v, seen, colored)
                            )
                        })
                        .collect();
                    seen.pop();
                    format!("{{{}}}", parts.join(","))
                }
                ObjPayload::Module(m) => format!("<module {}>", self.heap.string(m.name)),
                ObjPayload::Iterator(_) => "<iterator>".to_string(),
            },
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn format_number(n: f64) -> String {
    // f64 Display already renders integral values without a decimal point.
    format!("{}", n)
}

/// Checks a subscript/argument is an integral number.
pub(crate) fn integer_index(value: Value, what: &str) -> Result<i64, String> {
    match value {
        Value::Number(n) => {
            if n.trunc() != n {
                return Err(format!("{} must be a integer", what));
            }
            Ok(n as i64)
        }
        _ => Err(format!("{} must be a number", what)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_code(source: &str) -> (Vm, InterpretResult) {
        let mut vm = Vm::new();
        let result = vm.interpret(source);
        (vm, result)
    }

    fn global_number(vm: &Vm, name: &str) -> f64 {
        match vm.get_global(name) {
            Some(Value::Number(n)) => n,
            other => panic!("global '{}' is not a number: {:?}", name, other),
        }
    }

    fn global_bool(vm: &Vm, name: &str) -> bool {
        match vm.get_global(name) {
            Some(Value::Bool(b)) => b,
            other => panic!("global '{}' is not a bool: {:?}", name, other),
        }
    }

    fn global_string(vm: &Vm, name: &str) -> String {
        match vm.get_global(name) {
            Some(Value::Obj(r)) => vm.heap.string(r).to_string(),
            other => panic!("global '{}' is not an object: {:?}", name, other),
        }
    }

    #[test]
    fn arithmetic_precedence() {
        let (vm, result) = run_code("var r = 1 + 2 * 3;");
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "r"), 7.0);
    }

    #[test]
    fn for_loop_accumulates() {
        let (vm, result) = run_code("var a = 0; for (var i = 0; i < 5; i = i + 1) a = a + i;");
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "a"), 10.0);
    }

    #[test]
    fn while_loop_with_break_and_continue() {
        let (vm, result) = run_code(
            "var sum = 0; var i = 0;
             while (true) {
                 i = i + 1;
                 if (i > 10) break;
                 if (i % 2 == 0) continue;
                 sum = sum + i;
             }",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "sum"), 25.0);
    }

    #[test]
    fn string_concatenation_and_interning_identity() {
        let (vm, result) = run_code("var s = \"foo\" + \"bar\"; var same = s == \"foobar\";");
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_string(&vm, "s"), "foobar");
        // `==` is identity on objects; interning makes it hold.
        assert!(global_bool(&vm, "same"));
    }

    #[test]
    fn add_type_mismatch_is_a_runtime_error() {
        let (_, result) = run_code("var r = 1 + \"x\";");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn inner_binding_shadows_outer() {
        let (vm, result) = run_code(
            "var r = 0;
             var x = 1;
             { var x = 2; { var x = 3; r = x; } }",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "r"), 3.0);
    }

    #[test]
    fn closure_counter_survives_its_frame() {
        let (vm, result) = run_code(
            "fun make() {
                 var x = 0;
                 fun inc() { x = x + 1; return x; }
                 return inc;
             }
             var c = make();
             var a = c(); var b = c(); var d = c();",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "a"), 1.0);
        assert_eq!(global_number(&vm, "b"), 2.0);
        assert_eq!(global_number(&vm, "d"), 3.0);
    }

    #[test]
    fn sibling_closures_share_one_upvalue() {
        let (vm, result) = run_code(
            "var get; var set;
             fun make() {
                 var x = 10;
                 fun g() { return x; }
                 fun s(v) { x = v; }
                 get = g; set = s;
             }
             make();
             set(42);
             var r = get();",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "r"), 42.0);
    }

    #[test]
    fn class_with_inherited_init() {
        let (vm, result) = run_code(
            "class A { init(n) { this.n = n; } }
             class B : A { init(n) { super.init(n + 1); } }
             var r = B(10).n;",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "r"), 11.0);
    }

    #[test]
    fn methods_bind_their_receiver() {
        let (vm, result) = run_code(
            "class Counter {
                 init() { this.count = 0; }
                 bump() { this.count = this.count + 1; return this.count; }
             }
             var c = Counter();
             var m = c.bump;
             m(); m();
             var r = c.count;",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "r"), 2.0);
    }

    #[test]
    fn inherited_methods_are_callable() {
        let (vm, result) = run_code(
            "class A { hello() { return 5; } }
             class B : A {}
             var r = B().hello();",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "r"), 5.0);
    }

    #[test]
    fn list_literals_subscripts_and_iteration() {
        let (vm, result) = run_code(
            "var l = [1, 2, 3];
             l[0] = 10;
             var sum = 0;
             for (var x in l) sum = sum + x;",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "sum"), 15.0);
    }

    #[test]
    fn map_iteration_yields_key_value_pairs() {
        let (vm, result) = run_code(
            "var m = {\"a\": 1, \"b\": 2};
             var s = 0;
             for (var kv in m) s = s + kv[1];",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "s"), 3.0);
    }

    #[test]
    fn string_iteration_walks_characters() {
        let (vm, result) = run_code(
            "var out = \"\";
             for (var c in \"abc\") out = out + c;",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_string(&vm, "out"), "abc");
    }

    #[test]
    fn break_terminates_for_in() {
        let (vm, result) = run_code(
            "var n = 0;
             for (var x in [1, 2, 3, 4]) {
                 if (x == 3) break;
                 n = n + 1;
             }",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "n"), 2.0);
    }

    #[test]
    fn thrown_value_reaches_the_catch_binding() {
        let (vm, result) = run_code(
            "var r = \"\";
             try { throw \"boom\"; } catch (e) { r = e; }",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_string(&vm, "r"), "boom");
    }

    #[test]
    fn stack_height_is_restored_after_catch() {
        let (vm, result) = run_code(
            "var r = 0;
             fun risky() { throw 13; }
             try { var a = 1; risky(); var b = 2; } catch (e) { r = e; }
             var after = 99;",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "r"), 13.0);
        assert_eq!(global_number(&vm, "after"), 99.0);
    }

    #[test]
    fn uncaught_throw_is_a_runtime_error() {
        let (_, result) = run_code("throw \"nope\";");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn runtime_errors_become_catchable_throws() {
        let (vm, result) = run_code(
            "var r = \"\";
             try { var x = 1 / 0; } catch (e) { r = e; }",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_string(&vm, "r"), "Divide by zero.");
    }

    #[test]
    fn storing_an_undefined_global_fails_without_defining_it() {
        let (_, result) = run_code("missing = 1;");
        assert_eq!(result, InterpretResult::RuntimeError);
        // And the name stays undefined afterwards.
        let (_, result) = run_code(
            "try { missing = 1; } catch (e) {}
             var r = missing;",
        );
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn global_redeclaration_is_a_runtime_error() {
        let (_, result) = run_code("var a = 1; var a = 2;");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn calling_a_non_callable_fails() {
        let (_, result) = run_code("var x = 1; x();");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn arity_mismatch_is_reported() {
        let (_, result) = run_code("fun f(a, b) { return a; } f(1);");
        assert_eq!(result, InterpretResult::RuntimeError);
    }

    #[test]
    fn varargs_pack_surplus_arguments() {
        let (vm, result) = run_code(
            "fun f(first, ...rest) { return rest.size(); }
             var r = f(1, 2, 3, 4);",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "r"), 3.0);
    }

    #[test]
    fn logical_operators_short_circuit_to_discriminant() {
        let (vm, result) = run_code(
            "var a = nil or 3;
             var b = false and 9;
             var c = 1 and 2;",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "a"), 3.0);
        assert!(!global_bool(&vm, "b"));
        assert_eq!(global_number(&vm, "c"), 2.0);
    }

    #[test]
    fn compound_assignment_on_subscript() {
        let (vm, result) = run_code("var m = {\"k\": 1}; m[\"k\"] += 4; var r = m[\"k\"];");
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "r"), 5.0);
    }

    #[test]
    fn deep_equality_is_the_equals_native() {
        let (vm, result) = run_code(
            "var a = [1, 2, [3]];
             var b = [1, 2, [3]];
             var shallow = a == b;
             var deep = equals(a, b);",
        );
        assert_eq!(result, InterpretResult::Success);
        assert!(!global_bool(&vm, "shallow"));
        assert!(global_bool(&vm, "deep"));
    }

    #[test]
    fn stress_mode_collection_preserves_behaviour() {
        let mut vm = Vm::new();
        vm.heap.set_stress(true);
        let result = vm.interpret(
            "fun make(n) {
                 var acc = [];
                 for (var i = 0; i < n; i = i + 1) acc.append(\"item\" + str(i));
                 return acc;
             }
             var l = make(20);
             var r = l.size();
             var m = {\"a\": [1, 2], \"b\": \"text\"};
             var total = 0;
             for (var kv in m) total = total + 1;",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "r"), 20.0);
        assert_eq!(global_number(&vm, "total"), 2.0);
    }

    #[test]
    fn collection_reclaims_unreachable_cycles() {
        let mut vm = Vm::new();
        let result = vm.interpret(
            "for (var i = 0; i < 50; i = i + 1) {
                 var a = [];
                 var b = [a];
                 a.append(b);
             }",
        );
        assert_eq!(result, InterpretResult::Success);
        let before = vm.heap.live_objects();
        // Nothing kept those pairs alive; a manual collection drops them.
        vm.collect_garbage();
        assert!(vm.heap.live_objects() <= before);
    }

    #[test]
    fn repl_lines_share_globals() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret_line("var x = 1;"), InterpretResult::Success);
        assert_eq!(vm.interpret_line("var y = x + 1;"), InterpretResult::Success);
        assert_eq!(global_number(&vm, "y"), 2.0);
    }

    #[test]
    fn modules_are_cached_by_absolute_path() {
        let dir = std::env::temp_dir().join("aria_vm_import_test");
        let _ = std::fs::create_dir_all(&dir);
        std::fs::write(
            dir.join("counter.aria"),
            "var loads = 0;\nloads = loads + 1;\nvar value = 7;\n",
        )
        .unwrap();
        let main_path = dir.join("main.aria");
        std::fs::write(
            &main_path,
            "import counter;\nimport counter as again;\nvar a = counter.value;\nvar b = again.loads;\n",
        )
        .unwrap();

        let mut vm = Vm::new();
        let source = std::fs::read_to_string(&main_path).unwrap();
        let result = vm.interpret_file(main_path.to_str().unwrap(), &source);
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "a"), 7.0);
        // The module body ran exactly once.
        assert_eq!(global_number(&vm, "b"), 1.0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn self_referential_list_prints_with_cycle_marker() {
        let mut vm = Vm::new();
        let result = vm.interpret("var l = [1]; l.append(l);");
        assert_eq!(result, InterpretResult::Success);
        let l = vm.get_global("l").unwrap();
        assert_eq!(vm.raw_value_string(l), "[1,[...]]");
    }

    #[test]
    fn negative_literals_in_initializers() {
        let (vm, result) = run_code("var a = -5; var b = a - -3;");
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(global_number(&vm, "a"), -5.0);
        assert_eq!(global_number(&vm, "b"), -2.0);
    }
}
