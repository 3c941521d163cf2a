// File: src/builtins.rs
//
// The native environment: global native functions and variables plus the
// per-type builtin method tables for strings, lists, maps and iterators.
// Every entry is installed once at VM construction; attribute access on
// the container types consults these tables after instance fields fail.
//
// Natives receive the argument window as (argc, base): arguments sit at
// stack[base..], and for method-kind natives the receiver is at base - 1.
// Errors are plain strings; the VM turns them into catchable throws.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use once_cell::sync::Lazy;
use rand::Rng;

use crate::heap::ObjRef;
use crate::object::{
    FunctionKind, InstanceObj, ListObj, MapObj, NativeFn, NativeObj, ObjPayload,
};
use crate::table::ValueTable;
use crate::value::{value_type_string, values_equal, Value};
use crate::vm::Vm;

/// Time origin for the `clock` native.
static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Registers the full native environment on a fresh VM.
pub fn install(vm: &mut Vm) {
    define_native(vm, "clock", 0, native_clock, false);
    define_native(vm, "random", 0, native_random, false);
    define_native(vm, "println", 1, native_println, true);
    define_native(vm, "readline", 0, native_readline, false);
    define_native(vm, "typeof", 1, native_typeof, false);
    define_native(vm, "str", 1, native_str, false);
    define_native(vm, "num", 1, native_num, false);
    define_native(vm, "bool", 1, native_bool, false);
    define_native(vm, "copy", 1, native_copy, false);
    define_native(vm, "equals", 2, native_equals, false);
    define_native(vm, "iterator", 1, native_iterator, false);
    define_native(vm, "exit", 1, native_exit, false);
    define_native_var(vm, "pi", Value::Number(std::f64::consts::PI));
    define_native_var(vm, "e", Value::Number(std::f64::consts::E));
    define_native_var(vm, "_", Value::Nil);
    define_native_class(vm, "object");

    let mut table = ValueTable::new();
    bind_method(vm, &mut table, "length", 0, string_length);
    bind_method(vm, &mut table, "at", 1, string_at);
    bind_method(vm, &mut table, "substr", 2, string_substr);
    bind_method(vm, &mut table, "findstr", 1, string_findstr);
    bind_method(vm, &mut table, "concat", 1, string_concat);
    bind_method(vm, &mut table, "startWith", 1, string_start_with);
    bind_method(vm, &mut table, "endWith", 1, string_end_with);
    bind_method(vm, &mut table, "reverse", 0, string_reverse);
    bind_method(vm, &mut table, "upper", 0, string_upper);
    bind_method(vm, &mut table, "lower", 0, string_lower);
    bind_method(vm, &mut table, "trim", 0, string_trim);
    bind_method(vm, &mut table, "ltrim", 0, string_ltrim);
    bind_method(vm, &mut table, "rtrim", 0, string_rtrim);
    bind_method(vm, &mut table, "split", 1, string_split);
    vm.builtins.string = table;

    let mut table = ValueTable::new();
    bind_method(vm, &mut table, "append", 1, list_append);
    bind_method(vm, &mut table, "extend", 1, list_extend);
    bind_method(vm, &mut table, "size", 0, list_size);
    bind_method(vm, &mut table, "empty", 0, list_empty);
    bind_method(vm, &mut table, "pop", 0, list_pop);
    bind_method(vm, &mut table, "insert", 2, list_insert);
    bind_method(vm, &mut table, "remove", 1, list_remove);
    bind_method(vm, &mut table, "at", 1, list_at);
    bind_method(vm, &mut table, "clear", 0, list_clear);
    bind_method(vm, &mut table, "slice", 2, list_slice);
    bind_method(vm, &mut table, "reverse", 0, list_reverse);
    bind_method(vm, &mut table, "equals", 1, list_equals);
    vm.builtins.list = table;

    let mut table = ValueTable::new();
    bind_method(vm, &mut table, "insert", 2, map_insert);
    bind_method(vm, &mut table, "get", 1, map_get);
    bind_method(vm, &mut table, "remove", 1, map_remove);
    bind_method(vm, &mut table, "has", 1, map_has);
    bind_method(vm, &mut table, "size", 0, map_size);
    bind_method(vm, &mut table, "empty", 0, map_empty);
    bind_method(vm, &mut table, "clear", 0, map_clear);
    bind_method(vm, &mut table, "keys", 0, map_keys);
    bind_method(vm, &mut table, "values", 0, map_values);
    bind_method(vm, &mut table, "pairs", 0, map_pairs);
    bind_method(vm, &mut table, "equals", 1, map_equals);
    vm.builtins.map = table;

    let mut table = ValueTable::new();
    bind_method(vm, &mut table, "hasNext", 0, iterator_has_next);
    bind_method(vm, &mut table, "next", 0, iterator_next);
    vm.builtins.iterator = table;
}

fn define_native(vm: &mut Vm, name: &str, arity: usize, function: NativeFn, varargs: bool) {
    let name_ref = vm.heap.intern(name);
    let native = vm.heap.alloc(ObjPayload::Native(NativeObj {
        kind: FunctionKind::Function,
        function,
        name: name_ref,
        arity,
        accepts_varargs: varargs,
    }));
    vm.natives.insert(Value::Obj(name_ref), Value::Obj(native), &vm.heap);
}

fn define_native_var(vm: &mut Vm, name: &str, value: Value) {
    let name_ref = vm.heap.intern(name);
    vm.natives.insert(Value::Obj(name_ref), value, &vm.heap);
}

fn define_native_class(vm: &mut Vm, name: &str) {
    let name_ref = vm.heap.intern(name);
    let class = vm.heap.alloc(ObjPayload::Class(crate::object::ClassObj {
        name: name_ref,
        methods: Rc::new(RefCell::new(ValueTable::new())),
        super_class: None,
        init_method: None,
    }));
    vm.natives.insert(Value::Obj(name_ref), Value::Obj(class), &vm.heap);
}

fn bind_method(vm: &mut Vm, table: &mut ValueTable, name: &str, arity: usize, function: NativeFn) {
    let name_ref = vm.heap.intern(name);
    let native = vm.heap.alloc(ObjPayload::Native(NativeObj {
        kind: FunctionKind::Method,
        function,
        name: name_ref,
        arity,
        accepts_varargs: false,
    }));
    table.insert(Value::Obj(name_ref), Value::Obj(native), &vm.heap);
}

// ---- argument plumbing -----------------------------------------------------

fn arg(vm: &Vm, base: usize, index: usize) -> Value {
    vm.stack_at(base + index)
}

fn receiver(vm: &Vm, base: usize) -> ObjRef {
    match vm.stack_at(base - 1) {
        Value::Obj(r) => r,
        _ => unreachable!("builtin method without object receiver"),
    }
}

fn string_arg(vm: &Vm, value: Value, message: &str) -> Result<String, String> {
    if let Value::Obj(r) = value {
        if let ObjPayload::String(s) = vm.heap.payload(r) {
            return Ok(s.chars.clone());
        }
    }
    Err(message.to_string())
}

fn list_arg(vm: &Vm, value: Value) -> Result<ObjRef, String> {
    if let Value::Obj(r) = value {
        if matches!(vm.heap.payload(r), ObjPayload::List(_)) {
            return Ok(r);
        }
    }
    Err("Argument must be a list".to_string())
}

fn integer_arg(value: Value) -> Result<i64, String> {
    crate::vm::integer_index(value, "argument")
}

fn receiver_string(vm: &Vm, base: usize) -> String {
    let r = receiver(vm, base);
    match vm.heap.payload(r) {
        ObjPayload::String(s) => s.chars.clone(),
        _ => unreachable!("string method on non-string"),
    }
}

fn list_items(vm: &Vm, list: ObjRef) -> Vec<Value> {
    match vm.heap.payload(list) {
        ObjPayload::List(l) => l.items.clone(),
        _ => unreachable!("list access on non-list"),
    }
}

fn map_table(vm: &Vm, map: ObjRef) -> Rc<RefCell<ValueTable>> {
    match vm.heap.payload(map) {
        ObjPayload::Map(m) => m.table.clone(),
        _ => unreachable!("map access on non-map"),
    }
}

// ---- global natives --------------------------------------------------------

fn native_clock(_vm: &mut Vm, _argc: usize, _base: usize) -> Result<Value, String> {
    Ok(Value::Number(START.elapsed().as_secs_f64()))
}

fn native_random(_vm: &mut Vm, _argc: usize, _base: usize) -> Result<Value, String> {
    let n: i32 = rand::thread_rng().gen_range(0..i32::MAX);
    Ok(Value::Number(n as f64))
}

/// println(fmt, ...) — with one argument prints it; with more, `{}`
/// placeholders in the first (string) argument are substituted with raw
/// renderings of the rest.
fn native_println(vm: &mut Vm, argc: usize, base: usize) -> Result<Value, String> {
    // Varargs packed everything into the single formal slot.
    let list = match arg(vm, base, 0) {
        Value::Obj(r) => r,
        _ => unreachable!("println arguments are packed into a list"),
    };
    let items = list_items(vm, list);
    if argc == 1 {
        println!("{}", vm.format_value(items[0]));
        return Ok(Value::Nil);
    }
    let format = vm.raw_value_string(items[0]);
    let mut out = String::new();
    let mut next = 1;
    let chars: Vec<char> = format.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '{' && i + 1 < chars.len() && chars[i + 1] == '}' {
            if next < items.len() {
                out.push_str(&vm.raw_value_string(items[next]));
                next += 1;
            } else {
                out.push_str("{}");
            }
            i += 2;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    use colored::Colorize;
    println!("{}", out.yellow());
    Ok(Value::Nil)
}

fn native_readline(vm: &mut Vm, _argc: usize, _base: usize) -> Result<Value, String> {
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .map_err(|e| format!("readline failed: {}", e))?;
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Value::Obj(vm.intern(&line)))
}

fn native_typeof(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let name = value_type_string(arg(vm, base, 0), &vm.heap);
    Ok(Value::Obj(vm.intern(name)))
}

fn native_str(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let text = vm.raw_value_string(arg(vm, base, 0));
    Ok(Value::Obj(vm.intern(&text)))
}

fn native_num(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let text = string_arg(vm, arg(vm, base, 0), "argument must be a string")?;
    match text.trim().parse::<f64>() {
        Ok(n) => Ok(Value::Number(n)),
        Err(_) => Ok(Value::Nil),
    }
}

fn native_bool(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let text = string_arg(vm, arg(vm, base, 0), "argument must be a string")?;
    match text.as_str() {
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        _ => Err("Invalid boolean string".to_string()),
    }
}

/// Shallow copy of a list, map or instance; nil for everything else.
fn native_copy(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let source = match arg(vm, base, 0) {
        Value::Obj(r) => r,
        _ => return Ok(Value::Nil),
    };
    match vm.heap.payload(source) {
        ObjPayload::List(l) => {
            let items = l.items.clone();
            let copy = vm.alloc(ObjPayload::List(ListObj { items }));
            Ok(Value::Obj(copy))
        }
        ObjPayload::Map(m) => {
            let mut table = ValueTable::new();
            table.copy_from(&m.table.borrow(), &vm.heap);
            let copy = vm.alloc(ObjPayload::Map(MapObj { table: Rc::new(RefCell::new(table)) }));
            Ok(Value::Obj(copy))
        }
        ObjPayload::Instance(i) => {
            let class = i.class;
            let mut fields = ValueTable::new();
            fields.copy_from(&i.fields.borrow(), &vm.heap);
            let copy = vm.alloc(ObjPayload::Instance(InstanceObj {
                class,
                fields: Rc::new(RefCell::new(fields)),
            }));
            Ok(Value::Obj(copy))
        }
        _ => Ok(Value::Nil),
    }
}

fn native_equals(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let equal = values_equal(arg(vm, base, 0), arg(vm, base, 1), &vm.heap);
    Ok(Value::Bool(equal))
}

fn native_iterator(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    match arg(vm, base, 0) {
        v @ Value::Obj(_) => vm.create_iterator(v).or(Ok(Value::Nil)),
        _ => Ok(Value::Nil),
    }
}

fn native_exit(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let code = match arg(vm, base, 0) {
        Value::Number(n) => n as i32,
        _ => 1,
    };
    std::process::exit(code);
}

// ---- string methods --------------------------------------------------------

fn string_length(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    Ok(Value::Number(receiver_string(vm, base).chars().count() as f64))
}

fn string_at(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let text = receiver_string(vm, base);
    let index = integer_arg(arg(vm, base, 0))?;
    let chars: Vec<char> = text.chars().collect();
    if index < 0 || index as usize >= chars.len() {
        return Err("index out of range".to_string());
    }
    Ok(Value::Obj(vm.intern(&chars[index as usize].to_string())))
}

fn string_substr(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let text = receiver_string(vm, base);
    let chars: Vec<char> = text.chars().collect();
    let start = integer_arg(arg(vm, base, 0))?;
    if start < 0 || start as usize >= chars.len() {
        return Err("start index out of range".to_string());
    }
    let end = integer_arg(arg(vm, base, 1))?;
    if end < 0 || end as usize >= chars.len() {
        return Err("end index out of range".to_string());
    }
    if end < start {
        return Err("start index should be smaller than end index".to_string());
    }
    let piece: String = chars[start as usize..end as usize].iter().collect();
    Ok(Value::Obj(vm.intern(&piece)))
}

fn string_findstr(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let text = receiver_string(vm, base);
    let needle = string_arg(vm, arg(vm, base, 0), "argument must be a string")?;
    match text.find(&needle) {
        Some(byte_index) => {
            let char_index = text[..byte_index].chars().count();
            Ok(Value::Number(char_index as f64))
        }
        None => Ok(Value::Number(-1.0)),
    }
}

fn string_concat(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let text = receiver_string(vm, base);
    let other = string_arg(vm, arg(vm, base, 0), "argument must be a string")?;
    Ok(Value::Obj(vm.intern(&format!("{}{}", text, other))))
}

fn string_start_with(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let text = receiver_string(vm, base);
    let prefix = string_arg(vm, arg(vm, base, 0), "argument must be a string")?;
    Ok(Value::Bool(text.starts_with(&prefix)))
}

fn string_end_with(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let text = receiver_string(vm, base);
    let suffix = string_arg(vm, arg(vm, base, 0), "argument must be a string")?;
    Ok(Value::Bool(text.ends_with(&suffix)))
}

fn string_reverse(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let reversed: String = receiver_string(vm, base).chars().rev().collect();
    Ok(Value::Obj(vm.intern(&reversed)))
}

fn string_upper(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let upper = receiver_string(vm, base).to_uppercase();
    Ok(Value::Obj(vm.intern(&upper)))
}

fn string_lower(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let lower = receiver_string(vm, base).to_lowercase();
    Ok(Value::Obj(vm.intern(&lower)))
}

fn string_trim(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let trimmed = receiver_string(vm, base).trim().to_string();
    Ok(Value::Obj(vm.intern(&trimmed)))
}

fn string_ltrim(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let trimmed = receiver_string(vm, base).trim_start().to_string();
    Ok(Value::Obj(vm.intern(&trimmed)))
}

fn string_rtrim(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let trimmed = receiver_string(vm, base).trim_end().to_string();
    Ok(Value::Obj(vm.intern(&trimmed)))
}

/// split(sep) — empty separator splits into single characters.
fn string_split(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let text = receiver_string(vm, base);
    let separator = string_arg(vm, arg(vm, base, 0), "argument must be a string")?;
    let pieces: Vec<String> = if separator.is_empty() {
        text.chars().map(|c| c.to_string()).collect()
    } else {
        text.split(&separator).map(|s| s.to_string()).collect()
    };
    let mut items = Vec::with_capacity(pieces.len());
    for piece in &pieces {
        let s = vm.intern(piece);
        // Keep already-built elements reachable across interning.
        vm.heap.cache_push(Value::Obj(s));
        items.push(Value::Obj(s));
    }
    let count = items.len();
    let list = vm.alloc(ObjPayload::List(ListObj { items }));
    vm.heap.cache_pop(count);
    Ok(Value::Obj(list))
}

// ---- list methods ----------------------------------------------------------

fn list_append(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let list = receiver(vm, base);
    let value = arg(vm, base, 0);
    match vm.heap.payload_mut(list) {
        ObjPayload::List(l) => l.items.push(value),
        _ => unreachable!(),
    }
    vm.heap.recharge(list);
    Ok(Value::Nil)
}

fn list_extend(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let list = receiver(vm, base);
    let other = list_arg(vm, arg(vm, base, 0))?;
    let extra = list_items(vm, other);
    match vm.heap.payload_mut(list) {
        ObjPayload::List(l) => l.items.extend(extra),
        _ => unreachable!(),
    }
    vm.heap.recharge(list);
    Ok(Value::Nil)
}

fn list_size(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let list = receiver(vm, base);
    Ok(Value::Number(list_items(vm, list).len() as f64))
}

fn list_empty(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let list = receiver(vm, base);
    Ok(Value::Bool(list_items(vm, list).is_empty()))
}

fn list_pop(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let list = receiver(vm, base);
    match vm.heap.payload_mut(list) {
        ObjPayload::List(l) => {
            l.items.pop();
        }
        _ => unreachable!(),
    }
    Ok(Value::Nil)
}

/// insert(index, value) — false when the index is out of bounds.
fn list_insert(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let list = receiver(vm, base);
    let index = integer_arg(arg(vm, base, 0))?;
    let value = arg(vm, base, 1);
    let len = list_items(vm, list).len();
    if index < 0 || index as usize > len {
        return Ok(Value::Bool(false));
    }
    match vm.heap.payload_mut(list) {
        ObjPayload::List(l) => l.items.insert(index as usize, value),
        _ => unreachable!(),
    }
    vm.heap.recharge(list);
    Ok(Value::Bool(true))
}

fn list_remove(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let list = receiver(vm, base);
    let index = integer_arg(arg(vm, base, 0))?;
    let len = list_items(vm, list).len();
    if index < 0 || index as usize >= len {
        return Err("Index out of range".to_string());
    }
    match vm.heap.payload_mut(list) {
        ObjPayload::List(l) => {
            l.items.remove(index as usize);
        }
        _ => unreachable!(),
    }
    Ok(Value::Bool(true))
}

fn list_at(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let list = receiver(vm, base);
    let index = integer_arg(arg(vm, base, 0))?;
    let items = list_items(vm, list);
    if index < 0 || index as usize >= items.len() {
        return Err("index out of range".to_string());
    }
    Ok(items[index as usize])
}

fn list_clear(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let list = receiver(vm, base);
    match vm.heap.payload_mut(list) {
        ObjPayload::List(l) => l.items.clear(),
        _ => unreachable!(),
    }
    Ok(Value::Nil)
}

/// slice(start, end) — a fresh list of [start, end).
fn list_slice(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let list = receiver(vm, base);
    let items = list_items(vm, list);
    let start = integer_arg(arg(vm, base, 0))?;
    if start < 0 || start as usize >= items.len() {
        return Err("start index out of range".to_string());
    }
    let end = integer_arg(arg(vm, base, 1))?;
    if end < 0 || end as usize >= items.len() {
        return Err("end index out of range".to_string());
    }
    if end < start {
        return Err("start index should be smaller than end index".to_string());
    }
    let piece = items[start as usize..end as usize].to_vec();
    let sliced = vm.alloc(ObjPayload::List(ListObj { items: piece }));
    Ok(Value::Obj(sliced))
}

fn list_reverse(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let list = receiver(vm, base);
    match vm.heap.payload_mut(list) {
        ObjPayload::List(l) => l.items.reverse(),
        _ => unreachable!(),
    }
    Ok(Value::Nil)
}

fn list_equals(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let list = receiver(vm, base);
    let other = list_arg(vm, arg(vm, base, 0))?;
    let equal = values_equal(Value::Obj(list), Value::Obj(other), &vm.heap);
    Ok(Value::Bool(equal))
}

// ---- map methods -----------------------------------------------------------

fn map_insert(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let map = receiver(vm, base);
    let key = arg(vm, base, 0);
    let value = arg(vm, base, 1);
    let table = map_table(vm, map);
    let is_new = table.borrow_mut().insert(key, value, &vm.heap);
    vm.heap.recharge(map);
    Ok(Value::Bool(is_new))
}

fn map_get(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let map = receiver(vm, base);
    let key = arg(vm, base, 0);
    let table = map_table(vm, map);
    let value = table.borrow().get(key, &vm.heap);
    Ok(value.unwrap_or(Value::Nil))
}

fn map_remove(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let map = receiver(vm, base);
    let key = arg(vm, base, 0);
    let table = map_table(vm, map);
    let removed = table.borrow_mut().remove(key, &vm.heap);
    Ok(Value::Bool(removed))
}

fn map_has(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let map = receiver(vm, base);
    let key = arg(vm, base, 0);
    let table = map_table(vm, map);
    let has = table.borrow().has(key, &vm.heap);
    Ok(Value::Bool(has))
}

fn map_size(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let map = receiver(vm, base);
    let len = map_table(vm, map).borrow().len();
    Ok(Value::Number(len as f64))
}

fn map_empty(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let map = receiver(vm, base);
    let empty = map_table(vm, map).borrow().is_empty();
    Ok(Value::Bool(empty))
}

fn map_clear(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let map = receiver(vm, base);
    map_table(vm, map).borrow_mut().clear();
    Ok(Value::Nil)
}

fn map_keys(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let map = receiver(vm, base);
    let keys = map_table(vm, map).borrow().keys();
    let list = vm.alloc(ObjPayload::List(ListObj { items: keys }));
    Ok(Value::Obj(list))
}

fn map_values(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let map = receiver(vm, base);
    let values = map_table(vm, map).borrow().values();
    let list = vm.alloc(ObjPayload::List(ListObj { items: values }));
    Ok(Value::Obj(list))
}

/// pairs() — a list of fresh [key, value] lists in capacity order.
fn map_pairs(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let map = receiver(vm, base);
    let table = map_table(vm, map);
    let entries: Vec<(Value, Value)> = table.borrow().iter().collect();
    let mut items = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let pair = vm.alloc(ObjPayload::List(ListObj { items: vec![key, value] }));
        vm.heap.cache_push(Value::Obj(pair));
        items.push(Value::Obj(pair));
    }
    let count = items.len();
    let list = vm.alloc(ObjPayload::List(ListObj { items }));
    vm.heap.cache_pop(count);
    Ok(Value::Obj(list))
}

fn map_equals(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let map = receiver(vm, base);
    let other = match arg(vm, base, 0) {
        Value::Obj(r) if matches!(vm.heap.payload(r), ObjPayload::Map(_)) => r,
        _ => return Err("Argument must be a map".to_string()),
    };
    let equal = values_equal(Value::Obj(map), Value::Obj(other), &vm.heap);
    Ok(Value::Bool(equal))
}

// ---- iterator methods ------------------------------------------------------

fn iterator_has_next(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let iterator = receiver(vm, base);
    Ok(Value::Bool(vm.iterator_has_next(iterator)))
}

fn iterator_next(vm: &mut Vm, _argc: usize, base: usize) -> Result<Value, String> {
    let iterator = receiver(vm, base);
    vm.iterator_next(iterator)
}

#[cfg(test)]
mod tests {
    use crate::errors::InterpretResult;
    use crate::value::Value;
    use crate::vm::Vm;

    fn run(source: &str) -> (Vm, InterpretResult) {
        let mut vm = Vm::new();
        let result = vm.interpret(source);
        (vm, result)
    }

    fn number(vm: &Vm, name: &str) -> f64 {
        match vm.get_global(name) {
            Some(Value::Number(n)) => n,
            other => panic!("global '{}' is not a number: {:?}", name, other),
        }
    }

    fn string(vm: &Vm, name: &str) -> String {
        match vm.get_global(name) {
            Some(Value::Obj(r)) => vm.heap.string(r).to_string(),
            other => panic!("global '{}' is not a string: {:?}", name, other),
        }
    }

    fn boolean(vm: &Vm, name: &str) -> bool {
        match vm.get_global(name) {
            Some(Value::Bool(b)) => b,
            other => panic!("global '{}' is not a bool: {:?}", name, other),
        }
    }

    #[test]
    fn string_methods() {
        let (vm, result) = run(
            "var s = \"  Hello, World  \";
             var t = s.trim();
             var up = t.upper();
             var low = t.lower();
             var len = t.length();
             var idx = t.findstr(\"World\");
             var sub = t.substr(0, 5);
             var rev = \"abc\".reverse();
             var starts = t.startWith(\"Hello\");
             var ends = t.endWith(\"World\");",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(string(&vm, "t"), "Hello, World");
        assert_eq!(string(&vm, "up"), "HELLO, WORLD");
        assert_eq!(string(&vm, "low"), "hello, world");
        assert_eq!(number(&vm, "len"), 12.0);
        assert_eq!(number(&vm, "idx"), 7.0);
        assert_eq!(string(&vm, "sub"), "Hello");
        assert_eq!(string(&vm, "rev"), "cba");
        assert!(boolean(&vm, "starts"));
        assert!(boolean(&vm, "ends"));
    }

    #[test]
    fn string_split() {
        let (vm, result) = run(
            "var parts = \"a,b,c\".split(\",\");
             var n = parts.size();
             var first = parts[0];
             var chars = \"xy\".split(\"\");
             var m = chars.size();",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(number(&vm, "n"), 3.0);
        assert_eq!(string(&vm, "first"), "a");
        assert_eq!(number(&vm, "m"), 2.0);
    }

    #[test]
    fn list_methods() {
        let (vm, result) = run(
            "var l = [3, 1];
             l.append(2);
             l.insert(0, 0);
             var size = l.size();
             var second = l.at(1);
             l.remove(0);
             l.reverse();
             var head = l[0];
             var sl = l.slice(0, 2);
             var sn = sl.size();
             var eq = l.equals(copy(l));
             l.clear();
             var cleared = l.empty();",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(number(&vm, "size"), 4.0);
        assert_eq!(number(&vm, "second"), 3.0);
        assert_eq!(number(&vm, "head"), 2.0);
        assert_eq!(number(&vm, "sn"), 2.0);
        assert!(boolean(&vm, "eq"));
        assert!(boolean(&vm, "cleared"));
    }

    #[test]
    fn map_methods() {
        let (vm, result) = run(
            "var m = {};
             m.insert(\"a\", 1);
             m.insert(\"b\", 2);
             var got = m.get(\"a\");
             var missing = m.get(\"zzz\");
             var has = m.has(\"b\");
             var size = m.size();
             var keys = m.keys();
             var vals = m.values();
             var pairs = m.pairs();
             var pn = pairs.size();
             m.remove(\"a\");
             var size2 = m.size();",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(number(&vm, "got"), 1.0);
        assert_eq!(vm.get_global("missing"), Some(Value::Nil));
        assert!(boolean(&vm, "has"));
        assert_eq!(number(&vm, "size"), 2.0);
        assert_eq!(number(&vm, "pn"), 2.0);
        assert_eq!(number(&vm, "size2"), 1.0);
    }

    #[test]
    fn explicit_iterator_protocol() {
        let (vm, result) = run(
            "var it = iterator([10, 20]);
             var a = 0;
             while (it.hasNext()) a = a + it.next();",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(number(&vm, "a"), 30.0);
    }

    #[test]
    fn conversion_natives() {
        let (vm, result) = run(
            "var t = typeof([1]);
             var s = str(42);
             var n = num(\"3.5\");
             var bad = num(\"zebra\");
             var b = bool(\"true\");",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(string(&vm, "t"), "list");
        assert_eq!(string(&vm, "s"), "42");
        assert_eq!(number(&vm, "n"), 3.5);
        assert_eq!(vm.get_global("bad"), Some(Value::Nil));
        assert!(boolean(&vm, "b"));
    }

    #[test]
    fn copy_is_shallow_and_detached() {
        let (vm, result) = run(
            "var a = [1, 2];
             var b = copy(a);
             b.append(3);
             var an = a.size();
             var bn = b.size();",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(number(&vm, "an"), 2.0);
        assert_eq!(number(&vm, "bn"), 3.0);
    }

    #[test]
    fn native_constants_exist() {
        let (vm, result) = run("var p = pi; var napier = e;");
        assert_eq!(result, InterpretResult::Success);
        assert!((number(&vm, "p") - std::f64::consts::PI).abs() < 1e-12);
        assert!((number(&vm, "napier") - std::f64::consts::E).abs() < 1e-12);
    }

    #[test]
    fn clock_is_monotonic() {
        let (vm, result) = run("var t0 = clock(); var t1 = clock(); var ok = t1 >= t0;");
        assert_eq!(result, InterpretResult::Success);
        assert!(boolean(&vm, "ok"));
    }

    #[test]
    fn builtin_argument_errors_are_catchable() {
        let (vm, result) = run(
            "var r = \"\";
             try { [1].at(\"x\"); } catch (e) { r = e; }",
        );
        assert_eq!(result, InterpretResult::Success);
        assert_eq!(string(&vm, "r"), "argument must be a number");
    }
}
