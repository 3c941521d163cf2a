// File: src/disassembler.rs
//
// Chunk disassembly for debugging. `ARIA_DUMP_CODE` dumps every chunk
// after compilation; `ARIA_TRACE` prints the stack and the current
// instruction before each dispatch.

use crate::bytecode::{Chunk, OpCode};
use crate::heap::{Heap, ObjRef};
use crate::object::ObjPayload;
use crate::value::Value;
use crate::vm::Vm;

fn function_chunk<'a>(heap: &'a Heap, function: ObjRef) -> &'a Chunk {
    match heap.payload(function) {
        ObjPayload::Function(f) => &f.chunk,
        _ => panic!("disassembling a non-function"),
    }
}

pub fn disassemble(heap: &Heap, function: ObjRef, name: &str) {
    let chunk = function_chunk(heap, function);
    println!("== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset);
    }
}

/// Prints the stack and the instruction at `offset` (execution tracing).
pub fn trace_instruction(vm: &Vm, function: ObjRef, offset: usize) {
    let rendered: Vec<String> =
        (0..vm.stack_len()).map(|i| vm.raw_value_string(vm.stack_at(i))).collect();
    println!("stack:  [{}]", rendered.join(", "));
    let chunk = function_chunk(&vm.heap, function);
    disassemble_instruction(&vm.heap, chunk, offset);
}

fn constant_string(heap: &Heap, chunk: &Chunk, index: u16) -> String {
    match chunk.constants.get(index as usize) {
        Some(&Value::Obj(r)) => match heap.payload(r) {
            ObjPayload::String(s) => s.chars.clone(),
            ObjPayload::Function(f) => match f.name {
                Some(n) => format!("<fn {}>", heap.string(n)),
                None => "<script>".to_string(),
            },
            _ => "<obj>".to_string(),
        },
        Some(&Value::Number(n)) => format!("{}", n),
        Some(other) => format!("{:?}", other),
        None => "<bad const>".to_string(),
    }
}

pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    print!("{:04} ", offset);
    let line = chunk.line_at(offset);
    if offset > 0 && line == chunk.line_at(offset - 1) {
        print!("   | ");
    } else {
        print!("{:4} ", line);
    }

    let op = match OpCode::try_from(chunk.code[offset]) {
        Ok(op) => op,
        Err(_) => {
            println!("Unknown opcode {}", chunk.code[offset]);
            return offset + 1;
        }
    };
    match op {
        OpCode::LoadConst => constant_instruction("LOAD_CONST", heap, chunk, offset),
        OpCode::LoadNil => simple_instruction("LOAD_NIL", offset),
        OpCode::LoadTrue => simple_instruction("LOAD_TRUE", offset),
        OpCode::LoadFalse => simple_instruction("LOAD_FALSE", offset),
        OpCode::Pop => simple_instruction("POP", offset),
        OpCode::PopN => byte_instruction("POP_N", chunk, offset),
        OpCode::LoadLocal => word_instruction("LOAD_LOCAL", chunk, offset),
        OpCode::StoreLocal => word_instruction("STORE_LOCAL", chunk, offset),
        OpCode::LoadUpvalue => word_instruction("LOAD_UPVALUE", chunk, offset),
        OpCode::StoreUpvalue => word_instruction("STORE_UPVALUE", chunk, offset),
        OpCode::CloseUpvalue => simple_instruction("CLOSE_UPVALUE", offset),
        OpCode::DefGlobal => constant_instruction("DEF_GLOBAL", heap, chunk, offset),
        OpCode::LoadGlobal => constant_instruction("LOAD_GLOBAL", heap, chunk, offset),
        OpCode::StoreGlobal => constant_instruction("STORE_GLOBAL", heap, chunk, offset),
        OpCode::LoadProperty => constant_instruction("LOAD_PROPERTY", heap, chunk, offset),
        OpCode::StoreProperty => constant_instruction("STORE_PROPERTY", heap, chunk, offset),
        OpCode::LoadSubscr => simple_instruction("LOAD_SUBSCR", offset),
        OpCode::StoreSubscr => simple_instruction("STORE_SUBSCR", offset),
        OpCode::Equal => simple_instruction("EQUAL", offset),
        OpCode::NotEqual => simple_instruction("NOT_EQUAL", offset),
        OpCode::Greater => simple_instruction("GREATER", offset),
        OpCode::GreaterEqual => simple_instruction("GREATER_EQUAL", offset),
        OpCode::Less => simple_instruction("LESS", offset),
        OpCode::LessEqual => simple_instruction("LESS_EQUAL", offset),
        OpCode::Add => simple_instruction("ADD", offset),
        OpCode::Subtract => simple_instruction("SUBTRACT", offset),
        OpCode::Multiply => simple_instruction("MULTIPLY", offset),
        OpCode::Divide => simple_instruction("DIVIDE", offset),
        OpCode::Mod => simple_instruction("MOD", offset),
        OpCode::Not => simple_instruction("NOT", offset),
        OpCode::Negate => simple_instruction("NEGATE", offset),
        OpCode::Inc => simple_instruction("INC", offset),
        OpCode::Dec => simple_instruction("DEC", offset),
        OpCode::Print => simple_instruction("PRINT", offset),
        OpCode::Nop => simple_instruction("NOP", offset),
        OpCode::JumpFwd => jump_instruction("JUMP_FWD", chunk, offset, false),
        OpCode::JumpBwd => jump_instruction("JUMP_BWD", chunk, offset, true),
        OpCode::JumpTrue => jump_instruction("JUMP_TRUE", chunk, offset, true),
        OpCode::JumpTrueNoPop => jump_instruction("JUMP_TRUE_NOPOP", chunk, offset, true),
        OpCode::JumpFalse => jump_instruction("JUMP_FALSE", chunk, offset, true),
        OpCode::JumpFalseNoPop => jump_instruction("JUMP_FALSE_NOPOP", chunk, offset, true),
        OpCode::Call => byte_instruction("CALL", chunk, offset),
        OpCode::Closure => closure_instruction(heap, chunk, offset),
        OpCode::MakeClass => constant_instruction("MAKE_CLASS", heap, chunk, offset),
        OpCode::Inherit => simple_instruction("INHERIT", offset),
        OpCode::MakeMethod => constant_instruction("MAKE_METHOD", heap, chunk, offset),
        OpCode::MakeInitMethod => simple_instruction("MAKE_INIT_METHOD", offset),
        OpCode::InvokeMethod => {
            let name = chunk.read_u16(offset + 1);
            let argc = chunk.code[offset + 3];
            println!(
                "{:<20} {:4} '{}' ({} args)",
                "INVOKE_METHOD",
                name,
                constant_string(heap, chunk, name),
                argc
            );
            offset + 4
        }
        OpCode::LoadSuperMethod => constant_instruction("LOAD_SUPER_METHOD", heap, chunk, offset),
        OpCode::MakeList => word_instruction("MAKE_LIST", chunk, offset),
        OpCode::MakeMap => word_instruction("MAKE_MAP", chunk, offset),
        OpCode::Import => {
            let input = chunk.read_u16(offset + 1);
            let alias = chunk.read_u16(offset + 3);
            println!(
                "{:<20} '{}' as '{}'",
                "IMPORT",
                constant_string(heap, chunk, input),
                constant_string(heap, chunk, alias)
            );
            offset + 5
        }
        OpCode::GetIter => simple_instruction("GET_ITER", offset),
        OpCode::IterHasNext => simple_instruction("ITER_HAS_NEXT", offset),
        OpCode::IterGetNext => simple_instruction("ITER_GET_NEXT", offset),
        OpCode::BeginTry => jump_instruction("BEGIN_TRY", chunk, offset, true),
        OpCode::EndTry => simple_instruction("END_TRY", offset),
        OpCode::Throw => simple_instruction("THROW", offset),
        OpCode::Return => simple_instruction("RETURN", offset),
    }
}

fn simple_instruction(name: &str, offset: usize) -> usize {
    println!("{}", name);
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    println!("{:<20} {:4}", name, chunk.code[offset + 1]);
    offset + 2
}

fn word_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    println!("{:<20} {:4}", name, chunk.read_u16(offset + 1));
    offset + 3
}

fn constant_instruction(name: &str, heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.read_u16(offset + 1);
    println!("{:<20} {:4} '{}'", name, index, constant_string(heap, chunk, index));
    offset + 3
}

fn jump_instruction(name: &str, chunk: &Chunk, offset: usize, forward_in_code: bool) -> usize {
    let jump = chunk.read_u16(offset + 1) as isize;
    let target = if forward_in_code {
        offset as isize + 3 + jump
    } else {
        offset as isize + 3 - jump
    };
    println!("{:<20} {:4} -> {}", name, offset, target);
    offset + 3
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.read_u16(offset + 1);
    println!("{:<20} {:4} {}", "CLOSURE", index, constant_string(heap, chunk, index));
    let count = match chunk.constants.get(index as usize) {
        Some(&Value::Obj(r)) => match heap.payload(r) {
            ObjPayload::Function(f) => f.upvalue_count,
            _ => 0,
        },
        _ => 0,
    };
    let mut at = offset + 3;
    for _ in 0..count {
        let is_local = chunk.code[at] != 0;
        let slot = chunk.read_u16(at + 1);
        println!(
            "{:04}    |                     {} {}",
            at,
            if is_local { "local" } else { "upvalue" },
            slot
        );
        at += 3;
    }
    at
}
