use crate::chunk::{Chunk, OpCode};
use crate::value::{as_function, format_value, is_function};

pub fn disassemble_chunk(chunk: &Chunk, name: &str) {
    println!("== {} ==", name);

    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset);
    }
}

pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> usize {
    print!("{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.lines[offset]);
    }

    let byte = chunk.code[offset];
    let Some(op) = OpCode::from_byte(byte) else {
        println!("Unknown opcode {}", byte);
        return offset + 1;
    };

    match op {
        OpCode::Constant | OpCode::GetGlobal | OpCode::DefineGlobal | OpCode::SetGlobal => {
            constant_instruction(op, chunk, offset)
        }
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(op, chunk, offset),
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(op, 1, chunk, offset),
        OpCode::Loop => jump_instruction(op, -1, chunk, offset),
        OpCode::Closure => closure_instruction(chunk, offset),
        _ => simple_instruction(op, offset),
    }
}

fn simple_instruction(op: OpCode, offset: usize) -> usize {
    println!("{}", op);
    offset + 1
}

fn constant_instruction(op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1] as usize;
    println!(
        "{:<16} {:>4} '{}'",
        op.to_string(),
        constant,
        format_value(chunk.get_constant(constant))
    );
    offset + 2
}

fn byte_instruction(op: OpCode, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    println!("{:<16} {:>4}", op.to_string(), slot);
    offset + 2
}

fn jump_instruction(op: OpCode, sign: i64, chunk: &Chunk, offset: usize) -> usize {
    let jump = ((chunk.code[offset + 1] as u16) << 8) | chunk.code[offset + 2] as u16;
    let target = offset as i64 + 3 + sign * jump as i64;
    println!("{:<16} {:>4} -> {}", op.to_string(), offset, target);
    offset + 3
}

fn closure_instruction(chunk: &Chunk, mut offset: usize) -> usize {
    offset += 1;
    let constant = chunk.code[offset] as usize;
    offset += 1;
    let value = chunk.get_constant(constant);
    println!(
        "{:<16} {:>4} {}",
        OpCode::Closure.to_string(),
        constant,
        format_value(value)
    );

    if is_function(value) {
        let function = as_function(value);
        let upvalue_count = unsafe { (*function).upvalue_count };
        for _ in 0..upvalue_count {
            let is_local = chunk.code[offset];
            let index = chunk.code[offset + 1];
            println!(
                "{:04}    |                       {} {}",
                offset,
                if is_local != 0 { "local" } else { "upvalue" },
                index
            );
            offset += 2;
        }
    }
    offset
}
