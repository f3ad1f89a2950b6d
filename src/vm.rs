use std::ptr;

use crate::call_frame::CallFrame;
use crate::chunk::OpCode;
use crate::compiler::Parser;
use crate::gc::GcRoots;
use crate::objects::object::{NativeObject, Object, ObjectType};
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_manager::ObjectManager;
use crate::objects::object_string::ObjectString;
use crate::objects::object_upvalue::ObjectUpvalue;
use crate::std_mod::time::ClockTime;
use crate::table::Table;
use crate::value::{
    as_bool, as_closure, as_native, as_number, as_object, as_string, format_value, is_bool,
    is_nil, is_number, is_object, is_string, make_bool_value, make_nil_value, make_number_value,
    make_object_value, values_equal, Value,
};

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// The stack machine. One value stack shared by every call frame; each frame
/// owns a window into it starting at the callee's own stack slot. All mutable
/// interpreter state lives here so the compiler, the dispatch loop and the
/// collector see one coherent world.
pub struct VM {
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    stack_top: usize,
    globals: Table,
    open_upvalues: *mut ObjectUpvalue,
    heap: ObjectManager,
}

impl VM {
    pub fn new() -> VM {
        let mut vm = VM {
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: vec![make_nil_value(); STACK_MAX],
            stack_top: 0,
            globals: Table::new(),
            open_upvalues: ptr::null_mut(),
            heap: ObjectManager::new(),
        };
        vm.define_native("clock", Box::new(ClockTime::new()));
        vm
    }

    /// Register a host function under a global name. Must happen before
    /// `interpret`; the value dance keeps both objects rooted while the
    /// second one is allocated.
    pub fn define_native(&mut self, name: &str, function: Box<dyn NativeObject>) {
        self.collect_if_needed();
        let name_string = self.heap.copy_string(name);
        self.push(make_object_value(name_string as *mut Object));
        self.collect_if_needed();
        let native = self.heap.alloc_native(name.to_string(), function);
        self.push(make_object_value(native as *mut Object));

        let key = as_string(&self.peek(1));
        let value = self.peek(0);
        self.globals.set(key, value);
        self.pop();
        self.pop();
    }

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = {
            let mut parser = Parser::new(&mut self.heap, &self.globals);
            parser.compile(source)
        };
        let Some(function) = function else {
            return InterpretResult::CompileError;
        };

        // Root the fresh function on the stack before the closure allocation
        // can trigger a collection.
        self.push(make_object_value(function as *mut Object));
        self.collect_if_needed();
        let closure = self.heap.alloc_closure(function);
        self.pop();
        self.push(make_object_value(closure as *mut Object));
        if !self.call(closure, 0) {
            return InterpretResult::RuntimeError;
        }

        self.run()
    }

    fn run(&mut self) -> InterpretResult {
        loop {
            debug_feature::trace_instruction(self);

            let byte = self.read_byte();
            let Some(instruction) = OpCode::from_byte(byte) else {
                return self.runtime_error(&format!("Unknown opcode {}.", byte));
            };

            match instruction {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                OpCode::Nil => self.push(make_nil_value()),
                OpCode::True => self.push(make_bool_value(true)),
                OpCode::False => self.push(make_bool_value(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slots;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0);
                    let base = self.current_frame().slots;
                    self.stack[base + slot] = value;
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(name) {
                        Some(value) => self.push(value),
                        None => {
                            let message = format!("Undefined variable '{}'.", unsafe {
                                &(*name).content
                            });
                            return self.runtime_error(&message);
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.globals.set(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    // Assignment never creates a global: undo the insert and
                    // report the name as undefined.
                    if self.globals.set(name, value) {
                        self.globals.delete(name);
                        let message = format!("Undefined variable '{}'.", unsafe {
                            &(*name).content
                        });
                        return self.runtime_error(&message);
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let value = unsafe {
                        let upvalue = (&(*self.current_frame().closure).upvalues)[slot];
                        *(*upvalue).location
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0);
                    unsafe {
                        let upvalue = (&(*self.current_frame().closure).upvalues)[slot];
                        *(*upvalue).location = value;
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(make_bool_value(values_equal(&a, &b)));
                }
                OpCode::Greater
                | OpCode::Less
                | OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide => {
                    if !self.binary_op(instruction) {
                        return InterpretResult::RuntimeError;
                    }
                }
                OpCode::Add => {
                    if is_string(&self.peek(0)) && is_string(&self.peek(1)) {
                        self.concatenate();
                    } else if is_number(&self.peek(0)) && is_number(&self.peek(1)) {
                        let b = as_number(&self.pop());
                        let a = as_number(&self.pop());
                        self.push(make_number_value(a + b));
                    } else {
                        return self
                            .runtime_error("Operands must be two numbers or two strings.");
                    }
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(make_bool_value(is_falsey(&value)));
                }
                OpCode::Negate => {
                    if !is_number(&self.peek(0)) {
                        return self.runtime_error("Operand must be a number.");
                    }
                    let value = as_number(&self.pop());
                    self.push(make_number_value(-value));
                }
                OpCode::Print => {
                    let value = self.pop();
                    println!("{}", format_value(&value));
                }
                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.current_frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    // The condition stays on the stack; the compiled arms pop
                    // it themselves.
                    if is_falsey(&self.peek(0)) {
                        self.current_frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.current_frame_mut().ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    if !self.call_value(callee, arg_count) {
                        return InterpretResult::RuntimeError;
                    }
                }
                OpCode::Closure => {
                    let function = crate::value::as_function(&self.read_constant());
                    self.collect_if_needed();
                    let closure = self.heap.alloc_closure(function);
                    self.push(make_object_value(closure as *mut Object));

                    let upvalue_count = unsafe { (*function).upvalue_count };
                    for i in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.current_frame().slots;
                            let location = self.stack_ptr(base + index);
                            self.capture_upvalue(location)
                        } else {
                            unsafe { (&(*self.current_frame().closure).upvalues)[index] }
                        };
                        unsafe {
                            (&mut (*closure).upvalues)[i] = upvalue;
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    let last = self.stack_ptr(self.stack_top - 1);
                    self.close_upvalues(last);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let slots = self.current_frame().slots;
                    let last = self.stack_ptr(slots);
                    self.close_upvalues(last);

                    self.frames.pop();
                    if self.frames.is_empty() {
                        // The script closure itself.
                        self.pop();
                        return InterpretResult::Ok;
                    }

                    // Discard the returning frame's window, then put the
                    // result back where the callee used to sit.
                    self.stack_top = slots;
                    self.push(result);
                }
            }
        }
    }

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let byte = frame.function().chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let high = self.read_byte() as u16;
        let low = self.read_byte() as u16;
        (high << 8) | low
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frames.last().expect("no active call frame");
        *frame.function().chunk.get_constant(index)
    }

    fn read_string(&mut self) -> *mut ObjectString {
        let value = self.read_constant();
        as_string(&value)
    }

    fn push(&mut self, value: Value) {
        self.stack[self.stack_top] = value;
        self.stack_top += 1;
    }

    fn pop(&mut self) -> Value {
        self.stack_top -= 1;
        self.stack[self.stack_top]
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack_top - 1 - distance]
    }

    fn stack_ptr(&mut self, index: usize) -> *mut Value {
        &mut self.stack[index] as *mut Value
    }

    fn reset_stack(&mut self) {
        self.stack_top = 0;
        self.frames.clear();
        self.open_upvalues = ptr::null_mut();
    }

    /// Print the message and a stack trace (innermost frame first), then
    /// abandon the run by resetting the machine.
    fn runtime_error(&mut self, message: &str) -> InterpretResult {
        eprintln!("{}", message);

        for frame in self.frames.iter().rev() {
            let function = frame.function();
            // ip already advanced past the faulting instruction.
            let instruction = frame.ip.saturating_sub(1);
            let line = function.chunk.lines[instruction];
            if function.name.is_empty() {
                eprintln!("[line {}] in script", line);
            } else {
                eprintln!("[line {}] in {}()", line, function.name);
            }
        }

        self.reset_stack();
        InterpretResult::RuntimeError
    }

    fn binary_op(&mut self, instruction: OpCode) -> bool {
        if !is_number(&self.peek(0)) || !is_number(&self.peek(1)) {
            self.runtime_error("Operands must be numbers.");
            return false;
        }
        let b = as_number(&self.pop());
        let a = as_number(&self.pop());
        let value = match instruction {
            OpCode::Greater => make_bool_value(a > b),
            OpCode::Less => make_bool_value(a < b),
            OpCode::Subtract => make_number_value(a - b),
            OpCode::Multiply => make_number_value(a * b),
            OpCode::Divide => make_number_value(a / b),
            _ => unreachable!("not a binary operator: {}", instruction),
        };
        self.push(value);
        true
    }

    /// Both operands stay on the stack until the result exists, so a
    /// collection triggered by the allocation cannot free them.
    fn concatenate(&mut self) {
        let b = as_string(&self.peek(0));
        let a = as_string(&self.peek(1));
        let combined = unsafe {
            let mut combined =
                String::with_capacity((&(*a).content).len() + (&(*b).content).len());
            combined.push_str(&(*a).content);
            combined.push_str(&(*b).content);
            combined
        };
        self.collect_if_needed();
        let result = self.heap.take_string(combined);
        self.pop();
        self.pop();
        self.push(make_object_value(result as *mut Object));
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> bool {
        if is_object(&callee) {
            match unsafe { (*as_object(&callee)).obj_type } {
                ObjectType::Closure => return self.call(as_closure(&callee), arg_count),
                ObjectType::Native => {
                    let native = unsafe { &*as_native(&callee) };
                    let args_start = self.stack_top - arg_count;
                    let result = native
                        .function
                        .invoke(&self.stack[args_start..self.stack_top]);
                    return match result {
                        Ok(value) => {
                            self.stack_top = args_start - 1;
                            self.push(value);
                            true
                        }
                        Err(message) => {
                            self.runtime_error(&message);
                            false
                        }
                    };
                }
                _ => {}
            }
        }

        self.runtime_error("Can only call functions and classes.");
        false
    }

    fn call(&mut self, closure: *mut ObjectClosure, arg_count: usize) -> bool {
        let arity = unsafe { (*(*closure).function).arity } as usize;
        if arg_count != arity {
            self.runtime_error(&format!(
                "Expected {} arguments but got {}.",
                arity, arg_count
            ));
            return false;
        }

        if self.frames.len() == FRAMES_MAX {
            self.runtime_error("Stack overflow.");
            return false;
        }

        self.frames
            .push(CallFrame::new(closure, self.stack_top - arg_count - 1));
        true
    }

    /// Find or create the open up-value for a stack slot. The list is sorted
    /// by descending location so the walk can stop early, and a slot is never
    /// captured twice.
    fn capture_upvalue(&mut self, local: *mut Value) -> *mut ObjectUpvalue {
        let mut previous: *mut ObjectUpvalue = ptr::null_mut();
        let mut upvalue = self.open_upvalues;
        unsafe {
            while !upvalue.is_null() && (*upvalue).location > local {
                previous = upvalue;
                upvalue = (*upvalue).next;
            }
            if !upvalue.is_null() && (*upvalue).location == local {
                return upvalue;
            }
        }

        self.collect_if_needed();
        let created = self.heap.alloc_upvalue(local);
        unsafe {
            (*created).next = upvalue;
            if previous.is_null() {
                self.open_upvalues = created;
            } else {
                (*previous).next = created;
            }
        }
        created
    }

    /// Close every open up-value at or above `last`: copy the stack slot into
    /// the up-value and repoint it at itself.
    fn close_upvalues(&mut self, last: *mut Value) {
        unsafe {
            while !self.open_upvalues.is_null() && (*self.open_upvalues).location >= last {
                let upvalue = self.open_upvalues;
                (*upvalue).closed = *(*upvalue).location;
                (*upvalue).location = &mut (*upvalue).closed as *mut Value;
                self.open_upvalues = (*upvalue).next;
            }
        }
    }

    fn collect_if_needed(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        self.heap.collect(GcRoots {
            stack: &self.stack[..self.stack_top],
            frames: &self.frames,
            open_upvalues: self.open_upvalues,
            globals: &self.globals,
            compiler_functions: &[],
        });
    }

}

impl Default for VM {
    fn default() -> VM {
        VM::new()
    }
}

/// Only nil and false are falsey.
fn is_falsey(value: &Value) -> bool {
    is_nil(value) || (is_bool(value) && !as_bool(value))
}

#[cfg(feature = "debug_trace_execution")]
mod debug_feature {
    use super::*;

    pub fn trace_instruction(vm: &VM) {
        print!("          ");
        for slot in &vm.stack[..vm.stack_top] {
            print!("[ {} ]", format_value(slot));
        }
        println!();
        let frame = vm.frames.last().expect("no active call frame");
        crate::debug::disassemble_instruction(&frame.function().chunk, frame.ip);
    }
}

#[cfg(not(feature = "debug_trace_execution"))]
mod debug_feature {
    use super::*;

    pub fn trace_instruction(_vm: &VM) {}
}
