use std::ptr;

use crate::objects::object::{Object, ObjectType};
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_upvalue::ObjectUpvalue;

/// The runtime form of a function: the function plus the up-values it
/// captured. The slots start out null and are filled while the CLOSURE opcode
/// executes; the collector skips nulls, so a partially built closure is safe
/// to trace.
#[repr(C)]
pub struct ObjectClosure {
    pub object: Object,
    pub function: *mut ObjectFunction,
    pub upvalues: Vec<*mut ObjectUpvalue>,
}

impl ObjectClosure {
    pub fn new(function: *mut ObjectFunction) -> ObjectClosure {
        let upvalue_count = unsafe { (*function).upvalue_count };
        ObjectClosure {
            object: Object::new(ObjectType::Closure),
            function,
            upvalues: vec![ptr::null_mut(); upvalue_count],
        }
    }
}
