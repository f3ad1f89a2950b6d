use std::mem;
use std::ptr;

use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_native_function::ObjectNativeFunction;
use crate::objects::object_string::ObjectString;
use crate::objects::object_upvalue::ObjectUpvalue;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    String,
    Function,
    Closure,
    Upvalue,
    Native,
}

/// Common header embedded as the first field of every heap object. `#[repr(C)]`
/// on the header and on every concrete object makes the `*mut ObjectX` ↔
/// `*mut Object` casts sound. `next` threads all live objects into the heap's
/// intrusive list; `is_marked` belongs to the collector.
#[repr(C)]
pub struct Object {
    pub obj_type: ObjectType,
    pub is_marked: bool,
    pub next: *mut Object,
}

impl Object {
    pub fn new(obj_type: ObjectType) -> Object {
        Object {
            obj_type,
            is_marked: false,
            next: ptr::null_mut(),
        }
    }

    pub unsafe fn as_string(&self) -> &ObjectString {
        &*(self as *const Object as *const ObjectString)
    }

    pub unsafe fn as_function(&self) -> &ObjectFunction {
        &*(self as *const Object as *const ObjectFunction)
    }

    pub unsafe fn as_closure(&self) -> &ObjectClosure {
        &*(self as *const Object as *const ObjectClosure)
    }

    pub unsafe fn as_upvalue(&self) -> &ObjectUpvalue {
        &*(self as *const Object as *const ObjectUpvalue)
    }

    pub unsafe fn as_native(&self) -> &ObjectNativeFunction {
        &*(self as *const Object as *const ObjectNativeFunction)
    }

    /// Shallow struct size plus owned buffers, used for the heap's byte
    /// accounting and the collector's statistics.
    pub fn deep_size(&self) -> usize {
        unsafe {
            match self.obj_type {
                ObjectType::String => {
                    let string = self.as_string();
                    mem::size_of::<ObjectString>() + string.content.capacity()
                }
                ObjectType::Function => {
                    let function = self.as_function();
                    mem::size_of::<ObjectFunction>()
                        + function.chunk.code.capacity()
                        + function.chunk.lines.capacity() * mem::size_of::<u32>()
                        + function.chunk.constants.capacity() * mem::size_of::<Value>()
                        + function.name.capacity()
                }
                ObjectType::Closure => {
                    let closure = self.as_closure();
                    mem::size_of::<ObjectClosure>()
                        + closure.upvalues.capacity() * mem::size_of::<*mut ObjectUpvalue>()
                }
                ObjectType::Upvalue => mem::size_of::<ObjectUpvalue>(),
                ObjectType::Native => mem::size_of::<ObjectNativeFunction>(),
            }
        }
    }
}

/// A host function callable from scripts. Arguments arrive as the slice of
/// stack slots holding the call's arguments; an `Err` becomes a runtime error.
pub trait NativeObject {
    fn invoke(&self, args: &[Value]) -> Result<Value, String>;
}
