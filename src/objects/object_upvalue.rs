use std::ptr;

use crate::objects::object::{Object, ObjectType};
use crate::value::{make_nil_value, Value};

/// An indirection to a captured variable. While the variable lives on the VM
/// stack the up-value is *open*: `location` points at the stack slot and
/// `next` links it into the VM's list of open up-values (sorted by descending
/// location). Closing copies the slot into `closed` and repoints `location` at
/// it.
#[repr(C)]
pub struct ObjectUpvalue {
    pub object: Object,
    pub location: *mut Value,
    pub closed: Value,
    pub next: *mut ObjectUpvalue,
}

impl ObjectUpvalue {
    pub fn new(location: *mut Value) -> ObjectUpvalue {
        ObjectUpvalue {
            object: Object::new(ObjectType::Upvalue),
            location,
            closed: make_nil_value(),
            next: ptr::null_mut(),
        }
    }
}
