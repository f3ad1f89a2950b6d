use std::ptr;

use crate::gc::{GarbageCollector, GcRoots};
use crate::memory::GC_INITIAL_THRESHOLD;
use crate::objects::object::{NativeObject, Object, ObjectType};
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_native_function::ObjectNativeFunction;
use crate::objects::object_string::{hash_string, ObjectString};
use crate::objects::object_upvalue::ObjectUpvalue;
use crate::table::Table;
use crate::value::Value;

/// The object heap. Every live object is threaded through the intrusive
/// `next` list headed here; the collector walks that list during sweep.
/// The string interner also lives here so `copy_string`/`take_string` are
/// the only ways a string object comes to exist.
///
/// Callers run `collect_if_needed`-style checks through [`ObjectManager::collect`]
/// *before* allocating, passing whatever roots they hold; the allocation
/// entry points themselves never collect, so a freshly created object cannot
/// be swept before the caller roots it.
pub struct ObjectManager {
    objects: *mut Object,
    pub(crate) bytes_allocated: usize,
    pub(crate) next_gc: usize,
    pub strings: Table,
    gc: GarbageCollector,
}

impl ObjectManager {
    pub fn new() -> ObjectManager {
        ObjectManager {
            objects: ptr::null_mut(),
            bytes_allocated: 0,
            next_gc: GC_INITIAL_THRESHOLD,
            strings: Table::new(),
            gc: GarbageCollector::new(),
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// True once allocation has outgrown the current threshold. With the
    /// `gc_stress` feature every allocation point collects.
    pub fn should_collect(&self) -> bool {
        cfg!(feature = "gc_stress") || self.bytes_allocated > self.next_gc
    }

    /// Run a full mark-sweep cycle over the given roots.
    pub fn collect(&mut self, roots: GcRoots<'_>) {
        let mut gc = std::mem::take(&mut self.gc);
        gc.collect(self, roots);
        self.gc = gc;
    }

    pub fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    /// Thread a freshly boxed object onto the intrusive list and account for
    /// its size.
    fn track(&mut self, object: *mut Object) {
        unsafe {
            (*object).next = self.objects;
        }
        self.objects = object;
        self.bytes_allocated += unsafe { (*object).deep_size() };
    }

    pub fn alloc_function(&mut self, name: String) -> *mut ObjectFunction {
        let function = Box::into_raw(Box::new(ObjectFunction::new(name)));
        self.track(function as *mut Object);
        function
    }

    pub fn alloc_closure(&mut self, function: *mut ObjectFunction) -> *mut ObjectClosure {
        let closure = Box::into_raw(Box::new(ObjectClosure::new(function)));
        self.track(closure as *mut Object);
        closure
    }

    pub fn alloc_upvalue(&mut self, location: *mut Value) -> *mut ObjectUpvalue {
        let upvalue = Box::into_raw(Box::new(ObjectUpvalue::new(location)));
        self.track(upvalue as *mut Object);
        upvalue
    }

    pub fn alloc_native(
        &mut self,
        name: String,
        function: Box<dyn NativeObject>,
    ) -> *mut ObjectNativeFunction {
        let native = Box::into_raw(Box::new(ObjectNativeFunction::new(name, function)));
        self.track(native as *mut Object);
        native
    }

    /// Intern a borrowed string, copying the bytes only on a miss.
    pub fn copy_string(&mut self, content: &str) -> *mut ObjectString {
        let hash = hash_string(content);
        let interned = self.strings.find_string(content, hash);
        if !interned.is_null() {
            return interned;
        }
        self.intern_new(content.to_string(), hash)
    }

    /// Intern an owned string, dropping the buffer when an equal string
    /// already exists.
    pub fn take_string(&mut self, content: String) -> *mut ObjectString {
        let hash = hash_string(&content);
        let interned = self.strings.find_string(&content, hash);
        if !interned.is_null() {
            return interned;
        }
        self.intern_new(content, hash)
    }

    fn intern_new(&mut self, content: String, hash: u32) -> *mut ObjectString {
        let string = Box::into_raw(Box::new(ObjectString::new(content, hash)));
        self.track(string as *mut Object);
        self.strings.set(string, crate::value::make_nil_value());
        string
    }

    /// Free every unmarked object, clear the mark on survivors, and return
    /// the number of bytes released.
    pub(crate) fn sweep(&mut self) -> usize {
        let mut freed = 0usize;
        let mut previous: *mut Object = ptr::null_mut();
        let mut object = self.objects;
        unsafe {
            while !object.is_null() {
                if (*object).is_marked {
                    (*object).is_marked = false;
                    previous = object;
                    object = (*object).next;
                } else {
                    let unreached = object;
                    object = (*object).next;
                    if previous.is_null() {
                        self.objects = object;
                    } else {
                        (*previous).next = object;
                    }
                    freed += free_object(unreached);
                }
            }
        }
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed);
        freed
    }

    pub fn object_count(&self) -> usize {
        let mut count = 0;
        let mut object = self.objects;
        while !object.is_null() {
            count += 1;
            object = unsafe { (*object).next };
        }
        count
    }

    fn free_all(&mut self) {
        let mut object = self.objects;
        while !object.is_null() {
            let next = unsafe { (*object).next };
            unsafe {
                free_object(object);
            }
            object = next;
        }
        self.objects = ptr::null_mut();
        self.bytes_allocated = 0;
    }
}

impl Default for ObjectManager {
    fn default() -> ObjectManager {
        ObjectManager::new()
    }
}

impl Drop for ObjectManager {
    fn drop(&mut self) {
        self.free_all();
    }
}

/// Drop the concrete object behind the header and return the bytes released.
unsafe fn free_object(object: *mut Object) -> usize {
    let size = (*object).deep_size();
    match (*object).obj_type {
        ObjectType::String => drop(Box::from_raw(object as *mut ObjectString)),
        ObjectType::Function => drop(Box::from_raw(object as *mut ObjectFunction)),
        ObjectType::Closure => drop(Box::from_raw(object as *mut ObjectClosure)),
        ObjectType::Upvalue => drop(Box::from_raw(object as *mut ObjectUpvalue)),
        ObjectType::Native => drop(Box::from_raw(object as *mut ObjectNativeFunction)),
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_content_interns_to_the_same_object() {
        let mut heap = ObjectManager::new();
        let first = heap.copy_string("twin");
        let second = heap.copy_string("twin");
        assert_eq!(first, second);
        assert_eq!(heap.strings.len(), 1);
    }

    #[test]
    fn take_string_returns_the_interned_twin() {
        let mut heap = ObjectManager::new();
        let copied = heap.copy_string("dup");
        let taken = heap.take_string("dup".to_string());
        assert_eq!(copied, taken);
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn distinct_content_allocates_distinct_objects() {
        let mut heap = ObjectManager::new();
        let a = heap.copy_string("a");
        let b = heap.copy_string("b");
        assert_ne!(a, b);
        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn allocation_tracks_bytes() {
        let mut heap = ObjectManager::new();
        assert_eq!(heap.bytes_allocated(), 0);
        heap.copy_string("some content");
        assert!(heap.bytes_allocated() > 0);
    }

    #[test]
    fn closures_size_their_upvalue_vector_from_the_function() {
        let mut heap = ObjectManager::new();
        let function = heap.alloc_function("f".to_string());
        unsafe {
            (*function).upvalue_count = 3;
        }
        let closure = heap.alloc_closure(function);
        unsafe {
            assert_eq!((*closure).upvalues.len(), 3);
            assert!((*closure).upvalues.iter().all(|upvalue| upvalue.is_null()));
        }
    }
}
