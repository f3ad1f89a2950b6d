use crate::call_frame::CallFrame;
use crate::memory::{GC_HEAP_GROW_FACTOR, GC_INITIAL_THRESHOLD};
use crate::objects::object::{Object, ObjectType};
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_manager::ObjectManager;
use crate::objects::object_upvalue::ObjectUpvalue;
use crate::table::Table;
use crate::value::{as_object, is_object, Value};

/// Everything the collector treats as definitely live: the active slice of the
/// value stack, the call frames (their closures), the open up-value list, the
/// globals table, and the functions of whatever compilers are currently open.
pub struct GcRoots<'a> {
    pub stack: &'a [Value],
    pub frames: &'a [CallFrame],
    pub open_upvalues: *mut ObjectUpvalue,
    pub globals: &'a Table,
    pub compiler_functions: &'a [*mut ObjectFunction],
}

/// Aggregated collection statistics.
#[derive(Default, Debug, Clone)]
pub struct GCStats {
    pub cycles: u64,
    pub total_freed_bytes: usize,
    pub last_freed_bytes: usize,
    pub last_before_bytes: usize,
    pub last_after_bytes: usize,
    pub last_next_trigger_bytes: usize,
}

impl GCStats {
    fn record(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.cycles += 1;
        self.total_freed_bytes += freed;
        self.last_freed_bytes = freed;
        self.last_before_bytes = before;
        self.last_after_bytes = after;
        self.last_next_trigger_bytes = next_trigger;
    }
}

// Lightweight tracing macro (only active with the gc_debug feature)
#[cfg(feature = "gc_debug")]
macro_rules! gc_trace { ($($arg:tt)*) => { eprintln!("[gc-trace] {}", format_args!($($arg)*)); } }
#[cfg(not(feature = "gc_debug"))]
macro_rules! gc_trace { ($($arg:tt)*) => { } }

/// Tri-color mark-sweep. White objects are the unmarked ones still on the
/// heap's intrusive list; marking an object grays it onto the worklist;
/// draining the worklist blackens it by marking its outgoing references. The
/// worklist vector persists across cycles, its contents do not.
#[derive(Default)]
pub struct GarbageCollector {
    gray_stack: Vec<*mut Object>,
    stats: GCStats,
}

impl GarbageCollector {
    pub fn new() -> GarbageCollector {
        GarbageCollector {
            gray_stack: vec![],
            stats: GCStats::default(),
        }
    }

    pub fn collect(&mut self, heap: &mut ObjectManager, roots: GcRoots<'_>) {
        let before = heap.bytes_allocated;
        gc_trace!("collection begin, {} bytes live", before);

        self.mark_roots(&roots);
        self.trace_references();
        // The interner must not keep strings alive: drop every entry whose
        // key did not get marked before the sweep frees it.
        heap.strings.remove_white();
        let freed = heap.sweep();

        heap.next_gc = (heap.bytes_allocated * GC_HEAP_GROW_FACTOR).max(GC_INITIAL_THRESHOLD);
        self.stats
            .record(before, freed, heap.bytes_allocated, heap.next_gc);
        gc_trace!(
            "collection end, freed {} bytes ({} remain), next at {}",
            freed,
            heap.bytes_allocated,
            heap.next_gc
        );
    }

    fn mark_roots(&mut self, roots: &GcRoots<'_>) {
        for value in roots.stack {
            self.mark_value(value);
        }

        for frame in roots.frames {
            self.mark_object(frame.closure as *mut Object);
        }

        let mut upvalue = roots.open_upvalues;
        while !upvalue.is_null() {
            self.mark_object(upvalue as *mut Object);
            upvalue = unsafe { (*upvalue).next };
        }

        self.mark_table(roots.globals);

        for &function in roots.compiler_functions {
            self.mark_object(function as *mut Object);
        }
    }

    pub fn mark_object(&mut self, object: *mut Object) {
        if object.is_null() {
            return;
        }
        unsafe {
            if (*object).is_marked {
                return;
            }
            (*object).is_marked = true;
        }
        gc_trace!("mark {:p}", object);
        self.gray_stack.push(object);
    }

    pub fn mark_value(&mut self, value: &Value) {
        if is_object(value) {
            self.mark_object(as_object(value));
        }
    }

    fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key as *mut Object);
            self.mark_value(&value);
        }
    }

    fn trace_references(&mut self) {
        while let Some(object) = self.gray_stack.pop() {
            gc_trace!("blacken {:p}", object);
            unsafe {
                self.blacken_object(object);
            }
        }
    }

    /// Mark everything the object references.
    unsafe fn blacken_object(&mut self, object: *mut Object) {
        match (*object).obj_type {
            ObjectType::Closure => {
                let closure = (*object).as_closure();
                self.mark_object(closure.function as *mut Object);
                for &upvalue in &closure.upvalues {
                    self.mark_object(upvalue as *mut Object);
                }
            }
            ObjectType::Function => {
                let function = (*object).as_function();
                for constant in &function.chunk.constants {
                    self.mark_value(constant);
                }
            }
            ObjectType::Upvalue => {
                // Safe for open up-values too: `closed` holds nil until the
                // up-value actually closes.
                let upvalue = (*object).as_upvalue();
                self.mark_value(&upvalue.closed);
            }
            ObjectType::String | ObjectType::Native => {}
        }
    }

    pub fn stats(&self) -> &GCStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{make_nil_value, make_object_value};
    use std::ptr;

    fn roots_with_stack<'a>(stack: &'a [Value], globals: &'a Table) -> GcRoots<'a> {
        GcRoots {
            stack,
            frames: &[],
            open_upvalues: ptr::null_mut(),
            globals,
            compiler_functions: &[],
        }
    }

    #[test]
    fn unreachable_objects_are_swept() {
        let mut heap = ObjectManager::new();
        let keep = heap.copy_string("keep");
        heap.copy_string("drop1");
        heap.copy_string("drop2");

        let stack = [make_object_value(keep as *mut Object)];
        let globals = Table::new();
        heap.collect(roots_with_stack(&stack, &globals));

        assert_eq!(heap.object_count(), 1);
        assert_eq!(heap.gc().stats().cycles, 1);
        assert!(heap.gc().stats().last_freed_bytes > 0);
    }

    #[test]
    fn survivors_are_unmarked_for_the_next_cycle() {
        let mut heap = ObjectManager::new();
        let keep = heap.copy_string("keep");
        let stack = [make_object_value(keep as *mut Object)];
        let globals = Table::new();

        heap.collect(roots_with_stack(&stack, &globals));
        assert_eq!(heap.object_count(), 1);
        unsafe {
            assert!(!(*keep).object.is_marked);
        }

        // A second cycle with no roots frees the survivor.
        let empty: [Value; 0] = [];
        heap.collect(roots_with_stack(&empty, &globals));
        assert_eq!(heap.object_count(), 0);
    }

    #[test]
    fn closures_keep_their_function_alive() {
        let mut heap = ObjectManager::new();
        let function = heap.alloc_function("f".to_string());
        let closure = heap.alloc_closure(function);
        heap.alloc_function("unreachable".to_string());

        let stack = [make_object_value(closure as *mut Object)];
        let globals = Table::new();
        heap.collect(roots_with_stack(&stack, &globals));

        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn functions_keep_their_constants_alive() {
        let mut heap = ObjectManager::new();
        let name = heap.copy_string("in-pool");
        let function = heap.alloc_function("f".to_string());
        unsafe {
            (*function)
                .chunk
                .add_constant(make_object_value(name as *mut Object));
        }

        let stack = [make_object_value(function as *mut Object)];
        let globals = Table::new();
        heap.collect(roots_with_stack(&stack, &globals));

        assert_eq!(heap.object_count(), 2);
        assert!(!heap
            .strings
            .find_string("in-pool", crate::objects::object_string::hash_string("in-pool"))
            .is_null());
    }

    #[test]
    fn open_upvalue_list_is_a_root() {
        let mut heap = ObjectManager::new();
        let mut slot = make_nil_value();
        let upvalue = heap.alloc_upvalue(&mut slot as *mut Value);

        let globals = Table::new();
        let roots = GcRoots {
            stack: &[],
            frames: &[],
            open_upvalues: upvalue,
            globals: &globals,
            compiler_functions: &[],
        };
        heap.collect(roots);

        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn closed_upvalues_keep_their_value_alive() {
        let mut heap = ObjectManager::new();
        let captured = heap.copy_string("captured");
        let upvalue = heap.alloc_upvalue(ptr::null_mut());
        unsafe {
            (*upvalue).closed = make_object_value(captured as *mut Object);
            (*upvalue).location = &mut (*upvalue).closed as *mut Value;
        }

        let stack = [make_object_value(upvalue as *mut Object)];
        let globals = Table::new();
        heap.collect(roots_with_stack(&stack, &globals));

        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn globals_are_roots() {
        let mut heap = ObjectManager::new();
        let key = heap.copy_string("g");
        let value = heap.copy_string("kept by globals");
        let mut globals = Table::new();
        globals.set(key, make_object_value(value as *mut Object));

        let empty: [Value; 0] = [];
        heap.collect(roots_with_stack(&empty, &globals));

        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn compiler_chain_functions_are_roots() {
        let mut heap = ObjectManager::new();
        let function = heap.alloc_function("open compiler".to_string());
        let globals = Table::new();
        let functions = [function];
        let roots = GcRoots {
            stack: &[],
            frames: &[],
            open_upvalues: ptr::null_mut(),
            globals: &globals,
            compiler_functions: &functions,
        };
        heap.collect(roots);

        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn interner_does_not_keep_strings_alive() {
        let mut heap = ObjectManager::new();
        heap.copy_string("ephemeral");
        let hash = crate::objects::object_string::hash_string("ephemeral");
        assert!(!heap.strings.find_string("ephemeral", hash).is_null());

        let empty: [Value; 0] = [];
        let globals = Table::new();
        heap.collect(roots_with_stack(&empty, &globals));

        assert_eq!(heap.object_count(), 0);
        assert!(heap.strings.find_string("ephemeral", hash).is_null());
    }
}
