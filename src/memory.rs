/// Capacity growth used by the bytecode buffers and the hash table.
#[macro_export]
macro_rules! grow_capacity {
    ($capacity:expr) => {{
        if $capacity < 8 {
            8
        } else {
            $capacity * 2
        }
    }};
}

/// The heap doubles its collection threshold after every cycle.
pub const GC_HEAP_GROW_FACTOR: usize = 2;

/// First collection happens once a megabyte of objects is live.
pub const GC_INITIAL_THRESHOLD: usize = 1024 * 1024;
