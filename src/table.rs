use std::ptr;

use crate::grow_capacity;
use crate::objects::object_string::ObjectString;
use crate::value::{is_nil, make_bool_value, make_nil_value, Value};

const TABLE_MAX_LOAD: f64 = 0.75;

/// A bucket. Three states: empty (null key, nil value), tombstone (null key,
/// `true` value), or occupied. Probing walks through tombstones; insertion
/// reuses the first one it saw.
#[derive(Clone, Copy)]
pub struct Entry {
    pub key: *mut ObjectString,
    pub value: Value,
}

impl Entry {
    fn empty() -> Entry {
        Entry {
            key: ptr::null_mut(),
            value: make_nil_value(),
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_null() && !is_nil(&self.value)
    }
}

/// Open-addressed map from interned strings to values, probing linearly. Keys
/// hash once at string creation; lookups compare pointers because keys are
/// interned. `count` includes tombstones, which keeps probe loops finite under
/// the 0.75 load ceiling.
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            count: 0,
            entries: vec![],
        }
    }

    /// Live entries, tombstones excluded.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.key.is_null()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_entry(entries: &[Entry], key: *mut ObjectString) -> usize {
        let capacity = entries.len();
        let mut index = unsafe { (*key).hash } as usize % capacity;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            if entry.key.is_null() {
                if !entry.is_tombstone() {
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if entry.key == key {
                return index;
            }
            index = (index + 1) % capacity;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let old = std::mem::replace(&mut self.entries, vec![Entry::empty(); capacity]);
        self.count = 0;
        for entry in old {
            if entry.key.is_null() {
                continue;
            }
            let index = Self::find_entry(&self.entries, entry.key);
            self.entries[index] = entry;
            self.count += 1;
        }
    }

    /// Returns true when the key was not previously present.
    pub fn set(&mut self, key: *mut ObjectString, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * TABLE_MAX_LOAD {
            let capacity = grow_capacity!(self.entries.len());
            self.adjust_capacity(capacity);
        }

        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_null();
        if is_new_key && is_nil(&entry.value) {
            self.count += 1;
        }
        entry.key = key;
        entry.value = value;
        is_new_key
    }

    pub fn get(&self, key: *mut ObjectString) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &self.entries[index];
        if entry.key.is_null() {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Replaces the entry with a tombstone so probe chains stay intact.
    pub fn delete(&mut self, key: *mut ObjectString) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_null() {
            return false;
        }
        entry.key = ptr::null_mut();
        entry.value = make_bool_value(true);
        true
    }

    /// Content-addressed probe used by the interner, the one place keys are
    /// compared by bytes instead of by pointer.
    pub fn find_string(&self, content: &str, hash: u32) -> *mut ObjectString {
        if self.count == 0 {
            return ptr::null_mut();
        }
        let capacity = self.entries.len();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &self.entries[index];
            if entry.key.is_null() {
                if !entry.is_tombstone() {
                    return ptr::null_mut();
                }
            } else {
                let key = unsafe { &*entry.key };
                if key.content.len() == content.len()
                    && key.hash == hash
                    && key.content == content
                {
                    return entry.key;
                }
            }
            index = (index + 1) % capacity;
        }
    }

    /// Deletes every entry whose key object is unmarked. Run between the mark
    /// and sweep phases so the interner never dangles.
    pub fn remove_white(&mut self) {
        for index in 0..self.entries.len() {
            let key = self.entries[index].key;
            if !key.is_null() && unsafe { !(*key).object.is_marked } {
                self.entries[index].key = ptr::null_mut();
                self.entries[index].value = make_bool_value(true);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (*mut ObjectString, Value)> + '_ {
        self.entries
            .iter()
            .filter(|entry| !entry.key.is_null())
            .map(|entry| (entry.key, entry.value))
    }
}

impl Default for Table {
    fn default() -> Table {
        Table::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object_string::{hash_string, ObjectString};
    use crate::value::{make_number_value, values_equal};

    fn leak_string(content: &str) -> *mut ObjectString {
        let hash = hash_string(content);
        Box::into_raw(Box::new(ObjectString::new(content.to_string(), hash)))
    }

    #[test]
    fn get_on_empty_table_misses() {
        let table = Table::new();
        let key = leak_string("missing");
        assert!(table.get(key).is_none());
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut table = Table::new();
        let key = leak_string("answer");
        assert!(table.set(key, make_number_value(42.0)));
        let value = table.get(key).expect("key should be present");
        assert!(values_equal(&value, &make_number_value(42.0)));
    }

    #[test]
    fn second_set_reports_existing_key_and_overwrites() {
        let mut table = Table::new();
        let key = leak_string("k");
        assert!(table.set(key, make_number_value(1.0)));
        assert!(!table.set(key, make_number_value(2.0)));
        let value = table.get(key).expect("key should be present");
        assert!(values_equal(&value, &make_number_value(2.0)));
    }

    #[test]
    fn delete_leaves_a_reusable_tombstone() {
        let mut table = Table::new();
        let key = leak_string("gone");
        table.set(key, make_number_value(1.0));
        let count_after_insert = table.count;
        assert!(table.delete(key));
        assert!(table.get(key).is_none());
        assert!(!table.delete(key));
        // Tombstones stay in the count; reinserting reuses the slot without
        // growing it.
        assert_eq!(table.count, count_after_insert);
        assert!(table.set(key, make_number_value(2.0)));
        assert_eq!(table.count, count_after_insert);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn growth_rehashes_every_live_entry() {
        let mut table = Table::new();
        let keys: Vec<*mut ObjectString> =
            (0..32).map(|i| leak_string(&format!("key{}", i))).collect();
        for (i, key) in keys.iter().enumerate() {
            table.set(*key, make_number_value(i as f64));
        }
        assert!(table.capacity() >= 32);
        for (i, key) in keys.iter().enumerate() {
            let value = table.get(*key).expect("entry lost during growth");
            assert!(values_equal(&value, &make_number_value(i as f64)));
        }
    }

    #[test]
    fn growth_discards_tombstones() {
        let mut table = Table::new();
        let keys: Vec<*mut ObjectString> =
            (0..6).map(|i| leak_string(&format!("t{}", i))).collect();
        for key in &keys {
            table.set(*key, make_number_value(0.0));
        }
        for key in &keys[1..] {
            table.delete(*key);
        }
        // Force a rebuild; only the surviving key comes along.
        let survivors: Vec<*mut ObjectString> =
            (0..8).map(|i| leak_string(&format!("s{}", i))).collect();
        for key in &survivors {
            table.set(*key, make_number_value(1.0));
        }
        assert_eq!(table.len(), 1 + survivors.len());
        assert!(table.get(keys[0]).is_some());
        for key in &keys[1..] {
            assert!(table.get(*key).is_none());
        }
    }

    #[test]
    fn find_string_matches_by_content() {
        let mut table = Table::new();
        let key = leak_string("shared");
        table.set(key, make_number_value(0.0));
        let found = table.find_string("shared", hash_string("shared"));
        assert_eq!(found, key);
        assert!(table.find_string("other", hash_string("other")).is_null());
    }

    #[test]
    fn remove_white_drops_unmarked_keys() {
        let mut table = Table::new();
        let marked = leak_string("marked");
        let unmarked = leak_string("unmarked");
        unsafe {
            (*marked).object.is_marked = true;
        }
        table.set(marked, make_number_value(1.0));
        table.set(unmarked, make_number_value(2.0));
        table.remove_white();
        assert!(table.get(marked).is_some());
        assert!(table.get(unmarked).is_none());
    }
}
