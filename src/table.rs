use super::object::{hash_string, Heap, Obj, ObjRef, StrObj};
use super::value::Value;

/// Open-addressed hash table with linear probing, keyed by interned string
/// references. Used for the VM's globals and for the intern table itself.
///
/// Slot states: live `(Some(key), value)`, empty `(None, Nil)`, tombstone
/// `(None, Bool(true))`. Probing stops at an empty slot; tombstones keep
/// the probe sequence alive and are reused on insertion.
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry {
        key: None,
        value: Value::Nil,
    };

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && self.value == Value::Bool(true)
    }
}

impl Table {
    pub fn new() -> Self {
        Self {
            count: 0,
            entries: Vec::new(),
        }
    }

    /// Slot for `key`: its live entry if present, otherwise the first
    /// tombstone on the probe path, otherwise the terminating empty slot.
    fn find_entry(entries: &[Entry], heap: &Heap, key: ObjRef) -> usize {
        let capacity = entries.len();
        let mut index = heap.as_str(key).hash as usize & (capacity - 1);
        let mut tombstone = None;

        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return tombstone.unwrap_or(index);
                    }
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    pub fn get(&self, heap: &Heap, key: ObjRef) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[Self::find_entry(&self.entries, heap, key)];
        entry.key.map(|_| entry.value)
    }

    /// Inserts or overwrites; returns whether the key was new.
    pub fn set(&mut self, heap: &Heap, key: ObjRef, value: Value) -> bool {
        if (self.count + 1) * 4 > self.entries.len() * 3 {
            let capacity = if self.entries.is_empty() {
                8
            } else {
                self.entries.len() * 2
            };
            self.adjust_capacity(heap, capacity);
        }

        let index = Self::find_entry(&self.entries, heap, key);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        // A reused tombstone is already counted.
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new
    }

    pub fn delete(&mut self, heap: &Heap, key: ObjRef) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, heap, key);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::Bool(true);
        true
    }

    /// Rebuilds into `capacity` slots, discarding tombstones.
    fn adjust_capacity(&mut self, heap: &Heap, capacity: usize) {
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; capacity]);
        self.count = 0;
        for entry in old {
            if entry.key.is_some() {
                let index = Self::find_entry(&self.entries, heap, entry.key.unwrap());
                self.entries[index] = entry;
                self.count += 1;
            }
        }
    }

    /// The one lookup that compares keys by contents: scans the probe
    /// sequence for a string with this exact hash and character data.
    pub fn find_string(&self, heap: &Heap, chars: &str, hash: u32) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = hash as usize & (capacity - 1);

        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
                Some(key) => {
                    let string = heap.as_str(key);
                    if string.hash == hash && string.chars == chars {
                        return Some(key);
                    }
                }
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    /// Canonical string for `chars`: the already-interned object if one
    /// exists, otherwise a fresh allocation recorded in this table.
    pub fn intern(&mut self, heap: &mut Heap, chars: String) -> ObjRef {
        let hash = hash_string(&chars);
        if let Some(existing) = self.find_string(heap, &chars, hash) {
            return existing;
        }

        let string = heap.alloc(Obj::Str(StrObj { chars, hash }));
        self.set(heap, string, Value::Nil);
        string
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(heap: &mut Heap, strings: &mut Table, chars: &str) -> ObjRef {
        strings.intern(heap, chars.to_string())
    }

    #[test]
    fn set_get_overwrite() {
        let mut heap = Heap::new();
        let mut strings = Table::new();
        let mut table = Table::new();
        let a = key(&mut heap, &mut strings, "a");

        assert!(table.set(&heap, a, Value::Number(1.0)));
        assert_eq!(table.get(&heap, a), Some(Value::Number(1.0)));

        assert!(!table.set(&heap, a, Value::Number(2.0)));
        assert_eq!(table.get(&heap, a), Some(Value::Number(2.0)));
    }

    #[test]
    fn delete_leaves_a_reusable_tombstone() {
        let mut heap = Heap::new();
        let mut strings = Table::new();
        let mut table = Table::new();
        let a = key(&mut heap, &mut strings, "a");
        let b = key(&mut heap, &mut strings, "b");

        table.set(&heap, a, Value::Number(1.0));
        table.set(&heap, b, Value::Number(2.0));
        assert!(table.delete(&heap, a));
        assert!(!table.delete(&heap, a));
        assert_eq!(table.get(&heap, a), None);
        // The other entry is still reachable through the probe sequence.
        assert_eq!(table.get(&heap, b), Some(Value::Number(2.0)));

        table.set(&heap, a, Value::Number(3.0));
        assert_eq!(table.get(&heap, a), Some(Value::Number(3.0)));
    }

    #[test]
    fn growth_keeps_every_entry() {
        let mut heap = Heap::new();
        let mut strings = Table::new();
        let mut table = Table::new();

        let keys: Vec<ObjRef> = (0..40)
            .map(|i| key(&mut heap, &mut strings, &format!("key-{}", i)))
            .collect();
        for (i, k) in keys.iter().enumerate() {
            table.set(&heap, *k, Value::Number(i as f64));
        }
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(table.get(&heap, *k), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn intern_is_idempotent() {
        let mut heap = Heap::new();
        let mut strings = Table::new();

        let first = strings.intern(&mut heap, "canonical".to_string());
        let second = strings.intern(&mut heap, "canonical".to_string());
        assert_eq!(first, second);
        assert_eq!(heap.str_chars(first), "canonical");

        let other = strings.intern(&mut heap, "different".to_string());
        assert_ne!(first, other);
    }

    #[test]
    fn find_string_compares_contents() {
        let mut heap = Heap::new();
        let mut strings = Table::new();
        let interned = strings.intern(&mut heap, "needle".to_string());

        let hash = hash_string("needle");
        assert_eq!(strings.find_string(&heap, "needle", hash), Some(interned));
        assert_eq!(
            strings.find_string(&heap, "missing", hash_string("missing")),
            None
        );
    }
}
