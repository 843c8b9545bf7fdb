//! Hash table keyed by interned strings.
//!
//! Open addressing with linear probing. Deleted entries leave a tombstone behind so that probe
//! sequences running through them keep working; tombstones count towards the load factor and are
//! dropped when the table grows. Keys are compared by identity, which is correct only because
//! every string key is interned.

use crate::heap::HeapRef;
use crate::value::Value;

const MIN_CAPACITY: usize = 8;
// Grow once more than 3/4 of the buckets are full or tombstones.
const MAX_LOAD_NUMERATOR: usize = 3;
const MAX_LOAD_DENOMINATOR: usize = 4;

#[derive(Debug, Clone)]
struct Entry {
    key: HeapRef,
    // Cached so probing and growing never have to look at the string object.
    hash: u32,
    value: Value,
}

#[derive(Debug, Clone)]
enum Bucket {
    Empty,
    Tombstone,
    Full(Entry),
}

/// Mapping from interned string to value.
#[derive(Debug, Clone, Default)]
pub struct Table {
    buckets: Vec<Bucket>,
    // Full buckets plus tombstones: everything that lengthens a probe.
    used: usize,
    len: usize,
}

impl Table {
    /// An empty table. Doesn't allocate until the first insert.
    pub fn new() -> Table {
        Table::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The value stored under `key`.
    pub fn get(&self, key: &HeapRef) -> Option<Value> {
        if self.len == 0 {
            return None;
        }
        let idx = find_bucket(&self.buckets, key, key.string_hash());
        match &self.buckets[idx] {
            Bucket::Full(entry) => Some(entry.value.clone()),
            _ => None,
        }
    }

    /// Whether `key` has an entry.
    pub fn contains_key(&self, key: &HeapRef) -> bool {
        self.get(key).is_some()
    }

    /// Insert or overwrite. Returns true if the key was not in the table before.
    pub fn set(&mut self, key: HeapRef, value: Value) -> bool {
        if (self.used + 1) * MAX_LOAD_DENOMINATOR > self.buckets.len() * MAX_LOAD_NUMERATOR {
            self.grow();
        }
        let hash = key.string_hash();
        let idx = find_bucket(&self.buckets, &key, hash);
        let is_new_key = match &self.buckets[idx] {
            Bucket::Full(_) => false,
            Bucket::Empty => {
                self.used += 1;
                true
            }
            // reusing a tombstone doesn't change `used`
            Bucket::Tombstone => true,
        };
        if is_new_key {
            self.len += 1;
        }
        self.buckets[idx] = Bucket::Full(Entry { key, hash, value });
        is_new_key
    }

    /// Remove the key, returning whether it was present.
    pub fn delete(&mut self, key: &HeapRef) -> bool {
        if self.len == 0 {
            return false;
        }
        let idx = find_bucket(&self.buckets, key, key.string_hash());
        if let Bucket::Full(_) = self.buckets[idx] {
            self.buckets[idx] = Bucket::Tombstone;
            self.len -= 1;
            true
        } else {
            false
        }
    }

    /// Copy every entry of self into `to`.
    pub fn add_all(&self, to: &mut Table) {
        for (key, value) in self.iter() {
            to.set(key.clone(), value.clone());
        }
    }

    /// Look a string up by content rather than identity. This is how the intern pool finds the
    /// canonical copy of a string before one exists as a key anywhere.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<HeapRef> {
        if self.len == 0 {
            return None;
        }
        let mask = self.buckets.len() - 1;
        let mut idx = hash as usize & mask;
        loop {
            match &self.buckets[idx] {
                Bucket::Empty => return None,
                Bucket::Tombstone => {}
                Bucket::Full(entry) => {
                    if entry.hash == hash
                        && entry
                            .key
                            .map_as_string(|s| s.as_str() == chars)
                            .unwrap_or(false)
                    {
                        return Some(entry.key.clone());
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    /// Drop every entry whose key the collector did not mark. Used on the weak intern pool right
    /// before unmarked objects are freed.
    pub(crate) fn remove_unmarked(&mut self) {
        for bucket in self.buckets.iter_mut() {
            if let Bucket::Full(entry) = bucket {
                if !entry.key.is_marked() {
                    *bucket = Bucket::Tombstone;
                    self.len -= 1;
                }
            }
        }
    }

    /// Every live entry, in bucket order.
    pub fn iter(&self) -> impl Iterator<Item = (&HeapRef, &Value)> + '_ {
        self.buckets.iter().filter_map(|bucket| match bucket {
            Bucket::Full(entry) => Some((&entry.key, &entry.value)),
            _ => None,
        })
    }

    pub(crate) fn size_hint(&self) -> usize {
        self.buckets.capacity() * std::mem::size_of::<Bucket>()
    }

    fn grow(&mut self) {
        let capacity = (self.buckets.len() * 2).max(MIN_CAPACITY);
        let old = std::mem::replace(&mut self.buckets, vec![Bucket::Empty; capacity]);
        self.used = 0;
        self.len = 0;
        for bucket in old {
            if let Bucket::Full(entry) = bucket {
                let idx = find_bucket(&self.buckets, &entry.key, entry.hash);
                self.buckets[idx] = Bucket::Full(entry);
                self.used += 1;
                self.len += 1;
            }
        }
    }
}

// The bucket holding `key`, or the bucket it should be inserted into: the first tombstone on the
// probe path if there was one, otherwise the empty bucket that ended the probe.
// Capacity is always a power of two and never full, so the probe terminates.
fn find_bucket(buckets: &[Bucket], key: &HeapRef, hash: u32) -> usize {
    let mask = buckets.len() - 1;
    let mut idx = hash as usize & mask;
    let mut tombstone = None;
    loop {
        match &buckets[idx] {
            Bucket::Empty => return tombstone.unwrap_or(idx),
            Bucket::Tombstone => {
                if tombstone.is_none() {
                    tombstone = Some(idx);
                }
            }
            Bucket::Full(entry) => {
                if entry.key.ptr_eq(key) {
                    return idx;
                }
            }
        }
        idx = (idx + 1) & mask;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::heap::Heap;

    fn keys(heap: &mut Heap, n: usize) -> Vec<HeapRef> {
        (0..n).map(|i| heap.intern(&format!("key{}", i), &())).collect()
    }

    #[test]
    fn set_get_overwrite() {
        let mut heap = Heap::new();
        let k = keys(&mut heap, 2);
        let mut table = Table::new();
        assert_eq!(table.get(&k[0]), None);
        assert!(table.set(k[0].clone(), Value::Number(1.0)));
        assert!(!table.set(k[0].clone(), Value::Number(2.0)));
        assert_eq!(table.get(&k[0]), Some(Value::Number(2.0)));
        assert_eq!(table.get(&k[1]), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut heap = Heap::new();
        let k = keys(&mut heap, 100);
        let mut table = Table::new();
        for (i, key) in k.iter().enumerate() {
            table.set(key.clone(), Value::Number(i as f64));
        }
        assert_eq!(table.len(), 100);
        for (i, key) in k.iter().enumerate() {
            assert_eq!(table.get(key), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn delete_leaves_probe_chains_intact() {
        let mut heap = Heap::new();
        let k = keys(&mut heap, 40);
        let mut table = Table::new();
        for key in &k {
            table.set(key.clone(), Value::Boolean(true));
        }
        for key in k.iter().step_by(2) {
            assert!(table.delete(key));
        }
        assert!(!table.delete(&k[0]));
        for (i, key) in k.iter().enumerate() {
            assert_eq!(table.get(key).is_some(), i % 2 == 1, "key {}", i);
        }
        assert_eq!(table.len(), 20);

        // tombstones get reused
        assert!(table.set(k[0].clone(), Value::Nil));
        assert_eq!(table.get(&k[0]), Some(Value::Nil));
    }

    #[test]
    fn find_string_by_content() {
        let mut heap = Heap::new();
        let k = keys(&mut heap, 3);
        let mut table = Table::new();
        for key in &k {
            table.set(key.clone(), Value::Nil);
        }
        let found = table
            .find_string("key1", crate::object::hash_string("key1"))
            .unwrap();
        assert!(found.ptr_eq(&k[1]));
        assert!(table
            .find_string("nope", crate::object::hash_string("nope"))
            .is_none());
    }

    #[test]
    fn add_all_copies() {
        let mut heap = Heap::new();
        let k = keys(&mut heap, 5);
        let mut from = Table::new();
        for key in &k {
            from.set(key.clone(), Value::Number(7.0));
        }
        let mut to = Table::new();
        from.add_all(&mut to);
        assert_eq!(to.len(), 5);
        assert_eq!(to.get(&k[4]), Some(Value::Number(7.0)));
    }
}
