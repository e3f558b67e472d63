//! The hash-mapping container: a chained hash table keyed by value
//! equality, with identity as the fast path for heap-handle keys.
//!
//! The mapping box is a stable heap cell; insertion and deletion mutate it
//! in place through every handle (the uniqueness-gated copy rule belongs
//! to the array container, whose handles get replaced on the copy path).
//! Occupancy watermarks trigger grow and shrink rehashes, and a scrub pass
//! drops entries that hold destructed-object handles before operations
//! that must not observe stale objects.

use std::cell::RefCell;
use std::rc::Rc;

use crate::array::ArrayRef;
use crate::values::{deep_equal, drop_deep, eq_value, hash_value, Tag, TypeHint, Value};

const MIN_BUCKETS: usize = 8;

struct Entry {
    hash: u64,
    key: Value,
    value: Value,
}

/// Mapping backing store: bucket chains plus the key and value hints.
pub struct MappingData {
    buckets: Vec<Vec<Entry>>,
    size: usize,
    key_hint: TypeHint,
    val_hint: TypeHint,
}

impl MappingData {
    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    /// Move every key and value into `work` for the flattened teardown.
    pub(crate) fn drain_into(&mut self, work: &mut Vec<Value>) {
        for chain in std::mem::take(&mut self.buckets) {
            for entry in chain {
                work.push(entry.key);
                work.push(entry.value);
            }
        }
        self.size = 0;
    }
}

impl Drop for MappingData {
    fn drop(&mut self) {
        if self.size > 0 {
            let mut work = Vec::with_capacity(self.size * 2);
            self.drain_into(&mut work);
            drop_deep(&mut work);
        }
    }
}

/// Refcounted handle to a mapping.
#[derive(Clone)]
pub struct MappingRef(Rc<RefCell<MappingData>>);

impl Default for MappingRef {
    fn default() -> Self {
        Self::new()
    }
}

impl MappingRef {
    pub fn new() -> MappingRef {
        MappingRef(Rc::new(RefCell::new(MappingData {
            buckets: (0..MIN_BUCKETS).map(|_| Vec::new()).collect(),
            size: 0,
            key_hint: TypeHint::EMPTY,
            val_hint: TypeHint::EMPTY,
        })))
    }

    /// Build from key/value pairs; later duplicates win.
    pub fn from_pairs(pairs: Vec<(Value, Value)>) -> MappingRef {
        let m = MappingRef::new();
        for (k, v) in pairs {
            m.insert(k, v);
        }
        m
    }

    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }

    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    pub(crate) fn try_unwrap(self) -> Option<RefCell<MappingData>> {
        Rc::try_unwrap(self.0).ok()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn key_hint(&self) -> TypeHint {
        self.0.borrow().key_hint
    }

    pub fn val_hint(&self) -> TypeHint {
        self.0.borrow().val_hint
    }

    /// Bucket count, exposed for rehash diagnostics.
    pub fn bucket_count(&self) -> usize {
        self.0.borrow().buckets.len()
    }

    /// Insert or update. An existing key's value is replaced in its slot,
    /// leaving the chain layout (and thus iteration order) untouched.
    pub fn insert(&self, key: Value, value: Value) {
        let mut data = self.0.borrow_mut();
        data.key_hint.insert(key.tag());
        data.val_hint.insert(value.tag());
        let hash = hash_value(&key);
        let idx = data.bucket_of(hash);

        for entry in &mut data.buckets[idx] {
            if entry.hash == hash && eq_value(&entry.key, &key) {
                entry.value = value;
                return;
            }
        }
        data.buckets[idx].push(Entry { hash, key, value });
        data.size += 1;

        if data.size > data.buckets.len() * 2 {
            let n = data.buckets.len() * 2;
            rehash(&mut data, n);
        }
    }

    /// Look up `key`, cloning the stored value. A clear key-hint bit
    /// proves the miss without probing.
    pub fn lookup(&self, key: &Value) -> Option<Value> {
        let data = self.0.borrow();
        if !data.key_hint.contains(key.tag()) {
            return None;
        }
        let hash = hash_value(key);
        data.buckets[data.bucket_of(hash)]
            .iter()
            .find(|e| e.hash == hash && eq_value(&e.key, key))
            .map(|e| e.value.clone())
    }

    /// Indexing form of lookup: a miss yields the undefined zero.
    pub fn index_value(&self, key: &Value) -> Value {
        self.lookup(key).unwrap_or(Value::Undefined)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.lookup(key).is_some()
    }

    /// Remove `key`, freeing both the key and the value. Shrinks the
    /// table once occupancy falls below the low-water mark.
    pub fn delete(&self, key: &Value) -> bool {
        let mut data = self.0.borrow_mut();
        if !data.key_hint.contains(key.tag()) {
            return false;
        }
        let hash = hash_value(key);
        let idx = data.bucket_of(hash);
        let pos = data.buckets[idx]
            .iter()
            .position(|e| e.hash == hash && eq_value(&e.key, key));
        let Some(pos) = pos else {
            return false;
        };
        data.buckets[idx].remove(pos);
        data.size -= 1;

        if data.buckets.len() > MIN_BUCKETS && data.size * 4 < data.buckets.len() {
            let n = (data.buckets.len() / 2).max(MIN_BUCKETS);
            rehash(&mut data, n);
        }
        true
    }

    /// Drop entries whose key is a destructed-object handle and neutralize
    /// destructed values to the distinguishable zero.
    pub fn scrub_destructed(&self) {
        let mut data = self.0.borrow_mut();
        let mut dropped = 0usize;
        for chain in &mut data.buckets {
            chain.retain(|e| {
                if e.key.is_destructed_handle() {
                    dropped += 1;
                    false
                } else {
                    true
                }
            });
            for entry in chain {
                entry.value.check_destructed();
            }
        }
        data.size -= dropped;
    }

    /// Clone out every entry, in table order.
    pub fn entries(&self) -> Vec<(Value, Value)> {
        let data = self.0.borrow();
        let mut out = Vec::with_capacity(data.size);
        for chain in &data.buckets {
            for entry in chain {
                out.push((entry.key.clone(), entry.value.clone()));
            }
        }
        out
    }

    /// The keys, as an array. Scrubs stale objects first.
    pub fn indices(&self) -> ArrayRef {
        self.scrub_destructed();
        let items: Vec<Value> = self.entries().into_iter().map(|(k, _)| k).collect();
        ArrayRef::from_items_hint(items, self.key_hint())
    }

    /// The values, as an array. Scrubs stale objects first. Neutralized
    /// values make the hint include the integer bit.
    pub fn values(&self) -> ArrayRef {
        self.scrub_destructed();
        let items: Vec<Value> = self.entries().into_iter().map(|(_, v)| v).collect();
        ArrayRef::from_items_hint(items, self.val_hint().union(TypeHint::of(Tag::Int)))
    }

    /// Structural equality: same size and every entry of `self` matched by
    /// key with a structurally equal value. Both sides are scrubbed first.
    pub fn deep_equal(&self, other: &MappingRef, seen: &mut Vec<(usize, usize)>) -> bool {
        if self.addr() == other.addr() {
            return true;
        }
        self.scrub_destructed();
        other.scrub_destructed();
        if self.len() != other.len() {
            return false;
        }
        for (k, v) in self.entries() {
            match other.lookup(&k) {
                Some(w) if deep_equal(&v, &w, seen) => {}
                _ => return false,
            }
        }
        true
    }
}

fn rehash(data: &mut MappingData, new_buckets: usize) {
    let old = std::mem::take(&mut data.buckets);
    data.buckets = (0..new_buckets).map(|_| Vec::new()).collect();
    for chain in old {
        for entry in chain {
            let idx = data.bucket_of(entry.hash);
            data.buckets[idx].push(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectRef, ProgramRef};

    #[test]
    fn test_insert_lookup_delete() {
        let m = MappingRef::new();
        m.insert(Value::string("a"), Value::Int(1));
        m.insert(Value::Int(2), Value::string("two"));
        assert_eq!(m.len(), 2);
        assert!(eq_value(&m.lookup(&Value::string("a")).unwrap(), &Value::Int(1)));
        assert!(m.delete(&Value::string("a")));
        assert!(!m.delete(&Value::string("a")));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_update_in_place() {
        let m = MappingRef::new();
        m.insert(Value::Int(1), Value::Int(10));
        m.insert(Value::Int(1), Value::Int(20));
        assert_eq!(m.len(), 1);
        assert_eq!(m.lookup(&Value::Int(1)).unwrap().as_int(), Some(20));
    }

    #[test]
    fn test_miss_is_undefined() {
        let m = MappingRef::new();
        assert!(m.index_value(&Value::Int(9)).is_undefined());
    }

    #[test]
    fn test_key_equality_is_value_equality() {
        let m = MappingRef::new();
        m.insert(Value::string("key"), Value::Int(1));
        // A different allocation with the same content finds the entry.
        assert!(m.contains_key(&Value::string("key")));
        // Int and float keys never unify.
        m.insert(Value::Int(5), Value::Int(2));
        assert!(!m.contains_key(&Value::Float(5.0)));
    }

    #[test]
    fn test_hint_short_circuit() {
        let m = MappingRef::new();
        m.insert(Value::Int(1), Value::Int(2));
        assert!(!m.key_hint().contains(Tag::Str));
        assert!(m.lookup(&Value::string("nope")).is_none());
    }

    #[test]
    fn test_grow_and_shrink_rehash() {
        let m = MappingRef::new();
        let initial = m.bucket_count();
        for i in 0..100 {
            m.insert(Value::Int(i), Value::Int(i * 2));
        }
        assert!(m.bucket_count() > initial);
        for i in 0..100 {
            assert_eq!(m.lookup(&Value::Int(i)).unwrap().as_int(), Some(i * 2));
        }
        for i in 0..100 {
            m.delete(&Value::Int(i));
        }
        assert_eq!(m.len(), 0);
        assert_eq!(m.bucket_count(), MIN_BUCKETS);
    }

    #[test]
    fn test_scrub_destructed() {
        let program = ProgramRef::for_tests("Thing");
        let alive = ObjectRef::instantiate(&program);
        let dead = ObjectRef::instantiate(&program);
        let m = MappingRef::new();
        m.insert(Value::Int(1), Value::Object(dead.clone()));
        m.insert(Value::Object(dead.clone()), Value::Int(2));
        m.insert(Value::Int(3), Value::Object(alive.clone()));
        dead.destruct();

        m.scrub_destructed();
        // Dead key entry removed, dead value neutralized, rest untouched.
        assert_eq!(m.len(), 2);
        assert!(matches!(m.lookup(&Value::Int(1)), Some(Value::Destructed)));
        assert!(matches!(m.lookup(&Value::Int(3)), Some(Value::Object(_))));
    }

    #[test]
    fn test_indices_values() {
        let m = MappingRef::new();
        m.insert(Value::Int(1), Value::string("one"));
        let keys = m.indices();
        let vals = m.values();
        assert_eq!(keys.len(), 1);
        assert_eq!(vals.len(), 1);
        assert!(keys.hint().contains(Tag::Int));
        assert!(vals.hint().contains(Tag::Str));
    }

    #[test]
    fn test_deep_equal() {
        let a = MappingRef::new();
        let b = MappingRef::new();
        a.insert(Value::string("k"), Value::Int(1));
        b.insert(Value::string("k"), Value::Int(1));
        let mut seen = Vec::new();
        assert!(a.deep_equal(&b, &mut seen));
        b.insert(Value::string("k"), Value::Int(2));
        assert!(!a.deep_equal(&b, &mut seen));
    }
}
