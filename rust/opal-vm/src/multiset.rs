//! The multiset container: a bag of values kept sorted under the set
//! ordering, backed by the ordered array container.
//!
//! Membership and insertion both run as binary searches over the member
//! array, so the type-hint short circuits there apply here too. Handing
//! out the member array is cheap (a handle clone); the copy-on-write rule
//! keeps such snapshots stable across later insertions.

use std::cell::RefCell;
use std::rc::Rc;

use crate::array::ArrayRef;
use crate::values::{eq_value, Value};

/// Multiset backing store: the members, in set order.
pub struct MultisetData {
    members: ArrayRef,
}

impl MultisetData {
    pub(crate) fn into_members(self) -> ArrayRef {
        self.members
    }
}

/// Refcounted handle to a multiset.
#[derive(Clone)]
pub struct MultisetRef(Rc<RefCell<MultisetData>>);

impl Default for MultisetRef {
    fn default() -> Self {
        Self::new()
    }
}

impl MultisetRef {
    pub fn new() -> MultisetRef {
        MultisetRef(Rc::new(RefCell::new(MultisetData {
            members: ArrayRef::allocate(0),
        })))
    }

    /// Build from arbitrary items, sorting them into set order.
    pub fn from_items(items: Vec<Value>) -> MultisetRef {
        let mut members = ArrayRef::from_items(items);
        let order = members.get_set_order();
        members.order(&order);
        MultisetRef(Rc::new(RefCell::new(MultisetData { members })))
    }

    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }

    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    pub(crate) fn try_unwrap(self) -> Option<RefCell<MultisetData>> {
        Rc::try_unwrap(self.0).ok()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A handle to the member array. Callers treat it as a snapshot;
    /// structural updates to the multiset leave it behind.
    pub fn members(&self) -> ArrayRef {
        self.0.borrow().members.clone()
    }

    /// Insert one occurrence of `value` at its ordered position.
    pub fn insert(&self, value: Value) {
        let mut data = self.0.borrow_mut();
        let pos = match data.members.set_lookup(&value) {
            Ok(i) | Err(i) => i,
        };
        data.members.insert(pos, value);
    }

    /// Remove one occurrence of `value`. Returns false when absent.
    pub fn delete(&self, value: &Value) -> bool {
        let mut data = self.0.borrow_mut();
        match data.members.set_lookup(value) {
            Ok(i) => {
                data.members.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    pub fn member(&self, value: &Value) -> bool {
        self.0.borrow().members.set_lookup(value).is_ok()
    }

    /// Occurrences of `value`, scanning outward from the binary-search hit.
    pub fn count(&self, value: &Value) -> usize {
        let data = self.0.borrow();
        let Ok(hit) = data.members.set_lookup(value) else {
            return 0;
        };
        let same = |i: usize| data.members.get(i).is_some_and(|v| eq_value(&v, value));
        let mut lo = hit;
        while lo > 0 && same(lo - 1) {
            lo -= 1;
        }
        let mut hi = hit + 1;
        while hi < data.members.len() && same(hi) {
            hi += 1;
        }
        hi - lo
    }

    /// The members as an array, mirroring mapping `indices`.
    pub fn indices(&self) -> ArrayRef {
        let data = self.0.borrow();
        ArrayRef::from_items_hint(data.members.iter_cloned(), data.members.hint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::{eq_value, set_cmp};

    #[test]
    fn test_insert_keeps_set_order() {
        let s = MultisetRef::new();
        s.insert(Value::Int(5));
        s.insert(Value::string("a"));
        s.insert(Value::Int(1));
        let items = s.members().iter_cloned();
        for w in items.windows(2) {
            assert_ne!(set_cmp(&w[0], &w[1]), std::cmp::Ordering::Greater);
        }
        assert!(s.member(&Value::Int(5)));
        assert!(!s.member(&Value::Int(2)));
    }

    #[test]
    fn test_duplicates_counted() {
        let s = MultisetRef::new();
        s.insert(Value::Int(7));
        s.insert(Value::Int(7));
        s.insert(Value::Int(3));
        assert_eq!(s.count(&Value::Int(7)), 2);
        assert!(s.delete(&Value::Int(7)));
        assert_eq!(s.count(&Value::Int(7)), 1);
        assert!(s.delete(&Value::Int(7)));
        assert!(!s.delete(&Value::Int(7)));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_members_snapshot_survives_insert() {
        let s = MultisetRef::from_items(vec![Value::Int(1), Value::Int(2)]);
        let snap = s.members();
        s.insert(Value::Int(3));
        assert_eq!(snap.len(), 2);
        assert_eq!(s.len(), 3);
        assert!(eq_value(&s.members().get(2).unwrap(), &Value::Int(3)));
    }
}
