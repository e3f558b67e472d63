//! String interning table handing out shared handles.
//!
//! Interned strings share one allocation, so handle identity doubles as
//! the equality fast path inside the VM.

use std::collections::HashMap;
use std::rc::Rc;

/// Intern table mapping string content to a shared `Rc<str>` handle.
#[derive(Debug, Default)]
pub struct StringTable {
    lookup: HashMap<String, Rc<str>>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `s`, returning a handle shared with every previous and
    /// future interning of the same content.
    pub fn intern(&mut self, s: &str) -> Rc<str> {
        if let Some(handle) = self.lookup.get(s) {
            return Rc::clone(handle);
        }
        let handle: Rc<str> = Rc::from(s);
        self.lookup.insert(s.to_string(), Rc::clone(&handle));
        handle
    }

    /// Look up an already-interned string without inserting.
    pub fn get(&self, s: &str) -> Option<Rc<str>> {
        self.lookup.get(s).map(Rc::clone)
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_shares_allocation() {
        let mut table = StringTable::new();
        let a = table.intern("hello");
        let b = table.intern("hello");
        let c = table.intern("world");
        assert!(Rc::ptr_eq(&a, &b));
        assert!(!Rc::ptr_eq(&a, &c));
        assert_eq!(&*a, "hello");
    }

    #[test]
    fn test_get_does_not_insert() {
        let mut table = StringTable::new();
        assert!(table.get("missing").is_none());
        table.intern("present");
        assert!(table.get("present").is_some());
        assert_eq!(table.len(), 1);
    }
}
