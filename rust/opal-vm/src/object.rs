//! Programs, objects, and callables.
//!
//! A program is the immutable compiled shape (variable count plus function
//! bodies); an object is one instantiation of it. Destructing an object
//! takes its variable block away while handles to it remain valid; every
//! read through such a handle sees the destructed state instead of stale
//! variables.

use std::cell::RefCell;
use std::rc::Rc;

use opal_core::code::FunctionDef;

use crate::natives::NativeOp;
use crate::values::{drop_deep, Value};

pub struct ProgramData {
    name: String,
    num_vars: usize,
    functions: Vec<FunctionDef>,
}

/// Refcounted handle to a compiled program.
#[derive(Clone)]
pub struct ProgramRef(Rc<ProgramData>);

impl ProgramRef {
    pub fn new(name: String, num_vars: usize, functions: Vec<FunctionDef>) -> ProgramRef {
        ProgramRef(Rc::new(ProgramData {
            name,
            num_vars,
            functions,
        }))
    }

    /// A trivial program for container and value tests.
    #[cfg(test)]
    pub fn for_tests(name: &str) -> ProgramRef {
        ProgramRef::new(name.to_string(), 2, Vec::new())
    }

    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn num_vars(&self) -> usize {
        self.0.num_vars
    }

    pub fn function(&self, index: u16) -> Option<&FunctionDef> {
        self.0.functions.get(index as usize)
    }

    pub fn find_function(&self, name: &str) -> Option<u16> {
        self.0
            .functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| i as u16)
    }
}

/// One instantiation of a program. `state` is `None` once destructed.
pub struct Object {
    program: ProgramRef,
    state: RefCell<Option<Vec<Value>>>,
}

impl Object {
    pub(crate) fn take_state(&self) -> Option<Vec<Value>> {
        self.state.borrow_mut().take()
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        if let Some(mut vars) = self.take_state() {
            drop_deep(&mut vars);
        }
    }
}

/// Refcounted handle to an object.
#[derive(Clone)]
pub struct ObjectRef(Rc<Object>);

impl ObjectRef {
    /// Create an object with every variable at the ordinary zero.
    pub fn instantiate(program: &ProgramRef) -> ObjectRef {
        ObjectRef(Rc::new(Object {
            program: program.clone(),
            state: RefCell::new(Some(vec![Value::zero(); program.num_vars()])),
        }))
    }

    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }

    pub fn program(&self) -> &ProgramRef {
        &self.0.program
    }

    pub fn program_name(&self) -> &str {
        self.0.program.name()
    }

    pub fn is_destructed(&self) -> bool {
        self.0.state.borrow().is_none()
    }

    /// Tear the variable block out of the object. Outstanding handles keep
    /// the husk alive but every access through them reads as destructed.
    /// Returns false when already destructed.
    pub fn destruct(&self) -> bool {
        match self.0.take_state() {
            Some(mut vars) => {
                drop_deep(&mut vars);
                true
            }
            None => false,
        }
    }

    /// Read variable `index`; `None` when the object is destructed.
    pub fn get_var(&self, index: usize) -> Option<Value> {
        self.0
            .state
            .borrow()
            .as_ref()
            .and_then(|vars| vars.get(index).cloned())
    }

    /// Write variable `index`. False when destructed or out of range.
    pub fn set_var(&self, index: usize, value: Value) -> bool {
        match self.0.state.borrow_mut().as_mut() {
            Some(vars) if index < vars.len() => {
                vars[index] = value;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn try_unwrap(self) -> Option<Object> {
        Rc::try_unwrap(self.0).ok()
    }
}

/// A callable value: a registered native, or a function bound to an object.
#[derive(Clone)]
pub enum Callable {
    Native(Rc<NativeOp>),
    Bound { object: ObjectRef, fun: u16 },
}

impl Callable {
    pub fn name(&self) -> &str {
        match self {
            Callable::Native(op) => op.name,
            Callable::Bound { object, fun } => object
                .program()
                .function(*fun)
                .map(|f| f.name.as_str())
                .unwrap_or("?"),
        }
    }

    /// Identity address, consistent with [`Callable::same`] for natives and
    /// distinct per bound object.
    pub fn addr(&self) -> usize {
        match self {
            Callable::Native(op) => Rc::as_ptr(op) as *const u8 as usize,
            Callable::Bound { object, fun } => object.addr() ^ ((*fun as usize) << 1),
        }
    }

    /// Same callable: same native entry, or same object and function slot.
    pub fn same(&self, other: &Callable) -> bool {
        match (self, other) {
            (Callable::Native(a), Callable::Native(b)) => Rc::ptr_eq(a, b),
            (Callable::Bound { object: ao, fun: af }, Callable::Bound { object: bo, fun: bf }) => {
                ao.addr() == bo.addr() && af == bf
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::eq_value;

    #[test]
    fn test_instantiate_zeroed() {
        let p = ProgramRef::for_tests("Point");
        let o = ObjectRef::instantiate(&p);
        assert!(!o.is_destructed());
        assert!(eq_value(&o.get_var(0).unwrap(), &Value::Int(0)));
        assert!(o.get_var(2).is_none());
    }

    #[test]
    fn test_destruct_invalidates_vars() {
        let p = ProgramRef::for_tests("Point");
        let o = ObjectRef::instantiate(&p);
        assert!(o.set_var(1, Value::string("x")));
        let alias = o.clone();
        assert!(o.destruct());
        assert!(!o.destruct());
        assert!(alias.is_destructed());
        assert!(alias.get_var(1).is_none());
        assert!(!alias.set_var(1, Value::Int(9)));
    }

    #[test]
    fn test_destruct_survives_self_reference() {
        let p = ProgramRef::for_tests("Loop");
        let o = ObjectRef::instantiate(&p);
        o.set_var(0, Value::Object(o.clone()));
        assert!(o.destruct());
        assert!(o.is_destructed());
    }
}
