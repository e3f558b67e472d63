//! The evaluation stack, mark stack, and call frames.
//!
//! One bounded value stack is shared by every frame; a frame's locals are
//! a window into it starting at `locals_base`. The mark stack records
//! argument-list start positions so call sites never count arguments
//! themselves. Underflow is an engine invariant violation, never a
//! language error; overflow is the configured resource limit.

use crate::errors::FatalError;
use crate::object::ObjectRef;
use crate::values::Value;

/// One active call.
#[derive(Clone)]
pub struct Frame {
    /// The object whose function is running.
    pub object: ObjectRef,
    /// Function slot within the object's program.
    pub fun: u16,
    /// Absolute stack index of local 0.
    pub locals_base: usize,
    /// Instruction to resume in the caller.
    pub ret_pc: usize,
    /// Mark-stack height at entry.
    pub saved_marks: usize,
    /// Current instruction, kept fresh for backtraces.
    pub pc: usize,
}

/// The bounded operand stack plus the mark stack.
pub struct Stack {
    items: Vec<Value>,
    marks: Vec<usize>,
    limit: usize,
}

impl Stack {
    pub fn new(limit: usize) -> Stack {
        Stack {
            items: Vec::with_capacity(256.min(limit)),
            marks: Vec::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, value: Value) -> Result<(), FatalError> {
        if self.items.len() >= self.limit {
            return Err(FatalError::StackOverflow(self.limit));
        }
        self.items.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value, FatalError> {
        self.items
            .pop()
            .ok_or_else(|| FatalError::Invariant("pop from empty stack".to_string()))
    }

    /// Pop `n` values, preserving their stack order.
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, FatalError> {
        if self.items.len() < n {
            return Err(FatalError::Invariant(format!(
                "pop {} from stack of {}",
                n,
                self.items.len()
            )));
        }
        Ok(self.items.split_off(self.items.len() - n))
    }

    /// Discard the top `n` values.
    pub fn discard(&mut self, n: usize) -> Result<(), FatalError> {
        if self.items.len() < n {
            return Err(FatalError::Invariant(format!(
                "discard {} from stack of {}",
                n,
                self.items.len()
            )));
        }
        let keep = self.items.len() - n;
        self.items.truncate(keep);
        Ok(())
    }

    /// Drop everything above height `n`.
    pub fn truncate(&mut self, n: usize) {
        self.items.truncate(n);
    }

    pub fn peek(&self, depth: usize) -> Result<&Value, FatalError> {
        self.items
            .len()
            .checked_sub(depth + 1)
            .and_then(|i| self.items.get(i))
            .ok_or_else(|| FatalError::Invariant(format!("peek {} past stack bottom", depth)))
    }

    pub fn get(&self, index: usize) -> Result<&Value, FatalError> {
        self.items
            .get(index)
            .ok_or_else(|| FatalError::Invariant(format!("stack slot {} out of range", index)))
    }

    pub fn set(&mut self, index: usize, value: Value) -> Result<(), FatalError> {
        match self.items.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(FatalError::Invariant(format!(
                "stack slot {} out of range",
                index
            ))),
        }
    }

    pub fn push_mark(&mut self) {
        self.marks.push(self.items.len());
    }

    pub fn pop_mark(&mut self) -> Result<usize, FatalError> {
        self.marks
            .pop()
            .ok_or_else(|| FatalError::Invariant("pop from empty mark stack".to_string()))
    }

    pub fn mark_count(&self) -> usize {
        self.marks.len()
    }

    pub fn truncate_marks(&mut self, n: usize) {
        self.marks.truncate(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::eq_value;

    #[test]
    fn test_push_pop_order() {
        let mut s = Stack::new(16);
        s.push(Value::Int(1)).unwrap();
        s.push(Value::Int(2)).unwrap();
        let both = s.pop_n(2).unwrap();
        assert!(eq_value(&both[0], &Value::Int(1)));
        assert!(eq_value(&both[1], &Value::Int(2)));
        assert!(s.is_empty());
    }

    #[test]
    fn test_overflow_and_underflow() {
        let mut s = Stack::new(2);
        s.push(Value::Int(1)).unwrap();
        s.push(Value::Int(2)).unwrap();
        assert!(matches!(
            s.push(Value::Int(3)),
            Err(FatalError::StackOverflow(2))
        ));
        s.truncate(0);
        assert!(matches!(s.pop(), Err(FatalError::Invariant(_))));
    }

    #[test]
    fn test_marks_record_heights() {
        let mut s = Stack::new(16);
        s.push_mark();
        s.push(Value::Int(1)).unwrap();
        s.push(Value::Int(2)).unwrap();
        assert_eq!(s.len() - s.pop_mark().unwrap(), 2);
    }
}
