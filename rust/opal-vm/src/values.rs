//! Tagged value representation and the comparisons the containers and
//! dispatcher are built on.
//!
//! Heap-handle variants are `Rc`-owned: cloning a `Value` is the reference
//! increment and dropping it the decrement-and-maybe-free of the runtime's
//! ownership contract. The zero integer carries a flavor so that "no such
//! entry" (undefined) and "read from a destructed object" stay
//! distinguishable from a plain 0 while comparing equal to it.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::array::ArrayRef;
use crate::mapping::MappingRef;
use crate::multiset::MultisetRef;
use crate::object::{Callable, ObjectRef, ProgramRef};

/// Refcounted string handle. Interned strings share one allocation.
pub type RStr = Rc<str>;

/// Runtime type tags, in canonical set-ordering rank.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tag {
    Int = 0,
    Float = 1,
    Str = 2,
    Array = 3,
    Mapping = 4,
    Multiset = 5,
    Object = 6,
    Function = 7,
    Program = 8,
}

/// Flavor of a zero integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroFlavor {
    /// An ordinary number that happens to be zero.
    Number,
    /// Produced by lookup misses and absent arguments.
    Undefined,
    /// Read through a handle to a destructed object.
    Destructed,
}

/// Per-container bitmask over-approximating which tags occur inside.
///
/// Bits may be set spuriously but never missing, so a clear bit proves
/// absence and short-circuits scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeHint(u16);

impl TypeHint {
    pub const EMPTY: TypeHint = TypeHint(0);
    pub const MIXED: TypeHint = TypeHint(0x01ff);

    pub fn of(tag: Tag) -> TypeHint {
        TypeHint(1 << tag as u16)
    }

    pub fn insert(&mut self, tag: Tag) {
        self.0 |= 1 << tag as u16;
    }

    pub fn union(self, other: TypeHint) -> TypeHint {
        TypeHint(self.0 | other.0)
    }

    pub fn contains(self, tag: Tag) -> bool {
        self.0 & (1 << tag as u16) != 0
    }

    pub fn is_disjoint(self, other: TypeHint) -> bool {
        self.0 & other.0 == 0
    }

    /// True when every tag a value could have that orders below `tag` is
    /// absent, i.e. a `tag`-typed probe is less than everything here.
    pub fn all_above(self, tag: Tag) -> bool {
        let below: u16 = (2 << tag as u16) - 1;
        self.0 & below == 0
    }

    /// True when every tag ordering above `tag` is absent.
    pub fn all_below(self, tag: Tag) -> bool {
        let above: u16 = Self::MIXED.0 << tag as u16 & Self::MIXED.0;
        self.0 & above == 0
    }
}

/// A runtime value.
///
/// `LvalLocal` and `Void` are stack-only markers used by the two-slot
/// lvalue protocol; they are never stored in containers.
#[derive(Clone)]
pub enum Value {
    Int(i64),
    /// Zero integer, undefined flavor.
    Undefined,
    /// Zero integer read from a destructed object handle.
    Destructed,
    Float(f64),
    Str(RStr),
    Array(ArrayRef),
    Mapping(MappingRef),
    Multiset(MultisetRef),
    Object(ObjectRef),
    Function(Callable),
    Program(ProgramRef),
    /// Lvalue marker naming an absolute slot on the evaluation stack.
    LvalLocal(usize),
    /// Filler for the second slot of a direct lvalue.
    Void,
}

impl Value {
    pub fn zero() -> Value {
        Value::Int(0)
    }

    pub fn string(s: &str) -> Value {
        Value::Str(Rc::from(s))
    }

    pub fn tag(&self) -> Tag {
        match self {
            Value::Int(_) | Value::Undefined | Value::Destructed => Tag::Int,
            Value::Float(_) => Tag::Float,
            Value::Str(_) => Tag::Str,
            Value::Array(_) => Tag::Array,
            Value::Mapping(_) => Tag::Mapping,
            Value::Multiset(_) => Tag::Multiset,
            Value::Object(_) => Tag::Object,
            Value::Function(_) => Tag::Function,
            Value::Program(_) => Tag::Program,
            Value::LvalLocal(_) | Value::Void => {
                panic!("lvalue marker escaped the evaluation stack")
            }
        }
    }

    pub fn zero_flavor(&self) -> Option<ZeroFlavor> {
        match self {
            Value::Int(_) => Some(ZeroFlavor::Number),
            Value::Undefined => Some(ZeroFlavor::Undefined),
            Value::Destructed => Some(ZeroFlavor::Destructed),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Undefined | Value::Destructed => Some(0),
            _ => None,
        }
    }

    /// The false test. Only the zero integer (in any flavor) and handles
    /// to destructed objects read as zero; `0.0` and empty containers are
    /// true.
    pub fn is_zero(&self) -> bool {
        match self {
            Value::Int(n) => *n == 0,
            Value::Undefined | Value::Destructed => true,
            Value::Object(o) => o.is_destructed(),
            Value::Function(Callable::Bound { object, .. }) => object.is_destructed(),
            _ => false,
        }
    }

    /// True for a handle whose underlying object has been destructed.
    pub fn is_destructed_handle(&self) -> bool {
        match self {
            Value::Object(o) => o.is_destructed(),
            Value::Function(Callable::Bound { object, .. }) => object.is_destructed(),
            _ => false,
        }
    }

    /// Replace a handle to a destructed object with the distinguishable
    /// destructed zero, leaving other holders' handles intact.
    pub fn check_destructed(&mut self) {
        if self.is_destructed_handle() {
            *self = Value::Destructed;
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(
            self,
            Value::Array(_) | Value::Mapping(_) | Value::Multiset(_) | Value::Object(_)
        )
    }

    /// Identity address for heap handles, used for ordering, hashing and
    /// cycle detection. `None` for inline scalars.
    fn heap_addr(&self) -> Option<usize> {
        match self {
            Value::Str(s) => Some(Rc::as_ptr(s) as *const u8 as usize),
            Value::Array(a) => Some(a.addr()),
            Value::Mapping(m) => Some(m.addr()),
            Value::Multiset(s) => Some(s.addr()),
            Value::Object(o) => Some(o.addr()),
            Value::Program(p) => Some(p.addr()),
            Value::Function(c) => Some(c.addr()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Equality

/// Shallow value equality, as used by the `==` opcode and for mapping keys:
/// scalars by value (all zero flavors equal), strings by content with the
/// shared-allocation fast path, heap handles by identity. Int and float
/// never compare equal across tags.
pub fn eq_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => Rc::ptr_eq(x, y) || x == y,
        (Value::Function(x), Value::Function(y)) => x.same(y),
        _ => {
            if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
                return x == y;
            }
            match (a.heap_addr(), b.heap_addr()) {
                (Some(x), Some(y)) => a.tag() == b.tag() && x == y,
                _ => false,
            }
        }
    }
}

/// Structural equality with cycle protection: `seen` records handle pairs
/// already under comparison, and a revisited pair is taken as equal so
/// self-referential structures terminate.
pub fn deep_equal(a: &Value, b: &Value, seen: &mut Vec<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Array(x), Value::Array(y)) => {
            if x.addr() == y.addr() {
                return true;
            }
            let pair = (x.addr(), y.addr());
            if seen.contains(&pair) {
                return true;
            }
            seen.push(pair);
            let res = x.deep_equal(y, seen);
            seen.pop();
            res
        }
        (Value::Mapping(x), Value::Mapping(y)) => {
            if x.addr() == y.addr() {
                return true;
            }
            let pair = (x.addr(), y.addr());
            if seen.contains(&pair) {
                return true;
            }
            seen.push(pair);
            let res = x.deep_equal(y, seen);
            seen.pop();
            res
        }
        (Value::Multiset(x), Value::Multiset(y)) => {
            x.addr() == y.addr() || {
                let pair = (x.addr(), y.addr());
                if seen.contains(&pair) {
                    true
                } else {
                    seen.push(pair);
                    let res =
                        deep_equal(&Value::Array(x.members()), &Value::Array(y.members()), seen);
                    seen.pop();
                    res
                }
            }
        }
        _ => eq_value(a, b),
    }
}

// ---------------------------------------------------------------------------
// Orderings

/// The canonical set ordering: type tag first, then value. Strings order
/// by identity fast path then content; other heap handles by address,
/// which groups identical handles and is stable for the lifetime of the
/// values. Consistent with [`eq_value`].
pub fn set_cmp(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    let t = a.tag().cmp(&b.tag());
    if t != Ordering::Equal {
        return t;
    }
    match (a, b) {
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::Str(x), Value::Str(y)) => {
            if Rc::ptr_eq(x, y) {
                Ordering::Equal
            } else {
                x.as_bytes().cmp(y.as_bytes())
            }
        }
        _ => {
            if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
                return x.cmp(&y);
            }
            // Same tag, both heap handles.
            a.heap_addr().cmp(&b.heap_addr())
        }
    }
}

/// The switch-table ordering: as [`set_cmp`] but strings compare purely by
/// content. Compiled case tables are sorted under this comparator, and the
/// runtime binary search must use the very same one.
pub fn switch_cmp(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => x.as_bytes().cmp(y.as_bytes()),
        _ => set_cmp(a, b),
    }
}

// ---------------------------------------------------------------------------
// Hashing

/// Hash consistent with [`eq_value`]. The specific function is not part of
/// the engine contract.
pub fn hash_value(v: &Value) -> u64 {
    let mut h = DefaultHasher::new();
    match v {
        Value::Int(_) | Value::Undefined | Value::Destructed => {
            0u8.hash(&mut h);
            v.as_int().unwrap_or(0).hash(&mut h);
        }
        Value::Float(f) => {
            1u8.hash(&mut h);
            // -0.0 equals 0.0 and must hash like it.
            let f = if *f == 0.0 { 0.0 } else { *f };
            f.to_bits().hash(&mut h);
        }
        Value::Str(s) => {
            2u8.hash(&mut h);
            s.as_bytes().hash(&mut h);
        }
        Value::Function(c) => {
            3u8.hash(&mut h);
            c.addr().hash(&mut h);
        }
        other => {
            (other.tag() as u8).hash(&mut h);
            other.heap_addr().hash(&mut h);
        }
    }
    h.finish()
}

// ---------------------------------------------------------------------------
// Deep free

/// Flatten the teardown of nested containers into an explicit work list so
/// that freeing a deeply nested structure cannot exhaust the native stack.
/// Only sole-owner handles are unwrapped; shared ones just lose a count.
pub(crate) fn drop_deep(work: &mut Vec<Value>) {
    while let Some(v) = work.pop() {
        match v {
            Value::Array(a) => {
                if let Some(cell) = a.try_unwrap() {
                    let mut data = cell.into_inner();
                    work.append(data.take_items());
                }
            }
            Value::Mapping(m) => {
                if let Some(cell) = m.try_unwrap() {
                    cell.into_inner().drain_into(work);
                }
            }
            Value::Multiset(s) => {
                if let Some(cell) = s.try_unwrap() {
                    work.push(Value::Array(cell.into_inner().into_members()));
                }
            }
            Value::Object(o) => {
                if let Some(obj) = o.try_unwrap() {
                    if let Some(vars) = obj.take_state() {
                        work.extend(vars);
                    }
                }
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Display

impl Value {
    fn fmt_rec(&self, f: &mut fmt::Formatter<'_>, seen: &mut Vec<usize>, quoted: bool) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Undefined | Value::Destructed => write!(f, "0"),
            Value::Float(x) => write!(f, "{}", format_float(*x)),
            Value::Str(s) => {
                if quoted {
                    write!(f, "\"{}\"", s)
                } else {
                    write!(f, "{}", s)
                }
            }
            Value::Array(a) => {
                if seen.contains(&a.addr()) {
                    return write!(f, "[...]");
                }
                seen.push(a.addr());
                write!(f, "[")?;
                for (i, item) in a.iter_cloned().into_iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.fmt_rec(f, seen, true)?;
                }
                seen.pop();
                write!(f, "]")
            }
            Value::Mapping(m) => {
                if seen.contains(&m.addr()) {
                    return write!(f, "{{...}}");
                }
                seen.push(m.addr());
                write!(f, "{{")?;
                for (i, (k, v)) in m.entries().into_iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    k.fmt_rec(f, seen, true)?;
                    write!(f, ": ")?;
                    v.fmt_rec(f, seen, true)?;
                }
                seen.pop();
                write!(f, "}}")
            }
            Value::Multiset(s) => {
                write!(f, "<")?;
                for (i, item) in s.members().iter_cloned().into_iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.fmt_rec(f, seen, true)?;
                }
                write!(f, ">")
            }
            Value::Object(o) => {
                if o.is_destructed() {
                    write!(f, "<destructed {}>", o.program_name())
                } else {
                    write!(f, "<object {}>", o.program_name())
                }
            }
            Value::Function(c) => write!(f, "<function {}>", c.name()),
            Value::Program(p) => write!(f, "<program {}>", p.name()),
            Value::LvalLocal(n) => write!(f, "<lvalue @{}>", n),
            Value::Void => write!(f, "<void>"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_rec(f, &mut Vec::new(), false)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "Undefined"),
            Value::Destructed => write!(f, "Destructed"),
            other => write!(f, "{}", other),
        }
    }
}

/// Avoid trailing zeros but keep at least one decimal.
pub fn format_float(f: f64) -> String {
    if f == f.floor() && f.abs() < 1e15 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::ArrayRef;

    #[test]
    fn test_zero_flavors_equal_but_distinguishable() {
        assert!(eq_value(&Value::Undefined, &Value::Int(0)));
        assert!(eq_value(&Value::Destructed, &Value::Undefined));
        assert!(!eq_value(&Value::Undefined, &Value::Int(1)));
        assert_eq!(Value::Undefined.zero_flavor(), Some(ZeroFlavor::Undefined));
        assert_eq!(Value::Int(0).zero_flavor(), Some(ZeroFlavor::Number));
    }

    #[test]
    fn test_truth() {
        assert!(Value::Int(0).is_zero());
        assert!(!Value::Int(-3).is_zero());
        assert!(!Value::Float(0.0).is_zero());
        assert!(!Value::string("").is_zero());
        assert!(!Value::Array(ArrayRef::allocate(0)).is_zero());
    }

    #[test]
    fn test_int_float_never_equal() {
        assert!(!eq_value(&Value::Int(5), &Value::Float(5.0)));
    }

    #[test]
    fn test_string_equality_by_content() {
        assert!(eq_value(&Value::string("abc"), &Value::string("abc")));
        assert!(!eq_value(&Value::string("abc"), &Value::string("abd")));
    }

    #[test]
    fn test_container_equality_by_identity() {
        let a = ArrayRef::allocate(2);
        let b = ArrayRef::allocate(2);
        assert!(!eq_value(&Value::Array(a.clone()), &Value::Array(b)));
        assert!(eq_value(&Value::Array(a.clone()), &Value::Array(a)));
    }

    #[test]
    fn test_set_cmp_type_rank_first() {
        use std::cmp::Ordering;
        assert_eq!(set_cmp(&Value::Int(999), &Value::Float(-1.0)), Ordering::Less);
        assert_eq!(set_cmp(&Value::string("a"), &Value::Float(0.0)), Ordering::Greater);
        assert_eq!(set_cmp(&Value::Int(1), &Value::Int(2)), Ordering::Less);
        assert_eq!(set_cmp(&Value::string("b"), &Value::string("a")), Ordering::Greater);
    }

    #[test]
    fn test_hash_consistent_with_eq() {
        assert_eq!(hash_value(&Value::Undefined), hash_value(&Value::Int(0)));
        assert_eq!(hash_value(&Value::Float(-0.0)), hash_value(&Value::Float(0.0)));
        assert_eq!(
            hash_value(&Value::string("key")),
            hash_value(&Value::string("key"))
        );
    }

    #[test]
    fn test_deep_free_is_stack_safe() {
        // A list nested deep enough to blow the native stack if teardown
        // recursed per level.
        let mut v = Value::Int(0);
        for _ in 0..200_000 {
            let arr = ArrayRef::allocate(1);
            arr.set_index(0, v);
            v = Value::Array(arr);
        }
        drop(v);
    }

    #[test]
    fn test_display() {
        let arr = ArrayRef::allocate(2);
        arr.set_index(0, Value::Int(1));
        arr.set_index(1, Value::string("x"));
        assert_eq!(Value::Array(arr).to_string(), "[1, \"x\"]");
        assert_eq!(Value::Float(3.0).to_string(), "3.0");
    }

    #[test]
    fn test_display_cycle_terminates() {
        let arr = ArrayRef::allocate(1);
        arr.set_index(0, Value::Array(arr.clone()));
        let s = Value::Array(arr.clone()).to_string();
        assert_eq!(s, "[[...]]");
        // Break the cycle so the test does not leak.
        arr.set_index(0, Value::zero());
    }
}
