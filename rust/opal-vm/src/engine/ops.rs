//! Operator semantics for the binary, unary and comparison opcodes.
//!
//! Integer arithmetic is checked; overflow raises a catchable error rather
//! than wrapping. Mixed int/float arithmetic promotes to float. Container
//! operands get the set-algebra treatment: `-` and `&` preserve the left
//! operand's element order, `|` and `^` come out in set order through the
//! merge machinery.

use crate::array::{self, ArrayRef, MergeOp};
use crate::errors::Raise;
use crate::mapping::MappingRef;
use crate::multiset::MultisetRef;
use crate::values::{deep_equal, eq_value, Tag, Value};

/// Compound-assignment operator, encoded as the `Compound` operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Mod = 4,
    BitAnd = 5,
    BitOr = 6,
    BitXor = 7,
}

impl BinaryOp {
    pub fn from_u32(code: u32) -> Option<BinaryOp> {
        Some(match code {
            0 => BinaryOp::Add,
            1 => BinaryOp::Sub,
            2 => BinaryOp::Mul,
            3 => BinaryOp::Div,
            4 => BinaryOp::Mod,
            5 => BinaryOp::BitAnd,
            6 => BinaryOp::BitOr,
            7 => BinaryOp::BitXor,
            _ => return None,
        })
    }
}

pub(crate) fn type_name(v: &Value) -> &'static str {
    match v.tag() {
        Tag::Int => "int",
        Tag::Float => "float",
        Tag::Str => "string",
        Tag::Array => "array",
        Tag::Mapping => "mapping",
        Tag::Multiset => "multiset",
        Tag::Object => "object",
        Tag::Function => "function",
        Tag::Program => "program",
    }
}

fn bad_operands(op: &str, a: &Value, b: &Value) -> Raise {
    Raise::message(format!(
        "bad operands for {}: {} and {}",
        op,
        type_name(a),
        type_name(b)
    ))
}

/// Apply `op` to two values, raising on type or arithmetic errors.
pub fn binary(op: BinaryOp, a: Value, b: Value) -> Result<Value, Raise> {
    match op {
        BinaryOp::Add => add(a, b),
        BinaryOp::Sub => sub(a, b),
        BinaryOp::Mul => mul(a, b),
        BinaryOp::Div => div(a, b),
        BinaryOp::Mod => modulo(a, b),
        BinaryOp::BitAnd => bit_and(a, b),
        BinaryOp::BitOr => bit_or(a, b),
        BinaryOp::BitXor => bit_xor(a, b),
    }
}

fn as_float(v: &Value) -> Option<f64> {
    match v {
        Value::Float(x) => Some(*x),
        _ => v.as_int().map(|n| n as f64),
    }
}

fn add(a: Value, b: Value) -> Result<Value, Raise> {
    match (&a, &b) {
        (Value::Str(x), Value::Str(y)) => {
            let mut s = String::with_capacity(x.len() + y.len());
            s.push_str(x);
            s.push_str(y);
            Ok(Value::string(&s))
        }
        (Value::Array(x), Value::Array(y)) => Ok(Value::Array(ArrayRef::concat(x, y))),
        (Value::Mapping(x), Value::Mapping(y)) => {
            let out = MappingRef::from_pairs(x.entries());
            for (k, v) in y.entries() {
                out.insert(k, v);
            }
            Ok(Value::Mapping(out))
        }
        (Value::Multiset(x), Value::Multiset(y)) => {
            Ok(merge_multisets(x, y, MergeOp::Add))
        }
        _ => {
            if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
                return x
                    .checked_add(y)
                    .map(Value::Int)
                    .ok_or_else(|| Raise::message("integer overflow in +"));
            }
            numeric_float("+", &a, &b, |x, y| x + y)
        }
    }
}

fn sub(a: Value, b: Value) -> Result<Value, Raise> {
    match (&a, &b) {
        (Value::Array(x), Value::Array(y)) => Ok(Value::Array(array_difference(x, y, false))),
        (Value::Mapping(x), Value::Mapping(y)) => {
            let out = MappingRef::new();
            for (k, v) in x.entries() {
                if !y.contains_key(&k) {
                    out.insert(k, v);
                }
            }
            Ok(Value::Mapping(out))
        }
        (Value::Multiset(x), Value::Multiset(y)) => Ok(merge_multisets(x, y, MergeOp::Sub)),
        _ => {
            if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
                return x
                    .checked_sub(y)
                    .map(Value::Int)
                    .ok_or_else(|| Raise::message("integer overflow in -"));
            }
            numeric_float("-", &a, &b, |x, y| x - y)
        }
    }
}

fn mul(a: Value, b: Value) -> Result<Value, Raise> {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return x
            .checked_mul(y)
            .map(Value::Int)
            .ok_or_else(|| Raise::message("integer overflow in *"));
    }
    // string * int replicates, as does array * int.
    match (&a, &b) {
        (Value::Str(s), Value::Int(n)) => {
            let n = usize::try_from(*n)
                .map_err(|_| Raise::message("cannot replicate by a negative count"))?;
            Ok(Value::string(&s.repeat(n)))
        }
        (Value::Array(arr), Value::Int(n)) => {
            let n = usize::try_from(*n)
                .map_err(|_| Raise::message("cannot replicate by a negative count"))?;
            let base = arr.iter_cloned();
            let mut items = Vec::with_capacity(base.len() * n);
            for _ in 0..n {
                items.extend(base.iter().cloned());
            }
            Ok(Value::Array(ArrayRef::from_items_hint(items, arr.hint())))
        }
        _ => numeric_float("*", &a, &b, |x, y| x * y),
    }
}

fn div(a: Value, b: Value) -> Result<Value, Raise> {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        if y == 0 {
            return Err(Raise::message("division by zero"));
        }
        // Rounds toward negative infinity, pairing with the modulo rule.
        let q = x
            .checked_div(y)
            .ok_or_else(|| Raise::message("integer overflow in /"))?;
        let q = if x % y != 0 && (x < 0) != (y < 0) {
            q - 1
        } else {
            q
        };
        return Ok(Value::Int(q));
    }
    match (as_float(&a), as_float(&b)) {
        (Some(x), Some(y)) => {
            if y == 0.0 {
                Err(Raise::message("division by zero"))
            } else {
                Ok(Value::Float(x / y))
            }
        }
        _ => Err(bad_operands("/", &a, &b)),
    }
}

fn modulo(a: Value, b: Value) -> Result<Value, Raise> {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        if y == 0 {
            return Err(Raise::message("modulo by zero"));
        }
        // Result takes the sign of the right operand.
        let r = x.checked_rem_euclid(y).ok_or_else(|| Raise::message("integer overflow in %"))?;
        let r = if y < 0 && r != 0 { r + y } else { r };
        return Ok(Value::Int(r));
    }
    match (as_float(&a), as_float(&b)) {
        (Some(x), Some(y)) => {
            if y == 0.0 {
                Err(Raise::message("modulo by zero"))
            } else {
                Ok(Value::Float(x - y * (x / y).floor()))
            }
        }
        _ => Err(bad_operands("%", &a, &b)),
    }
}

fn numeric_float(
    op: &str,
    a: &Value,
    b: &Value,
    f: fn(f64, f64) -> f64,
) -> Result<Value, Raise> {
    match (as_float(a), as_float(b)) {
        (Some(x), Some(y)) if a.tag() != b.tag() || a.tag() == Tag::Float => {
            Ok(Value::Float(f(x, y)))
        }
        _ => Err(bad_operands(op, a, b)),
    }
}

fn bit_and(a: Value, b: Value) -> Result<Value, Raise> {
    match (&a, &b) {
        (Value::Array(x), Value::Array(y)) => Ok(Value::Array(array_difference(x, y, true))),
        (Value::Mapping(x), Value::Mapping(y)) => {
            let out = MappingRef::new();
            for (k, v) in x.entries() {
                if y.contains_key(&k) {
                    out.insert(k, v);
                }
            }
            Ok(Value::Mapping(out))
        }
        (Value::Multiset(x), Value::Multiset(y)) => Ok(merge_multisets(x, y, MergeOp::And)),
        _ => int_bits("&", &a, &b, |x, y| x & y),
    }
}

fn bit_or(a: Value, b: Value) -> Result<Value, Raise> {
    match (&a, &b) {
        (Value::Array(x), Value::Array(y)) => Ok(merge_arrays(x, y, MergeOp::Or)),
        (Value::Mapping(x), Value::Mapping(y)) => {
            let out = MappingRef::from_pairs(x.entries());
            for (k, v) in y.entries() {
                out.insert(k, v);
            }
            Ok(Value::Mapping(out))
        }
        (Value::Multiset(x), Value::Multiset(y)) => Ok(merge_multisets(x, y, MergeOp::Or)),
        _ => int_bits("|", &a, &b, |x, y| x | y),
    }
}

fn bit_xor(a: Value, b: Value) -> Result<Value, Raise> {
    match (&a, &b) {
        (Value::Array(x), Value::Array(y)) => Ok(merge_arrays(x, y, MergeOp::Xor)),
        (Value::Mapping(x), Value::Mapping(y)) => {
            let out = MappingRef::new();
            for (k, v) in x.entries() {
                if !y.contains_key(&k) {
                    out.insert(k, v);
                }
            }
            for (k, v) in y.entries() {
                if !x.contains_key(&k) {
                    out.insert(k, v);
                }
            }
            Ok(Value::Mapping(out))
        }
        (Value::Multiset(x), Value::Multiset(y)) => Ok(merge_multisets(x, y, MergeOp::Xor)),
        _ => int_bits("^", &a, &b, |x, y| x ^ y),
    }
}

fn int_bits(op: &str, a: &Value, b: &Value, f: fn(i64, i64) -> i64) -> Result<Value, Raise> {
    match (a.as_int(), b.as_int()) {
        (Some(x), Some(y)) if a.tag() == Tag::Int && b.tag() == Tag::Int => {
            Ok(Value::Int(f(x, y)))
        }
        _ => Err(bad_operands(op, a, b)),
    }
}

/// `a - b` (keep = false) or `a & b` (keep = true) over arrays, preserving
/// `a`'s element order. Membership in `b` is a binary search over a sorted
/// copy, with the usual hint short circuit when the types cannot overlap.
fn array_difference(a: &ArrayRef, b: &ArrayRef, keep: bool) -> ArrayRef {
    if a.hint().is_disjoint(b.hint()) {
        return if keep {
            ArrayRef::allocate(0)
        } else {
            ArrayRef::from_items_hint(a.iter_cloned(), a.hint())
        };
    }
    let mut sorted_b = ArrayRef::from_items(b.iter_cloned());
    let order = sorted_b.get_set_order();
    sorted_b.order(&order);
    let items: Vec<Value> = a
        .iter_cloned()
        .into_iter()
        .filter(|v| sorted_b.set_lookup(v).is_ok() == keep)
        .collect();
    ArrayRef::from_items_hint(items, a.hint())
}

/// Set-algebra on arrays through the merge machinery; the result comes out
/// in set order.
fn merge_arrays(a: &ArrayRef, b: &ArrayRef, op: MergeOp) -> Value {
    let mut sa = ArrayRef::from_items(a.iter_cloned());
    let oa = sa.get_set_order();
    sa.order(&oa);
    let mut sb = ArrayRef::from_items(b.iter_cloned());
    let ob = sb.get_set_order();
    sb.order(&ob);
    let zipper = array::merge(&sa, &sb, op);
    Value::Array(array::zip(&sa, &sb, &zipper))
}

fn merge_multisets(a: &MultisetRef, b: &MultisetRef, op: MergeOp) -> Value {
    // Multiset members are already in set order.
    let (ma, mb) = (a.members(), b.members());
    let zipper = array::merge(&ma, &mb, op);
    Value::Multiset(MultisetRef::from_items(
        array::zip(&ma, &mb, &zipper).iter_cloned(),
    ))
}

/// Unary negation.
pub fn negate(v: Value) -> Result<Value, Raise> {
    match v {
        Value::Float(x) => Ok(Value::Float(-x)),
        other => match other.as_int() {
            Some(n) => n
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| Raise::message("integer overflow in unary -")),
            None => Err(Raise::message(format!(
                "bad operand for unary -: {}",
                type_name(&other)
            ))),
        },
    }
}

/// Ordering comparison for `<`, `<=`, `>`, `>=`. Numbers compare across
/// int and float; strings compare by content; anything else raises.
pub fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering, Raise> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(x.as_bytes().cmp(y.as_bytes())),
        _ => match (as_float(a), as_float(b)) {
            (Some(x), Some(y)) => {
                // Use exact integer ordering when both sides are ints.
                if let (Some(i), Some(j)) = (a.as_int(), b.as_int()) {
                    Ok(i.cmp(&j))
                } else {
                    Ok(x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal))
                }
            }
            _ => Err(bad_operands("comparison", a, b)),
        },
    }
}

/// `==` result as a language boolean.
pub fn equals(a: &Value, b: &Value) -> Value {
    Value::Int(eq_value(a, b) as i64)
}

/// Structural equality as a language boolean (the `Identical` opcode and
/// the `equal` native).
pub fn structurally_equal(a: &Value, b: &Value) -> Value {
    let mut seen = Vec::new();
    Value::Int(deep_equal(a, b, &mut seen) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arr(items: &[i64]) -> ArrayRef {
        ArrayRef::from_items(items.iter().map(|&n| Value::Int(n)).collect())
    }

    fn ints(a: &ArrayRef) -> Vec<i64> {
        a.iter_cloned().iter().map(|v| v.as_int().unwrap()).collect()
    }

    #[test]
    fn test_int_arithmetic_checked() {
        assert_eq!(
            binary(BinaryOp::Add, Value::Int(2), Value::Int(3))
                .unwrap()
                .as_int(),
            Some(5)
        );
        assert!(binary(BinaryOp::Add, Value::Int(i64::MAX), Value::Int(1)).is_err());
        assert!(binary(BinaryOp::Div, Value::Int(1), Value::Int(0)).is_err());
        // Integer division floors.
        assert_eq!(
            binary(BinaryOp::Div, Value::Int(-7), Value::Int(2))
                .unwrap()
                .as_int(),
            Some(-4)
        );
    }

    #[test]
    fn test_modulo_sign_of_right_operand() {
        let m = |a: i64, b: i64| {
            binary(BinaryOp::Mod, Value::Int(a), Value::Int(b))
                .unwrap()
                .as_int()
                .unwrap()
        };
        assert_eq!(m(7, 3), 1);
        assert_eq!(m(-7, 3), 2);
        assert_eq!(m(7, -3), -2);
        assert_eq!(m(-7, -3), -1);
    }

    #[test]
    fn test_mixed_promotes_to_float() {
        match binary(BinaryOp::Add, Value::Int(1), Value::Float(0.5)).unwrap() {
            Value::Float(x) => assert_eq!(x, 1.5),
            other => panic!("expected float, got {:?}", other),
        }
    }

    #[test]
    fn test_string_concat_and_replicate() {
        let s = binary(BinaryOp::Add, Value::string("ab"), Value::string("cd")).unwrap();
        assert!(eq_value(&s, &Value::string("abcd")));
        let r = binary(BinaryOp::Mul, Value::string("ab"), Value::Int(3)).unwrap();
        assert!(eq_value(&r, &Value::string("ababab")));
        assert!(binary(BinaryOp::Add, Value::string("a"), Value::Int(1)).is_err());
    }

    #[test]
    fn test_array_sub_preserves_left_order() {
        let a = arr(&[5, 1, 4, 1, 3]);
        let b = arr(&[1, 9]);
        match binary(BinaryOp::Sub, Value::Array(a), Value::Array(b)).unwrap() {
            Value::Array(out) => assert_eq!(ints(&out), vec![5, 4, 3]),
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn test_array_and_preserves_left_order() {
        let a = arr(&[5, 1, 4, 3]);
        let b = arr(&[3, 5]);
        match binary(BinaryOp::BitAnd, Value::Array(a), Value::Array(b)).unwrap() {
            Value::Array(out) => assert_eq!(ints(&out), vec![5, 3]),
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn test_array_or_unions_in_set_order() {
        let a = arr(&[3, 1]);
        let b = arr(&[2, 3]);
        match binary(BinaryOp::BitOr, Value::Array(a), Value::Array(b)).unwrap() {
            Value::Array(out) => assert_eq!(ints(&out), vec![1, 2, 3]),
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn test_mapping_set_algebra() {
        let x = MappingRef::from_pairs(vec![
            (Value::Int(1), Value::string("a")),
            (Value::Int(2), Value::string("b")),
        ]);
        let y = MappingRef::from_pairs(vec![(Value::Int(2), Value::string("z"))]);
        match binary(BinaryOp::Sub, Value::Mapping(x.clone()), Value::Mapping(y.clone())).unwrap() {
            Value::Mapping(out) => {
                assert_eq!(out.len(), 1);
                assert!(out.contains_key(&Value::Int(1)));
            }
            other => panic!("expected mapping, got {:?}", other),
        }
        match binary(BinaryOp::Add, Value::Mapping(x), Value::Mapping(y)).unwrap() {
            Value::Mapping(out) => {
                // Right operand wins on key collision.
                assert!(eq_value(
                    &out.index_value(&Value::Int(2)),
                    &Value::string("z")
                ));
            }
            other => panic!("expected mapping, got {:?}", other),
        }
    }

    #[test]
    fn test_compare_and_equals() {
        assert_eq!(compare(&Value::Int(1), &Value::Float(1.5)).unwrap(), std::cmp::Ordering::Less);
        assert!(compare(&Value::Int(1), &Value::string("x")).is_err());
        assert!(eq_value(&equals(&Value::Undefined, &Value::Int(0)), &Value::Int(1)));
        let a = arr(&[1, 2]);
        let b = arr(&[1, 2]);
        assert!(eq_value(
            &equals(&Value::Array(a.clone()), &Value::Array(b.clone())),
            &Value::Int(0)
        ));
        assert!(eq_value(
            &structurally_equal(&Value::Array(a), &Value::Array(b)),
            &Value::Int(1)
        ));
    }
}
