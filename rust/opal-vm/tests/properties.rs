//! Property-style tests driven by deterministic pseudo-random scripts.

use opal_vm::array::{live_arrays, ArrayRef};
use opal_vm::mapping::MappingRef;
use opal_vm::Value;

/// Minimal xorshift64 so the scripts need no dev-dependency.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, n: u64) -> usize {
        (self.next() % n) as usize
    }
}

/// Every array handle's refcount must equal the number of slots holding it.
/// The script keeps arrays flat so slot occupancy is the whole truth.
fn assert_refcounts_conserved(pool: &[Value]) {
    for (i, v) in pool.iter().enumerate() {
        let Value::Array(a) = v else { continue };
        // The empty sentinel is also held by its thread-local anchor.
        if a.is_empty() {
            continue;
        }
        let holders = pool
            .iter()
            .filter(|w| matches!(w, Value::Array(b) if b.addr() == a.addr()))
            .count();
        assert_eq!(
            a.refcount(),
            holders,
            "slot {} refcount diverged from its holders",
            i
        );
    }
}

#[test]
fn test_refcount_conservation_random_script() {
    let baseline = live_arrays();
    {
        let mut rng = XorShift(0x9e3779b97f4a7c15);
        let mut pool: Vec<Value> = (0..16).map(|_| Value::zero()).collect();
        for step in 0..10_000 {
            match rng.below(4) {
                // assign: clone one slot into another
                0 => {
                    let src = rng.below(16);
                    let dst = rng.below(16);
                    pool[dst] = pool[src].clone();
                }
                // free: overwrite with zero
                1 => {
                    let slot = rng.below(16);
                    pool[slot] = Value::zero();
                }
                // fresh array
                2 => {
                    let slot = rng.below(16);
                    let n = rng.below(4);
                    let items = (0..n).map(|k| Value::Int(k as i64)).collect();
                    pool[slot] = Value::Array(ArrayRef::from_items(items));
                }
                // self-assignment must be a no-op
                _ => {
                    let slot = rng.below(16);
                    pool[slot] = pool[slot].clone();
                }
            }
            if step % 512 == 0 {
                assert_refcounts_conserved(&pool);
            }
        }
        assert_refcounts_conserved(&pool);
    }
    // Dropping the pool frees every array the script created.
    assert_eq!(live_arrays(), baseline);
}

#[test]
fn test_nested_structure_freed_exactly_once() {
    let baseline = live_arrays();
    {
        let leaf = ArrayRef::from_items(vec![Value::Int(1)]);
        // Two parents share the leaf; dropping both releases it once.
        let left = ArrayRef::from_items(vec![Value::Array(leaf.clone())]);
        let right = ArrayRef::from_items(vec![Value::Array(leaf.clone())]);
        assert_eq!(leaf.refcount(), 3);
        drop(left);
        assert_eq!(leaf.refcount(), 2);
        drop(right);
        assert_eq!(leaf.refcount(), 1);
    }
    assert_eq!(live_arrays(), baseline);
}

#[test]
fn test_random_insert_remove_matches_model() {
    let mut rng = XorShift(42);
    let mut array = ArrayRef::allocate(0);
    let mut model: Vec<i64> = Vec::new();
    for _ in 0..2_000 {
        if model.is_empty() || rng.below(3) < 2 {
            let pos = rng.below(model.len() as u64 + 1);
            let v = rng.next() as i64 % 1000;
            array.insert(pos, Value::Int(v));
            model.insert(pos, v);
        } else {
            let pos = rng.below(model.len() as u64);
            let removed = array.remove(pos);
            assert_eq!(removed.as_int(), Some(model.remove(pos)));
        }
        assert_eq!(array.len(), model.len());
    }
    for (i, want) in model.iter().enumerate() {
        assert_eq!(array.get(i).and_then(|v| v.as_int()), Some(*want));
    }
    assert!(array.hint_is_valid());
}

#[test]
fn test_random_mapping_matches_model() {
    use std::collections::HashMap;
    let mut rng = XorShift(7);
    let map = MappingRef::new();
    let mut model: HashMap<i64, i64> = HashMap::new();
    for _ in 0..2_000 {
        let key = rng.below(64) as i64;
        if rng.below(3) < 2 {
            let v = rng.next() as i64 % 1000;
            map.insert(Value::Int(key), Value::Int(v));
            model.insert(key, v);
        } else {
            assert_eq!(map.delete(&Value::Int(key)), model.remove(&key).is_some());
        }
        assert_eq!(map.len(), model.len());
    }
    for (k, v) in &model {
        assert_eq!(map.lookup(&Value::Int(*k)).and_then(|v| v.as_int()), Some(*v));
    }
}
