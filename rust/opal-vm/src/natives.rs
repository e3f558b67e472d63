//! Native operations: the registry and the core builtins.
//!
//! A native works directly on the engine's evaluation stack: it receives
//! the count of arguments sitting on top, consumes them, and leaves its
//! result. The dispatcher enforces the result discipline afterwards, so a
//! native that leaves nothing (or too much) still yields exactly one value.

use std::collections::HashMap;
use std::rc::Rc;

use chrono::Utc;
use once_cell::sync::Lazy;

use crate::array::ArrayRef;
use crate::engine::{ops, Engine};
use crate::errors::{Control, Raise};
use crate::mapping::MappingRef;
use crate::values::{Value, ZeroFlavor};

pub type NativeFn = fn(&mut Engine, usize) -> Result<(), Control>;

/// Behavior flags, advisory for optimizers and tooling.
pub mod flags {
    /// Observable side effects (output, mutation of shared state).
    pub const SIDE_EFFECT: u8 = 1 << 0;
    /// Reads state outside the engine (clocks, environment).
    pub const EXTERNAL: u8 = 1 << 1;
    /// Pure; safe to fold over constant arguments.
    pub const CONSTANT: u8 = 1 << 2;
}

/// One registered native operation.
#[derive(Clone)]
pub struct NativeOp {
    pub name: &'static str,
    /// Human-readable signature, for diagnostics and disassembly.
    pub signature: &'static str,
    pub min_args: usize,
    pub flags: u8,
    pub func: NativeFn,
}

/// Name-keyed registry the module loader resolves imports against.
#[derive(Default)]
pub struct NativeRegistry {
    by_name: HashMap<&'static str, Rc<NativeOp>>,
}

impl NativeRegistry {
    pub fn new() -> NativeRegistry {
        NativeRegistry::default()
    }

    pub fn register(&mut self, op: NativeOp) {
        self.by_name.insert(op.name, Rc::new(op));
    }

    pub fn lookup(&self, name: &str) -> Option<Rc<NativeOp>> {
        self.by_name.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.by_name.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Registry pre-loaded with the core builtins.
pub fn default_registry() -> NativeRegistry {
    let mut registry = NativeRegistry::new();
    for op in BUILTINS.iter() {
        registry.register(op.clone());
    }
    registry
}

static BUILTINS: Lazy<Vec<NativeOp>> = Lazy::new(|| {
    vec![
        NativeOp {
            name: "write",
            signature: "write(mixed ... args) -> int",
            min_args: 0,
            flags: flags::SIDE_EFFECT,
            func: native_write,
        },
        NativeOp {
            name: "sizeof",
            signature: "sizeof(string|array|mapping|multiset x) -> int",
            min_args: 1,
            flags: flags::CONSTANT,
            func: native_sizeof,
        },
        NativeOp {
            name: "indices",
            signature: "indices(array|mapping|multiset x) -> array",
            min_args: 1,
            flags: 0,
            func: native_indices,
        },
        NativeOp {
            name: "values",
            signature: "values(array|mapping|multiset x) -> array",
            min_args: 1,
            flags: 0,
            func: native_values,
        },
        NativeOp {
            name: "throw",
            signature: "throw(mixed err) -> never",
            min_args: 1,
            flags: 0,
            func: native_throw,
        },
        NativeOp {
            name: "equal",
            signature: "equal(mixed a, mixed b) -> int",
            min_args: 2,
            flags: flags::CONSTANT,
            func: native_equal,
        },
        NativeOp {
            name: "search",
            signature: "search(array|string|mapping haystack, mixed needle, int|void start) -> mixed",
            min_args: 2,
            flags: 0,
            func: native_search,
        },
        NativeOp {
            name: "mkmapping",
            signature: "mkmapping(array keys, array vals) -> mapping",
            min_args: 2,
            flags: 0,
            func: native_mkmapping,
        },
        NativeOp {
            name: "m_delete",
            signature: "m_delete(mapping m, mixed key) -> mixed",
            min_args: 2,
            flags: flags::SIDE_EFFECT,
            func: native_m_delete,
        },
        NativeOp {
            name: "destruct",
            signature: "destruct(object o) -> int",
            min_args: 1,
            flags: flags::SIDE_EFFECT,
            func: native_destruct,
        },
        NativeOp {
            name: "zero_type",
            signature: "zero_type(mixed x) -> int",
            min_args: 1,
            flags: flags::CONSTANT,
            func: native_zero_type,
        },
        NativeOp {
            name: "time",
            signature: "time() -> int",
            min_args: 0,
            flags: flags::EXTERNAL,
            func: native_time,
        },
    ]
});

fn native_write(eng: &mut Engine, argc: usize) -> Result<(), Control> {
    let args = eng.pop_args(argc)?;
    let mut text = String::new();
    for arg in &args {
        text.push_str(&format!("{}", arg));
    }
    let written = text.len() as i64;
    eng.emit(text);
    eng.push_value(Value::Int(written))
}

fn native_sizeof(eng: &mut Engine, argc: usize) -> Result<(), Control> {
    let args = eng.pop_args(argc)?;
    let n = match &args[0] {
        Value::Str(s) => s.chars().count(),
        Value::Array(a) => a.len(),
        Value::Mapping(m) => m.len(),
        Value::Multiset(s) => s.len(),
        other => return Err(bad_arg("sizeof", other)),
    };
    eng.push_value(Value::Int(n as i64))
}

fn native_indices(eng: &mut Engine, argc: usize) -> Result<(), Control> {
    let args = eng.pop_args(argc)?;
    let out = match &args[0] {
        Value::Array(a) => {
            ArrayRef::from_items((0..a.len() as i64).map(Value::Int).collect())
        }
        Value::Mapping(m) => m.indices(),
        Value::Multiset(s) => s.indices(),
        other => return Err(bad_arg("indices", other)),
    };
    eng.push_value(Value::Array(out))
}

fn native_values(eng: &mut Engine, argc: usize) -> Result<(), Control> {
    let args = eng.pop_args(argc)?;
    let out = match &args[0] {
        Value::Array(a) => ArrayRef::from_items_hint(a.iter_cloned(), a.hint()),
        Value::Mapping(m) => m.values(),
        Value::Multiset(s) => {
            ArrayRef::from_items(vec![Value::Int(1); s.len()])
        }
        other => return Err(bad_arg("values", other)),
    };
    eng.push_value(Value::Array(out))
}

fn native_throw(eng: &mut Engine, argc: usize) -> Result<(), Control> {
    let mut args = eng.pop_args(argc)?;
    Err(Raise(args.remove(0)).into())
}

fn native_equal(eng: &mut Engine, argc: usize) -> Result<(), Control> {
    let args = eng.pop_args(argc)?;
    let res = ops::structurally_equal(&args[0], &args[1]);
    eng.push_value(res)
}

fn native_search(eng: &mut Engine, argc: usize) -> Result<(), Control> {
    let args = eng.pop_args(argc)?;
    let start = match args.get(2) {
        Some(v) => usize::try_from(v.as_int().unwrap_or(0))
            .map_err(|_| Raise::message("search: negative start"))?,
        None => 0,
    };
    let res = match (&args[0], &args[1]) {
        (Value::Array(a), needle) => match a.search(needle, start) {
            Some(i) => Value::Int(i as i64),
            None => Value::Int(-1),
        },
        (Value::Str(hay), Value::Str(needle)) => match hay.get(start..).and_then(|s| s.find(&**needle)) {
            Some(i) => Value::Int((start + i) as i64),
            None => Value::Int(-1),
        },
        (Value::Mapping(m), needle) => {
            let mut found = Value::Undefined;
            for (k, v) in m.entries() {
                if crate::values::eq_value(&v, needle) {
                    found = k;
                    break;
                }
            }
            found
        }
        (other, _) => return Err(bad_arg("search", other)),
    };
    eng.push_value(res)
}

fn native_mkmapping(eng: &mut Engine, argc: usize) -> Result<(), Control> {
    let args = eng.pop_args(argc)?;
    let (keys, vals) = match (&args[0], &args[1]) {
        (Value::Array(k), Value::Array(v)) => (k, v),
        (other, Value::Array(_)) => return Err(bad_arg("mkmapping", other)),
        (_, other) => return Err(bad_arg("mkmapping", other)),
    };
    if keys.len() != vals.len() {
        return Err(Raise::message(format!(
            "mkmapping: unequal array sizes ({} vs {})",
            keys.len(),
            vals.len()
        ))
        .into());
    }
    let pairs = keys
        .iter_cloned()
        .into_iter()
        .zip(vals.iter_cloned())
        .collect();
    eng.push_value(Value::Mapping(MappingRef::from_pairs(pairs)))
}

fn native_m_delete(eng: &mut Engine, argc: usize) -> Result<(), Control> {
    let args = eng.pop_args(argc)?;
    let m = match &args[0] {
        Value::Mapping(m) => m,
        other => return Err(bad_arg("m_delete", other)),
    };
    let old = m.lookup(&args[1]).unwrap_or(Value::Undefined);
    m.delete(&args[1]);
    eng.push_value(old)
}

fn native_destruct(eng: &mut Engine, argc: usize) -> Result<(), Control> {
    let args = eng.pop_args(argc)?;
    let res = match &args[0] {
        Value::Object(o) => o.destruct() as i64,
        other => return Err(bad_arg("destruct", other)),
    };
    eng.push_value(Value::Int(res))
}

fn native_zero_type(eng: &mut Engine, argc: usize) -> Result<(), Control> {
    let args = eng.pop_args(argc)?;
    let v = &args[0];
    let kind = if v.is_destructed_handle() {
        2
    } else {
        match v.zero_flavor() {
            Some(ZeroFlavor::Number) | None => 0,
            Some(ZeroFlavor::Undefined) => 1,
            Some(ZeroFlavor::Destructed) => 2,
        }
    };
    eng.push_value(Value::Int(kind))
}

fn native_time(eng: &mut Engine, argc: usize) -> Result<(), Control> {
    eng.pop_args(argc)?;
    eng.push_value(Value::Int(Utc::now().timestamp()))
}

fn bad_arg(name: &str, got: &Value) -> Control {
    Raise::message(format!("{}: bad argument ({})", name, ops::type_name(got))).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_has_core_builtins() {
        let registry = default_registry();
        for name in ["write", "sizeof", "throw", "equal", "mkmapping", "destruct"] {
            assert!(registry.lookup(name).is_some(), "{} missing", name);
        }
        assert!(registry.lookup("no_such_native").is_none());
        let op = registry.lookup("sizeof").unwrap();
        assert_eq!(op.min_args, 1);
        assert_eq!(op.flags & flags::CONSTANT, flags::CONSTANT);
    }
}
