//! The resizable, type-hinted array container.
//!
//! Arrays are refcounted through [`ArrayRef`]. Structural mutation
//! (insert/remove/resize) takes the in-place path only when the caller
//! holds the sole outstanding handle; otherwise the data is copied with
//! slack and the caller's handle replaced, leaving aliases on the old
//! storage. Element writes through an established lvalue are always in
//! place, which is the language's aliased-assignment semantics.
//!
//! The shared empty-array sentinel is pinned for the thread's lifetime and
//! can never take the in-place path, so it is immutable by construction.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::{Rc, Weak};

use crate::values::{drop_deep, eq_value, set_cmp, switch_cmp, deep_equal, Tag, TypeHint, Value};

/// Zipper step flags: take/advance per side.
const OP_A: u8 = 1;
const OP_SKIP_A: u8 = 2;
const OP_TAKE_A: u8 = OP_A | OP_SKIP_A;
const OP_B: u8 = 4;
const OP_SKIP_B: u8 = 8;
const OP_TAKE_B: u8 = OP_B | OP_SKIP_B;

/// Set-algebra operation realized by [`merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOp {
    Add,
    Or,
    And,
    Xor,
    Sub,
}

impl MergeOp {
    /// Step flags for (a < b, a == b, a > b).
    fn minterm(self) -> (u8, u8, u8) {
        match self {
            MergeOp::Add => (OP_TAKE_A, OP_TAKE_A | OP_TAKE_B, OP_TAKE_B),
            MergeOp::Or => (OP_TAKE_A, OP_SKIP_A | OP_TAKE_B, OP_TAKE_B),
            MergeOp::And => (OP_SKIP_A, OP_SKIP_A | OP_TAKE_B, OP_SKIP_B),
            MergeOp::Xor => (OP_TAKE_A, OP_SKIP_A | OP_SKIP_B, OP_TAKE_B),
            MergeOp::Sub => (OP_TAKE_A, OP_SKIP_A, OP_SKIP_B),
        }
    }
}

/// Interleaving recipe produced by [`merge`]: entry `n >= 0` takes `a[n]`,
/// `n < 0` takes `b[!n]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zipper(pub Vec<isize>);

impl Zipper {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Array backing store: the elements plus the type-hint bitmask.
pub struct ArrayData {
    items: Vec<Value>,
    hint: TypeHint,
}

impl ArrayData {
    pub(crate) fn take_items(&mut self) -> &mut Vec<Value> {
        &mut self.items
    }
}

impl Drop for ArrayData {
    fn drop(&mut self) {
        // Flatten nested teardown so deep structures cannot exhaust the
        // native stack.
        if self.items.iter().any(Value::is_container) {
            let mut work = std::mem::take(&mut self.items);
            drop_deep(&mut work);
        }
    }
}

thread_local! {
    /// The shared empty array. Its pinned handle here keeps the refcount
    /// above one forever, so no caller can ever mutate it in place.
    static EMPTY_ARRAY: ArrayRef = ArrayRef(Rc::new(RefCell::new(ArrayData {
        items: Vec::new(),
        hint: TypeHint::EMPTY,
    })));

    /// Diagnostics registry of every live array of nonzero capacity,
    /// standing in for a traversal list anchored at the sentinel.
    static LIVE_ARRAYS: RefCell<Vec<Weak<RefCell<ArrayData>>>> = const { RefCell::new(Vec::new()) };
}

fn register(rc: &Rc<RefCell<ArrayData>>) {
    LIVE_ARRAYS.with(|reg| {
        let mut reg = reg.borrow_mut();
        if reg.len() > 32 && reg.iter().filter(|w| w.strong_count() == 0).count() > reg.len() / 2 {
            reg.retain(|w| w.strong_count() > 0);
        }
        reg.push(Rc::downgrade(rc));
    });
}

/// Number of live arrays with allocated storage (diagnostics).
pub fn live_arrays() -> usize {
    LIVE_ARRAYS.with(|reg| reg.borrow().iter().filter(|w| w.strong_count() > 0).count())
}

/// Refcounted handle to an array.
#[derive(Clone)]
pub struct ArrayRef(Rc<RefCell<ArrayData>>);

impl ArrayRef {
    /// Allocate an array of `n` zero-valued slots. `n == 0` returns a new
    /// handle on the shared empty sentinel without allocating.
    pub fn allocate(n: usize) -> ArrayRef {
        if n == 0 {
            return EMPTY_ARRAY.with(ArrayRef::clone);
        }
        let rc = Rc::new(RefCell::new(ArrayData {
            items: vec![Value::zero(); n],
            hint: TypeHint::of(Tag::Int),
        }));
        register(&rc);
        ArrayRef(rc)
    }

    /// Build an array from existing values, computing the hint.
    pub fn from_items(items: Vec<Value>) -> ArrayRef {
        if items.is_empty() {
            return EMPTY_ARRAY.with(ArrayRef::clone);
        }
        let mut hint = TypeHint::EMPTY;
        for v in &items {
            hint.insert(v.tag());
        }
        Self::from_items_hint(items, hint)
    }

    /// Build from values with a caller-supplied hint, which must be a
    /// superset of the tags present.
    pub fn from_items_hint(items: Vec<Value>, hint: TypeHint) -> ArrayRef {
        if items.is_empty() {
            return EMPTY_ARRAY.with(ArrayRef::clone);
        }
        debug_assert!(items.iter().all(|v| hint.contains(v.tag())));
        let rc = Rc::new(RefCell::new(ArrayData { items, hint }));
        register(&rc);
        ArrayRef(rc)
    }

    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }

    /// Outstanding handle count.
    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    pub(crate) fn try_unwrap(self) -> Option<RefCell<ArrayData>> {
        Rc::try_unwrap(self.0).ok()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().items.is_empty()
    }

    pub fn hint(&self) -> TypeHint {
        self.0.borrow().hint
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.borrow().items.get(index).cloned()
    }

    pub fn iter_cloned(&self) -> Vec<Value> {
        self.0.borrow().items.clone()
    }

    /// Write one element in place. This is the lvalue store: it writes
    /// through aliases deliberately and never copies.
    ///
    /// # Panics
    /// Out-of-range `index` is an invariant violation; the dispatcher
    /// checks ranges before establishing lvalues.
    pub fn set_index(&self, index: usize, value: Value) {
        let mut data = self.0.borrow_mut();
        assert!(index < data.items.len(), "array store out of range");
        data.hint.insert(value.tag());
        data.items[index] = value;
    }

    /// Take an element out, leaving a plain zero. Used by compound
    /// assignment to release the slot's reference eagerly.
    pub fn take_index(&self, index: usize) -> Option<Value> {
        let mut data = self.0.borrow_mut();
        if index >= data.items.len() {
            return None;
        }
        data.hint.insert(Tag::Int);
        Some(std::mem::replace(&mut data.items[index], Value::zero()))
    }

    fn is_unique(&self) -> bool {
        Rc::strong_count(&self.0) == 1
    }

    /// Copy the backing store with slack proportional to `want` and point
    /// this handle at the copy. Aliases keep the old storage.
    fn copy_for_write(&mut self, want: usize) {
        let data = self.0.borrow();
        let mut items = Vec::with_capacity(want + want / 2 + 4);
        items.extend(data.items.iter().cloned());
        let hint = data.hint;
        drop(data);
        let rc = Rc::new(RefCell::new(ArrayData { items, hint }));
        register(&rc);
        self.0 = rc;
    }

    /// Insert `value` before `index`, in place when uniquely owned.
    pub fn insert(&mut self, index: usize, value: Value) {
        let len = self.len();
        assert!(index <= len, "array insert out of range");
        if !self.is_unique() {
            self.copy_for_write(len + 1);
        }
        let mut data = self.0.borrow_mut();
        data.hint.insert(value.tag());
        data.items.insert(index, value);
    }

    pub fn push(&mut self, value: Value) {
        let len = self.len();
        self.insert(len, value);
    }

    /// Remove and return the element at `index`.
    pub fn remove(&mut self, index: usize) -> Value {
        let len = self.len();
        assert!(index < len, "array remove out of range");
        if !self.is_unique() {
            self.copy_for_write(len.saturating_sub(1));
        }
        self.0.borrow_mut().items.remove(index)
    }

    /// Grow or shrink to exactly `n` slots, padding with zeros.
    pub fn resize(&mut self, n: usize) {
        if !self.is_unique() {
            self.copy_for_write(n);
        }
        let mut data = self.0.borrow_mut();
        if n > data.items.len() {
            data.hint.insert(Tag::Int);
        }
        data.items.resize(n, Value::zero());
    }

    /// Truncate to `n` slots, freeing the dropped tail.
    pub fn shrink(&mut self, n: usize) {
        assert!(n <= self.len(), "array shrink cannot grow");
        self.resize(n);
    }

    /// Linear scan for a value equal to `value`, starting at `start`.
    /// A clear hint bit proves absence without scanning.
    pub fn search(&self, value: &Value, start: usize) -> Option<usize> {
        let data = self.0.borrow();
        if !data.hint.contains(value.tag()) {
            return None;
        }
        data.items[start.min(data.items.len())..]
            .iter()
            .position(|item| eq_value(item, value))
            .map(|p| p + start.min(data.items.len()))
    }

    /// Stable index permutation ordering the elements under `cmp`.
    pub fn get_order(&self, cmp: fn(&Value, &Value) -> Ordering) -> Vec<usize> {
        let data = self.0.borrow();
        let mut order: Vec<usize> = (0..data.items.len()).collect();
        order.sort_by(|&i, &j| cmp(&data.items[i], &data.items[j]));
        order
    }

    /// Permutation for the canonical set ordering.
    pub fn get_set_order(&self) -> Vec<usize> {
        self.get_order(set_cmp)
    }

    /// Rearrange in the order given by `order` (in place when uniquely
    /// owned, element `i` of the result is the old element `order[i]`).
    pub fn order(&mut self, order: &[usize]) {
        let len = self.len();
        assert_eq!(order.len(), len, "permutation length mismatch");
        if !self.is_unique() {
            self.copy_for_write(len);
        }
        let mut data = self.0.borrow_mut();
        let old = std::mem::take(&mut data.items);
        data.items = order.iter().map(|&i| old[i].clone()).collect();
    }

    /// Binary search under the set ordering. The array must already be in
    /// set order. `Ok` is a matching index, `Err` the insertion point.
    pub fn set_lookup(&self, value: &Value) -> Result<usize, usize> {
        self.ordered_lookup(value, set_cmp)
    }

    /// Binary search under the switch ordering.
    pub fn switch_lookup(&self, value: &Value) -> Result<usize, usize> {
        self.ordered_lookup(value, switch_cmp)
    }

    fn ordered_lookup(
        &self,
        value: &Value,
        cmp: fn(&Value, &Value) -> Ordering,
    ) -> Result<usize, usize> {
        let data = self.0.borrow();
        let tag = value.tag();
        if !data.hint.contains(tag) {
            if data.hint.all_above(tag) {
                return Err(0);
            }
            if data.hint.all_below(tag) {
                return Err(data.items.len());
            }
        }
        data.items.binary_search_by(|item| cmp(item, value))
    }

    /// Structural equality with the caller's seen-pairs list.
    pub fn deep_equal(&self, other: &ArrayRef, seen: &mut Vec<(usize, usize)>) -> bool {
        if self.addr() == other.addr() {
            return true;
        }
        let a = self.0.borrow();
        let b = other.0.borrow();
        a.items.len() == b.items.len()
            && a.items
                .iter()
                .zip(b.items.iter())
                .all(|(x, y)| deep_equal(x, y, seen))
    }

    /// Concatenation (the `+` operator); hints are unioned.
    pub fn concat(a: &ArrayRef, b: &ArrayRef) -> ArrayRef {
        let mut items = a.iter_cloned();
        items.extend(b.iter_cloned());
        ArrayRef::from_items_hint(items, a.hint().union(b.hint()))
    }

    /// Debug check: every element's tag must be covered by the hint.
    pub fn hint_is_valid(&self) -> bool {
        let data = self.0.borrow();
        data.items.iter().all(|v| data.hint.contains(v.tag()))
    }
}

/// Walk two set-ordered arrays in lockstep and describe how to interleave
/// them to realize `op`. When the type hints share no bits (and no objects
/// are involved) the walk is bypassed per operation.
pub fn merge(a: &ArrayRef, b: &ArrayRef, op: MergeOp) -> Zipper {
    let (less, equal, greater) = op.minterm();
    let ad = a.0.borrow();
    let bd = b.0.borrow();

    if ad.hint.is_disjoint(bd.hint)
        && !ad.hint.contains(Tag::Object)
        && !bd.hint.contains(Tag::Object)
    {
        match op {
            MergeOp::And => return Zipper(Vec::new()),
            MergeOp::Sub => return Zipper((0..ad.items.len() as isize).collect()),
            _ => {}
        }
    }

    let mut out = Vec::with_capacity(ad.items.len() + bd.items.len());
    let (mut ap, mut bp) = (0usize, 0usize);
    while ap < ad.items.len() && bp < bd.items.len() {
        let step = match set_cmp(&ad.items[ap], &bd.items[bp]) {
            Ordering::Less => less,
            Ordering::Equal => equal,
            Ordering::Greater => greater,
        };
        if step & OP_A != 0 {
            out.push(ap as isize);
        }
        if step & OP_B != 0 {
            out.push(!(bp as isize));
        }
        if step & OP_SKIP_A != 0 {
            ap += 1;
        }
        if step & OP_SKIP_B != 0 {
            bp += 1;
        }
    }
    if less & OP_A != 0 {
        while ap < ad.items.len() {
            out.push(ap as isize);
            ap += 1;
        }
    }
    if greater & OP_B != 0 {
        while bp < bd.items.len() {
            out.push(!(bp as isize));
            bp += 1;
        }
    }
    Zipper(out)
}

/// Materialize a merge result. The hint of the result is the union of the
/// inputs' hints (an over-approximation, as required).
pub fn zip(a: &ArrayRef, b: &ArrayRef, zipper: &Zipper) -> ArrayRef {
    let ad = a.0.borrow();
    let bd = b.0.borrow();
    let items: Vec<Value> = zipper
        .0
        .iter()
        .map(|&n| {
            if n >= 0 {
                ad.items[n as usize].clone()
            } else {
                bd.items[!n as usize].clone()
            }
        })
        .collect();
    drop(ad);
    drop(bd);
    ArrayRef::from_items_hint(items, a.hint().union(b.hint()))
}
