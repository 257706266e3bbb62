use crate::{Cid, Dataflow, OpError};
use heap::{compare, Heap, Node, PackedKey, Val};
use std::cmp::Ordering;

/// Mapper is the per-key transformation of Map and MapReduce nodes.
///
/// `map_entry` is invoked once per input key holding values, and emits zero
/// or more (key, value) pairs. Emitted handles are borrowed: they may be
/// input values, reads made through the context, or values interned through
/// the context. The engine retains its own references to whatever it keeps.
///
/// Mappers must be deterministic and must not consult state outside of the
/// context: every read made through the context is recorded, and is what
/// drives re-invocation when consulted keys change.
pub trait Mapper {
    fn map_entry(
        &self,
        ctx: &mut OpCtx<'_>,
        key: Val,
        values: &[Val],
    ) -> Result<Vec<(Val, Val)>, OpError>;
}

impl<F> Mapper for F
where
    F: Fn(&mut OpCtx<'_>, Val, &[Val]) -> Result<Vec<(Val, Val)>, OpError>,
{
    fn map_entry(
        &self,
        ctx: &mut OpCtx<'_>,
        key: Val,
        values: &[Val],
    ) -> Result<Vec<(Val, Val)>, OpError> {
        (self)(ctx, key, values)
    }
}

/// Reducer maintains a per-key accumulator under addition and removal of
/// mapped values. It must behave as a group: `remove(add(a, v), v) == a`.
/// `remove` may return None to signal that the accumulator cannot be
/// rewound, in which case the engine rebuilds it from scratch.
///
/// `initial` and the Ok results of `add`/`remove` transfer one reference
/// of the returned accumulator to the caller; an implementation returning
/// a handle it did not just intern must incref it.
pub trait Reducer {
    fn initial(&self, heap: &mut Heap) -> Val;
    fn add(&self, heap: &mut Heap, acc: Val, value: Val) -> Result<Val, OpError>;
    fn remove(&self, heap: &mut Heap, acc: Val, value: Val) -> Result<Option<Val>, OpError>;
}

/// LazyCompute produces the values of a lazy collection key on demand.
/// The context allows reads of declared collections and of the lazy
/// collection itself (memoized, cycle-checked). Returned handles are
/// borrowed, exactly as for Mapper.
pub trait LazyCompute {
    fn compute(&self, ctx: &mut OpCtx<'_>, key: Val) -> Result<Vec<Val>, OpError>;
}

impl<F> LazyCompute for F
where
    F: Fn(&mut OpCtx<'_>, Val) -> Result<Vec<Val>, OpError>,
{
    fn compute(&self, ctx: &mut OpCtx<'_>, key: Val) -> Result<Vec<Val>, OpError> {
        (self)(ctx, key)
    }
}

/// OpCtx is the capability surface handed to operator code: tracked reads
/// of declared input collections, and interning of new values.
///
/// Values interned through the context live in a per-invocation scratch
/// set, released after the engine has retained what the operator emitted.
pub struct OpCtx<'e> {
    pub(crate) df: &'e mut Dataflow,
    pub(crate) allowed: &'e [Cid],
    pub(crate) self_cid: Option<Cid>,
    pub(crate) reads: Vec<(Cid, PackedKey)>,
    pub(crate) scratch: Vec<Val>,
}

impl<'e> OpCtx<'e> {
    /// Read the whole multiset of values at `key` of a declared collection.
    /// A missing key reads as empty.
    pub fn get_array(&mut self, cid: Cid, key: Val) -> Result<Vec<Val>, OpError> {
        if !self.allowed.contains(&cid) && self.self_cid != Some(cid) {
            return Err(OpError::Upstream(crate::FlowErr::contract(format!(
                "operator read of collection {cid:?} which it did not declare",
            ))));
        }
        let packed = heap::pack_key(&self.df.heap, key);
        self.reads.push((cid, packed.clone()));
        self.df.operator_read(cid, key, &packed)
    }

    /// Read the single value at `key`, failing unless exactly one is held.
    pub fn get_unique(&mut self, cid: Cid, key: Val) -> Result<Val, OpError> {
        let values = self.get_array(cid, key)?;
        match values.as_slice() {
            [v] => Ok(*v),
            vs => Err(OpError::fail(format!(
                "expected exactly one value at key {}, found {}",
                self.df.heap.to_json(key),
                vs.len(),
            ))),
        }
    }

    /// Read of the operator's own lazy collection, for self-recursive
    /// computations. Memoized, and a re-entrant read of a key already being
    /// computed fails with a cycle error.
    pub fn self_array(&mut self, key: Val) -> Result<Vec<Val>, OpError> {
        match self.self_cid {
            Some(cid) => self.get_array(cid, key),
            None => Err(OpError::Upstream(crate::FlowErr::contract(
                "self reads are only available to lazy computations",
            ))),
        }
    }

    pub fn self_unique(&mut self, key: Val) -> Result<Val, OpError> {
        match self.self_cid {
            Some(cid) => self.get_unique(cid, key),
            None => Err(OpError::Upstream(crate::FlowErr::contract(
                "self reads are only available to lazy computations",
            ))),
        }
    }

    /// View an interned value.
    pub fn node(&self, v: Val) -> Node<'_> {
        self.df.heap.node(v)
    }

    /// Numeric interpretation of a value, if it is a number.
    pub fn number(&self, v: Val) -> Option<f64> {
        self.df.heap.number(v)
    }

    pub fn field(&self, obj: Val, property: &str) -> Option<Val> {
        self.df.heap.field(obj, property)
    }

    pub fn intern_json(&mut self, v: &serde_json::Value) -> Val {
        let v = self.df.heap.intern_value(v);
        self.scratch.push(v);
        v
    }

    pub fn intern_u64(&mut self, n: u64) -> Val {
        let v = self.df.heap.intern_u64(n);
        self.scratch.push(v);
        v
    }

    pub fn intern_i64(&mut self, n: i64) -> Val {
        let v = self.df.heap.intern_i64(n);
        self.scratch.push(v);
        v
    }

    pub fn intern_f64(&mut self, f: f64) -> Val {
        let v = self.df.heap.intern_f64(f);
        self.scratch.push(v);
        v
    }

    pub fn intern_str(&mut self, s: &str) -> Val {
        let v = self.df.heap.intern_str(s);
        self.scratch.push(v);
        v
    }

    /// Intern an array over element handles, which are borrowed.
    pub fn intern_array(&mut self, items: &[Val]) -> Val {
        for item in items {
            self.df.heap.inc_ref(*item);
        }
        let v = self.df.heap.intern_array(items.to_vec());
        self.scratch.push(v);
        v
    }

    /// Intern an object over (property, value) pairs; values are borrowed.
    pub fn intern_object(&mut self, fields: &[(&str, Val)]) -> Val {
        let fields = fields
            .iter()
            .map(|(property, value)| {
                let property = self.df.heap.intern_str(property);
                self.df.heap.inc_ref(*value);
                (property, *value)
            })
            .collect();
        let v = self.df.heap.intern_object(fields);
        self.scratch.push(v);
        v
    }
}

/// Sum reduces numbers by addition. Integer sums fail on overflow rather
/// than silently wrapping; a float on either side makes the sum a float.
pub struct Sum;

enum Number {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
}

fn number_of(heap: &Heap, v: Val) -> Result<Number, OpError> {
    match heap.node(v) {
        Node::PosInt(n) => Ok(Number::Unsigned(n)),
        Node::NegInt(n) => Ok(Number::Signed(n)),
        Node::Float(f) => Ok(Number::Float(f)),
        node => Err(OpError::fail(format!("expected a number, found {node:?}"))),
    }
}

fn checked_add(heap: &mut Heap, lhs: Number, rhs: Number, sign: i64) -> Result<Val, OpError> {
    use Number::*;

    // Integer pairs stay exact; mixed pairs widen to float.
    match (lhs, rhs) {
        (Float(l), r) => Ok(heap.intern_f64(l + as_f64(r) * sign as f64)),
        (l, Float(r)) => Ok(heap.intern_f64(as_f64(l) + r * sign as f64)),
        (l, r) => {
            let total = as_i128(l) + as_i128(r) * sign as i128;
            if let Ok(n) = u64::try_from(total) {
                Ok(heap.intern_u64(n))
            } else if let Ok(n) = i64::try_from(total) {
                Ok(heap.intern_i64(n))
            } else {
                Err(OpError::fail("sum resulted in numeric overflow"))
            }
        }
    }
}

fn as_f64(n: Number) -> f64 {
    match n {
        Number::Unsigned(n) => n as f64,
        Number::Signed(n) => n as f64,
        Number::Float(f) => f,
    }
}

fn as_i128(n: Number) -> i128 {
    match n {
        Number::Unsigned(n) => n as i128,
        Number::Signed(n) => n as i128,
        Number::Float(_) => unreachable!("float operands take the widening path"),
    }
}

impl Reducer for Sum {
    fn initial(&self, heap: &mut Heap) -> Val {
        heap.intern_u64(0)
    }

    fn add(&self, heap: &mut Heap, acc: Val, value: Val) -> Result<Val, OpError> {
        let (lhs, rhs) = (number_of(heap, acc)?, number_of(heap, value)?);
        checked_add(heap, lhs, rhs, 1)
    }

    fn remove(&self, heap: &mut Heap, acc: Val, value: Val) -> Result<Option<Val>, OpError> {
        let (lhs, rhs) = (number_of(heap, acc)?, number_of(heap, value)?);
        checked_add(heap, lhs, rhs, -1).map(Some)
    }
}

/// Count reduces to the number of values, regardless of their content.
pub struct Count;

impl Reducer for Count {
    fn initial(&self, heap: &mut Heap) -> Val {
        heap.intern_u64(0)
    }

    fn add(&self, heap: &mut Heap, acc: Val, _value: Val) -> Result<Val, OpError> {
        match heap.node(acc) {
            Node::PosInt(n) => Ok(heap.intern_u64(n + 1)),
            node => Err(OpError::fail(format!("corrupt count accumulator {node:?}"))),
        }
    }

    fn remove(&self, heap: &mut Heap, acc: Val, _value: Val) -> Result<Option<Val>, OpError> {
        match heap.node(acc) {
            Node::PosInt(n) if n > 0 => Ok(Some(heap.intern_u64(n - 1))),
            node => Err(OpError::fail(format!("corrupt count accumulator {node:?}"))),
        }
    }
}

/// Min keeps the smallest value by structural order.
/// Removal of the current extremum requires a rebuild.
pub struct Min;

/// Max keeps the largest value by structural order.
pub struct Max;

fn extremum(
    heap: &mut Heap,
    acc: Val,
    value: Val,
    keep: Ordering,
) -> Result<Val, OpError> {
    let winner = match heap.node(acc) {
        Node::Null => value,
        _ if compare(heap, value, acc) == keep => value,
        _ => acc,
    };
    heap.inc_ref(winner);
    Ok(winner)
}

fn rewind_extremum(heap: &mut Heap, acc: Val, value: Val) -> Result<Option<Val>, OpError> {
    if acc == value {
        // The extremum itself was removed; the engine must rebuild.
        Ok(None)
    } else {
        heap.inc_ref(acc);
        Ok(Some(acc))
    }
}

impl Reducer for Min {
    fn initial(&self, heap: &mut Heap) -> Val {
        heap.intern_null()
    }

    fn add(&self, heap: &mut Heap, acc: Val, value: Val) -> Result<Val, OpError> {
        extremum(heap, acc, value, Ordering::Less)
    }

    fn remove(&self, heap: &mut Heap, acc: Val, value: Val) -> Result<Option<Val>, OpError> {
        rewind_extremum(heap, acc, value)
    }
}

impl Reducer for Max {
    fn initial(&self, heap: &mut Heap) -> Val {
        heap.intern_null()
    }

    fn add(&self, heap: &mut Heap, acc: Val, value: Val) -> Result<Val, OpError> {
        extremum(heap, acc, value, Ordering::Greater)
    }

    fn remove(&self, heap: &mut Heap, acc: Val, value: Val) -> Result<Option<Val>, OpError> {
        rewind_extremum(heap, acc, value)
    }
}

/// First keeps the earliest value added at the key.
/// Removing the kept value requires a rebuild.
pub struct First;

impl Reducer for First {
    fn initial(&self, heap: &mut Heap) -> Val {
        heap.intern_null()
    }

    fn add(&self, heap: &mut Heap, acc: Val, value: Val) -> Result<Val, OpError> {
        let kept = match heap.node(acc) {
            Node::Null => value,
            _ => acc,
        };
        heap.inc_ref(kept);
        Ok(kept)
    }

    fn remove(&self, heap: &mut Heap, acc: Val, value: Val) -> Result<Option<Val>, OpError> {
        rewind_extremum(heap, acc, value)
    }
}

/// Last keeps the most recent value added at the key.
/// Removing the kept value requires a rebuild.
pub struct Last;

impl Reducer for Last {
    fn initial(&self, heap: &mut Heap) -> Val {
        heap.intern_null()
    }

    fn add(&self, heap: &mut Heap, _acc: Val, value: Val) -> Result<Val, OpError> {
        heap.inc_ref(value);
        Ok(value)
    }

    fn remove(&self, heap: &mut Heap, acc: Val, value: Val) -> Result<Option<Val>, OpError> {
        rewind_extremum(heap, acc, value)
    }
}

#[cfg(test)]
mod test {
    use super::{Count, First, Last, Reducer, Sum};
    use heap::Heap;
    use quickcheck::quickcheck;

    #[test]
    fn test_first_and_last() {
        let mut heap = Heap::new();
        let (a, b) = (heap.intern_str("a"), heap.intern_str("b"));

        let acc = First.initial(&mut heap);
        let acc = First.add(&mut heap, acc, a).unwrap();
        let acc = First.add(&mut heap, acc, b).unwrap();
        assert_eq!(acc, a);
        // Removing the loser keeps the winner; removing the winner
        // demands a rebuild.
        assert_eq!(First.remove(&mut heap, acc, b).unwrap(), Some(a));
        assert_eq!(First.remove(&mut heap, acc, a).unwrap(), None);

        let acc = Last.initial(&mut heap);
        let acc = Last.add(&mut heap, acc, a).unwrap();
        let acc = Last.add(&mut heap, acc, b).unwrap();
        assert_eq!(acc, b);
        assert_eq!(Last.remove(&mut heap, acc, a).unwrap(), Some(b));
        assert_eq!(Last.remove(&mut heap, acc, b).unwrap(), None);
    }

    #[test]
    fn test_sum_widening() {
        let mut heap = Heap::new();
        let acc = Sum.initial(&mut heap);

        let v = heap.intern_u64(10);
        let acc = Sum.add(&mut heap, acc, v).unwrap();
        assert_eq!(heap.to_json(acc), serde_json::json!(10));

        let v = heap.intern_f64(0.5);
        let acc = Sum.add(&mut heap, acc, v).unwrap();
        assert_eq!(heap.to_json(acc), serde_json::json!(10.5));

        let v = heap.intern_i64(-11);
        let acc = Sum.add(&mut heap, acc, v).unwrap();
        assert_eq!(heap.to_json(acc), serde_json::json!(-0.5));
    }

    #[test]
    fn test_sum_overflow() {
        let mut heap = Heap::new();
        let acc = heap.intern_u64(u64::MAX);
        let v = heap.intern_u64(1);
        assert!(Sum.add(&mut heap, acc, v).is_err());
    }

    quickcheck! {
        // A sequence of integer additions rewinds to the initial
        // accumulator: the group law the propagator relies upon.
        fn sum_rewinds_to_default(values: Vec<i32>) -> bool {
            let mut heap = Heap::new();
            let zero = Sum.initial(&mut heap);
            let mut acc = zero;
            heap.inc_ref(acc);

            let values: Vec<_> = values.iter().map(|v| heap.intern_i64(*v as i64)).collect();
            for v in &values {
                let next = Sum.add(&mut heap, acc, *v).unwrap();
                heap.dec_ref(acc);
                acc = next;
            }
            for v in &values {
                let next = Sum.remove(&mut heap, acc, *v).unwrap().unwrap();
                heap.dec_ref(acc);
                acc = next;
            }
            acc == zero
        }

        fn count_rewinds_to_default(n: u8) -> bool {
            let mut heap = Heap::new();
            let zero = Count.initial(&mut heap);
            let mut acc = zero;
            heap.inc_ref(acc);

            let v = heap.intern_str("x");
            for _ in 0..n {
                let next = Count.add(&mut heap, acc, v).unwrap();
                heap.dec_ref(acc);
                acc = next;
            }
            for _ in 0..n {
                let next = Count.remove(&mut heap, acc, v).unwrap().unwrap();
                heap.dec_ref(acc);
                acc = next;
            }
            acc == zero
        }
    }
}
