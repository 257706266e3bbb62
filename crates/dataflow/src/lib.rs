use fxhash::FxHashMap;
use heap::PackedKey;
use std::collections::{BTreeMap, BTreeSet};

pub use heap::{Heap, Val};

mod bag;
pub use bag::Bag;

mod error;
pub use error::{BuildError, FlowErr, OpError};

mod node;
pub use node::Cid;

mod ops;
pub use ops::{Count, First, Last, LazyCompute, Mapper, Max, Min, OpCtx, Reducer, Sum};

mod propagate;
mod store;

/// Dataflow is the incremental collection graph: the interned value heap,
/// the materialized collection store, the typed nodes with their per-key
/// traces, and the scheduling state of the propagator.
///
/// It is single-threaded by design; the embedding service serializes every
/// mutation onto one engine thread.
pub struct Dataflow {
    pub heap: Heap,
    pub(crate) store: store::Store,
    pub(crate) nodes: BTreeMap<Cid, node::NodeState>,
    pub(crate) next_cid: u64,
    /// Scheduled recomputation: node to the source keys to re-run.
    pub(crate) dirty: BTreeMap<Cid, BTreeSet<PackedKey>>,
    /// Keys changed since the last drain, for reader-facing diffs.
    /// Owns one reference per logged key handle.
    pub(crate) changed: BTreeMap<Cid, BTreeMap<PackedKey, Val>>,
    /// Recomputations parked on a pending external collection.
    pub(crate) deferred: FxHashMap<Cid, BTreeSet<(Cid, PackedKey)>>,
    /// Lazy keys currently being computed, for cycle detection.
    pub(crate) pull_stack: Vec<(Cid, PackedKey)>,
    /// The pending external collection behind the last blocked read.
    pub(crate) blocked_on: Option<Cid>,
}

impl Dataflow {
    pub fn new() -> Self {
        Self {
            heap: Heap::new(),
            store: store::Store::default(),
            nodes: BTreeMap::new(),
            next_cid: 0,
            dirty: BTreeMap::new(),
            changed: BTreeMap::new(),
            deferred: FxHashMap::default(),
            pull_stack: Vec::new(),
            blocked_on: None,
        }
    }

    /// All rows of an eager collection, in key order. A pending external
    /// collection reads as empty.
    pub fn snapshot(&self, cid: Cid) -> Vec<(Val, Bag)> {
        if self.external_pending_read(cid) {
            return Vec::new();
        }
        self.store
            .table(cid)
            .iter()
            .map(|(_, row)| (row.key, row.bag.clone()))
            .collect()
    }

    /// The bag at one key of an eager collection, if present.
    pub fn read_key(&self, cid: Cid, key: Val) -> Option<Bag> {
        if self.external_pending_read(cid) {
            return None;
        }
        let packed = heap::pack_key(&self.heap, key);
        self.store.table(cid).get(&packed).map(|row| row.bag.clone())
    }

    /// Number of keys held by an eager collection.
    pub fn size(&self, cid: Cid) -> usize {
        if self.external_pending_read(cid) {
            return 0;
        }
        self.store.table(cid).len()
    }

    /// Collections with changes logged since the last `clear_changes`.
    pub fn changed_collections(&self) -> Vec<Cid> {
        self.changed.keys().copied().collect()
    }

    /// Changed rows of a collection as (key, current bag), in key order;
    /// a None bag is a deletion.
    pub fn changed_rows(&self, cid: Cid) -> Vec<(Val, Option<Bag>)> {
        let Some(logged) = self.changed.get(&cid) else {
            return Vec::new();
        };
        logged
            .iter()
            .map(|(packed, key)| {
                let bag = self.store.table(cid).get(packed).map(|row| row.bag.clone());
                (*key, bag)
            })
            .collect()
    }

    /// Drop the change log, releasing its key references.
    pub fn clear_changes(&mut self) {
        for (_, logged) in std::mem::take(&mut self.changed) {
            for (_, key) in logged {
                self.heap.dec_ref(key);
            }
        }
    }

    fn external_pending_read(&self, cid: Cid) -> bool {
        matches!(
            self.nodes.get(&cid).map(|n| &n.kind),
            Some(node::Kind::External(state)) if state.pending
        )
    }
}

impl Default for Dataflow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::{Bag, Cid, Dataflow, FlowErr, Mapper, Min, OpCtx, OpError, Sum, Val};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::rc::Rc;

    // Emits (key, value + offset) for every value of the key.
    struct Offset(f64);

    impl Mapper for Offset {
        fn map_entry(
            &self,
            ctx: &mut OpCtx<'_>,
            key: Val,
            values: &[Val],
        ) -> Result<Vec<(Val, Val)>, OpError> {
            values
                .iter()
                .map(|v| {
                    let n = ctx
                        .number(*v)
                        .ok_or_else(|| OpError::fail("expected a number"))?;
                    Ok((key, ctx.intern_f64(n + self.0)))
                })
                .collect()
        }
    }

    // Emits (key mod 2, value) for every value of the key.
    struct KeyParity;

    impl Mapper for KeyParity {
        fn map_entry(
            &self,
            ctx: &mut OpCtx<'_>,
            key: Val,
            values: &[Val],
        ) -> Result<Vec<(Val, Val)>, OpError> {
            let k = ctx
                .number(key)
                .ok_or_else(|| OpError::fail("expected a numeric key"))? as u64;
            let parity = ctx.intern_u64(k % 2);
            Ok(values.iter().map(|v| (parity, *v)).collect())
        }
    }

    // Emits (key, value * value) treating the key's value as a number.
    struct Square;

    impl Mapper for Square {
        fn map_entry(
            &self,
            ctx: &mut OpCtx<'_>,
            key: Val,
            values: &[Val],
        ) -> Result<Vec<(Val, Val)>, OpError> {
            values
                .iter()
                .map(|v| {
                    let n = ctx
                        .number(*v)
                        .ok_or_else(|| OpError::fail("expected a number"))?;
                    Ok((key, ctx.intern_f64(n * n)))
                })
                .collect()
        }
    }

    fn apply_json(df: &mut Dataflow, cid: Cid, rows: Value) {
        let rows: Vec<(Val, Vec<Val>)> = rows
            .as_array()
            .unwrap()
            .iter()
            .map(|row| {
                let key = df.heap.intern_value(&row[0]);
                let values = row[1]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|v| df.heap.intern_value(v))
                    .collect();
                (key, values)
            })
            .collect();
        df.apply(cid, &rows);
        for (key, values) in rows {
            df.heap.dec_ref(key);
            for v in values {
                df.heap.dec_ref(v);
            }
        }
        df.propagate();
        df.clear_changes();
    }

    fn snapshot_json(df: &Dataflow, cid: Cid) -> Value {
        Value::Array(
            df.snapshot(cid)
                .into_iter()
                .map(|(key, bag)| {
                    let values: Vec<_> =
                        bag.values().iter().map(|v| df.heap.to_json(*v)).collect();
                    json!([df.heap.to_json(key), values])
                })
                .collect(),
        )
    }

    #[test]
    fn test_offset_map() {
        let mut df = Dataflow::new();
        let input = df.create_input();
        let mapped = df.create_map(input, vec![], Rc::new(Offset(5.0))).unwrap();

        apply_json(&mut df, input, json!([[1, [10]], [2, [20]]]));
        assert_eq!(snapshot_json(&df, mapped), json!([[1, [15]], [2, [25]]]));

        apply_json(&mut df, input, json!([[1, []]]));
        assert_eq!(snapshot_json(&df, mapped), json!([[2, [25]]]));

        apply_json(&mut df, input, json!([[2, []]]));
        assert_eq!(snapshot_json(&df, mapped), json!([]));

        df.remove_node(mapped);
        df.remove_node(input);
        df.clear_changes();
        assert_eq!(df.heap.live(), 0);
    }

    #[test]
    fn test_map_reduce_sum_by_parity() {
        let mut df = Dataflow::new();
        let input = df.create_input();
        let summed = df
            .create_map_reduce(input, vec![], Rc::new(KeyParity), Rc::new(Sum))
            .unwrap();

        apply_json(
            &mut df,
            input,
            json!([[0, [1]], [1, [1]], [2, [2]], [3, [2]]]),
        );
        assert_eq!(snapshot_json(&df, summed), json!([[0, [3]], [1, [3]]]));

        apply_json(&mut df, input, json!([[4, [10]]]));
        assert_eq!(snapshot_json(&df, summed), json!([[0, [13]], [1, [3]]]));

        apply_json(&mut df, input, json!([[0, []]]));
        assert_eq!(snapshot_json(&df, summed), json!([[0, [12]], [1, [3]]]));

        // Draining one parity entirely deletes its output key.
        apply_json(&mut df, input, json!([[1, []], [3, []]]));
        assert_eq!(snapshot_json(&df, summed), json!([[0, [12]]]));
    }

    #[test]
    fn test_merge_multiset_union() {
        let mut df = Dataflow::new();
        let input1 = df.create_input();
        let input2 = df.create_input();
        let merged = df.create_merge(vec![input1, input2]).unwrap();

        apply_json(&mut df, input1, json!([[1, [10]]]));
        apply_json(&mut df, input2, json!([[1, [20]], [2, [7]]]));
        assert_eq!(snapshot_json(&df, merged), json!([[1, [10, 20]], [2, [7]]]));

        apply_json(&mut df, input1, json!([[1, []]]));
        assert_eq!(snapshot_json(&df, merged), json!([[1, [20]], [2, [7]]]));
    }

    #[test]
    fn test_take_slice_chain() {
        let mut df = Dataflow::new();
        let input = df.create_input();
        let squared = df.create_map(input, vec![], Rc::new(Square)).unwrap();

        let (mut heap_ranges, mut handles) = (Vec::new(), Vec::new());
        for (lo, hi) in [(1, 1), (3, 4), (7, 9), (20, 50)] {
            let lo = df.heap.intern_u64(lo);
            let hi = df.heap.intern_u64(hi);
            heap_ranges.push((lo, hi));
            handles.extend([lo, hi]);
        }
        let sliced = df.create_slice(squared, &heap_ranges).unwrap();
        let taken = df.create_take(sliced, 7).unwrap();

        let lo = df.heap.intern_u64(0);
        let hi = df.heap.intern_u64(2000);
        let outer = df.create_slice(taken, &[(lo, hi)]).unwrap();
        handles.extend([lo, hi]);
        for h in handles {
            df.heap.dec_ref(h);
        }

        let rows: Vec<Value> = (0..=30).map(|k| json!([k, [k]])).collect();
        apply_json(&mut df, input, Value::Array(rows));

        assert_eq!(
            snapshot_json(&df, outer),
            json!([
                [1, [1]],
                [3, [9]],
                [4, [16]],
                [7, [49]],
                [8, [64]],
                [9, [81]],
                [20, [400]]
            ])
        );
    }

    #[test]
    fn test_take_promotes_on_deletion() {
        let mut df = Dataflow::new();
        let input = df.create_input();
        let taken = df.create_take(input, 3).unwrap();

        apply_json(
            &mut df,
            input,
            json!([[1, [1]], [2, [2]], [3, [3]], [4, [4]], [5, [5]]]),
        );
        assert_eq!(snapshot_json(&df, taken), json!([[1, [1]], [2, [2]], [3, [3]]]));

        apply_json(&mut df, input, json!([[2, []]]));
        assert_eq!(snapshot_json(&df, taken), json!([[1, [1]], [3, [3]], [4, [4]]]));

        apply_json(&mut df, input, json!([[0, [0]]]));
        assert_eq!(snapshot_json(&df, taken), json!([[0, [0]], [1, [1]], [3, [3]]]));
    }

    #[test]
    fn test_take_under_limit() {
        let mut df = Dataflow::new();
        let input = df.create_input();
        let taken = df.create_take(input, 10).unwrap();

        apply_json(&mut df, input, json!([[1, [1]], [2, [2]]]));
        assert_eq!(snapshot_json(&df, taken), json!([[1, [1]], [2, [2]]]));
    }

    #[test]
    fn test_slice_boundaries_inclusive() {
        let mut df = Dataflow::new();
        let input = df.create_input();

        let lo = df.heap.intern_u64(10);
        let hi = df.heap.intern_u64(20);
        let sliced = df.create_slice(input, &[(lo, hi)]).unwrap();
        df.heap.dec_ref(lo);
        df.heap.dec_ref(hi);

        apply_json(
            &mut df,
            input,
            json!([[9, [1]], [10, [2]], [20, [3]], [21, [4]]]),
        );
        assert_eq!(snapshot_json(&df, sliced), json!([[10, [2]], [20, [3]]]));
    }

    #[test]
    fn test_whole_collection_reduce() {
        let mut df = Dataflow::new();
        let input = df.create_input();
        let total = df.create_reduce(input, Rc::new(Sum)).unwrap();

        apply_json(&mut df, input, json!([[1, [10]], [2, [20, 5]]]));
        assert_eq!(snapshot_json(&df, total), json!([[0, [35]]]));

        apply_json(&mut df, input, json!([[2, [1]]]));
        assert_eq!(snapshot_json(&df, total), json!([[0, [11]]]));

        apply_json(&mut df, input, json!([[1, []], [2, []]]));
        assert_eq!(snapshot_json(&df, total), json!([]));
    }

    // Computes input.getUnique(k) + 2, lazily per key.
    struct PlusTwo {
        input: Cid,
    }

    impl super::LazyCompute for PlusTwo {
        fn compute(&self, ctx: &mut OpCtx<'_>, key: Val) -> Result<Vec<Val>, OpError> {
            let v = ctx.get_unique(self.input, key)?;
            let n = ctx
                .number(v)
                .ok_or_else(|| OpError::fail("expected a number"))?;
            Ok(vec![ctx.intern_f64(n + 2.0)])
        }
    }

    // Emits (k, lazy.getUnique(k) - v) for each value.
    struct LazyMinus {
        lazy: Cid,
    }

    impl Mapper for LazyMinus {
        fn map_entry(
            &self,
            ctx: &mut OpCtx<'_>,
            key: Val,
            values: &[Val],
        ) -> Result<Vec<(Val, Val)>, OpError> {
            values
                .iter()
                .map(|v| {
                    let l = ctx.get_unique(self.lazy, key)?;
                    let l = ctx.number(l).unwrap_or(0.0);
                    let v = ctx
                        .number(*v)
                        .ok_or_else(|| OpError::fail("expected a number"))?;
                    Ok((key, ctx.intern_f64(l - v)))
                })
                .collect()
        }
    }

    #[test]
    fn test_lazy_and_eager() {
        let mut df = Dataflow::new();
        let input = df.create_input();
        let lazy = df
            .create_lazy(vec![input], Rc::new(PlusTwo { input }))
            .unwrap();
        let eager = df
            .create_map(input, vec![lazy], Rc::new(LazyMinus { lazy }))
            .unwrap();

        apply_json(&mut df, input, json!([[0, [10]], [1, [20]]]));
        assert_eq!(snapshot_json(&df, eager), json!([[0, [2]], [1, [2]]]));

        apply_json(&mut df, input, json!([[2, [4]]]));
        assert_eq!(
            snapshot_json(&df, eager),
            json!([[0, [2]], [1, [2]], [2, [2]]])
        );

        // A changed input invalidates the lazy entry it fed.
        apply_json(&mut df, input, json!([[0, [30]]]));
        assert_eq!(
            snapshot_json(&df, eager),
            json!([[0, [2]], [1, [2]], [2, [2]]])
        );
    }

    // Counts down to zero through its own collection.
    struct Countdown;

    impl super::LazyCompute for Countdown {
        fn compute(&self, ctx: &mut OpCtx<'_>, key: Val) -> Result<Vec<Val>, OpError> {
            let n = ctx
                .number(key)
                .ok_or_else(|| OpError::fail("expected a numeric key"))?;
            if n <= 0.0 {
                return Ok(vec![ctx.intern_u64(0)]);
            }
            let prev = ctx.intern_f64(n - 1.0);
            let below = ctx.self_unique(prev)?;
            let below = ctx.number(below).unwrap_or(0.0);
            Ok(vec![ctx.intern_f64(below + 1.0)])
        }
    }

    // Emits (k, lazy.getUnique(k)) for each key.
    struct PullLazy {
        lazy: Cid,
    }

    impl Mapper for PullLazy {
        fn map_entry(
            &self,
            ctx: &mut OpCtx<'_>,
            key: Val,
            _values: &[Val],
        ) -> Result<Vec<(Val, Val)>, OpError> {
            let v = ctx.get_unique(self.lazy, key)?;
            Ok(vec![(key, v)])
        }
    }

    #[test]
    fn test_lazy_recursion() {
        let mut df = Dataflow::new();
        let input = df.create_input();
        let lazy = df.create_lazy(vec![], Rc::new(Countdown)).unwrap();
        let eager = df
            .create_map(input, vec![lazy], Rc::new(PullLazy { lazy }))
            .unwrap();

        apply_json(&mut df, input, json!([[8, [1]]]));
        assert_eq!(snapshot_json(&df, eager), json!([[8, [8]]]));
    }

    // Reads its own key: a cycle by construction.
    struct SelfRead;

    impl super::LazyCompute for SelfRead {
        fn compute(&self, ctx: &mut OpCtx<'_>, key: Val) -> Result<Vec<Val>, OpError> {
            ctx.self_array(key)
        }
    }

    #[test]
    fn test_lazy_cycle_is_an_error() {
        let mut df = Dataflow::new();
        let input = df.create_input();
        let lazy = df.create_lazy(vec![], Rc::new(SelfRead)).unwrap();
        let eager = df
            .create_map(input, vec![lazy], Rc::new(PullLazy { lazy }))
            .unwrap();

        apply_json(&mut df, input, json!([[1, [1]]]));

        let rows = df.snapshot(eager);
        assert_eq!(rows.len(), 1);
        match &rows[0].1 {
            Bag::Error(FlowErr::Cycle(key)) => assert_eq!(key.as_ref(), "1"),
            bag => panic!("expected a cycle error, found {bag:?}"),
        }
    }

    // Emits (k, v + sum of ext values at k).
    struct AddExternal {
        ext: Cid,
    }

    impl Mapper for AddExternal {
        fn map_entry(
            &self,
            ctx: &mut OpCtx<'_>,
            key: Val,
            values: &[Val],
        ) -> Result<Vec<(Val, Val)>, OpError> {
            let bonus: f64 = ctx
                .get_array(self.ext, key)?
                .iter()
                .filter_map(|v| ctx.number(*v))
                .sum();
            values
                .iter()
                .map(|v| {
                    let n = ctx
                        .number(*v)
                        .ok_or_else(|| OpError::fail("expected a number"))?;
                    Ok((key, ctx.intern_f64(n + bonus)))
                })
                .collect()
        }
    }

    #[test]
    fn test_pending_external_defers_recomputation() {
        let mut df = Dataflow::new();
        let input = df.create_input();
        let ext = df.create_external();
        let mapped = df
            .create_map(input, vec![ext], Rc::new(AddExternal { ext }))
            .unwrap();

        apply_json(&mut df, input, json!([[1, [10]]]));
        assert_eq!(snapshot_json(&df, mapped), json!([[1, [10]]]));

        // While the subscription is pending, a dependent write neither
        // recomputes with empty data nor propagates.
        df.set_external_loading(ext);
        assert_eq!(snapshot_json(&df, ext), json!([]));
        apply_json(&mut df, input, json!([[1, [11]]]));
        assert_eq!(snapshot_json(&df, mapped), json!([[1, [10]]]));

        // The update wakes the parked recomputation.
        let key = df.heap.intern_u64(1);
        let bonus = df.heap.intern_u64(100);
        df.external_update(ext, &[(key, vec![bonus])], true);
        df.heap.dec_ref(key);
        df.heap.dec_ref(bonus);
        df.propagate();
        df.clear_changes();

        assert_eq!(snapshot_json(&df, mapped), json!([[1, [111]]]));
    }

    #[test]
    fn test_failed_external_poisons_dependents() {
        let mut df = Dataflow::new();
        let input = df.create_input();
        let ext = df.create_external();
        let mapped = df
            .create_map(input, vec![ext], Rc::new(AddExternal { ext }))
            .unwrap();

        let key = df.heap.intern_u64(1);
        let bonus = df.heap.intern_u64(100);
        df.external_update(ext, &[(key, vec![bonus])], true);
        df.heap.dec_ref(key);
        df.heap.dec_ref(bonus);
        df.propagate();

        apply_json(&mut df, input, json!([[1, [10]]]));
        assert_eq!(snapshot_json(&df, mapped), json!([[1, [110]]]));

        df.set_external_failed(ext, "connection lost", true);
        df.propagate();
        df.clear_changes();

        let rows = df.snapshot(mapped);
        match &rows[0].1 {
            Bag::Error(FlowErr::Adapter { message, retryable }) => {
                assert_eq!(message.as_ref(), "connection lost");
                assert!(retryable);
            }
            bag => panic!("expected an adapter error, found {bag:?}"),
        }

        // Recovery through a fresh initial update.
        let key = df.heap.intern_u64(1);
        let bonus = df.heap.intern_u64(7);
        df.external_update(ext, &[(key, vec![bonus])], true);
        df.heap.dec_ref(key);
        df.heap.dec_ref(bonus);
        df.propagate();
        df.clear_changes();

        assert_eq!(snapshot_json(&df, mapped), json!([[1, [17]]]));
    }

    // Fails on the value 13.
    struct Superstitious;

    impl Mapper for Superstitious {
        fn map_entry(
            &self,
            ctx: &mut OpCtx<'_>,
            key: Val,
            values: &[Val],
        ) -> Result<Vec<(Val, Val)>, OpError> {
            for v in values {
                if ctx.number(*v) == Some(13.0) {
                    return Err(OpError::fail("thirteen is right out"));
                }
            }
            Ok(values.iter().map(|v| (key, *v)).collect())
        }
    }

    #[test]
    fn test_operator_error_surfaces_and_recovers() {
        let mut df = Dataflow::new();
        let input = df.create_input();
        let mapped = df.create_map(input, vec![], Rc::new(Superstitious)).unwrap();

        apply_json(&mut df, input, json!([[1, [13]], [2, [2]]]));
        let rows = df.snapshot(mapped);
        assert_eq!(rows.len(), 2);
        match &rows[0].1 {
            Bag::Error(FlowErr::User(message)) => {
                assert_eq!(message.as_ref(), "thirteen is right out")
            }
            bag => panic!("expected a user error, found {bag:?}"),
        }

        apply_json(&mut df, input, json!([[1, [14]]]));
        assert_eq!(snapshot_json(&df, mapped), json!([[1, [14]], [2, [2]]]));
    }

    #[test]
    fn test_min_rebuilds_on_extremum_removal() {
        let mut df = Dataflow::new();
        let input = df.create_input();
        let low = df
            .create_map_reduce(input, vec![], Rc::new(KeyParity), Rc::new(Min))
            .unwrap();

        apply_json(&mut df, input, json!([[0, [5]], [2, [3]], [4, [9]]]));
        assert_eq!(snapshot_json(&df, low), json!([[0, [3]]]));

        apply_json(&mut df, input, json!([[2, []]]));
        assert_eq!(snapshot_json(&df, low), json!([[0, [5]]]));
    }

    #[test]
    fn test_empty_and_single_element_boundaries() {
        let mut df = Dataflow::new();
        let input = df.create_input();
        let mapped = df.create_map(input, vec![], Rc::new(Offset(1.0))).unwrap();
        let total = df.create_reduce(input, Rc::new(Sum)).unwrap();

        df.propagate();
        assert_eq!(snapshot_json(&df, mapped), json!([]));
        assert_eq!(snapshot_json(&df, total), json!([]));

        // An empty batch is a no-op.
        apply_json(&mut df, input, json!([]));
        assert_eq!(snapshot_json(&df, mapped), json!([]));

        apply_json(&mut df, input, json!([[5, [5]]]));
        assert_eq!(snapshot_json(&df, mapped), json!([[5, [6]]]));
        assert_eq!(snapshot_json(&df, total), json!([[0, [5]]]));

        // Deleting a key that never existed changes nothing.
        apply_json(&mut df, input, json!([[9, []]]));
        assert_eq!(snapshot_json(&df, mapped), json!([[5, [6]]]));
    }

    #[test]
    fn test_slice_with_no_ranges_is_empty() {
        let mut df = Dataflow::new();
        let input = df.create_input();
        let sliced = df.create_slice(input, &[]).unwrap();

        apply_json(&mut df, input, json!([[1, [1]], [2, [2]]]));
        assert_eq!(snapshot_json(&df, sliced), json!([]));
    }

    #[test]
    fn test_mixed_type_key_ordering() {
        let mut df = Dataflow::new();
        let input = df.create_input();

        apply_json(
            &mut df,
            input,
            json!([["a", [1]], [10, [2]], [true, [3]], [null, [4]]]),
        );
        assert_eq!(
            snapshot_json(&df, input),
            json!([[null, [4]], [true, [3]], [10, [2]], ["a", [1]]])
        );
    }

    #[test]
    fn test_teardown_releases_the_heap() {
        let mut df = Dataflow::new();
        let input = df.create_input();
        let lazy = df
            .create_lazy(vec![input], Rc::new(PlusTwo { input }))
            .unwrap();
        let eager = df
            .create_map(input, vec![lazy], Rc::new(LazyMinus { lazy }))
            .unwrap();
        let total = df.create_reduce(eager, Rc::new(Sum)).unwrap();

        apply_json(&mut df, input, json!([[0, [10]], [1, [20]]]));
        assert_eq!(snapshot_json(&df, total), json!([[0, [4]]]));

        df.remove_node(total);
        df.remove_node(eager);
        df.remove_node(lazy);
        df.remove_node(input);
        df.clear_changes();
        assert_eq!(df.heap.live(), 0);
    }
}
