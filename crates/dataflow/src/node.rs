use crate::{Bag, BuildError, Dataflow, FlowErr, LazyCompute, Mapper, Reducer};
use fxhash::FxHashMap;
use heap::{PackedKey, Val};
use std::collections::BTreeSet;
use std::rc::Rc;

/// Cid identifies a collection and the node producing it.
/// Ids are allocated in construction order and never reused, so ascending
/// id order is a topological order of the eager graph: every input of a
/// node was constructed, and therefore numbered, before it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid(pub(crate) u64);

#[derive(Debug)]
pub(crate) struct NodeState {
    pub kind: Kind,
    /// Nodes with an edge from this one: primary readers, auxiliary
    /// readers, and lazy nodes consulting this collection.
    pub downstream: Vec<Cid>,
}

pub(crate) enum Kind {
    Input,
    External(ExternalState),
    Map(MapState),
    MapReduce(MapState, ReduceState),
    Merge(MergeState),
    Slice(SliceState),
    Take(TakeState),
    Reduce(FoldState),
    Lazy(LazyState),
}

impl std::fmt::Debug for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Kind {
    pub fn name(&self) -> &'static str {
        match self {
            Kind::Input => "input",
            Kind::External(_) => "external",
            Kind::Map(_) => "map",
            Kind::MapReduce(..) => "map-reduce",
            Kind::Merge(_) => "merge",
            Kind::Slice(_) => "slice",
            Kind::Take(_) => "take",
            Kind::Reduce(_) => "reduce",
            Kind::Lazy(_) => "lazy",
        }
    }

    pub fn is_eager(&self) -> bool {
        !matches!(self, Kind::Lazy(_))
    }

    /// Collections this node reads, primary and auxiliary alike.
    pub fn upstreams(&self) -> Vec<Cid> {
        match self {
            Kind::Input | Kind::External(_) => Vec::new(),
            Kind::Map(m) | Kind::MapReduce(m, _) => {
                let mut out = vec![m.input];
                out.extend(&m.aux);
                out
            }
            Kind::Merge(m) => m.inputs.clone(),
            Kind::Slice(s) => vec![s.input],
            Kind::Take(t) => vec![t.input],
            Kind::Reduce(f) => vec![f.input],
            Kind::Lazy(l) => l.aux.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ExternalState {
    pub pending: bool,
    pub failed: Option<FlowErr>,
}

pub(crate) struct MapState {
    pub input: Cid,
    pub aux: Vec<Cid>,
    pub mapper: Rc<dyn Mapper>,
    pub book: MapBook,
}

/// MapBook is the trace bookkeeping of a Map or MapReduce node.
#[derive(Default)]
pub(crate) struct MapBook {
    /// Per source key: what its last invocation emitted and read.
    pub contrib: FxHashMap<PackedKey, SourceContrib>,
    /// Inverted reads: consulted (collection, key) to the source keys
    /// whose invocations consulted it.
    pub read_index: FxHashMap<Cid, FxHashMap<PackedKey, BTreeSet<PackedKey>>>,
    /// Inverted emissions: output key to contributing source keys.
    pub out_index: FxHashMap<PackedKey, BTreeSet<PackedKey>>,
}

pub(crate) struct SourceContrib {
    pub emitted: Vec<Emission>,
    pub reads: Vec<(Cid, PackedKey)>,
    /// The invocation failed, or its input key holds an error.
    /// The error surfaces at the output key equal to the source key.
    pub err: Option<FlowErr>,
}

/// Emission owns one heap reference of both its key and value.
pub(crate) struct Emission {
    pub packed: PackedKey,
    pub key: Val,
    pub value: Val,
}

pub(crate) struct ReduceState {
    pub reducer: Rc<dyn Reducer>,
    /// Per output key accumulator; owns one reference per entry.
    /// Keys currently surfacing an error hold no entry.
    pub accum: FxHashMap<PackedKey, Val>,
}

#[derive(Debug)]
pub(crate) struct MergeState {
    pub inputs: Vec<Cid>,
}

#[derive(Debug)]
pub(crate) struct SliceState {
    pub input: Cid,
    /// Inclusive packed ranges. A key is retained when any range holds it.
    pub ranges: Vec<(PackedKey, PackedKey)>,
}

#[derive(Debug)]
pub(crate) struct TakeState {
    pub input: Cid,
    pub limit: usize,
}

pub(crate) struct FoldState {
    pub input: Cid,
    pub reducer: Rc<dyn Reducer>,
    /// The single output key (sentinel 0); owns one reference.
    pub out_key: Val,
    pub out_packed: PackedKey,
    /// Per source key, the values folded in; owns their references.
    pub contrib: FxHashMap<PackedKey, Vec<Val>>,
    /// Source keys currently holding an error value.
    pub errs: std::collections::BTreeMap<PackedKey, FlowErr>,
    /// Owns one reference; None when empty or when an error surfaced.
    pub accum: Option<Val>,
}

pub(crate) struct LazyState {
    pub aux: Vec<Cid>,
    pub compute: Rc<dyn LazyCompute>,
    pub cache: FxHashMap<PackedKey, LazyEntry>,
    /// Inverted reads: consulted (collection, key) to cached keys whose
    /// computation consulted it. Self-reads appear under this node's id.
    pub dep_index: FxHashMap<Cid, FxHashMap<PackedKey, BTreeSet<PackedKey>>>,
}

/// LazyEntry owns one reference of its key and of each cached value.
pub(crate) struct LazyEntry {
    pub key: Val,
    pub bag: Bag,
    pub reads: Vec<(Cid, PackedKey)>,
}

impl Dataflow {
    /// Create a writable input collection.
    pub fn create_input(&mut self) -> Cid {
        self.insert_node(Kind::Input, true)
    }

    /// Create a collection populated by an external subscription.
    pub fn create_external(&mut self) -> Cid {
        self.insert_node(Kind::External(ExternalState::default()), true)
    }

    /// Create a Map node over `input`, with `aux` declaring any further
    /// collections the mapper may consult through its context.
    pub fn create_map(
        &mut self,
        input: Cid,
        aux: Vec<Cid>,
        mapper: Rc<dyn Mapper>,
    ) -> Result<Cid, BuildError> {
        self.check_eager_input(input, "map")?;
        for a in &aux {
            self.check_exists(*a)?;
        }
        let cid = self.insert_node(
            Kind::Map(MapState {
                input,
                aux,
                mapper,
                book: MapBook::default(),
            }),
            true,
        );
        self.seed_from(cid, &[input]);
        Ok(cid)
    }

    /// Create a MapReduce node: map as for Map, then reduce all mapped
    /// values of each output key under `reducer`.
    pub fn create_map_reduce(
        &mut self,
        input: Cid,
        aux: Vec<Cid>,
        mapper: Rc<dyn Mapper>,
        reducer: Rc<dyn Reducer>,
    ) -> Result<Cid, BuildError> {
        self.check_eager_input(input, "map-reduce")?;
        for a in &aux {
            self.check_exists(*a)?;
        }
        let cid = self.insert_node(
            Kind::MapReduce(
                MapState {
                    input,
                    aux,
                    mapper,
                    book: MapBook::default(),
                },
                ReduceState {
                    reducer,
                    accum: FxHashMap::default(),
                },
            ),
            true,
        );
        self.seed_from(cid, &[input]);
        Ok(cid)
    }

    /// Create a Merge node: the per-key multiset union of `inputs`.
    pub fn create_merge(&mut self, inputs: Vec<Cid>) -> Result<Cid, BuildError> {
        if inputs.is_empty() {
            return Err(BuildError::EmptyMerge);
        }
        for input in &inputs {
            self.check_eager_input(*input, "merge")?;
        }
        let seed = inputs.clone();
        let cid = self.insert_node(Kind::Merge(MergeState { inputs }), true);
        self.seed_from(cid, &seed);
        Ok(cid)
    }

    /// Create a Slice node retaining keys within any of the inclusive
    /// `ranges`. Bounds are borrowed handles.
    pub fn create_slice(&mut self, input: Cid, ranges: &[(Val, Val)]) -> Result<Cid, BuildError> {
        self.check_eager_input(input, "slice")?;
        let ranges = ranges
            .iter()
            .map(|(lo, hi)| {
                (
                    heap::pack_key(&self.heap, *lo),
                    heap::pack_key(&self.heap, *hi),
                )
            })
            .collect();
        let cid = self.insert_node(Kind::Slice(SliceState { input, ranges }), true);
        self.seed_from(cid, &[input]);
        Ok(cid)
    }

    /// Create a Take node retaining the first `limit` keys in key order.
    pub fn create_take(&mut self, input: Cid, limit: usize) -> Result<Cid, BuildError> {
        if limit == 0 {
            return Err(BuildError::ZeroTake);
        }
        self.check_eager_input(input, "take")?;
        let cid = self.insert_node(Kind::Take(TakeState { input, limit }), true);
        // Take diffs its whole window per pass; an empty dirty entry
        // forces the initial build.
        self.dirty.entry(cid).or_default();
        Ok(cid)
    }

    /// Create a Reduce node folding the entire input collection onto the
    /// sentinel output key 0.
    pub fn create_reduce(&mut self, input: Cid, reducer: Rc<dyn Reducer>) -> Result<Cid, BuildError> {
        self.check_eager_input(input, "reduce")?;
        let out_key = self.heap.intern_u64(0);
        let out_packed = heap::pack_key(&self.heap, out_key);
        let cid = self.insert_node(
            Kind::Reduce(FoldState {
                input,
                reducer,
                out_key,
                out_packed,
                contrib: FxHashMap::default(),
                errs: std::collections::BTreeMap::new(),
                accum: None,
            }),
            true,
        );
        self.seed_from(cid, &[input]);
        Ok(cid)
    }

    /// Create a Lazy node whose keys are computed on demand by `compute`,
    /// reading the declared `aux` collections and itself.
    pub fn create_lazy(
        &mut self,
        aux: Vec<Cid>,
        compute: Rc<dyn LazyCompute>,
    ) -> Result<Cid, BuildError> {
        for a in &aux {
            self.check_exists(*a)?;
        }
        Ok(self.insert_node(
            Kind::Lazy(LazyState {
                aux,
                compute,
                cache: FxHashMap::default(),
                dep_index: FxHashMap::default(),
            }),
            false,
        ))
    }

    pub fn contains(&self, cid: Cid) -> bool {
        self.nodes.contains_key(&cid)
    }

    pub fn is_eager(&self, cid: Cid) -> bool {
        self.nodes
            .get(&cid)
            .map(|n| n.kind.is_eager())
            .unwrap_or(false)
    }

    /// Remove a node with no remaining readers, releasing every reference
    /// its table and bookkeeping hold. Callers drop dependents first.
    pub fn remove_node(&mut self, cid: Cid) {
        let node = self.nodes.remove(&cid).expect("node exists");
        assert!(
            node.downstream.is_empty(),
            "removing node {cid:?} which still has readers"
        );

        for u in node.kind.upstreams() {
            if let Some(up) = self.nodes.get_mut(&u) {
                up.downstream.retain(|d| *d != cid);
            }
        }

        let eager = node.kind.is_eager();
        match node.kind {
            Kind::Map(m) => self.release_map_book(m.book),
            Kind::MapReduce(m, r) => {
                self.release_map_book(m.book);
                for (_, acc) in r.accum {
                    self.heap.dec_ref(acc);
                }
            }
            Kind::Reduce(f) => {
                self.heap.dec_ref(f.out_key);
                for (_, vals) in f.contrib {
                    for v in vals {
                        self.heap.dec_ref(v);
                    }
                }
                if let Some(acc) = f.accum {
                    self.heap.dec_ref(acc);
                }
            }
            Kind::Lazy(l) => {
                for (_, entry) in l.cache {
                    self.heap.dec_ref(entry.key);
                    for v in entry.bag.values() {
                        self.heap.dec_ref(*v);
                    }
                }
            }
            _ => (),
        }
        if eager {
            self.store.remove(&mut self.heap, cid);
        }

        if let Some(logged) = self.changed.remove(&cid) {
            for (_, key) in logged {
                self.heap.dec_ref(key);
            }
        }
        self.dirty.remove(&cid);
        self.deferred.remove(&cid);
        for parked in self.deferred.values_mut() {
            parked.retain(|(n, _)| *n != cid);
        }
    }

    fn release_map_book(&mut self, book: MapBook) {
        for (_, contrib) in book.contrib {
            for em in contrib.emitted {
                self.heap.dec_ref(em.key);
                self.heap.dec_ref(em.value);
            }
        }
    }

    fn insert_node(&mut self, kind: Kind, table: bool) -> Cid {
        let cid = Cid(self.next_cid);
        self.next_cid += 1;

        for u in kind.upstreams() {
            debug_assert!(u < cid, "edges must point forward in id order");
            self.nodes
                .get_mut(&u)
                .expect("upstream exists")
                .downstream
                .push(cid);
        }
        if table {
            self.store.create(cid);
        }
        self.nodes.insert(
            cid,
            NodeState {
                kind,
                downstream: Vec::new(),
            },
        );
        cid
    }

    // Seed a freshly built node with every key of its inputs, so that its
    // first propagation materializes it in full.
    fn seed_from(&mut self, cid: Cid, inputs: &[Cid]) {
        let mut keys = BTreeSet::new();
        for input in inputs {
            for (packed, _) in self.store.table(*input).iter() {
                keys.insert(packed.clone());
            }
        }
        if !keys.is_empty() {
            self.dirty.entry(cid).or_default().extend(keys);
        }
    }

    fn check_exists(&self, cid: Cid) -> Result<(), BuildError> {
        if !self.nodes.contains_key(&cid) {
            return Err(BuildError::UnknownCollection(cid));
        }
        Ok(())
    }

    fn check_eager_input(&self, cid: Cid, role: &'static str) -> Result<(), BuildError> {
        let node = self
            .nodes
            .get(&cid)
            .ok_or(BuildError::UnknownCollection(cid))?;
        if !node.kind.is_eager() {
            return Err(BuildError::LazyInput(cid, role));
        }
        Ok(())
    }
}
