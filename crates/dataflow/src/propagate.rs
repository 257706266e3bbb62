use crate::node::{Emission, ExternalState, Kind, LazyEntry, SourceContrib};
use crate::{Bag, Cid, Dataflow, FlowErr, Mapper, OpCtx, OpError, Reducer};
use heap::{PackedKey, Val};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

impl Dataflow {
    /// Apply a batch of writes to an input collection: each row replaces
    /// the values at its key, and an empty values list deletes the key.
    /// Handles are borrowed. Downstream work is scheduled; the caller runs
    /// `propagate` to quiescence.
    pub fn apply(&mut self, cid: Cid, rows: &[(Val, Vec<Val>)]) {
        debug_assert!(
            matches!(
                self.nodes.get(&cid).map(|n| &n.kind),
                Some(Kind::Input) | Some(Kind::External(_))
            ),
            "apply targets an input collection"
        );
        let changed = self.write_rows(cid, rows);
        if !changed.is_empty() {
            self.schedule_changes(cid, &changed);
        }
    }

    /// Apply an adapter update to an external collection.
    /// An initial update replaces the collection's entire contents; a
    /// non-initial update applies row deltas. Either form clears pending
    /// and failed states and wakes any parked dependents.
    pub fn external_update(&mut self, cid: Cid, rows: &[(Val, Vec<Val>)], is_initial: bool) {
        {
            let state = self.external_state(cid);
            state.pending = false;
            state.failed = None;
        }
        let mut changed = self.write_rows(cid, rows);

        if is_initial {
            let provided: BTreeSet<PackedKey> = rows
                .iter()
                .map(|(key, _)| heap::pack_key(&self.heap, *key))
                .collect();
            let stale: Vec<PackedKey> = self
                .store
                .table(cid)
                .iter()
                .map(|(packed, _)| packed.clone())
                .filter(|packed| !provided.contains(packed))
                .collect();
            for packed in stale {
                if self.delete_row(cid, &packed) {
                    changed.insert(packed);
                }
            }
        }

        self.wake_parked(cid);
        if !changed.is_empty() {
            self.schedule_changes(cid, &changed);
        }
    }

    /// Mark an external collection pending: reads of its keys return
    /// empty to clients, and recomputations consulting it are parked
    /// until the next update rather than observing empty.
    pub fn set_external_loading(&mut self, cid: Cid) {
        self.external_state(cid).pending = true;
        tracing::debug!(?cid, "external collection is loading");
    }

    /// Mark an external collection failed. Its materialized keys become
    /// error values and every read of it surfaces the error, which
    /// dependents propagate into their own outputs.
    pub fn set_external_failed(&mut self, cid: Cid, message: &str, retryable: bool) {
        let err = FlowErr::Adapter {
            message: message.into(),
            retryable,
        };
        {
            let state = self.external_state(cid);
            state.pending = false;
            state.failed = Some(err.clone());
        }
        tracing::debug!(?cid, message, retryable, "external collection failed");

        let rows: Vec<(PackedKey, Val)> = self
            .store
            .table(cid)
            .iter()
            .map(|(packed, row)| (packed.clone(), row.key))
            .collect();
        let mut changed = BTreeSet::new();
        for (packed, key) in rows {
            if self.write_row(cid, &packed, key, Some(Bag::Error(err.clone()))) {
                changed.insert(packed);
            }
        }

        self.wake_parked(cid);
        if !changed.is_empty() {
            self.schedule_changes(cid, &changed);
        }
    }

    /// Run propagation to quiescence: expand dirtied keys through the
    /// graph in topological (id) order, recomputing exactly the output
    /// keys whose traces reference a dirtied input.
    pub fn propagate(&mut self) {
        let mut steps = 0usize;
        while let Some((cid, keys)) = self.dirty.pop_first() {
            if !self.nodes.contains_key(&cid) {
                continue;
            }
            steps += 1;
            let changed = self.step_node(cid, keys);
            if !changed.is_empty() {
                self.schedule_changes(cid, &changed);
            }
        }
        if steps != 0 {
            tracing::debug!(steps, "propagation reached quiescence");
        }
    }

    fn external_state(&mut self, cid: Cid) -> &mut ExternalState {
        match self.nodes.get_mut(&cid).map(|n| &mut n.kind) {
            Some(Kind::External(state)) => state,
            kind => panic!("expected {cid:?} to be an external collection, found {kind:?}"),
        }
    }

    fn write_rows(&mut self, cid: Cid, rows: &[(Val, Vec<Val>)]) -> BTreeSet<PackedKey> {
        let mut changed = BTreeSet::new();
        for (key, values) in rows {
            let packed = heap::pack_key(&self.heap, *key);
            let did = if values.is_empty() {
                self.delete_row(cid, &packed)
            } else {
                self.write_row(cid, &packed, *key, Some(Bag::Values(values.clone())))
            };
            if did {
                changed.insert(packed);
            }
        }
        changed
    }

    fn wake_parked(&mut self, cid: Cid) {
        if let Some(parked) = self.deferred.remove(&cid) {
            tracing::debug!(?cid, parked = parked.len(), "re-running parked recomputations");
            for (node, src) in parked {
                self.dirty.entry(node).or_default().insert(src);
            }
        }
    }

    // Write `bag` at the row for `packed`, recording the change for
    // reader-facing diffs. The logged key reference is captured before
    // the write, which may otherwise release it.
    pub(crate) fn write_row(
        &mut self,
        cid: Cid,
        packed: &PackedKey,
        key: Val,
        bag: Option<Bag>,
    ) -> bool {
        let log_key = self
            .store
            .table(cid)
            .get(packed)
            .map(|row| row.key)
            .unwrap_or(key);
        self.heap.inc_ref(log_key);

        let outcome = self.store.write(&mut self.heap, cid, packed, key, bag);
        if outcome.changed {
            let logged = self.changed.entry(cid).or_default();
            if let Some(prev) = logged.insert(packed.clone(), log_key) {
                self.heap.dec_ref(prev);
            }
        } else {
            self.heap.dec_ref(log_key);
        }
        outcome.changed
    }

    pub(crate) fn delete_row(&mut self, cid: Cid, packed: &PackedKey) -> bool {
        let Some(log_key) = self.store.table(cid).get(packed).map(|row| row.key) else {
            return false;
        };
        self.heap.inc_ref(log_key);
        self.store.write(&mut self.heap, cid, packed, log_key, None);

        let logged = self.changed.entry(cid).or_default();
        if let Some(prev) = logged.insert(packed.clone(), log_key) {
            self.heap.dec_ref(prev);
        }
        true
    }

    // Expand changed keys of `u` into scheduled work for its readers:
    // re-invocation of the source keys whose trace references a changed
    // key, eviction cascades for lazy readers.
    fn schedule_changes(&mut self, u: Cid, changed: &BTreeSet<PackedKey>) {
        enum Sched {
            Keys(BTreeSet<PackedKey>),
            Touch,
            Evict,
        }

        let downstream = self
            .nodes
            .get(&u)
            .map(|n| n.downstream.clone())
            .unwrap_or_default();

        for d in downstream {
            let sched = match &self.nodes.get(&d).expect("downstream node exists").kind {
                Kind::Map(m) | Kind::MapReduce(m, _) => {
                    let mut invocations = BTreeSet::new();
                    if m.input == u {
                        invocations.extend(changed.iter().cloned());
                    }
                    if let Some(by_key) = m.book.read_index.get(&u) {
                        for k in changed {
                            if let Some(srcs) = by_key.get(k) {
                                invocations.extend(srcs.iter().cloned());
                            }
                        }
                    }
                    Sched::Keys(invocations)
                }
                Kind::Merge(_) | Kind::Slice(_) | Kind::Reduce(_) => Sched::Keys(changed.clone()),
                Kind::Take(_) => Sched::Touch,
                Kind::Lazy(_) => Sched::Evict,
                Kind::Input | Kind::External(_) => {
                    unreachable!("source collections have no inputs")
                }
            };
            match sched {
                Sched::Keys(keys) if keys.is_empty() => (),
                Sched::Keys(keys) => {
                    self.dirty.entry(d).or_default().extend(keys);
                }
                Sched::Touch => {
                    self.dirty.entry(d).or_default();
                }
                Sched::Evict => {
                    let evicted = self.evict_lazy(d, u, changed);
                    if !evicted.is_empty() {
                        self.schedule_changes(d, &evicted);
                    }
                }
            }
        }
    }

    // Evict cached entries of lazy node `d` which consulted a changed key
    // of `u`, cascading through entries which consulted evicted entries.
    fn evict_lazy(&mut self, d: Cid, u: Cid, changed: &BTreeSet<PackedKey>) -> BTreeSet<PackedKey> {
        let Kind::Lazy(state) = &mut self.nodes.get_mut(&d).expect("lazy node exists").kind else {
            unreachable!("evict_lazy targets a lazy node")
        };

        let mut stack: Vec<PackedKey> = Vec::new();
        if let Some(by_key) = state.dep_index.get_mut(&u) {
            for k in changed {
                if let Some(deps) = by_key.remove(k) {
                    stack.extend(deps);
                }
            }
        }

        let mut evicted = BTreeSet::new();
        while let Some(k) = stack.pop() {
            let Some(entry) = state.cache.remove(&k) else {
                continue;
            };
            if let Some(by_key) = state.dep_index.get_mut(&d) {
                if let Some(deps) = by_key.remove(&k) {
                    stack.extend(deps);
                }
            }
            for (rc, rk) in &entry.reads {
                if let Some(by_key) = state.dep_index.get_mut(rc) {
                    if let Some(set) = by_key.get_mut(rk) {
                        set.remove(&k);
                        if set.is_empty() {
                            by_key.remove(rk);
                        }
                    }
                }
            }
            self.heap.dec_ref(entry.key);
            for v in entry.bag.values() {
                self.heap.dec_ref(*v);
            }
            evicted.insert(k);
        }
        evicted
    }

    fn step_node(&mut self, cid: Cid, keys: BTreeSet<PackedKey>) -> BTreeSet<PackedKey> {
        enum Plan {
            Map {
                input: Cid,
                aux: Vec<Cid>,
                mapper: Rc<dyn Mapper>,
                reducer: Option<Rc<dyn Reducer>>,
            },
            Merge(Vec<Cid>),
            Slice(Cid, Vec<(PackedKey, PackedKey)>),
            Take(Cid, usize),
            Fold(Cid, Rc<dyn Reducer>),
            Skip,
        }

        let plan = match &self.nodes.get(&cid).expect("scheduled node exists").kind {
            Kind::Map(m) => Plan::Map {
                input: m.input,
                aux: m.aux.clone(),
                mapper: m.mapper.clone(),
                reducer: None,
            },
            Kind::MapReduce(m, r) => Plan::Map {
                input: m.input,
                aux: m.aux.clone(),
                mapper: m.mapper.clone(),
                reducer: Some(r.reducer.clone()),
            },
            Kind::Merge(m) => Plan::Merge(m.inputs.clone()),
            Kind::Slice(s) => Plan::Slice(s.input, s.ranges.clone()),
            Kind::Take(t) => Plan::Take(t.input, t.limit),
            Kind::Reduce(f) => Plan::Fold(f.input, f.reducer.clone()),
            Kind::Input | Kind::External(_) | Kind::Lazy(_) => Plan::Skip,
        };

        match plan {
            Plan::Map {
                input,
                aux,
                mapper,
                reducer,
            } => self.recompute_map(cid, keys, input, aux, mapper, reducer),
            Plan::Merge(inputs) => self.recompute_merge(cid, keys, inputs),
            Plan::Slice(input, ranges) => self.recompute_slice(cid, keys, input, ranges),
            Plan::Take(input, limit) => self.recompute_take(cid, keys, input, limit),
            Plan::Fold(input, reducer) => self.recompute_fold(cid, keys, input, reducer),
            Plan::Skip => BTreeSet::new(),
        }
    }

    // True when `input` is an external collection awaiting its next
    // update; recomputations reading it are parked instead of run.
    fn input_pending(&self, input: Cid) -> bool {
        matches!(
            self.nodes.get(&input).map(|n| &n.kind),
            Some(Kind::External(ExternalState { pending: true, .. }))
        )
    }

    fn park_all(&mut self, ext: Cid, node: Cid, keys: BTreeSet<PackedKey>) {
        let parked = self.deferred.entry(ext).or_default();
        for k in keys {
            parked.insert((node, k));
        }
    }

    fn recompute_map(
        &mut self,
        cid: Cid,
        keys: BTreeSet<PackedKey>,
        input: Cid,
        aux: Vec<Cid>,
        mapper: Rc<dyn Mapper>,
        reducer: Option<Rc<dyn Reducer>>,
    ) -> BTreeSet<PackedKey> {
        if self.input_pending(input) {
            self.park_all(input, cid, keys);
            return BTreeSet::new();
        }
        let mut allowed = aux;
        allowed.push(input);

        enum Outcome {
            Absent,
            Errored(FlowErr, Vec<(Cid, PackedKey)>),
            Blocked(Cid),
            Emitted(Vec<Emission>, Vec<(Cid, PackedKey)>),
        }

        // Invoke the mapper for each dirtied source key.
        let mut results: Vec<(PackedKey, Outcome)> = Vec::with_capacity(keys.len());
        for src in keys {
            let (key, values) = match self.store.table(input).get(&src) {
                None => {
                    results.push((src, Outcome::Absent));
                    continue;
                }
                Some(row) => match &row.bag {
                    Bag::Error(e) => {
                        let e = e.clone();
                        results.push((src, Outcome::Errored(e, Vec::new())));
                        continue;
                    }
                    Bag::Values(vs) => (row.key, vs.clone()),
                },
            };

            self.blocked_on = None;
            let mut ctx = OpCtx {
                df: self,
                allowed: &allowed,
                self_cid: None,
                reads: Vec::new(),
                scratch: Vec::new(),
            };
            let out = mapper.map_entry(&mut ctx, key, &values);
            let OpCtx {
                reads, scratch, ..
            } = ctx;

            let outcome = match out {
                Ok(emissions) => {
                    // Retain emissions before scratch values are released.
                    let emissions = emissions
                        .into_iter()
                        .map(|(key, value)| {
                            self.heap.inc_ref(key);
                            self.heap.inc_ref(value);
                            Emission {
                                packed: heap::pack_key(&self.heap, key),
                                key,
                                value,
                            }
                        })
                        .collect();
                    Outcome::Emitted(emissions, reads)
                }
                Err(OpError::Blocked) => match self.blocked_on.take() {
                    Some(ext) => Outcome::Blocked(ext),
                    None => Outcome::Errored(
                        FlowErr::contract("operator returned blocked without a blocking read"),
                        reads,
                    ),
                },
                Err(OpError::Fail(message)) => Outcome::Errored(FlowErr::user(message), reads),
                Err(OpError::Upstream(e)) => Outcome::Errored(e, reads),
            };
            for s in scratch {
                self.heap.dec_ref(s);
            }
            results.push((src, outcome));
        }

        // Swap the trace bookkeeping out while rows are rewritten.
        let mut book = match &mut self.nodes.get_mut(&cid).expect("node exists").kind {
            Kind::Map(m) | Kind::MapReduce(m, _) => std::mem::take(&mut m.book),
            _ => unreachable!("map recompute over a map node"),
        };
        let mut accum = match &mut self.nodes.get_mut(&cid).expect("node exists").kind {
            Kind::MapReduce(_, r) => std::mem::take(&mut r.accum),
            _ => Default::default(),
        };

        let mut affected: BTreeSet<PackedKey> = BTreeSet::new();
        let mut removed_by_out: BTreeMap<PackedKey, Vec<Emission>> = BTreeMap::new();
        let mut added_by_out: BTreeMap<PackedKey, Vec<Val>> = BTreeMap::new();

        for (src, outcome) in results {
            let outcome = match outcome {
                Outcome::Blocked(ext) => {
                    self.deferred.entry(ext).or_default().insert((cid, src));
                    continue;
                }
                outcome => outcome,
            };

            // Clear the source's previous contribution and trace.
            if let Some(old) = book.contrib.remove(&src) {
                if old.err.is_some() {
                    if let Some(srcs) = book.out_index.get_mut(&src) {
                        srcs.remove(&src);
                        if srcs.is_empty() {
                            book.out_index.remove(&src);
                        }
                    }
                    affected.insert(src.clone());
                }
                for em in old.emitted {
                    if let Some(srcs) = book.out_index.get_mut(&em.packed) {
                        srcs.remove(&src);
                        if srcs.is_empty() {
                            book.out_index.remove(&em.packed);
                        }
                    }
                    affected.insert(em.packed.clone());
                    removed_by_out.entry(em.packed.clone()).or_default().push(em);
                }
                for (rc, rk) in old.reads {
                    if let Some(by_key) = book.read_index.get_mut(&rc) {
                        if let Some(srcs) = by_key.get_mut(&rk) {
                            srcs.remove(&src);
                            if srcs.is_empty() {
                                by_key.remove(&rk);
                            }
                        }
                    }
                }
            }

            match outcome {
                Outcome::Absent => (),
                Outcome::Blocked(_) => unreachable!("blocked sources were parked"),
                Outcome::Errored(err, reads) => {
                    affected.insert(src.clone());
                    book.out_index
                        .entry(src.clone())
                        .or_default()
                        .insert(src.clone());
                    for (rc, rk) in &reads {
                        book.read_index
                            .entry(*rc)
                            .or_default()
                            .entry(rk.clone())
                            .or_default()
                            .insert(src.clone());
                    }
                    book.contrib.insert(
                        src,
                        SourceContrib {
                            emitted: Vec::new(),
                            reads,
                            err: Some(err),
                        },
                    );
                }
                Outcome::Emitted(emissions, reads) => {
                    for em in &emissions {
                        affected.insert(em.packed.clone());
                        book.out_index
                            .entry(em.packed.clone())
                            .or_default()
                            .insert(src.clone());
                        added_by_out
                            .entry(em.packed.clone())
                            .or_default()
                            .push(em.value);
                    }
                    for (rc, rk) in &reads {
                        book.read_index
                            .entry(*rc)
                            .or_default()
                            .entry(rk.clone())
                            .or_default()
                            .insert(src.clone());
                    }
                    book.contrib.insert(
                        src,
                        SourceContrib {
                            emitted: emissions,
                            reads,
                            err: None,
                        },
                    );
                }
            }
        }

        // Rewrite every affected output key.
        let mut changed = BTreeSet::new();
        for out in &affected {
            let srcs = book.out_index.get(out);
            let Some(srcs) = srcs.filter(|s| !s.is_empty()) else {
                if let Some(acc) = accum.remove(out) {
                    self.heap.dec_ref(acc);
                }
                if self.delete_row(cid, out) {
                    changed.insert(out.clone());
                }
                continue;
            };

            // An error contribution poisons its output key.
            let err = srcs
                .iter()
                .find_map(|s| book.contrib[s].err.clone());
            if let Some(err) = err {
                if let Some(acc) = accum.remove(out) {
                    self.heap.dec_ref(acc);
                }
                let key = self
                    .store
                    .table(input)
                    .get(out)
                    .map(|row| row.key)
                    .expect("erroring source key exists in the input");
                if self.write_row(cid, out, key, Some(Bag::Error(err))) {
                    changed.insert(out.clone());
                }
                continue;
            }

            match &reducer {
                None => {
                    // Map: concatenate contributions in source-key order.
                    let mut key = None;
                    let mut values = Vec::new();
                    for s in srcs {
                        for em in &book.contrib[s].emitted {
                            if em.packed == *out {
                                key.get_or_insert(em.key);
                                values.push(em.value);
                            }
                        }
                    }
                    let key = key.expect("a contributing source emitted this key");
                    if self.write_row(cid, out, key, Some(Bag::Values(values))) {
                        changed.insert(out.clone());
                    }
                }
                Some(reducer) => {
                    let removed: Vec<Val> = removed_by_out
                        .get(out)
                        .map(|ems| ems.iter().map(|em| em.value).collect())
                        .unwrap_or_default();
                    let added = added_by_out.get(out).map(Vec::as_slice).unwrap_or(&[]);

                    let mut failure: Option<FlowErr> = None;
                    let mut acc = accum.remove(out);

                    // Reducer fast path: rewind removals, then advance
                    // additions, over the retained accumulator.
                    if let Some(a) = acc.take() {
                        match advance(reducer, &mut self.heap, a, &removed, added) {
                            Advanced::Acc(a) => acc = Some(a),
                            Advanced::Rebuild => (),
                            Advanced::Failed(err) => failure = Some(err),
                        }
                    }

                    // Full rebuild from the contribution trace.
                    if failure.is_none() && acc.is_none() {
                        let mut a = reducer.initial(&mut self.heap);
                        'fold: for s in srcs {
                            for em in &book.contrib[s].emitted {
                                if em.packed != *out {
                                    continue;
                                }
                                match reducer.add(&mut self.heap, a, em.value) {
                                    Ok(next) => {
                                        self.heap.dec_ref(a);
                                        a = next;
                                    }
                                    Err(e) => {
                                        self.heap.dec_ref(a);
                                        failure = Some(reduce_failure(e));
                                        break 'fold;
                                    }
                                }
                            }
                        }
                        if failure.is_none() {
                            acc = Some(a);
                        }
                    }

                    let key = first_emitted_key(&book.contrib, srcs, out)
                        .expect("a contributing source emitted this key");
                    let did = match failure {
                        Some(err) => self.write_row(cid, out, key, Some(Bag::Error(err))),
                        None => {
                            let a = acc.expect("accumulator resolved");
                            accum.insert(out.clone(), a);
                            self.write_row(cid, out, key, Some(Bag::Values(vec![a])))
                        }
                    };
                    if did {
                        changed.insert(out.clone());
                    }
                }
            }
        }

        // Release displaced emissions only now: the reducer fast path
        // reads their value handles.
        for (_, removed) in removed_by_out {
            for em in removed {
                self.heap.dec_ref(em.key);
                self.heap.dec_ref(em.value);
            }
        }

        match &mut self.nodes.get_mut(&cid).expect("node exists").kind {
            Kind::Map(m) => m.book = book,
            Kind::MapReduce(m, r) => {
                m.book = book;
                r.accum = accum;
            }
            _ => unreachable!(),
        }
        changed
    }

    fn recompute_merge(
        &mut self,
        cid: Cid,
        keys: BTreeSet<PackedKey>,
        inputs: Vec<Cid>,
    ) -> BTreeSet<PackedKey> {
        for input in &inputs {
            if self.input_pending(*input) {
                let ext = *input;
                self.park_all(ext, cid, keys);
                return BTreeSet::new();
            }
        }

        let mut changed = BTreeSet::new();
        for k in keys {
            let mut key: Option<Val> = None;
            let mut values: Vec<Val> = Vec::new();
            let mut err: Option<FlowErr> = None;
            for input in &inputs {
                if let Some(row) = self.store.table(*input).get(&k) {
                    key.get_or_insert(row.key);
                    match &row.bag {
                        Bag::Values(vs) => values.extend(vs.iter().copied()),
                        Bag::Error(e) => {
                            err.get_or_insert_with(|| e.clone());
                        }
                    }
                }
            }
            let did = match (key, err) {
                (None, _) => self.delete_row(cid, &k),
                (Some(key), Some(err)) => self.write_row(cid, &k, key, Some(Bag::Error(err))),
                (Some(key), None) => self.write_row(cid, &k, key, Some(Bag::Values(values))),
            };
            if did {
                changed.insert(k);
            }
        }
        changed
    }

    fn recompute_slice(
        &mut self,
        cid: Cid,
        keys: BTreeSet<PackedKey>,
        input: Cid,
        ranges: Vec<(PackedKey, PackedKey)>,
    ) -> BTreeSet<PackedKey> {
        if self.input_pending(input) {
            self.park_all(input, cid, keys);
            return BTreeSet::new();
        }

        let mut changed = BTreeSet::new();
        for k in keys {
            let retained = ranges.iter().any(|(lo, hi)| *lo <= k && k <= *hi);
            let row = if retained {
                self.store
                    .table(input)
                    .get(&k)
                    .map(|row| (row.key, row.bag.clone()))
            } else {
                None
            };
            let did = match row {
                Some((key, bag)) => self.write_row(cid, &k, key, Some(bag)),
                None => self.delete_row(cid, &k),
            };
            if did {
                changed.insert(k);
            }
        }
        changed
    }

    // Take re-diffs its whole window per pass: the first `limit` input
    // keys in key order, with sorted-key order breaking ties at the
    // cutoff. Deletions inside the window promote the next key.
    fn recompute_take(
        &mut self,
        cid: Cid,
        keys: BTreeSet<PackedKey>,
        input: Cid,
        limit: usize,
    ) -> BTreeSet<PackedKey> {
        if self.input_pending(input) {
            // The next update re-touches this window.
            self.park_all(input, cid, keys);
            return BTreeSet::new();
        }
        let desired: Vec<(PackedKey, Val, Bag)> = self
            .store
            .table(input)
            .iter()
            .take(limit)
            .map(|(packed, row)| (packed.clone(), row.key, row.bag.clone()))
            .collect();
        let window: BTreeSet<&PackedKey> = desired.iter().map(|(packed, ..)| packed).collect();

        let dropped: Vec<PackedKey> = self
            .store
            .table(cid)
            .iter()
            .map(|(packed, _)| packed.clone())
            .filter(|packed| !window.contains(packed))
            .collect();

        let mut changed = BTreeSet::new();
        for (packed, key, bag) in &desired {
            if self.write_row(cid, packed, *key, Some(bag.clone())) {
                changed.insert(packed.clone());
            }
        }
        for packed in dropped {
            if self.delete_row(cid, &packed) {
                changed.insert(packed);
            }
        }
        changed
    }

    fn recompute_fold(
        &mut self,
        cid: Cid,
        keys: BTreeSet<PackedKey>,
        input: Cid,
        reducer: Rc<dyn Reducer>,
    ) -> BTreeSet<PackedKey> {
        if self.input_pending(input) {
            self.park_all(input, cid, keys);
            return BTreeSet::new();
        }

        let (out_key, out_packed, mut contrib, mut errs, mut acc) = {
            let Kind::Reduce(f) = &mut self.nodes.get_mut(&cid).expect("node exists").kind else {
                unreachable!("fold recompute over a reduce node")
            };
            (
                f.out_key,
                f.out_packed.clone(),
                std::mem::take(&mut f.contrib),
                std::mem::take(&mut f.errs),
                f.accum.take(),
            )
        };

        let mut removed: Vec<Val> = Vec::new();
        let mut added: Vec<Val> = Vec::new();
        for src in keys {
            if let Some(old) = contrib.remove(&src) {
                removed.extend(old);
            }
            errs.remove(&src);

            let row = self
                .store
                .table(input)
                .get(&src)
                .map(|row| row.bag.clone());
            match row {
                None => (),
                Some(Bag::Error(e)) => {
                    errs.insert(src, e);
                }
                Some(Bag::Values(vs)) => {
                    for v in &vs {
                        self.heap.inc_ref(*v);
                    }
                    added.extend(vs.iter().copied());
                    contrib.insert(src, vs);
                }
            }
        }

        let mut failure: Option<FlowErr> = errs.values().next().cloned();
        if failure.is_some() {
            if let Some(a) = acc.take() {
                self.heap.dec_ref(a);
            }
        } else {
            if let Some(a) = acc.take() {
                match advance(&reducer, &mut self.heap, a, &removed, &added) {
                    Advanced::Acc(a) => acc = Some(a),
                    Advanced::Rebuild => (),
                    Advanced::Failed(err) => failure = Some(err),
                }
            }
            if failure.is_none() && acc.is_none() && !contrib.is_empty() {
                let mut a = reducer.initial(&mut self.heap);
                let mut srcs: Vec<&PackedKey> = contrib.keys().collect();
                srcs.sort();
                'fold: for src in srcs {
                    for v in &contrib[src] {
                        match reducer.add(&mut self.heap, a, *v) {
                            Ok(next) => {
                                self.heap.dec_ref(a);
                                a = next;
                            }
                            Err(e) => {
                                self.heap.dec_ref(a);
                                failure = Some(reduce_failure(e));
                                break 'fold;
                            }
                        }
                    }
                }
                if failure.is_none() {
                    acc = Some(a);
                }
            }
        }

        for v in removed {
            self.heap.dec_ref(v);
        }

        let did = match (&failure, &acc) {
            (Some(err), _) => self.write_row(cid, &out_packed, out_key, Some(Bag::Error(err.clone()))),
            (None, Some(a)) => {
                let a = *a;
                self.write_row(cid, &out_packed, out_key, Some(Bag::Values(vec![a])))
            }
            (None, None) => self.delete_row(cid, &out_packed),
        };

        let mut changed = BTreeSet::new();
        if did {
            changed.insert(out_packed.clone());
        }

        let Kind::Reduce(f) = &mut self.nodes.get_mut(&cid).expect("node exists").kind else {
            unreachable!()
        };
        f.contrib = contrib;
        f.errs = errs;
        f.accum = acc;
        changed
    }

    /// Service an operator's read of a consulted collection.
    pub(crate) fn operator_read(
        &mut self,
        cid: Cid,
        key: Val,
        packed: &PackedKey,
    ) -> Result<Vec<Val>, OpError> {
        enum Class {
            Failed(FlowErr),
            Pending,
            Lazy,
            Eager,
        }

        let class = match self.nodes.get(&cid).map(|n| &n.kind) {
            None => {
                return Err(OpError::Upstream(FlowErr::contract(format!(
                    "read of dropped collection {cid:?}"
                ))))
            }
            Some(Kind::External(state)) => {
                if let Some(err) = &state.failed {
                    Class::Failed(err.clone())
                } else if state.pending {
                    Class::Pending
                } else {
                    Class::Eager
                }
            }
            Some(Kind::Lazy(_)) => Class::Lazy,
            Some(_) => Class::Eager,
        };

        match class {
            Class::Failed(err) => Err(OpError::Upstream(err)),
            Class::Pending => {
                self.blocked_on = Some(cid);
                Err(OpError::Blocked)
            }
            Class::Lazy => self.pull_lazy(cid, key, packed),
            Class::Eager => self.read_store_bag(cid, packed),
        }
    }

    fn read_store_bag(&self, cid: Cid, packed: &PackedKey) -> Result<Vec<Val>, OpError> {
        match self.store.table(cid).get(packed) {
            None => Ok(Vec::new()),
            Some(row) => match &row.bag {
                Bag::Values(vs) => Ok(vs.clone()),
                Bag::Error(e) => Err(OpError::Upstream(e.clone())),
            },
        }
    }

    // Memoized pull of a lazy collection key. A re-entrant pull of a key
    // already on the computation stack fails with a cycle error, which is
    // cached like any other result and propagates to the caller.
    fn pull_lazy(&mut self, cid: Cid, key: Val, packed: &PackedKey) -> Result<Vec<Val>, OpError> {
        {
            let Kind::Lazy(state) = &self.nodes.get(&cid).expect("lazy node exists").kind else {
                unreachable!("pull of a lazy node")
            };
            if let Some(entry) = state.cache.get(packed) {
                return match &entry.bag {
                    Bag::Values(vs) => Ok(vs.clone()),
                    Bag::Error(e) => Err(OpError::Upstream(e.clone())),
                };
            }
        }

        if self
            .pull_stack
            .iter()
            .any(|(c, p)| *c == cid && p == packed)
        {
            let rendered = self.heap.to_json(key).to_string();
            return Err(OpError::Upstream(FlowErr::Cycle(rendered.into())));
        }

        let (compute, aux) = {
            let Kind::Lazy(state) = &self.nodes.get(&cid).expect("lazy node exists").kind else {
                unreachable!()
            };
            (state.compute.clone(), state.aux.clone())
        };

        self.pull_stack.push((cid, packed.clone()));
        let mut ctx = OpCtx {
            df: self,
            allowed: &aux,
            self_cid: Some(cid),
            reads: Vec::new(),
            scratch: Vec::new(),
        };
        let result = compute.compute(&mut ctx, key);
        let OpCtx {
            reads, scratch, ..
        } = ctx;
        self.pull_stack.pop();

        let outcome = match result {
            Ok(values) => {
                // Retain before scratch release, as for mapper emissions.
                for v in &values {
                    self.heap.inc_ref(*v);
                }
                Ok(values)
            }
            Err(OpError::Blocked) => Err(OpError::Blocked),
            Err(OpError::Fail(message)) => Err(OpError::Upstream(FlowErr::user(message))),
            Err(OpError::Upstream(e)) => Err(OpError::Upstream(e)),
        };
        for s in scratch {
            self.heap.dec_ref(s);
        }

        // Cache the result with the reads that produced it; a blocked
        // computation is not cached and will re-run on demand.
        if !matches!(&outcome, Err(OpError::Blocked)) {
            let bag = match &outcome {
                Ok(vs) => Bag::Values(vs.clone()),
                Err(OpError::Upstream(e)) => Bag::Error(e.clone()),
                _ => unreachable!(),
            };
            self.heap.inc_ref(key);
            let Kind::Lazy(state) = &mut self.nodes.get_mut(&cid).expect("node exists").kind
            else {
                unreachable!()
            };
            for (rc, rk) in &reads {
                state
                    .dep_index
                    .entry(*rc)
                    .or_default()
                    .entry(rk.clone())
                    .or_default()
                    .insert(packed.clone());
            }
            state.cache.insert(packed.clone(), LazyEntry { key, bag, reads });
        }
        outcome
    }
}

enum Advanced {
    Acc(Val),
    Rebuild,
    Failed(FlowErr),
}

// Reducer fast path: rewind `removed` then advance `added` over the
// accumulator `a`, whose reference is consumed. A removal the reducer
// cannot rewind demands a rebuild.
fn advance(
    reducer: &Rc<dyn Reducer>,
    heap: &mut heap::Heap,
    mut a: Val,
    removed: &[Val],
    added: &[Val],
) -> Advanced {
    for v in removed {
        match reducer.remove(heap, a, *v) {
            Ok(Some(next)) => {
                heap.dec_ref(a);
                a = next;
            }
            Ok(None) => {
                heap.dec_ref(a);
                return Advanced::Rebuild;
            }
            Err(e) => {
                heap.dec_ref(a);
                return Advanced::Failed(reduce_failure(e));
            }
        }
    }
    for v in added {
        match reducer.add(heap, a, *v) {
            Ok(next) => {
                heap.dec_ref(a);
                a = next;
            }
            Err(e) => {
                heap.dec_ref(a);
                return Advanced::Failed(reduce_failure(e));
            }
        }
    }
    Advanced::Acc(a)
}

fn reduce_failure(err: OpError) -> FlowErr {
    match err {
        OpError::Fail(message) => FlowErr::user(message),
        OpError::Upstream(e) => e,
        OpError::Blocked => FlowErr::contract("reducer performed a blocking read"),
    }
}

fn first_emitted_key(
    contrib: &fxhash::FxHashMap<PackedKey, SourceContrib>,
    srcs: &BTreeSet<PackedKey>,
    out: &PackedKey,
) -> Option<Val> {
    for s in srcs {
        for em in &contrib[s].emitted {
            if em.packed == *out {
                return Some(em.key);
            }
        }
    }
    None
}
