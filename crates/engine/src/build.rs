use crate::kernel::Command;
use crate::subscribe::{Adapter, ExtKey, SubEntry, SubId, SubscriptionHandle};
use anyhow::Context;
use dataflow::{Cid, Dataflow, LazyCompute, Mapper, Reducer};
use fxhash::FxHashMap;
use std::collections::BTreeMap;
use std::rc::Rc;
use tokio::sync::mpsc;

/// BuildCtx is the wiring surface handed to `Resource::instantiate`:
/// named input collections, derived-node constructors, lazy collections,
/// and external resource subscriptions.
///
/// Nodes wired here are private to the instance being built and are
/// dropped when it closes; inputs and externals are shared.
pub struct BuildCtx<'k> {
    pub(crate) df: &'k mut Dataflow,
    pub(crate) inputs: &'k BTreeMap<String, Cid>,
    pub(crate) adapters: &'k mut BTreeMap<String, Box<dyn Adapter>>,
    pub(crate) subs: &'k mut FxHashMap<SubId, SubEntry>,
    pub(crate) externals: &'k mut FxHashMap<ExtKey, SubId>,
    pub(crate) next_sub: &'k mut u64,
    pub(crate) tx: &'k mpsc::UnboundedSender<Command>,
    pub(crate) created: Vec<Cid>,
    pub(crate) pinned: Vec<ExtKey>,
}

impl<'k> BuildCtx<'k> {
    /// A named input collection declared at engine construction.
    pub fn input(&self, name: &str) -> anyhow::Result<Cid> {
        self.inputs
            .get(name)
            .copied()
            .with_context(|| format!("unknown input collection {name:?}"))
    }

    /// Map `input` through `mapper`. `aux` declares further collections
    /// the mapper may consult through its operator context.
    pub fn map(
        &mut self,
        input: Cid,
        aux: Vec<Cid>,
        mapper: impl Mapper + 'static,
    ) -> anyhow::Result<Cid> {
        let cid = self.df.create_map(input, aux, Rc::new(mapper))?;
        self.created.push(cid);
        Ok(cid)
    }

    pub fn map_reduce(
        &mut self,
        input: Cid,
        aux: Vec<Cid>,
        mapper: impl Mapper + 'static,
        reducer: impl Reducer + 'static,
    ) -> anyhow::Result<Cid> {
        let cid = self
            .df
            .create_map_reduce(input, aux, Rc::new(mapper), Rc::new(reducer))?;
        self.created.push(cid);
        Ok(cid)
    }

    pub fn merge(&mut self, inputs: Vec<Cid>) -> anyhow::Result<Cid> {
        let cid = self.df.create_merge(inputs)?;
        self.created.push(cid);
        Ok(cid)
    }

    /// Retain keys within any of the inclusive JSON `ranges`.
    pub fn slice(&mut self, input: Cid, ranges: &[(serde_json::Value, serde_json::Value)]) -> anyhow::Result<Cid> {
        let bounds: Vec<_> = ranges
            .iter()
            .map(|(lo, hi)| {
                let lo = self.df.heap.intern_value(lo);
                let hi = self.df.heap.intern_value(hi);
                (lo, hi)
            })
            .collect();
        let result = self.df.create_slice(input, &bounds);
        for (lo, hi) in bounds {
            self.df.heap.dec_ref(lo);
            self.df.heap.dec_ref(hi);
        }
        let cid = result?;
        self.created.push(cid);
        Ok(cid)
    }

    /// Retain the first `limit` keys in key order.
    pub fn take(&mut self, input: Cid, limit: usize) -> anyhow::Result<Cid> {
        let cid = self.df.create_take(input, limit)?;
        self.created.push(cid);
        Ok(cid)
    }

    /// Fold the whole collection onto the sentinel key 0.
    pub fn reduce(&mut self, input: Cid, reducer: impl Reducer + 'static) -> anyhow::Result<Cid> {
        let cid = self.df.create_reduce(input, Rc::new(reducer))?;
        self.created.push(cid);
        Ok(cid)
    }

    /// Create a lazy collection computed per key on demand.
    /// The computation may read the declared `aux` collections and
    /// itself; external resources are not reachable from lazy code.
    pub fn lazy(
        &mut self,
        aux: Vec<Cid>,
        compute: impl LazyCompute + 'static,
    ) -> anyhow::Result<Cid> {
        let cid = self.df.create_lazy(aux, Rc::new(compute))?;
        self.created.push(cid);
        Ok(cid)
    }

    /// Bind an eager collection to an external resource served by the
    /// named adapter. Subscriptions are shared: a second instance naming
    /// the same (service, resource, params) pins the same collection.
    pub fn use_external_resource(
        &mut self,
        service: &str,
        resource: &str,
        params: serde_json::Value,
    ) -> anyhow::Result<Cid> {
        let key = ExtKey::new(service, resource, &params);
        if let Some(sub) = self.externals.get(&key) {
            let entry = self.subs.get_mut(sub).expect("subscription is registered");
            entry.pins += 1;
            self.pinned.push(key);
            return Ok(entry.cid);
        }

        let adapter = self
            .adapters
            .get_mut(service)
            .with_context(|| format!("unknown external service {service:?}"))?;

        let sub = SubId(*self.next_sub);
        *self.next_sub += 1;

        let handle = SubscriptionHandle {
            sub,
            tx: self.tx.clone(),
        };
        adapter
            .subscribe(&handle, resource, &params)
            .with_context(|| format!("subscribing {resource:?} to service {service:?}"))?;

        let cid = self.df.create_external();
        self.subs.insert(
            sub,
            SubEntry {
                cid,
                service: service.to_string(),
                pins: 1,
            },
        );
        self.externals.insert(key.clone(), sub);
        self.pinned.push(key);
        tracing::info!(service, resource, ?sub, "subscribed external resource");
        Ok(cid)
    }
}
