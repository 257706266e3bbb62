use crate::resource::{DiffSink, Instance, Resource};
use crate::subscribe::{Adapter, ExtKey, SubEntry, SubId};
use crate::wire::{self, WireDiff, WireValues};
use crate::{BuildCtx, Error};
use dataflow::{Cid, Dataflow};
use fxhash::FxHashMap;
use heap::Val;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};

type Entries = Vec<(serde_json::Value, Vec<serde_json::Value>)>;

pub(crate) enum Command {
    Update {
        collection: String,
        entries: Entries,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Instantiate {
        instance: String,
        resource: String,
        params: serde_json::Value,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    CloseInstance {
        instance: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    GetAll {
        instance: String,
        since: Option<String>,
        reply: oneshot::Sender<Result<WireDiff, Error>>,
    },
    GetArray {
        instance: String,
        key: serde_json::Value,
        reply: oneshot::Sender<Result<WireValues, Error>>,
    },
    Subscribe {
        instance: String,
        sink: Box<dyn DiffSink>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Adapter(AdapterEvent),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) enum AdapterEvent {
    Update {
        sub: SubId,
        entries: Entries,
        is_initial: bool,
    },
    Error {
        sub: SubId,
        message: String,
        retryable: bool,
    },
    Loading {
        sub: SubId,
    },
}

/// Kernel owns all graph state and runs on a single engine thread.
/// Every command runs to completion, and any command that touched inputs
/// is settled: propagation runs to quiescence, then changed instance
/// outputs are flushed to their subscribers under fresh watermarks.
pub(crate) struct Kernel {
    df: Dataflow,
    inputs: BTreeMap<String, Cid>,
    resources: BTreeMap<String, Box<dyn Resource>>,
    adapters: BTreeMap<String, Box<dyn Adapter>>,
    instances: BTreeMap<String, Instance>,
    subs: FxHashMap<SubId, SubEntry>,
    externals: FxHashMap<ExtKey, SubId>,
    next_sub: u64,
    tx: mpsc::UnboundedSender<Command>,
}

impl Kernel {
    pub fn new(
        input_names: Vec<String>,
        resources: BTreeMap<String, Box<dyn Resource>>,
        adapters: BTreeMap<String, Box<dyn Adapter>>,
        tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let mut df = Dataflow::new();
        let mut inputs = BTreeMap::new();
        for name in input_names {
            let cid = df.create_input();
            inputs.insert(name, cid);
        }
        Self {
            df,
            inputs,
            resources,
            adapters,
            instances: BTreeMap::new(),
            subs: FxHashMap::default(),
            externals: FxHashMap::default(),
            next_sub: 0,
            tx,
        }
    }

    pub fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        tracing::info!(inputs = self.inputs.len(), "engine thread started");
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                Command::Shutdown { reply } => {
                    self.shutdown();
                    let _ = reply.send(());
                    break;
                }
                cmd => {
                    self.dispatch(cmd);
                    self.settle();
                }
            }
        }
        tracing::info!("engine thread stopped");
    }

    fn dispatch(&mut self, cmd: Command) {
        match cmd {
            Command::Update {
                collection,
                entries,
                reply,
            } => {
                let _ = reply.send(self.update(&collection, &entries));
            }
            Command::Instantiate {
                instance,
                resource,
                params,
                reply,
            } => {
                let _ = reply.send(self.instantiate(instance, resource, params));
            }
            Command::CloseInstance { instance, reply } => {
                let _ = reply.send(self.close_instance(&instance));
            }
            Command::GetAll {
                instance,
                since,
                reply,
            } => {
                let _ = reply.send(self.get_all(&instance, since.as_deref()));
            }
            Command::GetArray {
                instance,
                key,
                reply,
            } => {
                let _ = reply.send(self.get_array(&instance, &key));
            }
            Command::Subscribe {
                instance,
                sink,
                reply,
            } => {
                let _ = reply.send(self.subscribe(&instance, sink));
            }
            Command::Adapter(event) => self.adapter_event(event),
            Command::Shutdown { .. } => unreachable!("shutdown is handled by the run loop"),
        }
    }

    // Propagate to quiescence, then flush per-instance diffs.
    fn settle(&mut self) {
        self.df.propagate();
        let changed = self.df.changed_collections();
        if changed.is_empty() {
            return;
        }
        for (name, instance) in self.instances.iter_mut() {
            if !changed.contains(&instance.output) {
                continue;
            }
            let rows = self.df.changed_rows(instance.output);
            if rows.is_empty() {
                continue;
            }
            let values = wire::render_rows(&self.df.heap, &rows);
            instance.push_diff(values);
            tracing::debug!(
                instance = %name,
                watermark = instance.watermark,
                "emitted instance diff"
            );
        }
        self.df.clear_changes();
    }

    fn update(&mut self, collection: &str, entries: &Entries) -> Result<(), Error> {
        let cid = *self
            .inputs
            .get(collection)
            .ok_or_else(|| Error::UnknownCollection(collection.to_string()))?;
        let rows = self.intern_rows(entries);
        self.df.apply(cid, &rows);
        self.release_rows(rows);
        Ok(())
    }

    fn instantiate(
        &mut self,
        instance: String,
        resource: String,
        params: serde_json::Value,
    ) -> Result<(), Error> {
        if let Some(existing) = self.instances.get(&instance) {
            if existing.resource == resource && existing.params == params {
                return Ok(());
            }
            return Err(Error::InstanceMismatch(instance));
        }
        let Some(template) = self.resources.remove(&resource) else {
            return Err(Error::UnknownResource(resource));
        };

        let mut ctx = BuildCtx {
            df: &mut self.df,
            inputs: &self.inputs,
            adapters: &mut self.adapters,
            subs: &mut self.subs,
            externals: &mut self.externals,
            next_sub: &mut self.next_sub,
            tx: &self.tx,
            created: Vec::new(),
            pinned: Vec::new(),
        };
        let result = template.instantiate(&mut ctx, &params);
        let BuildCtx {
            created, pinned, ..
        } = ctx;
        self.resources.insert(resource.clone(), template);

        match result {
            Ok(output) if self.df.is_eager(output) => {
                tracing::info!(instance = %instance, resource = %resource, "instantiated resource");
                self.instances.insert(
                    instance,
                    Instance {
                        resource,
                        params,
                        output,
                        created,
                        pinned,
                        watermark: 0,
                        history: Vec::new(),
                        sinks: Vec::new(),
                    },
                );
                Ok(())
            }
            Ok(_) => {
                self.rollback(created, pinned);
                Err(Error::LazyOutput(instance))
            }
            Err(err) => {
                self.rollback(created, pinned);
                Err(Error::Template(format!("{err:#}")))
            }
        }
    }

    fn rollback(&mut self, created: Vec<Cid>, pinned: Vec<ExtKey>) {
        for cid in created.iter().rev() {
            self.df.remove_node(*cid);
        }
        for key in pinned {
            self.unpin(&key);
        }
    }

    fn close_instance(&mut self, instance: &str) -> Result<(), Error> {
        let Some(inst) = self.instances.remove(instance) else {
            return Err(Error::UnknownInstance(instance.to_string()));
        };
        for cid in inst.created.iter().rev() {
            self.df.remove_node(*cid);
        }
        for key in inst.pinned {
            self.unpin(&key);
        }
        tracing::info!(instance, "closed resource instance");
        Ok(())
    }

    fn unpin(&mut self, key: &ExtKey) {
        let Some(&sub) = self.externals.get(key) else {
            return;
        };
        let entry = self.subs.get_mut(&sub).expect("pinned subscription exists");
        entry.pins -= 1;
        if entry.pins > 0 {
            return;
        }
        let (cid, service) = (entry.cid, entry.service.clone());
        self.subs.remove(&sub);
        self.externals.remove(key);
        if let Some(adapter) = self.adapters.get_mut(&service) {
            adapter.unsubscribe(sub);
        }
        self.df.remove_node(cid);
        tracing::info!(?sub, service = %service, "unsubscribed external resource");
    }

    fn get_all(&self, instance: &str, since: Option<&str>) -> Result<WireDiff, Error> {
        let inst = self
            .instances
            .get(instance)
            .ok_or_else(|| Error::UnknownInstance(instance.to_string()))?;
        match since {
            None => Ok(inst.seed_diff(&self.df)),
            Some(w) => {
                let w = wire::parse_watermark(w)
                    .ok_or_else(|| Error::InvalidWatermark(w.to_string()))?;
                Ok(inst.suffix_since(w))
            }
        }
    }

    fn get_array(&mut self, instance: &str, key: &serde_json::Value) -> Result<WireValues, Error> {
        let (output, watermark) = {
            let inst = self
                .instances
                .get(instance)
                .ok_or_else(|| Error::UnknownInstance(instance.to_string()))?;
            (inst.output, inst.watermark)
        };
        let k = self.df.heap.intern_value(key);
        let payload = match self.df.read_key(output, k) {
            None => Vec::new(),
            Some(bag) => wire::render_bag(&self.df.heap, &bag),
        };
        self.df.heap.dec_ref(k);
        Ok(WireValues {
            payload,
            watermark: wire::render_watermark(watermark),
        })
    }

    fn subscribe(&mut self, instance: &str, mut sink: Box<dyn DiffSink>) -> Result<(), Error> {
        let Some(inst) = self.instances.get_mut(instance) else {
            return Err(Error::UnknownInstance(instance.to_string()));
        };
        // Seed the subscriber with the current contents, then stream.
        sink.emit(inst.seed_diff(&self.df));
        inst.sinks.push(sink);
        Ok(())
    }

    fn adapter_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::Update {
                sub,
                entries,
                is_initial,
            } => {
                let Some(entry) = self.subs.get(&sub) else {
                    tracing::debug!(?sub, "dropping late adapter update");
                    return;
                };
                let cid = entry.cid;
                let rows = self.intern_rows(&entries);
                self.df.external_update(cid, &rows, is_initial);
                self.release_rows(rows);
            }
            AdapterEvent::Loading { sub } => {
                let Some(entry) = self.subs.get(&sub) else {
                    tracing::debug!(?sub, "dropping late adapter loading signal");
                    return;
                };
                self.df.set_external_loading(entry.cid);
            }
            AdapterEvent::Error {
                sub,
                message,
                retryable,
            } => {
                let Some(entry) = self.subs.get(&sub) else {
                    tracing::debug!(?sub, "dropping late adapter error");
                    return;
                };
                let cid = entry.cid;
                self.df.set_external_failed(cid, &message, retryable);
            }
        }
    }

    fn shutdown(&mut self) {
        let names: Vec<String> = self.instances.keys().cloned().collect();
        for name in names {
            let _ = self.close_instance(&name);
        }
        for (_, adapter) in self.adapters.iter_mut() {
            adapter.shutdown();
        }
        tracing::info!("engine shut down");
    }

    fn intern_rows(&mut self, entries: &Entries) -> Vec<(Val, Vec<Val>)> {
        entries
            .iter()
            .map(|(key, values)| {
                let key = self.df.heap.intern_value(key);
                let values = values.iter().map(|v| self.df.heap.intern_value(v)).collect();
                (key, values)
            })
            .collect()
    }

    fn release_rows(&mut self, rows: Vec<(Val, Vec<Val>)>) {
        for (key, values) in rows {
            self.df.heap.dec_ref(key);
            for v in values {
                self.df.heap.dec_ref(v);
            }
        }
    }
}
