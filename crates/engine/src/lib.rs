use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};

mod build;
pub use build::BuildCtx;

mod kernel;
use kernel::{Command, Kernel};

mod resource;
pub use resource::{DiffSink, Resource};

mod subscribe;
pub use subscribe::{Adapter, SubId, SubscriptionHandle};

mod wire;
pub use wire::{ErrorEnvelope, WireDiff, WireValues};

// Operator surface for resource templates.
pub use dataflow::{
    Bag, BuildError, Cid, Count, First, FlowErr, Last, LazyCompute, Mapper, Max, Min, OpCtx,
    OpError, Reducer, Sum,
};
pub use heap::Val;

/// Error is the synchronous failure surface of the control API.
/// Value-level failures (operator errors, cycles, adapter errors) are not
/// here: they flow through diff streams as error values.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown input collection {0:?}")]
    UnknownCollection(String),
    #[error("unknown resource {0:?}")]
    UnknownResource(String),
    #[error("unknown resource instance {0:?}")]
    UnknownInstance(String),
    #[error("instance {0:?} already exists with a different resource or parameters")]
    InstanceMismatch(String),
    #[error("instance {0:?} resource returned a lazy output collection")]
    LazyOutput(String),
    #[error("failed to instantiate resource: {0}")]
    Template(String),
    #[error("invalid watermark {0:?}")]
    InvalidWatermark(String),
    #[error("the engine has stopped")]
    Stopped,
}

/// Engine owns the single-threaded kernel: one per embedding service.
/// All state lives on the engine thread; `Handle` is the way in.
pub struct Engine {
    handle: Handle,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Builder declares the engine's named input collections, resource
/// templates, and external adapters, then starts the engine thread.
#[derive(Default)]
pub struct Builder {
    inputs: Vec<String>,
    resources: BTreeMap<String, Box<dyn Resource>>,
    adapters: BTreeMap<String, Box<dyn Adapter>>,
}

impl Builder {
    /// Declare a writable input collection.
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }

    /// Register a resource template under `name`.
    pub fn resource(mut self, name: impl Into<String>, template: impl Resource + 'static) -> Self {
        self.resources.insert(name.into(), Box::new(template));
        self
    }

    /// Register an adapter serving external resources for `service`.
    pub fn adapter(mut self, service: impl Into<String>, adapter: impl Adapter + 'static) -> Self {
        self.adapters.insert(service.into(), Box::new(adapter));
        self
    }

    pub fn start(self) -> Engine {
        let (tx, rx) = mpsc::unbounded_channel();
        let Self {
            inputs,
            resources,
            adapters,
        } = self;

        let kernel_tx = tx.clone();
        let thread = std::thread::Builder::new()
            .name("engine".to_string())
            .spawn(move || Kernel::new(inputs, resources, adapters, kernel_tx).run(rx))
            .expect("failed to spawn the engine thread");

        Engine {
            handle: Handle { tx },
            thread: Some(thread),
        }
    }
}

impl Engine {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// A cloneable control handle onto the engine thread.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Shut down: close instances, drain adapters, stop the thread.
    pub fn close(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let (reply, done) = oneshot::channel();
        if self.handle.tx.send(Command::Shutdown { reply }).is_ok() {
            let _ = done.blocking_recv();
        }
        let _ = thread.join();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handle issues control commands to the engine thread and blocks for
/// their replies. Commands from one handle are applied atomically, in
/// issue order.
#[derive(Debug, Clone)]
pub struct Handle {
    tx: mpsc::UnboundedSender<Command>,
}

impl Handle {
    /// Write a batch of rows into an input collection. The whole batch is
    /// applied and propagated as one event; an empty values array deletes
    /// its key.
    pub fn update(
        &self,
        collection: &str,
        entries: Vec<(serde_json::Value, Vec<serde_json::Value>)>,
    ) -> Result<(), Error> {
        self.call(|reply| Command::Update {
            collection: collection.to_string(),
            entries,
            reply,
        })
    }

    /// Open a resource instance. Idempotent for an identical
    /// (instance, resource, params) triple.
    pub fn instantiate_resource(
        &self,
        instance: &str,
        resource: &str,
        params: serde_json::Value,
    ) -> Result<(), Error> {
        self.call(|reply| Command::Instantiate {
            instance: instance.to_string(),
            resource: resource.to_string(),
            params,
            reply,
        })
    }

    pub fn close_resource_instance(&self, instance: &str) -> Result<(), Error> {
        self.call(|reply| Command::CloseInstance {
            instance: instance.to_string(),
            reply,
        })
    }

    /// Without `since`: the instance's full contents as an initial diff.
    /// With `since`: the concatenated diff suffix later than that
    /// watermark, under the current high watermark.
    pub fn get_all(&self, instance: &str, since: Option<&str>) -> Result<WireDiff, Error> {
        self.call(|reply| Command::GetAll {
            instance: instance.to_string(),
            since: since.map(str::to_string),
            reply,
        })
    }

    /// The values at one key of the instance's output.
    pub fn get_array(&self, instance: &str, key: serde_json::Value) -> Result<WireValues, Error> {
        self.call(|reply| Command::GetArray {
            instance: instance.to_string(),
            key,
            reply,
        })
    }

    /// Stream diffs: the sink is seeded with an initial snapshot and then
    /// receives one diff per propagation that changed the output.
    pub fn subscribe(&self, instance: &str, sink: impl DiffSink + 'static) -> Result<(), Error> {
        self.call(|reply| Command::Subscribe {
            instance: instance.to_string(),
            sink: Box::new(sink),
            reply,
        })
    }

    fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, Error>>) -> Command,
    ) -> Result<T, Error> {
        let (reply, done) = oneshot::channel();
        self.tx.send(build(reply)).map_err(|_| Error::Stopped)?;
        done.blocking_recv().map_err(|_| Error::Stopped)?
    }
}

/// Install a stderr tracing subscriber honoring RUST_LOG.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
