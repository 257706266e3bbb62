use crate::kernel::{AdapterEvent, Command};
use dataflow::Cid;
use tokio::sync::mpsc;

/// SubId identifies one live external subscription. Ids are never reused,
/// so a callback carrying a stale id after unsubscription simply finds no
/// subscription and is dropped.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubId(pub(crate) u64);

/// Adapter is the engine-facing contract of an external service: it is
/// asked to subscribe and unsubscribe resource streams, and it pushes
/// rows back through the SubscriptionHandle it was given.
///
/// Adapters own their I/O: `subscribe` must not block the engine thread,
/// and callbacks may be issued from any thread at any later time.
pub trait Adapter: Send {
    fn subscribe(
        &mut self,
        subscription: &SubscriptionHandle,
        resource: &str,
        params: &serde_json::Value,
    ) -> anyhow::Result<()>;

    /// Best-effort: callbacks arriving after unsubscription are dropped.
    fn unsubscribe(&mut self, subscription: SubId);

    fn shutdown(&mut self);
}

/// SubscriptionHandle is the callback surface handed to an adapter.
/// All three callbacks funnel onto the engine thread and serialize with
/// every other graph mutation.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub(crate) sub: SubId,
    pub(crate) tx: mpsc::UnboundedSender<Command>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubId {
        self.sub
    }

    /// Deliver rows. An initial update replaces the subscription's whole
    /// contents and is idempotent; a non-initial update applies deltas,
    /// with an empty values array deleting its key.
    pub fn update(
        &self,
        entries: Vec<(serde_json::Value, Vec<serde_json::Value>)>,
        is_initial: bool,
    ) {
        let _ = self.tx.send(Command::Adapter(AdapterEvent::Update {
            sub: self.sub,
            entries,
            is_initial,
        }));
    }

    /// Report a failure: every key of the backed collection surfaces the
    /// error until a subsequent update.
    pub fn error(&self, message: impl Into<String>, retryable: bool) {
        let _ = self.tx.send(Command::Adapter(AdapterEvent::Error {
            sub: self.sub,
            message: message.into(),
            retryable,
        }));
    }

    /// Mark the subscription pending: dependent recomputation is parked
    /// until the next update.
    pub fn loading(&self) {
        let _ = self.tx.send(Command::Adapter(AdapterEvent::Loading { sub: self.sub }));
    }
}

/// ExtKey identifies an external collection for sharing: two instances
/// subscribing the same service, resource, and parameters share one
/// subscription and one backing collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ExtKey {
    pub service: String,
    pub resource: String,
    /// Canonical JSON rendering of the parameter bag.
    pub params: String,
}

impl ExtKey {
    pub fn new(service: &str, resource: &str, params: &serde_json::Value) -> Self {
        Self {
            service: service.to_string(),
            resource: resource.to_string(),
            params: params.to_string(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct SubEntry {
    pub cid: Cid,
    pub service: String,
    /// Number of live resource instances using this subscription.
    pub pins: u32,
}
