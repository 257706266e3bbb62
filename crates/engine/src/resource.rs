use crate::subscribe::ExtKey;
use crate::wire::{self, WireDiff};
use crate::BuildCtx;
use dataflow::{Cid, Dataflow};

/// Resource is a parameterizable template of a derived collection.
/// `instantiate` wires a sub-graph through the context and returns the
/// eager collection serving as the instance's output.
pub trait Resource: Send {
    fn instantiate(
        &self,
        ctx: &mut BuildCtx<'_>,
        params: &serde_json::Value,
    ) -> anyhow::Result<Cid>;
}

/// DiffSink receives the streamed diffs of a subscribed instance:
/// an initial snapshot, then one diff per propagation that changed the
/// instance's output, in strictly increasing watermark order.
pub trait DiffSink: Send {
    fn emit(&mut self, diff: WireDiff);
}

impl DiffSink for tokio::sync::mpsc::UnboundedSender<WireDiff> {
    fn emit(&mut self, diff: WireDiff) {
        // A dropped receiver means the subscriber went away; the diff
        // stream for it is simply cancelled.
        let _ = self.send(diff);
    }
}

/// Instance is a live, uniquely identified binding of a resource to
/// parameters, callbacks, and a watermark sequence.
pub(crate) struct Instance {
    pub resource: String,
    pub params: serde_json::Value,
    pub output: Cid,
    /// Nodes wired by instantiation, in creation order.
    /// They are private to this instance and dropped in reverse on close.
    pub created: Vec<Cid>,
    /// External subscriptions pinned by this instance.
    pub pinned: Vec<ExtKey>,
    pub watermark: u64,
    /// Emitted diffs, retained to serve `get_all(since)` suffix reads.
    pub history: Vec<(u64, WireDiff)>,
    pub sinks: Vec<Box<dyn DiffSink>>,
}

impl Instance {
    /// Snapshot of the output's current contents under the current
    /// watermark, marked initial.
    pub fn seed_diff(&self, df: &Dataflow) -> WireDiff {
        let values = df
            .snapshot(self.output)
            .into_iter()
            .map(|(key, bag)| (df.heap.to_json(key), wire::render_bag(&df.heap, &bag)))
            .collect();
        WireDiff {
            values,
            watermark: wire::render_watermark(self.watermark),
            is_initial: Some(true),
        }
    }

    /// The concatenated suffix of diffs later than `since`, under the
    /// current high watermark.
    pub fn suffix_since(&self, since: u64) -> WireDiff {
        let values = self
            .history
            .iter()
            .filter(|(w, _)| *w > since)
            .flat_map(|(_, diff)| diff.values.iter().cloned())
            .collect();
        WireDiff {
            values,
            watermark: wire::render_watermark(self.watermark),
            is_initial: None,
        }
    }

    /// Issue the next watermark, record the diff, and fan it out.
    pub fn push_diff(&mut self, values: Vec<(serde_json::Value, Vec<serde_json::Value>)>) {
        self.watermark += 1;
        let diff = WireDiff {
            values,
            watermark: wire::render_watermark(self.watermark),
            is_initial: None,
        };
        self.history.push((self.watermark, diff.clone()));
        for sink in &mut self.sinks {
            sink.emit(diff.clone());
        }
    }
}
