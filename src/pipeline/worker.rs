//! Per-shard worker: owns a private `ConnectionTracker` and folds the events
//! routed to its shard, in arrival order.

use crossbeam_channel::{Receiver, Sender};

use crate::flow::{FlowKey, FlowResolver};
use crate::tracker::{ConnectionTable, ConnectionTracker, PacketEvent, TrackerStats};

/// A resolved packet on its way to a shard.
#[derive(Debug, Clone, Copy)]
pub struct ShardPacket {
    pub key: FlowKey,
    pub event: PacketEvent,
}

/// Final state from a worker whose input channel closed.
#[derive(Debug)]
pub struct ShardResult {
    pub shard_id: usize,
    pub table: ConnectionTable,
    pub stats: TrackerStats,
}

pub struct Worker {
    shard_id: usize,
    tracker: ConnectionTracker,
}

impl Worker {
    pub fn new(shard_id: usize, resolver: FlowResolver) -> Self {
        Worker {
            shard_id,
            tracker: ConnectionTracker::new(resolver),
        }
    }

    /// Consume packets until every sender is dropped, then report.
    pub fn run(mut self, rx: Receiver<ShardPacket>, result_tx: Sender<ShardResult>) {
        for pkt in rx.iter() {
            self.tracker.observe_event(pkt.key, pkt.event);
        }

        let stats = self.tracker.stats();
        let flows = self.tracker.len();
        let table = self.tracker.finish();
        tracing::debug!(shard = self.shard_id, flows, packets = stats.packets, "worker finished");

        // The collector only goes away if the caller abandoned the run.
        let _ = result_tx.send(ShardResult {
            shard_id: self.shard_id,
            table,
            stats,
        });
    }
}
