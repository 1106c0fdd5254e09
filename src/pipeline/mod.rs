//! Flow-sharded tracking pipeline.
//!
//! Splits tracking across N worker threads ("shards"). Each worker owns its
//! own `ConnectionTracker`, so no flow state is ever shared. The feeding
//! thread resolves each packet once and routes it by flow key, which keeps
//! every packet of a connection on one worker, in order.
//!
//! ```text
//! records (caller thread)
//!   |
//!   |-- resolve → FlowKey → shard = hash(key) % N
//!   |
//!   +--[bounded channel]--→ Worker 0  (ConnectionTracker)
//!   +--[bounded channel]--→ Worker 1
//!   ...
//!   +--[bounded channel]--→ Worker N-1
//!
//! Workers --[unbounded]--→ merge (caller thread) → ConnectionTable
//! ```

pub mod merge;
pub mod router;
pub mod worker;

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::config::PipelineConfig;
use crate::flow::FlowResolver;
use crate::record::PacketRecord;
use crate::tracker::{ConnectionTable, ConnectionTracker, PacketEvent, TrackerStats};

pub use merge::Merged;
pub use worker::{ShardPacket, ShardResult};

/// Result of one tracking pass, single or sharded.
#[derive(Debug)]
pub struct TrackOutcome {
    pub table: ConnectionTable,
    pub stats: TrackerStats,
    /// Number of workers used (1 for the single-pass path).
    pub workers: usize,
    /// True when the run was interrupted before all records were fed.
    pub partial: bool,
}

/// Resolve `0` to an automatic worker count.
pub fn effective_workers(configured: usize) -> usize {
    if configured == 0 {
        // Half the available cores, minimum 1, maximum 8.
        (num_cpus::get() / 2).clamp(1, 8)
    } else {
        configured
    }
}

/// Track `records`, sharding across workers when more than one is configured.
pub fn track(
    records: &[PacketRecord],
    resolver: FlowResolver,
    config: &PipelineConfig,
    running: &AtomicBool,
) -> TrackOutcome {
    let workers = effective_workers(config.workers);
    if workers <= 1 {
        track_single(records, resolver, running)
    } else {
        track_sharded(records, resolver, workers, config.channel_capacity, running)
    }
}

/// Single-threaded fold over the records.
pub fn track_single(
    records: &[PacketRecord],
    resolver: FlowResolver,
    running: &AtomicBool,
) -> TrackOutcome {
    let mut tracker = ConnectionTracker::new(resolver);
    let mut partial = false;
    for (i, record) in records.iter().enumerate() {
        // Checking the flag every packet costs more than the fold itself.
        if i % 4096 == 0 && !running.load(Ordering::Relaxed) {
            partial = true;
            break;
        }
        tracker.observe(record);
    }

    tracing::info!(connections = tracker.len(), "identified unique TCP connections");
    let stats = tracker.stats();
    TrackOutcome {
        table: tracker.finish(),
        stats,
        workers: 1,
        partial,
    }
}

/// Handle to running shard workers.
pub struct PipelineHandle {
    resolver: FlowResolver,
    senders: Vec<Sender<ShardPacket>>,
    results: Receiver<ShardResult>,
    worker_handles: Vec<thread::JoinHandle<()>>,
    unrelated: u64,
}

impl PipelineHandle {
    pub fn num_workers(&self) -> usize {
        self.worker_handles.len()
    }

    /// Resolve and route one packet. Unrelated packets are counted and
    /// dropped here, before they reach a worker.
    pub fn dispatch(&mut self, record: &PacketRecord) {
        let (key, direction) = match self.resolver.resolve(record) {
            Some(resolved) => resolved,
            None => {
                self.unrelated += 1;
                return;
            }
        };
        let shard = router::shard_for_key(&key, self.senders.len());
        let pkt = ShardPacket {
            key,
            event: PacketEvent::new(record.timestamp, direction, record.flags),
        };
        if self.senders[shard].send(pkt).is_err() {
            tracing::error!(shard, "worker channel closed, packet dropped");
        }
    }

    /// Close the inputs, join workers and merge their tables.
    pub fn finish(mut self) -> Merged {
        let num_workers = self.worker_handles.len();
        // Dropping senders lets workers see the disconnect.
        self.senders.clear();
        for h in self.worker_handles.drain(..) {
            if h.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
        let mut merged = merge::collect(self.results, num_workers);
        merged.stats.packets += self.unrelated;
        merged.stats.unrelated += self.unrelated;
        merged
    }
}

/// Spawn `num_workers` shard workers.
pub fn spawn(
    resolver: FlowResolver,
    num_workers: usize,
    channel_capacity: usize,
) -> PipelineHandle {
    let num_workers = num_workers.max(1);
    tracing::info!(num_workers, "starting sharded pipeline");

    let (result_tx, result_rx) = crossbeam_channel::unbounded::<ShardResult>();
    let mut senders = Vec::with_capacity(num_workers);
    let mut worker_handles = Vec::with_capacity(num_workers);

    for shard_id in 0..num_workers {
        let (pkt_tx, pkt_rx) = bounded::<ShardPacket>(channel_capacity.max(1));
        senders.push(pkt_tx);

        let result_tx = result_tx.clone();
        let handle = thread::Builder::new()
            .name(format!("cs-worker-{}", shard_id))
            .spawn(move || {
                worker::Worker::new(shard_id, resolver).run(pkt_rx, result_tx);
            })
            .expect("failed to spawn worker thread");
        worker_handles.push(handle);
    }

    // Only workers may hold result senders, so collection ends when they do.
    drop(result_tx);

    PipelineHandle {
        resolver,
        senders,
        results: result_rx,
        worker_handles,
        unrelated: 0,
    }
}

pub fn track_sharded(
    records: &[PacketRecord],
    resolver: FlowResolver,
    num_workers: usize,
    channel_capacity: usize,
    running: &AtomicBool,
) -> TrackOutcome {
    let mut handle = spawn(resolver, num_workers, channel_capacity);
    let workers = handle.num_workers();
    let mut partial = false;

    for (i, record) in records.iter().enumerate() {
        if i % 4096 == 0 && !running.load(Ordering::Relaxed) {
            partial = true;
            break;
        }
        handle.dispatch(record);
    }

    let merged = handle.finish();
    if merged.shards < workers {
        tracing::warn!(reported = merged.shards, workers, "not every shard reported");
    }
    tracing::info!(connections = merged.table.len(), workers, "identified unique TCP connections");

    TrackOutcome {
        table: merged.table,
        stats: merged.stats,
        workers,
        partial,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Endpoint;
    use crate::record::TcpFlags;
    use std::net::{IpAddr, Ipv4Addr};

    fn server() -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::new(192, 168, 56, 104)), 8000)
    }

    fn workload() -> Vec<PacketRecord> {
        let s = server();
        let mut records = Vec::new();
        for i in 0..200u16 {
            let client = IpAddr::V4(Ipv4Addr::new(10, 0, (i / 50) as u8, 1));
            let port = 30000 + i;
            let t = i as f64 * 0.01;
            let c2s = |t, flags| PacketRecord::new(t, client, port, s.ip, s.port, flags);
            let s2c = |t, flags| PacketRecord::new(t, s.ip, s.port, client, port, flags);
            records.push(c2s(t, TcpFlags::SYN));
            match i % 3 {
                0 => records.push(s2c(t + 0.5, TcpFlags::RST)),
                1 => {
                    records.push(c2s(t + 1.0, TcpFlags::FIN_ACK));
                    records.push(s2c(t + 1.1, TcpFlags::FIN_ACK));
                    records.push(c2s(t + 1.2, TcpFlags::ACK));
                }
                _ => {}
            }
        }
        // Noise that must be counted as unrelated.
        records.push(PacketRecord::new(
            9.0,
            IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            53,
            IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2)),
            53,
            TcpFlags::ACK,
        ));
        records.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        records
    }

    #[test]
    fn sharded_matches_single_pass() {
        let records = workload();
        let running = AtomicBool::new(true);
        let resolver = FlowResolver::new(server());

        let single = track_single(&records, resolver, &running);
        let sharded = track_sharded(&records, resolver, 4, 16, &running);

        assert_eq!(single.table, sharded.table);
        assert_eq!(single.stats, sharded.stats);
        assert_eq!(sharded.workers, 4);
        assert_eq!(single.table.len(), 200);
        assert_eq!(single.stats.unrelated, 1);
        assert!(!sharded.partial);
    }

    #[test]
    fn stopped_run_is_partial() {
        let records = workload();
        let running = AtomicBool::new(false);
        let outcome = track_single(&records, FlowResolver::new(server()), &running);
        assert!(outcome.partial);
        assert!(outcome.table.is_empty());

        let outcome = track_sharded(&records, FlowResolver::new(server()), 2, 4, &running);
        assert!(outcome.partial);
        assert!(outcome.table.is_empty());
    }

    #[test]
    fn auto_workers_within_bounds() {
        let n = effective_workers(0);
        assert!((1..=8).contains(&n));
        assert_eq!(effective_workers(3), 3);
    }
}
