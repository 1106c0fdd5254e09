//! Collects per-shard results and merges them into one table.

use crossbeam_channel::Receiver;

use crate::tracker::{ConnectionTable, TrackerStats};

use super::worker::ShardResult;

/// Merged outcome of a sharded run.
#[derive(Debug)]
pub struct Merged {
    pub table: ConnectionTable,
    pub stats: TrackerStats,
    /// Shards that reported; less than the worker count only if one died.
    pub shards: usize,
}

/// Drain every shard result. Blocks until all result senders are dropped.
pub fn collect(rx: Receiver<ShardResult>, num_workers: usize) -> Merged {
    let mut parts: Vec<Option<ShardResult>> = (0..num_workers).map(|_| None).collect();

    for result in rx.iter() {
        let idx = result.shard_id;
        if idx < parts.len() {
            parts[idx] = Some(result);
        } else {
            tracing::warn!(shard = idx, "result from unknown shard dropped");
        }
    }

    merge(parts.into_iter().flatten())
}

pub fn merge<I>(results: I) -> Merged
where
    I: IntoIterator<Item = ShardResult>,
{
    let mut stats = TrackerStats::default();
    let mut tables = Vec::new();
    for result in results {
        stats.merge(&result.stats);
        tables.push(result.table);
    }
    let shards = tables.len();
    Merged {
        table: ConnectionTable::merge(tables),
        stats,
        shards,
    }
}
