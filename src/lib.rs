//! connscope library crate: packet records in, connection lifecycles and
//! duration series out. The binary, benchmarks and integration tests all go
//! through this API.

pub mod capture;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod display;
pub mod durations;
pub mod export;
pub mod flow;
pub mod pipeline;
pub mod record;
pub mod tracker;

pub use durations::{DurationAggregator, DurationSeries, DurationSummary};
pub use flow::{Direction, Endpoint, FlowKey, FlowResolver};
pub use record::{PacketRecord, TcpFlags};
pub use tracker::{ConnectionRecord, ConnectionTable, ConnectionTracker, EndReason};

/// Single-pass analysis: track every record against `server`, then
/// aggregate durations with the given timeout sentinel.
pub fn analyze<'a, I>(
    records: I,
    server: Endpoint,
    timeout_sentinel_secs: f64,
) -> (ConnectionTable, DurationSeries)
where
    I: IntoIterator<Item = &'a PacketRecord>,
{
    let mut tracker = ConnectionTracker::new(FlowResolver::new(server));
    tracker.observe_all(records);
    let table = tracker.finish();
    let series = DurationAggregator::new(timeout_sentinel_secs).aggregate(&table);
    (table, series)
}
