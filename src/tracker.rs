//! Connection lifecycle tracking.
//!
//! The per-flow state machine is expressed as a pure function,
//! [`transition`], over the current record (if any) and one packet event.
//! [`ConnectionTracker`] owns the flow table for a single analysis pass and
//! applies whatever the transition function decides.
//!
//! ```text
//!            client SYN               RST
//!   Unseen ─────────────→ Open ───────────────→ Closed(Reset)
//!                          │
//!                          │ FIN from both peers, FIN carried ACK,
//!                          │ then ACK from the side opposite the last FIN
//!                          └──────────────────→ Closed(NormalClose)
//! ```
//!
//! A client SYN older than a record's `start_time` pulls the start earlier,
//! including on closed records. Nothing else touches a closed record.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::flow::{Direction, FlowKey, FlowResolver};
use crate::record::{PacketRecord, TcpFlags};

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Reset,
    #[serde(rename = "normal")]
    NormalClose,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Reset => write!(f, "reset"),
            EndReason::NormalClose => write!(f, "normal"),
        }
    }
}

/// Lifecycle state of one flow key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unseen,
    Open,
    Closed(EndReason),
}

impl ConnectionState {
    pub fn of(record: Option<&ConnectionRecord>) -> Self {
        match record {
            None => ConnectionState::Unseen,
            Some(rec) => rec.state(),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unseen => write!(f, "unseen"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed(reason) => write!(f, "closed({})", reason),
        }
    }
}

/// Most recent FIN observed on a flow.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PendingFin {
    pub time: f64,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub key: FlowKey,
    /// Earliest client SYN seen for this key.
    pub start_time: f64,
    pub end_time: Option<f64>,
    pub end_reason: Option<EndReason>,
    pub pending_fin: Option<PendingFin>,
    /// Set once any FIN carrying ACK has been observed.
    pub fin_ack_confirmed: bool,
    #[serde(default)]
    pub client_fin_seen: bool,
    #[serde(default)]
    pub server_fin_seen: bool,
}

impl ConnectionRecord {
    pub fn new(key: FlowKey, start_time: f64) -> Self {
        ConnectionRecord {
            key,
            start_time,
            end_time: None,
            end_reason: None,
            pending_fin: None,
            fin_ack_confirmed: false,
            client_fin_seen: false,
            server_fin_seen: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match (self.end_time, self.end_reason) {
            (Some(_), Some(reason)) => ConnectionState::Closed(reason),
            _ => ConnectionState::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Measured lifetime, or `None` while the connection is open.
    pub fn duration(&self) -> Option<f64> {
        self.end_time.map(|end| end - self.start_time)
    }

    fn fin_seen_from(&self, direction: Direction) -> bool {
        match direction {
            Direction::ClientToServer => self.client_fin_seen,
            Direction::ServerToClient => self.server_fin_seen,
        }
    }

    /// Apply a transition produced by [`transition`] for this record.
    ///
    /// `Open` is handled by the table owner since it creates the record.
    pub fn apply(&mut self, change: Transition) {
        match change {
            Transition::PullStart(ts) => self.start_time = ts,
            Transition::Reset(ts) => self.close(ts, EndReason::Reset),
            Transition::NormalClose(ts) => self.close(ts, EndReason::NormalClose),
            Transition::Fin { fin, with_ack } => {
                self.pending_fin = Some(fin);
                match fin.direction {
                    Direction::ClientToServer => self.client_fin_seen = true,
                    Direction::ServerToClient => self.server_fin_seen = true,
                }
                if with_ack {
                    self.fin_ack_confirmed = true;
                }
            }
            Transition::Open { .. } | Transition::Ignore => {}
        }
    }

    fn close(&mut self, ts: f64, reason: EndReason) {
        self.end_time = Some(ts);
        self.end_reason = Some(reason);
    }
}

/// A packet reduced to what the state machine looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketEvent {
    pub time: f64,
    pub direction: Direction,
    pub flags: TcpFlags,
}

impl PacketEvent {
    pub fn new(time: f64, direction: Direction, flags: TcpFlags) -> Self {
        PacketEvent {
            time,
            direction,
            flags,
        }
    }
}

/// Outcome of feeding one event to one flow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    /// Unseen → Open.
    Open { start: f64 },
    /// Earlier client SYN; move `start_time` back.
    PullStart(f64),
    /// Open → Closed(Reset).
    Reset(f64),
    /// FIN recorded; the flow stays open.
    Fin { fin: PendingFin, with_ack: bool },
    /// Open → Closed(NormalClose).
    NormalClose(f64),
    Ignore,
}

/// The per-flow transition function.
pub fn transition(current: Option<&ConnectionRecord>, event: &PacketEvent) -> Transition {
    let flags = event.flags;

    if event.direction == Direction::ClientToServer && flags.is_initial_syn() {
        return match current {
            None => Transition::Open { start: event.time },
            Some(rec) if event.time < rec.start_time => Transition::PullStart(event.time),
            Some(_) => Transition::Ignore,
        };
    }

    let rec = match current {
        Some(rec) if rec.is_open() => rec,
        _ => return Transition::Ignore,
    };

    if flags.rst {
        return Transition::Reset(event.time);
    }

    if flags.fin {
        return Transition::Fin {
            fin: PendingFin {
                time: event.time,
                direction: event.direction,
            },
            with_ack: flags.ack,
        };
    }

    if flags.ack && rec.fin_ack_confirmed {
        if let Some(fin) = rec.pending_fin {
            let both_fins = rec.fin_seen_from(fin.direction)
                && rec.fin_seen_from(fin.direction.reverse());
            if both_fins && fin.direction != event.direction && event.time > fin.time {
                return Transition::NormalClose(event.time);
            }
        }
    }

    Transition::Ignore
}

/// Counters for one tracking pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub packets: u64,
    /// Packets not to or from the server endpoint.
    pub unrelated: u64,
    pub opened: u64,
    pub start_corrections: u64,
    pub resets: u64,
    pub normal_closes: u64,
    pub fins: u64,
    pub ignored: u64,
}

impl TrackerStats {
    pub fn merge(&mut self, other: &TrackerStats) {
        self.packets += other.packets;
        self.unrelated += other.unrelated;
        self.opened += other.opened;
        self.start_corrections += other.start_corrections;
        self.resets += other.resets;
        self.normal_closes += other.normal_closes;
        self.fins += other.fins;
        self.ignored += other.ignored;
    }

    fn count(&mut self, change: &Transition) {
        match change {
            Transition::Open { .. } => self.opened += 1,
            Transition::PullStart(_) => self.start_corrections += 1,
            Transition::Reset(_) => self.resets += 1,
            Transition::Fin { .. } => self.fins += 1,
            Transition::NormalClose(_) => self.normal_closes += 1,
            Transition::Ignore => self.ignored += 1,
        }
    }
}

/// Owns the flow table for one analysis pass.
///
/// A four-tuple is one connection attempt per pass: a second handshake that
/// reuses the same client port after a close is folded into the existing
/// record (its SYN can only pull `start_time` earlier). Captures with heavy
/// ephemeral-port reuse will under-count connections.
#[derive(Debug)]
pub struct ConnectionTracker {
    resolver: FlowResolver,
    connections: AHashMap<FlowKey, ConnectionRecord>,
    stats: TrackerStats,
}

impl ConnectionTracker {
    pub fn new(resolver: FlowResolver) -> Self {
        ConnectionTracker {
            resolver,
            connections: AHashMap::new(),
            stats: TrackerStats::default(),
        }
    }

    pub fn resolver(&self) -> &FlowResolver {
        &self.resolver
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn get(&self, key: &FlowKey) -> Option<&ConnectionRecord> {
        self.connections.get(key)
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    /// Feed one packet. Returns `None` when the packet is unrelated to the
    /// server endpoint.
    pub fn observe(&mut self, packet: &PacketRecord) -> Option<Transition> {
        match self.resolver.resolve(packet) {
            Some((key, direction)) => Some(self.observe_event(
                key,
                PacketEvent::new(packet.timestamp, direction, packet.flags),
            )),
            None => {
                self.stats.packets += 1;
                self.stats.unrelated += 1;
                None
            }
        }
    }

    /// Feed an already-resolved event.
    pub fn observe_event(&mut self, key: FlowKey, event: PacketEvent) -> Transition {
        self.stats.packets += 1;

        let change = transition(self.connections.get(&key), &event);
        self.stats.count(&change);

        match change {
            Transition::Open { start } => {
                tracing::trace!(flow = %key, start, "connection opened");
                self.connections
                    .insert(key, ConnectionRecord::new(key, start));
            }
            Transition::Ignore => {}
            other => {
                if let Some(rec) = self.connections.get_mut(&key) {
                    match other {
                        Transition::PullStart(ts) => {
                            tracing::debug!(
                                flow = %key,
                                from = rec.start_time,
                                to = ts,
                                "earlier SYN moved start time"
                            );
                        }
                        Transition::Reset(ts) | Transition::NormalClose(ts) => {
                            tracing::trace!(flow = %key, end = ts, "connection closed");
                        }
                        _ => {}
                    }
                    rec.apply(other);
                }
            }
        }

        change
    }

    pub fn observe_all<'a, I>(&mut self, packets: I)
    where
        I: IntoIterator<Item = &'a PacketRecord>,
    {
        for packet in packets {
            self.observe(packet);
        }
    }

    /// End the pass and freeze the table.
    pub fn finish(self) -> ConnectionTable {
        ConnectionTable::from_records(self.connections.into_values().collect())
    }
}

/// Finalized, read-only result of a tracking pass.
///
/// Records are ordered by `(start_time, key)` so the aligned duration
/// sequences derived from a table are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ConnectionRecord>", into = "Vec<ConnectionRecord>")]
pub struct ConnectionTable {
    records: Vec<ConnectionRecord>,
}

impl ConnectionTable {
    pub fn from_records(mut records: Vec<ConnectionRecord>) -> Self {
        records.sort_by(|a, b| {
            a.start_time
                .total_cmp(&b.start_time)
                .then_with(|| a.key.cmp(&b.key))
        });
        ConnectionTable { records }
    }

    /// Combine tables built over disjoint key sets (one per pipeline shard).
    pub fn merge<I>(parts: I) -> Self
    where
        I: IntoIterator<Item = ConnectionTable>,
    {
        let records: Vec<ConnectionRecord> = parts.into_iter().flat_map(|t| t.records).collect();
        debug_assert!(
            {
                let mut seen = ahash::AHashSet::new();
                records.iter().all(|r| seen.insert(r.key))
            },
            "ConnectionTable::merge: a flow key appeared in more than one shard"
        );
        ConnectionTable::from_records(records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ConnectionRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ConnectionRecord> {
        self.records.iter()
    }

    pub fn get(&self, key: &FlowKey) -> Option<&ConnectionRecord> {
        self.records.iter().find(|r| r.key == *key)
    }

    /// Earliest start time across all records.
    pub fn reference_time(&self) -> Option<f64> {
        // Sorted by start time, so the first record holds the minimum.
        self.records.first().map(|r| r.start_time)
    }

    pub fn count_state(&self, state: ConnectionState) -> usize {
        self.records.iter().filter(|r| r.state() == state).count()
    }
}

/// A stored record whose end time and end reason disagree: one is set and
/// the other is not.
#[derive(Debug, Clone, PartialEq)]
pub struct InconsistentRecord {
    pub key: FlowKey,
    pub end_time: Option<f64>,
    pub end_reason: Option<EndReason>,
}

impl fmt::Display for InconsistentRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.end_time, self.end_reason) {
            (Some(end), None) => {
                write!(f, "connection {} ends at {} without a reason", self.key, end)
            }
            _ => write!(f, "connection {} has an end reason but no end time", self.key),
        }
    }
}

impl std::error::Error for InconsistentRecord {}

/// Tables read back from storage must agree with what tracking produces:
/// a record is closed exactly when both end fields are set.
impl TryFrom<Vec<ConnectionRecord>> for ConnectionTable {
    type Error = InconsistentRecord;

    fn try_from(records: Vec<ConnectionRecord>) -> Result<Self, Self::Error> {
        if let Some(bad) = records
            .iter()
            .find(|r| r.end_time.is_some() != r.end_reason.is_some())
        {
            return Err(InconsistentRecord {
                key: bad.key,
                end_time: bad.end_time,
                end_reason: bad.end_reason,
            });
        }
        Ok(ConnectionTable::from_records(records))
    }
}

impl From<ConnectionTable> for Vec<ConnectionRecord> {
    fn from(table: ConnectionTable) -> Self {
        table.records
    }
}

impl<'a> IntoIterator for &'a ConnectionTable {
    type Item = &'a ConnectionRecord;
    type IntoIter = std::slice::Iter<'a, ConnectionRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
