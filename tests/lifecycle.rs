//! End-to-end lifecycle scenarios through the public library API.

use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::atomic::AtomicBool;

use connscope::capture::fields;
use connscope::config::PipelineConfig;
use connscope::durations::{summarize, DurationAggregator};
use connscope::tracker::ConnectionState;
use connscope::{analyze, checkpoint, pipeline};
use connscope::{EndReason, Endpoint, FlowResolver, PacketRecord, TcpFlags};

const SENTINEL: f64 = 100.0;

fn server() -> Endpoint {
    Endpoint::new(IpAddr::V4(Ipv4Addr::new(192, 168, 56, 104)), 8000)
}

fn client(last: u8, port: u16) -> Endpoint {
    Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
}

fn c2s(t: f64, c: Endpoint, flags: TcpFlags) -> PacketRecord {
    let s = server();
    PacketRecord::new(t, c.ip, c.port, s.ip, s.port, flags)
}

fn s2c(t: f64, c: Endpoint, flags: TcpFlags) -> PacketRecord {
    let s = server();
    PacketRecord::new(t, s.ip, s.port, c.ip, c.port, flags)
}

fn full_close(c: Endpoint, t0: f64) -> Vec<PacketRecord> {
    vec![
        c2s(t0, c, TcpFlags::SYN),
        s2c(t0 + 0.01, c, TcpFlags::SYN_ACK),
        c2s(t0 + 0.02, c, TcpFlags::ACK),
        c2s(t0 + 5.0, c, TcpFlags::FIN_ACK),
        s2c(t0 + 5.01, c, TcpFlags::ACK),
        s2c(t0 + 5.02, c, TcpFlags::FIN_ACK),
        c2s(t0 + 5.03, c, TcpFlags::ACK),
    ]
}

#[test]
fn graceful_close_ends_at_final_ack() {
    let c = client(1, 40000);
    let (table, series) = analyze(&full_close(c, 0.0), server(), SENTINEL);

    assert_eq!(table.len(), 1);
    let rec = &table.records()[0];
    assert_eq!(rec.start_time, 0.0);
    assert_eq!(rec.end_time, Some(5.03));
    assert_eq!(rec.end_reason, Some(EndReason::NormalClose));
    assert_eq!(series.relative_start, vec![0.0]);
    assert_eq!(series.duration, vec![5.03]);
    assert_eq!(series.timed_out, vec![false]);
}

#[test]
fn server_reset_ends_connection() {
    let c = client(1, 40000);
    let packets = vec![c2s(0.0, c, TcpFlags::SYN), s2c(0.1, c, TcpFlags::RST)];
    let (table, series) = analyze(&packets, server(), SENTINEL);

    assert_eq!(table.records()[0].end_reason, Some(EndReason::Reset));
    assert_eq!(series.duration, vec![0.1]);
}

#[test]
fn lone_syn_times_out_with_sentinel() {
    let c = client(1, 40000);
    let (table, series) = analyze(&[c2s(0.0, c, TcpFlags::SYN)], server(), SENTINEL);

    assert_eq!(table.records()[0].end_time, None);
    assert_eq!(table.count_state(ConnectionState::Open), 1);
    assert_eq!(series.duration, vec![SENTINEL]);
    assert_eq!(series.timed_out, vec![true]);
}

#[test]
fn disjoint_flows_get_independent_relative_starts() {
    let a = client(1, 40000);
    let b = client(2, 40001);
    let mut packets = vec![
        c2s(1.0, a, TcpFlags::SYN),
        c2s(3.5, b, TcpFlags::SYN),
        s2c(3.6, b, TcpFlags::RST),
    ];
    packets.sort_by(|x, y| x.timestamp.total_cmp(&y.timestamp));
    let (table, series) = analyze(&packets, server(), SENTINEL);

    assert_eq!(table.len(), 2);
    assert_eq!(series.reference_time, Some(1.0));
    assert_eq!(series.relative_start, vec![0.0, 2.5]);
    assert_eq!(series.duration[0], SENTINEL);
    assert!((series.duration[1] - 0.1).abs() < 1e-9);
}

#[test]
fn reset_is_terminal() {
    let c = client(1, 40000);
    let packets = vec![
        c2s(0.0, c, TcpFlags::SYN),
        s2c(0.5, c, TcpFlags::RST),
        c2s(1.0, c, TcpFlags::FIN_ACK),
        s2c(1.1, c, TcpFlags::FIN_ACK),
        c2s(1.2, c, TcpFlags::ACK),
        s2c(1.3, c, TcpFlags::RST),
    ];
    let (table, _) = analyze(&packets, server(), SENTINEL);
    let rec = &table.records()[0];
    assert_eq!(rec.end_time, Some(0.5));
    assert_eq!(rec.end_reason, Some(EndReason::Reset));
}

#[test]
fn out_of_order_syns_keep_earliest_start() {
    let c = client(1, 40000);
    let packets = vec![
        c2s(2.0, c, TcpFlags::SYN),
        c2s(1.0, c, TcpFlags::SYN),
        c2s(3.0, c, TcpFlags::SYN),
    ];
    let (table, _) = analyze(&packets, server(), SENTINEL);
    assert_eq!(table.records()[0].start_time, 1.0);
}

#[test]
fn sharded_tracking_matches_single_pass() {
    let mut packets = Vec::new();
    for i in 0..64u16 {
        let c = client((i % 7) as u8 + 1, 30000 + i);
        let t0 = i as f64 * 0.25;
        match i % 3 {
            0 => packets.extend(full_close(c, t0)),
            1 => {
                packets.push(c2s(t0, c, TcpFlags::SYN));
                packets.push(s2c(t0 + 0.2, c, TcpFlags::RST));
            }
            _ => packets.push(c2s(t0, c, TcpFlags::SYN)),
        }
    }
    packets.sort_by(|x, y| x.timestamp.total_cmp(&y.timestamp));

    let running = AtomicBool::new(true);
    let resolver = FlowResolver::new(server());
    let single = pipeline::track(&packets, resolver, &PipelineConfig::default(), &running);
    let sharded = pipeline::track(
        &packets,
        resolver,
        &PipelineConfig {
            workers: 3,
            channel_capacity: 8,
        },
        &running,
    );

    assert_eq!(single.workers, 1);
    assert_eq!(sharded.workers, 3);
    assert_eq!(single.table, sharded.table);
    assert_eq!(single.stats, sharded.stats);

    let aggregator = DurationAggregator::new(SENTINEL);
    let summary = summarize(&aggregator.aggregate(&sharded.table));
    assert_eq!(summary.total, 64);
    assert_eq!(summary.normal, 22);
    assert_eq!(summary.reset, 21);
    assert_eq!(summary.timed_out, 21);
}

#[test]
fn field_text_with_bad_lines_still_decodes() {
    let text = "\
0.0\t10.0.0.1\t192.168.56.104\t40000\t8000\t1\t0\t0\t0
not a record
0.1\t192.168.56.104\t10.0.0.1\t8000\t40000\t0\t0\t0\t1
0.2\t10.0.0.1\t192.168.56.104\tnope\t8000\t0\t1\t0\t0
";
    let decoded = fields::read(Cursor::new(text), Path::new("inline")).unwrap();
    assert_eq!(decoded.records.len(), 2);
    assert_eq!(decoded.malformed, 2);

    let (table, series) = analyze(&decoded.records, server(), SENTINEL);
    assert_eq!(table.records()[0].end_reason, Some(EndReason::Reset));
    assert!((series.duration[0] - 0.1).abs() < 1e-9);
}

#[test]
fn checkpointed_table_reproduces_series() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(checkpoint::CONNECTIONS_FILE);

    let mut packets = full_close(client(1, 40000), 0.0);
    packets.push(c2s(2.0, client(2, 40001), TcpFlags::SYN));
    packets.sort_by(|x, y| x.timestamp.total_cmp(&y.timestamp));
    let (table, series) = analyze(&packets, server(), SENTINEL);

    let source = checkpoint::Provenance::new(Path::new("capture.pcap"), server());
    checkpoint::save_table(&path, &source, &table).unwrap();
    let loaded = checkpoint::try_load_table(&path, &source).unwrap().unwrap();
    let reloaded = DurationAggregator::new(SENTINEL).aggregate(&loaded);

    assert_eq!(loaded, table);
    assert_eq!(reloaded, series);
}

#[test]
fn empty_input_yields_empty_series() {
    let none: [PacketRecord; 0] = [];
    let (table, series) = analyze(&none, server(), SENTINEL);
    assert!(table.is_empty());
    assert!(series.is_empty());
    assert_eq!(series.reference_time, None);
    assert_eq!(summarize(&series).mean_duration, None);
}
