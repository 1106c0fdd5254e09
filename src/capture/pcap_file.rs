//! Native capture-file reader built on libpcap.
//!
//! Only the handful of header fields the tracker needs are read, at fixed
//! offsets, the way the shard router hashes frames without a full parse.
//! IPv6 extension headers are not walked: a TCP segment behind one is
//! treated as non-TCP and dropped, as are non-initial IPv4 fragments.

use pcap::{Capture, Linktype};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use super::{DecodeError, DecodeOutput};
use crate::record::{PacketRecord, TcpFlags};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const IPPROTO_TCP: u8 = 6;
/// Bytes of TCP header needed to reach the flags byte.
const TCP_FLAGS_END: usize = 14;

/// Link-layer framing the reader understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    /// Linux cooked capture (`any` interface), 16-byte header.
    LinuxSll,
    /// BSD loopback: 4-byte address family header.
    Null,
    /// Bare IP, version from the first nibble.
    Raw,
}

impl LinkLayer {
    pub fn from_linktype(linktype: Linktype) -> Option<Self> {
        match linktype {
            Linktype::ETHERNET => Some(LinkLayer::Ethernet),
            Linktype::LINUX_SLL => Some(LinkLayer::LinuxSll),
            Linktype::NULL | Linktype::LOOP => Some(LinkLayer::Null),
            Linktype::RAW | Linktype::IPV4 | Linktype::IPV6 => Some(LinkLayer::Raw),
            // DLT_RAW is 12 on some BSDs.
            Linktype(12) => Some(LinkLayer::Raw),
            _ => None,
        }
    }
}

/// What one captured frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Tcp(PacketRecord),
    /// Not IP/TCP; silently skipped, like `tshark -Y tcp`.
    NotTcp,
    /// IP or TCP header cut short before the fields we need.
    Truncated { need: usize, have: usize },
    /// Header fields that cannot describe a valid packet.
    Malformed(&'static str),
}

pub fn read_file(path: &Path) -> Result<DecodeOutput, DecodeError> {
    let mut cap = Capture::from_file(path)?;
    let linktype = cap.get_datalink();
    let link = LinkLayer::from_linktype(linktype)
        .ok_or(DecodeError::UnsupportedLinkType(linktype.0))?;

    tracing::debug!(link = ?link, "opened capture file");

    let mut out = DecodeOutput::default();
    let mut index: u64 = 0;
    loop {
        let packet = match cap.next_packet() {
            Ok(packet) => packet,
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => return Err(DecodeError::Pcap(e)),
        };
        index += 1;

        let ts = packet.header.ts.tv_sec as f64 + packet.header.ts.tv_usec as f64 / 1_000_000.0;
        match decode_frame(link, ts, packet.data) {
            Frame::Tcp(record) => out.push(record),
            Frame::NotTcp => {}
            Frame::Truncated { need, have } => out.skip(
                index,
                &format!("truncated frame: need {} bytes, got {}", need, have),
            ),
            Frame::Malformed(reason) => out.skip(index, &reason),
        }
    }
    Ok(out)
}

/// Extract a record from one raw frame.
pub fn decode_frame(link: LinkLayer, ts: f64, data: &[u8]) -> Frame {
    match link {
        LinkLayer::Ethernet => {
            if data.len() < 14 {
                return Frame::NotTcp;
            }
            let mut ether_type = u16::from_be_bytes([data[12], data[13]]);
            let mut offset = 14;
            if ether_type == ETHERTYPE_VLAN {
                if data.len() < 18 {
                    return Frame::NotTcp;
                }
                ether_type = u16::from_be_bytes([data[16], data[17]]);
                offset = 18;
            }
            match ether_type {
                ETHERTYPE_IPV4 => decode_ipv4(data, offset, ts),
                ETHERTYPE_IPV6 => decode_ipv6(data, offset, ts),
                _ => Frame::NotTcp,
            }
        }
        LinkLayer::LinuxSll => {
            if data.len() < 16 {
                return Frame::NotTcp;
            }
            match u16::from_be_bytes([data[14], data[15]]) {
                ETHERTYPE_IPV4 => decode_ipv4(data, 16, ts),
                ETHERTYPE_IPV6 => decode_ipv6(data, 16, ts),
                _ => Frame::NotTcp,
            }
        }
        LinkLayer::Null => decode_ip(data, 4, ts),
        LinkLayer::Raw => decode_ip(data, 0, ts),
    }
}

fn decode_ip(data: &[u8], offset: usize, ts: f64) -> Frame {
    match data.get(offset).map(|b| b >> 4) {
        Some(4) => decode_ipv4(data, offset, ts),
        Some(6) => decode_ipv6(data, offset, ts),
        _ => Frame::NotTcp,
    }
}

fn truncated(data: &[u8], need: usize) -> Option<Frame> {
    (data.len() < need).then(|| Frame::Truncated {
        need,
        have: data.len(),
    })
}

fn decode_ipv4(data: &[u8], offset: usize, ts: f64) -> Frame {
    if let Some(frame) = truncated(data, offset + 20) {
        return frame;
    }
    if data[offset + 9] != IPPROTO_TCP {
        return Frame::NotTcp;
    }
    let frag_offset = u16::from_be_bytes([data[offset + 6], data[offset + 7]]) & 0x1FFF;
    if frag_offset != 0 {
        return Frame::NotTcp;
    }

    let ihl = (data[offset] & 0x0F) as usize * 4;
    if ihl < 20 {
        return Frame::Malformed("IPv4 header length below 20 bytes");
    }
    if let Some(frame) = truncated(data, offset + ihl) {
        return frame;
    }
    let src = Ipv4Addr::new(
        data[offset + 12],
        data[offset + 13],
        data[offset + 14],
        data[offset + 15],
    );
    let dst = Ipv4Addr::new(
        data[offset + 16],
        data[offset + 17],
        data[offset + 18],
        data[offset + 19],
    );
    decode_tcp(data, offset + ihl, ts, IpAddr::V4(src), IpAddr::V4(dst))
}

fn decode_ipv6(data: &[u8], offset: usize, ts: f64) -> Frame {
    if let Some(frame) = truncated(data, offset + 40) {
        return frame;
    }
    if data[offset + 6] != IPPROTO_TCP {
        return Frame::NotTcp;
    }

    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&data[offset + 8..offset + 24]);
    dst.copy_from_slice(&data[offset + 24..offset + 40]);
    decode_tcp(
        data,
        offset + 40,
        ts,
        IpAddr::V6(Ipv6Addr::from(src)),
        IpAddr::V6(Ipv6Addr::from(dst)),
    )
}

fn decode_tcp(data: &[u8], offset: usize, ts: f64, src: IpAddr, dst: IpAddr) -> Frame {
    if let Some(frame) = truncated(data, offset + TCP_FLAGS_END) {
        return frame;
    }
    let src_port = u16::from_be_bytes([data[offset], data[offset + 1]]);
    let dst_port = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
    let flags = TcpFlags::from_bits(data[offset + 13]);
    Frame::Tcp(PacketRecord::new(ts, src, src_port, dst, dst_port, flags))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_tcp(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, flags: u8) -> Vec<u8> {
        let mut ip = vec![0u8; 40];
        ip[0] = 0x45;
        ip[9] = IPPROTO_TCP;
        ip[12..16].copy_from_slice(&src);
        ip[16..20].copy_from_slice(&dst);
        ip[20..22].copy_from_slice(&sport.to_be_bytes());
        ip[22..24].copy_from_slice(&dport.to_be_bytes());
        ip[32] = 0x50;
        ip[33] = flags;
        ip
    }

    fn ethernet(ether_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; 14];
        frame[12..14].copy_from_slice(&ether_type.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn ethernet_ipv4_syn() {
        let frame = ethernet(
            ETHERTYPE_IPV4,
            &ipv4_tcp([10, 0, 0, 1], [10, 0, 0, 2], 40000, 8000, 0x02),
        );
        match decode_frame(LinkLayer::Ethernet, 1.5, &frame) {
            Frame::Tcp(rec) => {
                assert_eq!(rec.timestamp, 1.5);
                assert_eq!(rec.src_addr, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
                assert_eq!(rec.src_port, 40000);
                assert_eq!(rec.dst_port, 8000);
                assert_eq!(rec.flags, TcpFlags::SYN);
            }
            other => panic!("expected TCP frame, got {:?}", other),
        }
    }

    #[test]
    fn vlan_tagged_frame() {
        let mut payload = vec![0x00, 0x64, 0x08, 0x00];
        payload.extend(ipv4_tcp([10, 0, 0, 2], [10, 0, 0, 1], 8000, 40000, 0x14));
        let frame = ethernet(ETHERTYPE_VLAN, &payload);
        match decode_frame(LinkLayer::Ethernet, 0.0, &frame) {
            Frame::Tcp(rec) => assert_eq!(rec.flags, TcpFlags::from_bits(0x14)),
            other => panic!("expected TCP frame, got {:?}", other),
        }
    }

    #[test]
    fn loopback_and_raw_frames() {
        let ip = ipv4_tcp([127, 0, 0, 1], [127, 0, 0, 1], 5000, 8000, 0x11);
        let mut null_frame = vec![2, 0, 0, 0];
        null_frame.extend_from_slice(&ip);
        assert!(matches!(
            decode_frame(LinkLayer::Null, 0.0, &null_frame),
            Frame::Tcp(_)
        ));
        assert!(matches!(decode_frame(LinkLayer::Raw, 0.0, &ip), Frame::Tcp(_)));
    }

    #[test]
    fn ipv6_tcp() {
        let mut ip = vec![0u8; 60];
        ip[0] = 0x60;
        ip[6] = IPPROTO_TCP;
        ip[23] = 1;
        ip[39] = 2;
        ip[40..42].copy_from_slice(&50000u16.to_be_bytes());
        ip[42..44].copy_from_slice(&443u16.to_be_bytes());
        ip[53] = 0x04;
        match decode_frame(LinkLayer::Raw, 0.0, &ip) {
            Frame::Tcp(rec) => {
                assert_eq!(rec.src_addr, IpAddr::V6(Ipv6Addr::LOCALHOST));
                assert_eq!(rec.dst_port, 443);
                assert_eq!(rec.flags, TcpFlags::RST);
            }
            other => panic!("expected TCP frame, got {:?}", other),
        }
    }

    #[test]
    fn non_tcp_and_truncated() {
        let mut udp = ipv4_tcp([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, 0);
        udp[9] = 17;
        assert_eq!(
            decode_frame(LinkLayer::Ethernet, 0.0, &ethernet(ETHERTYPE_IPV4, &udp)),
            Frame::NotTcp
        );
        assert_eq!(
            decode_frame(LinkLayer::Ethernet, 0.0, &ethernet(0x0806, &[0u8; 28])),
            Frame::NotTcp
        );

        let tcp = ipv4_tcp([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, 0x02);
        let frame = ethernet(ETHERTYPE_IPV4, &tcp[..28]);
        assert_eq!(
            decode_frame(LinkLayer::Ethernet, 0.0, &frame),
            Frame::Truncated { need: 48, have: 42 }
        );
    }

    #[test]
    fn later_fragments_are_skipped() {
        let mut ip = ipv4_tcp([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, 0x02);
        ip[7] = 0x10;
        assert_eq!(decode_frame(LinkLayer::Raw, 0.0, &ip), Frame::NotTcp);
    }

    #[test]
    fn short_ipv4_header_length_is_malformed() {
        let mut ip = ipv4_tcp([10, 0, 0, 1], [10, 0, 0, 2], 40000, 8000, 0x02);
        ip[0] = 0x40;
        assert!(matches!(
            decode_frame(LinkLayer::Raw, 0.0, &ip),
            Frame::Malformed(_)
        ));
        ip[0] = 0x44;
        assert!(matches!(
            decode_frame(LinkLayer::Raw, 0.0, &ip),
            Frame::Malformed(_)
        ));
    }

    #[test]
    fn cut_ip_headers_are_truncated_not_dropped() {
        let ip = ipv4_tcp([10, 0, 0, 1], [10, 0, 0, 2], 40000, 8000, 0x02);
        assert_eq!(
            decode_frame(LinkLayer::Raw, 0.0, &ip[..12]),
            Frame::Truncated { need: 20, have: 12 }
        );

        // IHL claims options that are not in the frame.
        let mut with_options = ip[..24].to_vec();
        with_options[0] = 0x4F;
        assert_eq!(
            decode_frame(LinkLayer::Raw, 0.0, &with_options),
            Frame::Truncated { need: 60, have: 24 }
        );

        let mut v6 = vec![0u8; 30];
        v6[0] = 0x60;
        assert_eq!(
            decode_frame(LinkLayer::Raw, 0.0, &v6),
            Frame::Truncated { need: 40, have: 30 }
        );
    }

    #[test]
    fn link_types_map() {
        assert_eq!(
            LinkLayer::from_linktype(Linktype::ETHERNET),
            Some(LinkLayer::Ethernet)
        );
        assert_eq!(LinkLayer::from_linktype(Linktype(12)), Some(LinkLayer::Raw));
        assert_eq!(LinkLayer::from_linktype(Linktype(9999)), None);
    }
}
