//! Fixed-shape TCP packet record and the text-field parser that validates it.
//!
//! Field order matches `tshark -T fields` output once
//! [`crate::capture::tshark`] has folded its `ip.*`/`ipv6.*` address columns
//! into one pair:
//!
//! ```text
//! frame.time_epoch  src  dst  tcp.srcport  tcp.dstport  syn  ack  fin  reset
//! ```
//!
//! Everything downstream of [`parse_fields`] works on typed values only.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Number of tab-separated fields in one record line.
pub const FIELD_COUNT: usize = 9;

/// TCP control bits the lifecycle tracker cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

impl TcpFlags {
    pub const SYN: TcpFlags = TcpFlags {
        syn: true,
        ack: false,
        fin: false,
        rst: false,
    };
    pub const SYN_ACK: TcpFlags = TcpFlags {
        syn: true,
        ack: true,
        fin: false,
        rst: false,
    };
    pub const ACK: TcpFlags = TcpFlags {
        syn: false,
        ack: true,
        fin: false,
        rst: false,
    };
    pub const FIN: TcpFlags = TcpFlags {
        syn: false,
        ack: false,
        fin: true,
        rst: false,
    };
    pub const FIN_ACK: TcpFlags = TcpFlags {
        syn: false,
        ack: true,
        fin: true,
        rst: false,
    };
    pub const RST: TcpFlags = TcpFlags {
        syn: false,
        ack: false,
        fin: false,
        rst: true,
    };

    /// Build from the raw TCP flags byte (FIN=0x01, SYN=0x02, RST=0x04, ACK=0x10).
    pub fn from_bits(bits: u8) -> Self {
        TcpFlags {
            syn: bits & 0x02 != 0,
            ack: bits & 0x10 != 0,
            fin: bits & 0x01 != 0,
            rst: bits & 0x04 != 0,
        }
    }

    /// True when the segment opens a connection (SYN without ACK).
    #[inline]
    pub fn is_initial_syn(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn is_empty(&self) -> bool {
        !(self.syn || self.ack || self.fin || self.rst)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(4);
        if self.syn {
            parts.push("SYN");
        }
        if self.ack {
            parts.push("ACK");
        }
        if self.fin {
            parts.push("FIN");
        }
        if self.rst {
            parts.push("RST");
        }
        if parts.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", parts.join(","))
        }
    }
}

/// One observed TCP segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PacketRecord {
    /// Capture timestamp in seconds.
    pub timestamp: f64,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: TcpFlags,
}

impl PacketRecord {
    pub fn new(
        timestamp: f64,
        src_addr: IpAddr,
        src_port: u16,
        dst_addr: IpAddr,
        dst_port: u16,
        flags: TcpFlags,
    ) -> Self {
        PacketRecord {
            timestamp,
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            flags,
        }
    }
}

impl fmt::Display for PacketRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.6} {}:{} -> {}:{} [{}]",
            self.timestamp, self.src_addr, self.src_port, self.dst_addr, self.dst_port, self.flags
        )
    }
}

/// Why a record line was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordError {
    /// Fewer fields than [`FIELD_COUNT`].
    MissingFields { expected: usize, actual: usize },
    /// Timestamp absent, unparseable or not finite.
    BadTimestamp(String),
    BadAddress(String),
    BadPort(String),
    /// Both address fields empty: the packet carried no IP header tshark
    /// could name, so it is not a record at all.
    NoAddress,
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::MissingFields { expected, actual } => {
                write!(f, "expected {} fields, got {}", expected, actual)
            }
            RecordError::BadTimestamp(raw) => write!(f, "invalid timestamp '{}'", raw),
            RecordError::BadAddress(raw) => write!(f, "invalid address '{}'", raw),
            RecordError::BadPort(raw) => write!(f, "invalid port '{}'", raw),
            RecordError::NoAddress => write!(f, "no source or destination address"),
        }
    }
}

impl std::error::Error for RecordError {}

/// Parse one tab-separated record line.
///
/// Extra trailing fields are ignored. A trailing carriage return is tolerated
/// so CRLF exports decode the same as LF ones.
pub fn parse_fields(line: &str) -> Result<PacketRecord, RecordError> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < FIELD_COUNT {
        return Err(RecordError::MissingFields {
            expected: FIELD_COUNT,
            actual: fields.len(),
        });
    }

    if fields[1].trim().is_empty() && fields[2].trim().is_empty() {
        return Err(RecordError::NoAddress);
    }

    let timestamp = parse_timestamp(fields[0])?;
    let src_addr = parse_addr(fields[1])?;
    let dst_addr = parse_addr(fields[2])?;
    let src_port = parse_port(fields[3])?;
    let dst_port = parse_port(fields[4])?;

    let flags = TcpFlags {
        syn: parse_flag(fields[5]),
        ack: parse_flag(fields[6]),
        fin: parse_flag(fields[7]),
        rst: parse_flag(fields[8]),
    };

    Ok(PacketRecord {
        timestamp,
        src_addr,
        dst_addr,
        src_port,
        dst_port,
        flags,
    })
}

fn parse_timestamp(raw: &str) -> Result<f64, RecordError> {
    match raw.trim().parse::<f64>() {
        Ok(ts) if ts.is_finite() => Ok(ts),
        _ => Err(RecordError::BadTimestamp(raw.to_string())),
    }
}

fn parse_addr(raw: &str) -> Result<IpAddr, RecordError> {
    raw.trim()
        .parse()
        .map_err(|_| RecordError::BadAddress(raw.to_string()))
}

fn parse_port(raw: &str) -> Result<u16, RecordError> {
    raw.trim()
        .parse()
        .map_err(|_| RecordError::BadPort(raw.to_string()))
}

// tshark prints "1"/"0" for flag fields, newer releases "True"/"False".
fn parse_flag(raw: &str) -> bool {
    let raw = raw.trim();
    raw == "1" || raw.eq_ignore_ascii_case("true")
}
