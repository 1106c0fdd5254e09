//! Flow identity relative to a monitored server endpoint.
//!
//! Unlike a generic 5-tuple table, every key here is oriented client → server:
//! whichever side sent the packet, the non-server endpoint is the client.

use crate::record::PacketRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Endpoint { ip, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Which way a packet travelled relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => write!(f, "client_to_server"),
            Direction::ServerToClient => write!(f, "server_to_client"),
        }
    }
}

/// Canonical client → server 4-tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey {
    pub client: Endpoint,
    pub server: Endpoint,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.client, self.server)
    }
}

/// Maps packets to `(FlowKey, Direction)` for one configured server endpoint.
#[derive(Debug, Clone, Copy)]
pub struct FlowResolver {
    server: Endpoint,
}

impl FlowResolver {
    pub fn new(server: Endpoint) -> Self {
        FlowResolver { server }
    }

    pub fn server(&self) -> Endpoint {
        self.server
    }

    /// Resolve a packet, or `None` when it neither targets nor originates
    /// from the server endpoint.
    #[inline]
    pub fn resolve(&self, packet: &PacketRecord) -> Option<(FlowKey, Direction)> {
        let src = Endpoint::new(packet.src_addr, packet.src_port);
        let dst = Endpoint::new(packet.dst_addr, packet.dst_port);

        if dst == self.server {
            Some((
                FlowKey {
                    client: src,
                    server: dst,
                },
                Direction::ClientToServer,
            ))
        } else if src == self.server {
            Some((
                FlowKey {
                    client: dst,
                    server: src,
                },
                Direction::ServerToClient,
            ))
        } else {
            None
        }
    }
}
