//! Shard selection by flow key.
//!
//! Keys are already canonical (client → server), so both directions of a
//! connection hash identically without any min/max ordering step.

use std::hash::{Hash, Hasher};

use crate::flow::FlowKey;

/// `shard = hash(key) % num_shards`.
#[inline]
pub fn shard_for_key(key: &FlowKey, num_shards: usize) -> usize {
    if num_shards <= 1 {
        return 0;
    }
    // Fixed-key hasher: every thread must agree on the shard of a key.
    let mut hasher = ahash::AHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % num_shards
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Direction, Endpoint, FlowResolver};
    use crate::record::{PacketRecord, TcpFlags};
    use std::net::{IpAddr, Ipv4Addr};

    fn server() -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 80)
    }

    #[test]
    fn both_directions_same_shard() {
        let resolver = FlowResolver::new(server());
        let client = Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 12345);
        let s = server();
        let out = PacketRecord::new(0.0, client.ip, client.port, s.ip, s.port, TcpFlags::SYN);
        let back = PacketRecord::new(0.1, s.ip, s.port, client.ip, client.port, TcpFlags::SYN_ACK);

        let (key_out, dir_out) = resolver.resolve(&out).unwrap();
        let (key_back, dir_back) = resolver.resolve(&back).unwrap();
        assert_eq!(dir_out, Direction::ClientToServer);
        assert_eq!(dir_back, Direction::ServerToClient);
        assert_eq!(shard_for_key(&key_out, 4), shard_for_key(&key_back, 4));
    }

    #[test]
    fn shard_is_stable_and_in_range() {
        for port in 1024..1280u16 {
            let key = FlowKey {
                client: Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 1, 7)), port),
                server: server(),
            };
            let shard = shard_for_key(&key, 7);
            assert!(shard < 7);
            assert_eq!(shard, shard_for_key(&key, 7));
        }
    }

    #[test]
    fn single_shard_short_circuits() {
        let key = FlowKey {
            client: Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 1),
            server: server(),
        };
        assert_eq!(shard_for_key(&key, 0), 0);
        assert_eq!(shard_for_key(&key, 1), 0);
    }
}
