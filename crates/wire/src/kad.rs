//! Kademlia RPC message codec
//!
//! Enough of the Amino DHT wire schema to send a FIND_NODE request to one
//! specific DHT server and read the closer-peers out of its reply. The
//! iterative lookups go through the kad behaviour; this direct form exists
//! so the probe can ask *each* closest peer individually what it knows
//! about a target and count the corroborating answers.

use libp2p::{Multiaddr, PeerId};

use prost::Message as _;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(bytes, tag = "2")]
    pub key: Vec<u8>,
    #[prost(message, repeated, tag = "8")]
    pub closer_peers: Vec<Peer>,
    #[prost(message, repeated, tag = "9")]
    pub provider_peers: Vec<Peer>,
    #[prost(int32, tag = "10")]
    pub cluster_level_raw: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Peer {
    #[prost(bytes, tag = "1")]
    pub id: Vec<u8>,
    #[prost(bytes, repeated, tag = "2")]
    pub addrs: Vec<Vec<u8>>,
    #[prost(enumeration = "ConnectionType", tag = "3")]
    pub connection: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    PutValue = 0,
    GetValue = 1,
    AddProvider = 2,
    GetProviders = 3,
    FindNode = 4,
    Ping = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum ConnectionType {
    NotConnected = 0,
    Connected = 1,
    CanConnect = 2,
    CannotConnect = 3,
}

/// Build a FIND_NODE request for the given peer key.
pub fn find_node_request(target: &PeerId) -> Message {
    Message {
        r#type: MessageType::FindNode as i32,
        key: target.to_bytes(),
        ..Default::default()
    }
}

/// Encode a message to its protobuf bytes.
pub fn encode(msg: &Message) -> Vec<u8> {
    msg.encode_to_vec()
}

/// Decode a message from protobuf bytes.
pub fn decode(bytes: &[u8]) -> Result<Message, prost::DecodeError> {
    Message::decode(bytes)
}

/// The closer-peers of a reply as `(peer, addrs)` pairs. Entries with an
/// unparseable id are dropped; unparseable addresses are dropped
/// per-entry.
pub fn closer_peers(msg: &Message) -> Vec<(PeerId, Vec<Multiaddr>)> {
    msg.closer_peers
        .iter()
        .filter_map(|p| {
            let id = PeerId::from_bytes(&p.id).ok()?;
            let addrs = p
                .addrs
                .iter()
                .filter_map(|a| Multiaddr::try_from(a.clone()).ok())
                .collect();
            Some((id, addrs))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_id() -> PeerId {
        "QmYyQSo1c1Ym7orWxLYvCrM2EmxFTANf8wXmmE7DWjhx5N"
            .parse()
            .unwrap()
    }

    #[test]
    fn test_find_node_request_shape() {
        let target = peer_id();
        let msg = find_node_request(&target);
        assert_eq!(msg.r#type, MessageType::FindNode as i32);
        assert_eq!(msg.key, target.to_bytes());
        assert!(msg.closer_peers.is_empty());
    }

    #[test]
    fn test_roundtrip() {
        let msg = find_node_request(&peer_id());
        let back = decode(&encode(&msg)).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_closer_peers_extraction() {
        let target = peer_id();
        let addr: Multiaddr = "/ip4/203.0.113.7/tcp/4001".parse().unwrap();
        let reply = Message {
            r#type: MessageType::FindNode as i32,
            closer_peers: vec![
                Peer {
                    id: target.to_bytes(),
                    addrs: vec![addr.to_vec(), b"not an addr".to_vec()],
                    connection: ConnectionType::Connected as i32,
                },
                // Malformed entry: skipped entirely.
                Peer {
                    id: b"bogus".to_vec(),
                    addrs: vec![],
                    connection: 0,
                },
            ],
            ..Default::default()
        };
        let peers = closer_peers(&reply);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].0, target);
        assert_eq!(peers[0].1, vec![addr]);
    }
}
