//! CidCheck Wire
//!
//! Codecs for the two overlay protocols the probe speaks on the wire
//! itself rather than through a behaviour: the bitswap message (to ask a
//! peer whether it holds a block) and the Kademlia RPC message (to ask a
//! DHT server for its closest peers to a key). Both are varint-delimited
//! protobuf; the message structs are written by hand against the
//! published schemas, no protoc at build time.

pub mod bitswap;
pub mod framing;
pub mod kad;

use libp2p::StreamProtocol;

/// Bitswap protocol ids, newest first. The first id the remote accepts
/// wins the negotiation.
pub const BITSWAP_PROTOCOLS: [StreamProtocol; 4] = [
    StreamProtocol::new("/ipfs/bitswap/1.2.0"),
    StreamProtocol::new("/ipfs/bitswap/1.1.0"),
    StreamProtocol::new("/ipfs/bitswap/1.0.0"),
    StreamProtocol::new("/ipfs/bitswap"),
];

/// The Amino DHT RPC protocol.
pub const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/ipfs/kad/1.0.0");

/// Whether a negotiated bitswap protocol supports HAVE / DONT_HAVE block
/// presences (introduced in 1.2.0). Older peers only answer with blocks.
pub fn supports_presence(protocol: &StreamProtocol) -> bool {
    protocol.as_ref() == "/ipfs/bitswap/1.2.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_support() {
        assert!(supports_presence(&BITSWAP_PROTOCOLS[0]));
        assert!(!supports_presence(&BITSWAP_PROTOCOLS[1]));
        assert!(!supports_presence(&BITSWAP_PROTOCOLS[3]));
    }
}
