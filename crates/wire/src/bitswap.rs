//! Bitswap message codec
//!
//! Message structs mirror the boxo bitswap protobuf schema. The probe
//! only ever sends a single-entry wantlist and inspects the reply for a
//! block presence (1.2.0) or the block itself (older protocols).

use cid::Cid;
use prost::Message as _;

/// Want priority used for probe requests. Matches the default priority
/// bitswap clients assign to fresh wants.
const PROBE_PRIORITY: i32 = 2147483632;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(message, optional, tag = "1")]
    pub wantlist: Option<Wantlist>,
    /// Raw block data, bitswap 1.0.0 style.
    #[prost(bytes, repeated, tag = "2")]
    pub blocks: Vec<Vec<u8>>,
    /// Prefixed blocks, bitswap >= 1.1.0.
    #[prost(message, repeated, tag = "3")]
    pub payload: Vec<Block>,
    #[prost(message, repeated, tag = "4")]
    pub block_presences: Vec<BlockPresence>,
    #[prost(int32, tag = "5")]
    pub pending_bytes: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Wantlist {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<Entry>,
    #[prost(bool, tag = "2")]
    pub full: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Entry {
    /// CID bytes of the wanted block.
    #[prost(bytes, tag = "1")]
    pub block: Vec<u8>,
    #[prost(int32, tag = "2")]
    pub priority: i32,
    #[prost(bool, tag = "3")]
    pub cancel: bool,
    #[prost(enumeration = "WantType", tag = "4")]
    pub want_type: i32,
    #[prost(bool, tag = "5")]
    pub send_dont_have: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Block {
    /// CID prefix: version, codec, multihash code and length.
    #[prost(bytes, tag = "1")]
    pub prefix: Vec<u8>,
    #[prost(bytes, tag = "2")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BlockPresence {
    #[prost(bytes, tag = "1")]
    pub cid: Vec<u8>,
    #[prost(enumeration = "BlockPresenceType", tag = "2")]
    pub r#type: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum WantType {
    Block = 0,
    Have = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum BlockPresenceType {
    Have = 0,
    DontHave = 1,
}

/// Build a WANT_HAVE request for one CID, asking the peer to answer with
/// HAVE or DONT_HAVE instead of the block itself.
pub fn want_have_request(cid: &Cid) -> Message {
    want_request(cid, WantType::Have)
}

/// Build a WANT_BLOCK request for one CID, for peers speaking a bitswap
/// version without presence support.
pub fn want_block_request(cid: &Cid) -> Message {
    want_request(cid, WantType::Block)
}

fn want_request(cid: &Cid, want_type: WantType) -> Message {
    Message {
        wantlist: Some(Wantlist {
            entries: vec![Entry {
                block: cid.to_bytes(),
                priority: PROBE_PRIORITY,
                cancel: false,
                want_type: want_type as i32,
                send_dont_have: true,
            }],
            full: false,
        }),
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

/// Block presence for the given CID in a reply, if any: `Some(true)` for
/// HAVE, `Some(false)` for DONT_HAVE.
pub fn presence_for(msg: &Message, cid: &Cid) -> Option<bool> {
    for bp in &msg.block_presences {
        let matches = Cid::try_from(bp.cid.as_slice())
            .map(|c| c == *cid)
            .unwrap_or(false);
        if matches {
            return Some(bp.r#type == BlockPresenceType::Have as i32);
        }
    }
    None
}

/// Whether the reply carries the block itself. Prefixed payload entries
/// are matched against the CID's prefix; bare 1.0.0 blocks cannot be
/// attributed to a CID without hashing, so any bare block counts.
pub fn carries_block(msg: &Message, cid: &Cid) -> bool {
    let prefix = cid_prefix_bytes(cid);
    msg.payload.iter().any(|b| b.prefix == prefix) || !msg.blocks.is_empty()
}

/// The CID's prefix bytes: varint version, codec, multihash code, digest
/// length. This is what prefixed bitswap payload blocks carry.
pub fn cid_prefix_bytes(cid: &Cid) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    let mut buf = unsigned_varint::encode::u64_buffer();
    out.extend_from_slice(unsigned_varint::encode::u64(cid.version() as u64, &mut buf));
    out.extend_from_slice(unsigned_varint::encode::u64(cid.codec(), &mut buf));
    out.extend_from_slice(unsigned_varint::encode::u64(cid.hash().code(), &mut buf));
    out.extend_from_slice(unsigned_varint::encode::u64(cid.hash().size() as u64, &mut buf));
    out
}
