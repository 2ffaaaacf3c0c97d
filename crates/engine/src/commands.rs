//! Host command system
//!
//! Commands sent from the probe facade to the swarm task. Each carries a
//! oneshot (or, for streaming results, an mpsc sender) for the reply.

use libp2p::kad::RecordKey;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::{mpsc, oneshot};

/// A provider discovered for a CID, with whatever addresses the host has
/// learned for it so far. The address set may be empty; dialing by peer
/// id lets the DHT supply more.
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

/// Commands handled by the swarm task.
#[derive(Debug)]
pub enum HostCommand {
    /// Dial a peer on the given addresses (plus anything the host already
    /// knows), honoring the address gate. Replies once a connection is
    /// established or the dial fails outright.
    Connect {
        peer_id: PeerId,
        addrs: Vec<Multiaddr>,
        reply_tx: oneshot::Sender<Result<(), String>>,
    },
    /// Remote multiaddrs of all currently established connections to a
    /// peer.
    ConnectionsTo {
        peer_id: PeerId,
        reply_tx: oneshot::Sender<Vec<Multiaddr>>,
    },
    /// Addresses the host has learned for a peer (identify, DHT).
    KnownAddrs {
        peer_id: PeerId,
        reply_tx: oneshot::Sender<Vec<Multiaddr>>,
    },
    /// Iterative DHT lookup for the closest peers to a key.
    ClosestPeers {
        key: Vec<u8>,
        reply_tx: oneshot::Sender<Result<Vec<PeerId>, String>>,
    },
    /// Stream providers for a key, stopping after `cap` records when set.
    /// Dropping the receiver tears the query down.
    Providers {
        key: RecordKey,
        cap: Option<usize>,
        tx: mpsc::Sender<ProviderRecord>,
    },
    /// Start listening on an address; replies with the bound address.
    Listen {
        addr: Multiaddr,
        reply_tx: oneshot::Sender<Result<Multiaddr, String>>,
    },
    /// Resolves once the initial DHT bootstrap has finished (immediately
    /// if it already has, or if the host runs no DHT).
    AwaitReady { reply_tx: oneshot::Sender<()> },
}
