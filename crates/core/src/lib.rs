//! CidCheck Core
//!
//! Domain types for the cidcheck diagnostic probe: content keys, peer
//! targets, multiaddr classification, and the report structures returned
//! by a probe run.

pub mod addr;
pub mod report;

use cid::Cid;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;

pub use addr::{filter_public, is_public_multiaddr, AddrFilter};
pub use report::{BitswapCheckOutput, PeerCheckOutput, ProviderOutput};

/// Number of providers at which to stop enumerating the DHT when checking
/// a CID on its own.
pub const MAX_PROVIDERS_COUNT: usize = 10;

/// Errors that abort a check before any network observation happens.
///
/// Operational failures (unreachable peers, failed negotiations, DHT
/// trouble) never surface here; they are embedded in the report fields so
/// the caller still receives a complete diagnostic picture.
#[derive(Debug, Error)]
pub enum CheckError {
    /// The CID string did not parse.
    #[error("invalid cid: {0}")]
    InvalidCid(String),
    /// The multiaddr string did not parse or carried no peer identity.
    #[error("invalid multiaddr: {0}")]
    InvalidMultiaddr(String),
    /// Host or DHT construction failed.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),
}

/// Parse a CID from its canonical string form.
pub fn parse_cid(s: &str) -> Result<Cid, CheckError> {
    s.parse::<Cid>()
        .map_err(|e| CheckError::InvalidCid(format!("{}: {}", s, e)))
}

/// The peer a check is aimed at: an identity plus zero or more transport
/// addresses, parsed from a `/p2p/` multiaddr.
///
/// `/p2p/<id>` gives the identity-only form; a full address such as
/// `/ip4/1.2.3.4/tcp/4001/p2p/<id>` carries the transport the user wants
/// probed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTarget {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerTarget {
    /// Parse a multiaddr string into `(peer_id, addrs)`.
    ///
    /// The address must end in a `/p2p/<peer-id>` component. Everything
    /// before it (if anything) becomes the transport address set.
    pub fn parse(s: &str) -> Result<Self, CheckError> {
        let ma: Multiaddr = s
            .parse()
            .map_err(|e| CheckError::InvalidMultiaddr(format!("{}: {}", s, e)))?;
        Self::from_multiaddr(&ma)
            .ok_or_else(|| CheckError::InvalidMultiaddr(format!("{}: missing /p2p component", s)))
    }

    /// Split a multiaddr into its trailing peer identity and transport part.
    pub fn from_multiaddr(ma: &Multiaddr) -> Option<Self> {
        let mut transport = Multiaddr::empty();
        let mut peer_id = None;
        for proto in ma.iter() {
            match proto {
                Protocol::P2p(id) => peer_id = Some(id),
                other => {
                    // Components after the peer identity (relay suffixes)
                    // are not probe targets.
                    if peer_id.is_some() {
                        return None;
                    }
                    transport.push(other);
                }
            }
        }
        let peer_id = peer_id?;
        let addrs = if transport.is_empty() {
            Vec::new()
        } else {
            vec![transport]
        };
        Some(Self { peer_id, addrs })
    }

    /// Whether the user supplied only an identity, no transport address.
    pub fn only_peer_id(&self) -> bool {
        self.addrs.is_empty()
    }

    /// The `/p2p/<id>` form of this target, dropping any transport part.
    pub fn p2p_multiaddr(&self) -> Multiaddr {
        Multiaddr::empty().with(Protocol::P2p(self.peer_id))
    }

    /// The full multiaddr form: transport (if any) followed by `/p2p/<id>`.
    pub fn to_multiaddr(&self) -> Multiaddr {
        match self.addrs.first() {
            Some(a) => a.clone().with(Protocol::P2p(self.peer_id)),
            None => self.p2p_multiaddr(),
        }
    }
}
