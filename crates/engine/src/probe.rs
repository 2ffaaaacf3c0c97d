//! Block-availability probe
//!
//! Asks one peer, over bitswap, whether it holds one block. Bitswap
//! answers on a stream of its own choosing rather than the request
//! stream, so the probe subscribes to the host's inbound router for the
//! peer before the want goes out.
//!
//! The probe never fails: whatever happens is folded into the returned
//! `BitswapCheckOutput`, including the round-trip duration.

use std::time::{Duration, Instant};

use cid::Cid;
use cidcheck_core::{BitswapCheckOutput, PeerTarget};
use cidcheck_wire::{bitswap, framing, supports_presence, BITSWAP_PROTOCOLS};
use libp2p::Multiaddr;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::HostError;
use crate::host::ProbeHost;

/// How long to wait for the peer's answer once the want was sent. The
/// dial deadlines upstream bound connection setup; this bounds a peer
/// that accepts the stream and then goes quiet.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Probe `peer_maddr` for `cid` over bitswap. The multiaddr is nominal
/// when the host already holds a connection to the peer; only its
/// identity component steers the probe.
pub async fn check_block(
    cancel: &CancellationToken,
    host: &ProbeHost,
    cid: &Cid,
    peer_maddr: &Multiaddr,
) -> BitswapCheckOutput {
    debug!(%cid, %peer_maddr, "bitswap probe start");
    let start = Instant::now();
    let mut out = BitswapCheckOutput::default();
    if let Err(e) = probe(cancel, host, cid, peer_maddr, &mut out).await {
        out.error = e.to_string();
    }
    out.duration = start.elapsed();
    debug!(%cid, found = out.found, responded = out.responded, "bitswap probe end");
    out
}

async fn probe(
    cancel: &CancellationToken,
    host: &ProbeHost,
    cid: &Cid,
    peer_maddr: &Multiaddr,
    out: &mut BitswapCheckOutput,
) -> Result<(), HostError> {
    let target = PeerTarget::from_multiaddr(peer_maddr)
        .ok_or_else(|| HostError::Unreachable(format!("{}: no peer identity", peer_maddr)))?;

    // Subscribe before the want goes out; the reply can arrive on a fresh
    // inbound stream immediately.
    let mut inbox = host.bitswap_messages(target.peer_id);

    let (protocol, mut stream) = host.open_stream(target.peer_id, &BITSWAP_PROTOCOLS).await?;

    // Peers below 1.2.0 know nothing of HAVE/DONT_HAVE; ask those for the
    // block itself and only an actual block counts as found.
    let request = if supports_presence(&protocol) {
        bitswap::want_have_request(cid)
    } else {
        bitswap::want_block_request(cid)
    };
    framing::write_frame(&mut stream, &bitswap::encode(&request)).await?;

    let deadline = tokio::time::sleep(RESPONSE_TIMEOUT);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(HostError::Canceled),
            _ = &mut deadline => {
                return Err(HostError::Io(format!(
                    "timed out after {:?} waiting for a bitswap response",
                    RESPONSE_TIMEOUT
                )));
            }
            message = inbox.rx.recv() => {
                let Some(message) = message else {
                    return Err(HostError::Io("bitswap routing closed".into()));
                };
                out.responded = true;
                if let Some(have) = bitswap::presence_for(&message, cid) {
                    out.found = have;
                    return Ok(());
                }
                if bitswap::carries_block(&message, cid) {
                    out.found = true;
                    return Ok(());
                }
                // Unrelated traffic (e.g. the peer's own wantlist); keep
                // waiting for our answer.
            }
        }
    }
}
