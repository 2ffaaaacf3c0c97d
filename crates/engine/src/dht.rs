//! DHT query layer
//!
//! Two questions, both answered by live observation rather than local
//! state: which addresses does the DHT hold for a peer, and does a peer
//! appear among the providers of a CID.
//!
//! The address lookup deliberately does not trust the iterative lookup's
//! own answer. It finds the K closest DHT servers to the peer key and
//! asks *each of them* directly; every server whose reply contains the
//! target contributes one observation per address. The per-address count
//! is a corroboration signal: independent servers agreeing on an address
//! means the record really is spread through the DHT.

use std::collections::HashMap;
use std::time::Duration;

use cid::Cid;
use cidcheck_wire::{framing, kad as kadwire, KAD_PROTOCOL};
use libp2p::{Multiaddr, PeerId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::HostError;
use crate::exec::exec_on_many;
use crate::host::ProbeHost;

/// Fraction of per-server queries that must succeed before the fan-out
/// may wind down.
const ADDR_QUERY_WAIT_FRAC: f64 = 0.3;

/// Deadline for one FIND_NODE round trip against one DHT server.
const ADDR_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Ask the DHT where a peer lives: address string → number of DHT servers
/// that returned it.
///
/// Errors with `DhtUnavailable` when the closest-peers lookup fails or
/// when zero per-server queries succeed; an empty map with `Ok` cannot
/// happen (at least one success implies at least one reply, though the
/// replies may still contain no addresses for the target).
pub async fn peer_addrs_in_dht(
    cancel: &CancellationToken,
    host: &ProbeHost,
    target: PeerId,
) -> Result<HashMap<String, u32>, HostError> {
    let closest = host.closest_peers(target.to_bytes()).await?;
    debug!(%target, servers = closest.len(), "querying closest DHT servers for peer addrs");

    // Buffer sized for one reply per server so publishers never block.
    let (tx, mut rx) = mpsc::channel::<Option<Vec<Multiaddr>>>(closest.len().max(1));

    let op = {
        let host = host.clone();
        move |_token: CancellationToken, server: PeerId| {
            let host = host.clone();
            let tx = tx.clone();
            async move {
                let peers = request_closest_peers(&host, server, target).await?;
                for (peer_id, addrs) in peers {
                    if peer_id == target {
                        let _ = tx.try_send(Some(addrs));
                        return Ok(());
                    }
                }
                let _ = tx.try_send(None);
                Ok(())
            }
        }
    };

    let successes = exec_on_many(
        cancel,
        ADDR_QUERY_WAIT_FRAC,
        ADDR_QUERY_TIMEOUT,
        op,
        closest,
        false,
    )
    .await;

    if successes == 0 {
        return Err(HostError::DhtUnavailable);
    }

    let mut addr_map: HashMap<String, u32> = HashMap::new();
    while let Ok(reply) = rx.try_recv() {
        let Some(addrs) = reply else { continue };
        for addr in addrs {
            *addr_map.entry(addr.to_string()).or_default() += 1;
        }
    }
    Ok(addr_map)
}

/// One FIND_NODE round trip: ask `server` for *its* closest peers to
/// `target` over a fresh DHT stream.
async fn request_closest_peers(
    host: &ProbeHost,
    server: PeerId,
    target: PeerId,
) -> Result<Vec<(PeerId, Vec<Multiaddr>)>, HostError> {
    // The server came out of our own routing table moments ago, so the
    // host usually has addresses for it.
    host.connect(server, Vec::new(), ADDR_QUERY_TIMEOUT).await?;
    let (_protocol, mut stream) = host.open_stream(server, &[KAD_PROTOCOL]).await?;

    let request = kadwire::find_node_request(&target);
    framing::write_frame(&mut stream, &kadwire::encode(&request)).await?;
    let reply = framing::read_frame(&mut stream).await?;
    let message = kadwire::decode(&reply)?;
    Ok(kadwire::closer_peers(&message))
}

/// Stream providers of `cid` without a cap and report whether `target`
/// shows up among them. False on stream end or cancellation.
pub async fn provider_record_from_peer_in_dht(
    cancel: &CancellationToken,
    host: &ProbeHost,
    cid: &Cid,
    target: PeerId,
) -> bool {
    let mut providers = host.providers(cid, None);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            record = providers.recv() => match record {
                Some(record) if record.peer_id == target => return true,
                Some(_) => continue,
                None => return false,
            }
        }
    }
}
