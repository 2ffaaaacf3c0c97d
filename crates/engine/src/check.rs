//! Check orchestrator
//!
//! The two top-level probe operations. `run_cid_check` fans out over the
//! CID's providers as the DHT surfaces them, one worker per provider;
//! `run_peer_check` probes one specific peer, on an ephemeral host when
//! the caller supplied the address to test.
//!
//! Only input parsing and host construction can fail these calls.
//! Everything a peer can do wrong is recorded in the report instead, and
//! one provider's failure never aborts the others.

use std::sync::Arc;
use std::time::Duration;

use cid::Cid;
use cidcheck_core::{
    filter_public, parse_cid, CheckError, PeerCheckOutput, PeerTarget, ProviderOutput,
    MAX_PROVIDERS_COUNT,
};
use cidcheck_wire::BITSWAP_PROTOCOLS;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::ProviderRecord;
use crate::dht::{peer_addrs_in_dht, provider_record_from_peer_in_dht};
use crate::host::ProbeHost;
use crate::probe::check_block;

/// Dial deadline for each provider worker in a CID check.
const PROVIDER_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Dial deadline for a peer check. Generous: hole punching through a
/// relay can take a while.
const PEER_DIAL_TIMEOUT: Duration = Duration::from_secs(120);

/// The diagnostic engine: one shared host, checks on demand.
#[derive(Clone)]
pub struct CheckEngine {
    host: ProbeHost,
}

impl CheckEngine {
    pub fn new(host: ProbeHost) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &ProbeHost {
        &self.host
    }

    /// Enumerate providers for a CID (capped) and probe each one:
    /// advertised public addresses, connectivity, and block availability.
    ///
    /// Result order follows DHT arrival and worker scheduling; a CID with
    /// zero providers yields an empty list, not an error.
    pub async fn run_cid_check(
        &self,
        cancel: &CancellationToken,
        cid_str: &str,
    ) -> Result<Vec<ProviderOutput>, CheckError> {
        let cid = parse_cid(cid_str)?;
        info!(%cid, "cid check start");

        let mut providers = self.host.providers(&cid, Some(MAX_PROVIDERS_COUNT));
        let out: Arc<Mutex<Vec<ProviderOutput>>> =
            Arc::new(Mutex::new(Vec::with_capacity(MAX_PROVIDERS_COUNT)));
        let mut workers = JoinSet::new();

        loop {
            let record = tokio::select! {
                _ = cancel.cancelled() => break,
                record = providers.recv() => record,
            };
            let Some(record) = record else { break };

            let host = self.host.clone();
            let cid = cid.clone();
            let cancel = cancel.clone();
            let out = out.clone();
            workers.spawn(async move {
                let report = check_provider(&cancel, &host, &cid, record).await;
                out.lock().await.push(report);
            });
        }
        // Receiver dropped here: a still-running provider query is torn
        // down on the producer side.
        drop(providers);

        while workers.join_next().await.is_some() {}

        let mut results = out.lock().await;
        info!(%cid, providers = results.len(), "cid check done");
        Ok(std::mem::take(&mut *results))
    }

    /// Probe one peer for one CID: DHT discoverability, provider-record
    /// presence, reachability, block availability.
    pub async fn run_peer_check(
        &self,
        cancel: &CancellationToken,
        maddr_str: &str,
        cid_str: &str,
    ) -> Result<PeerCheckOutput, CheckError> {
        let target = PeerTarget::parse(maddr_str)?;
        let cid = parse_cid(cid_str)?;
        info!(peer = %target.peer_id, %cid, "peer check start");

        let mut out = PeerCheckOutput::default();

        out.provider_record_from_peer_in_dht =
            provider_record_from_peer_in_dht(cancel, &self.host, &cid, target.peer_id).await;

        let addr_result = peer_addrs_in_dht(cancel, &self.host, target.peer_id).await;

        let mut dial_addrs = target.addrs.clone();

        // Ephemeral host for user-supplied addresses: the shared host may
        // already hold a connection from DHT traversal, which would turn
        // "is this address reachable" into a trivial yes.
        let ephemeral;
        let host = if target.only_peer_id() {
            match addr_result {
                Err(e) => {
                    // Not resolvable through the DHT; nothing to dial.
                    out.connection_error = e.to_string();
                    return Ok(out);
                }
                Ok(addr_map) => {
                    for addr in addr_map.keys() {
                        match addr.parse() {
                            Ok(ma) => dial_addrs.push(ma),
                            Err(e) => warn!("unparseable addr {} from DHT: {}", addr, e),
                        }
                    }
                    out.peer_found_in_dht = addr_map;
                }
            }
            &self.host
        } else {
            if let Ok(addr_map) = addr_result {
                out.peer_found_in_dht = addr_map;
            }
            ephemeral = self.host.ephemeral()?;
            &ephemeral
        };

        // The dial result itself is advisory; the stream open below is
        // the reachability verdict and doubles as the hole-punch nudge.
        if let Err(e) = host
            .connect(target.peer_id, dial_addrs, PEER_DIAL_TIMEOUT)
            .await
        {
            debug!(peer = %target.peer_id, "connect failed: {}", e);
        }
        if let Err(e) = host.open_stream(target.peer_id, &BITSWAP_PROTOCOLS).await {
            out.connection_error = e.to_string();
            return Ok(out);
        }

        out.data_available_over_bitswap =
            check_block(cancel, host, &cid, &target.to_multiaddr()).await;

        out.connection_maddrs = host
            .connections_to(target.peer_id)
            .await
            .iter()
            .map(ToString::to_string)
            .collect();

        info!(peer = %target.peer_id, %cid, "peer check done");
        Ok(out)
    }
}

/// Worker body for one provider in a CID check.
async fn check_provider(
    cancel: &CancellationToken,
    host: &ProbeHost,
    cid: &Cid,
    provider: ProviderRecord,
) -> ProviderOutput {
    let mut out = ProviderOutput {
        id: provider.peer_id.to_string(),
        addrs: filter_public(&provider.addrs)
            .iter()
            .map(ToString::to_string)
            .collect(),
        ..Default::default()
    };

    if let Err(e) = host
        .connect(
            provider.peer_id,
            provider.addrs.clone(),
            PROVIDER_DIAL_TIMEOUT,
        )
        .await
    {
        out.connection_error = e.to_string();
        return out;
    }

    // Opening a bitswap stream right after connect is what upgrades a
    // relayed connection to a direct one where NAT traversal allows.
    if let Err(e) = host.open_stream(provider.peer_id, &BITSWAP_PROTOCOLS).await {
        out.connection_error = e.to_string();
        return out;
    }

    // The host is connected now, so the multiaddr is nominal.
    let target = PeerTarget {
        peer_id: provider.peer_id,
        addrs: Vec::new(),
    };
    out.data_available_over_bitswap =
        check_block(cancel, host, cid, &target.p2p_multiaddr()).await;

    out.connection_maddrs = host
        .connections_to(provider.peer_id)
        .await
        .iter()
        .map(ToString::to_string)
        .collect();

    out
}
