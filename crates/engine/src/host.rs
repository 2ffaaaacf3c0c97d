//! Probe host facade
//!
//! `ProbeHost` is the engine's handle on a libp2p swarm: a command
//! channel into the task that drives the swarm, plus a stream control for
//! protocols the engine speaks directly. One shared host serves all
//! checks; ephemeral hosts (same gate policy, no DHT) exist so a probe of
//! a user-supplied address cannot be short-circuited by a connection the
//! shared host already happens to hold.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use cid::Cid;
use cidcheck_core::{AddrFilter, CheckError};
use cidcheck_wire::{bitswap, framing, BITSWAP_PROTOCOLS};
use futures::StreamExt;
use libp2p::identify;
use libp2p::kad::{self, RecordKey};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{DialError, SwarmEvent};
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::behaviour::{build_swarm, HostConfig, ProbeBehaviourEvent, ProbeSwarm};
use crate::commands::{HostCommand, ProviderRecord};
use crate::errors::HostError;

type BitswapSubs = Arc<StdMutex<HashMap<PeerId, mpsc::Sender<bitswap::Message>>>>;

/// Handle to a running probe host. Cloning shares the underlying swarm;
/// the swarm task exits (and the swarm with it) when the last clone is
/// dropped.
#[derive(Clone)]
pub struct ProbeHost {
    local_peer_id: PeerId,
    cmd_tx: mpsc::UnboundedSender<HostCommand>,
    control: libp2p_stream::Control,
    bitswap_subs: BitswapSubs,
    config: Arc<HostConfig>,
}

impl ProbeHost {
    /// Build a host and spawn its swarm task.
    pub fn new(config: HostConfig) -> Result<Self, CheckError> {
        let (swarm, local_peer_id) = build_swarm(&config)?;
        let control = swarm.behaviour().stream.new_control();
        let bitswap_subs = start_bitswap_router(&control);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(host_task(swarm, cmd_rx));

        Ok(Self {
            local_peer_id,
            cmd_tx,
            control,
            bitswap_subs,
            config: Arc::new(config),
        })
    }

    /// Build an isolated host with the same gate policy and no DHT.
    pub fn ephemeral(&self) -> Result<ProbeHost, CheckError> {
        ProbeHost::new(self.config.ephemeral())
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn filter(&self) -> AddrFilter {
        self.config.filter
    }

    /// Start listening; resolves with the bound address.
    pub async fn listen(&self, addr: Multiaddr) -> Result<Multiaddr, CheckError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HostCommand::Listen { addr, reply_tx })
            .map_err(|_| CheckError::Bootstrap("host task gone".into()))?;
        reply_rx
            .await
            .map_err(|_| CheckError::Bootstrap("host task gone".into()))?
            .map_err(CheckError::Bootstrap)
    }

    /// Wait until the initial DHT bootstrap finished. Resolves at once on
    /// hosts without a DHT.
    pub async fn await_ready(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HostCommand::AwaitReady { reply_tx })
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    /// Dial a peer on the given addresses plus anything the host already
    /// knows for it, under a deadline. The address gate applies.
    pub async fn connect(
        &self,
        peer_id: PeerId,
        addrs: Vec<Multiaddr>,
        deadline: Duration,
    ) -> Result<(), HostError> {
        let dialable: Vec<Multiaddr> = addrs
            .iter()
            .filter(|a| self.config.filter.allows(a))
            .cloned()
            .collect();
        if !addrs.is_empty() && dialable.is_empty() {
            return Err(HostError::Unreachable(format!(
                "no dialable addresses for {} (all gated as non-public)",
                peer_id
            )));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HostCommand::Connect {
                peer_id,
                addrs: dialable,
                reply_tx,
            })
            .map_err(|_| HostError::Unreachable("host task gone".into()))?;

        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(HostError::Unreachable(e)),
            Ok(Err(_)) => Err(HostError::Unreachable("host task gone".into())),
            Err(_) => Err(HostError::Unreachable(format!(
                "dial timed out after {:?}",
                deadline
            ))),
        }
    }

    /// Open a stream negotiating the first acceptable protocol from a
    /// priority list. On a relayed connection this is also what nudges
    /// the hole-punch upgrade along.
    pub async fn open_stream(
        &self,
        peer_id: PeerId,
        protocols: &[StreamProtocol],
    ) -> Result<(StreamProtocol, libp2p::Stream), HostError> {
        let mut last_err = String::from("no protocols offered");
        for protocol in protocols {
            let mut control = self.control.clone();
            match control.open_stream(peer_id, protocol.clone()).await {
                Ok(stream) => return Ok((protocol.clone(), stream)),
                Err(libp2p_stream::OpenStreamError::UnsupportedProtocol(p)) => {
                    last_err = format!("protocol {} not supported", p);
                }
                Err(e) => {
                    last_err = e.to_string();
                }
            }
        }
        Err(HostError::Negotiation(last_err))
    }

    /// Remote multiaddrs of current connections to a peer. After a hole
    /// punch this typically yields a relay path and a direct path.
    pub async fn connections_to(&self, peer_id: PeerId) -> Vec<Multiaddr> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HostCommand::ConnectionsTo { peer_id, reply_tx })
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Addresses the host has learned for a peer from identify and DHT
    /// traffic.
    pub async fn known_addrs(&self, peer_id: PeerId) -> Vec<Multiaddr> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HostCommand::KnownAddrs { peer_id, reply_tx })
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Iterative DHT lookup for the K closest peers to a key.
    pub async fn closest_peers(&self, key: Vec<u8>) -> Result<Vec<PeerId>, HostError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HostCommand::ClosestPeers { key, reply_tx })
            .map_err(|_| HostError::DhtUnavailable)?;
        match reply_rx.await {
            Ok(Ok(peers)) => Ok(peers),
            Ok(Err(e)) => {
                debug!("closest-peers lookup failed: {}", e);
                Err(HostError::DhtUnavailable)
            }
            Err(_) => Err(HostError::DhtUnavailable),
        }
    }

    /// Stream providers for a CID, up to `cap` records when set. Dropping
    /// the receiver cancels the underlying query.
    pub fn providers(&self, cid: &Cid, cap: Option<usize>) -> mpsc::Receiver<ProviderRecord> {
        let (tx, rx) = mpsc::channel(64);
        // The DHT keys providers by multihash, not by full CID.
        let key = RecordKey::new(&cid.hash().to_bytes());
        let _ = self.cmd_tx.send(HostCommand::Providers { key, cap, tx });
        rx
    }

    /// Subscribe to bitswap messages arriving from a peer. Bitswap
    /// answers on a fresh stream of its own rather than the one the
    /// request went out on, so replies are routed here by sender.
    pub fn bitswap_messages(&self, peer_id: PeerId) -> BitswapInbox {
        let (tx, rx) = mpsc::channel(8);
        self.bitswap_subs
            .lock()
            .expect("bitswap subscription lock poisoned")
            .insert(peer_id, tx.clone());
        BitswapInbox {
            peer_id,
            tx,
            rx,
            subs: self.bitswap_subs.clone(),
        }
    }
}

/// Live subscription to one peer's inbound bitswap messages. Dropping it
/// removes the routing entry.
pub struct BitswapInbox {
    peer_id: PeerId,
    tx: mpsc::Sender<bitswap::Message>,
    pub rx: mpsc::Receiver<bitswap::Message>,
    subs: BitswapSubs,
}

impl Drop for BitswapInbox {
    fn drop(&mut self) {
        let mut subs = match self.subs.lock() {
            Ok(s) => s,
            Err(_) => return,
        };
        // Only remove our own entry; a newer probe of the same peer may
        // have replaced it.
        if subs
            .get(&self.peer_id)
            .is_some_and(|tx| tx.same_channel(&self.tx))
        {
            subs.remove(&self.peer_id);
        }
    }
}

/// Accept inbound bitswap streams on every protocol version and route
/// decoded messages to the probe waiting on that peer.
fn start_bitswap_router(control: &libp2p_stream::Control) -> BitswapSubs {
    let subs: BitswapSubs = Arc::new(StdMutex::new(HashMap::new()));
    for protocol in BITSWAP_PROTOCOLS {
        let mut control = control.clone();
        match control.accept(protocol.clone()) {
            Ok(incoming) => {
                tokio::spawn(route_incoming(incoming, subs.clone()));
            }
            Err(e) => warn!(%protocol, "could not accept bitswap streams: {}", e),
        }
    }
    subs
}

async fn route_incoming(mut incoming: libp2p_stream::IncomingStreams, subs: BitswapSubs) {
    while let Some((peer, mut stream)) = incoming.next().await {
        let subs = subs.clone();
        tokio::spawn(async move {
            loop {
                let frame = match framing::read_frame(&mut stream).await {
                    Ok(f) => f,
                    Err(_) => break,
                };
                let msg = match bitswap::decode(&frame) {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(%peer, "undecodable bitswap message: {}", e);
                        break;
                    }
                };
                let tx = subs
                    .lock()
                    .ok()
                    .and_then(|s| s.get(&peer).cloned());
                match tx {
                    Some(tx) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => trace!(%peer, "unsolicited bitswap message"),
                }
            }
        });
    }
}

/// Per-query bookkeeping for a streaming provider lookup.
struct ProviderQuery {
    tx: mpsc::Sender<ProviderRecord>,
    remaining: Option<usize>,
    seen: HashSet<PeerId>,
}

/// Drive the swarm: execute facade commands, reply to them from swarm
/// events, and keep the connection table and address book current. Exits
/// when the last facade handle is dropped.
async fn host_task(mut swarm: ProbeSwarm, mut cmd_rx: mpsc::UnboundedReceiver<HostCommand>) {
    let mut pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), String>>>> =
        HashMap::new();
    let mut pending_closest: HashMap<kad::QueryId, oneshot::Sender<Result<Vec<PeerId>, String>>> =
        HashMap::new();
    let mut provider_queries: HashMap<kad::QueryId, ProviderQuery> = HashMap::new();
    let mut pending_listens: HashMap<
        libp2p::core::transport::ListenerId,
        oneshot::Sender<Result<Multiaddr, String>>,
    > = HashMap::new();
    let mut connections: HashMap<PeerId, HashMap<libp2p::swarm::ConnectionId, Multiaddr>> =
        HashMap::new();
    let mut addr_book: HashMap<PeerId, HashSet<Multiaddr>> = HashMap::new();
    let mut ready_waiters: Vec<oneshot::Sender<()>> = Vec::new();
    let mut ready = false;

    // Kick off the initial bootstrap; a host without bootstrap peers (or
    // without a DHT at all) is ready immediately.
    match swarm.behaviour_mut().kademlia.as_mut() {
        Some(kad) => {
            if let Err(e) = kad.bootstrap() {
                warn!("dht bootstrap not started: {}", e);
                ready = true;
            }
        }
        None => ready = true,
    }

    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                let Some(command) = command else { break };
                handle_command(
                    &mut swarm,
                    command,
                    &mut pending_dials,
                    &mut pending_closest,
                    &mut provider_queries,
                    &mut pending_listens,
                    &connections,
                    &addr_book,
                    &mut ready_waiters,
                    ready,
                );
            }
            event = swarm.select_next_some() => {
                handle_swarm_event(
                    &mut swarm,
                    event,
                    &mut pending_dials,
                    &mut pending_closest,
                    &mut provider_queries,
                    &mut pending_listens,
                    &mut connections,
                    &mut addr_book,
                    &mut ready_waiters,
                    &mut ready,
                );
            }
        }
    }
    debug!("host task exiting");
}

#[allow(clippy::too_many_arguments)]
fn handle_command(
    swarm: &mut ProbeSwarm,
    command: HostCommand,
    pending_dials: &mut HashMap<PeerId, Vec<oneshot::Sender<Result<(), String>>>>,
    pending_closest: &mut HashMap<kad::QueryId, oneshot::Sender<Result<Vec<PeerId>, String>>>,
    provider_queries: &mut HashMap<kad::QueryId, ProviderQuery>,
    pending_listens: &mut HashMap<
        libp2p::core::transport::ListenerId,
        oneshot::Sender<Result<Multiaddr, String>>,
    >,
    connections: &HashMap<PeerId, HashMap<libp2p::swarm::ConnectionId, Multiaddr>>,
    addr_book: &HashMap<PeerId, HashSet<Multiaddr>>,
    ready_waiters: &mut Vec<oneshot::Sender<()>>,
    ready: bool,
) {
    match command {
        HostCommand::Connect {
            peer_id,
            addrs,
            reply_tx,
        } => {
            if swarm.is_connected(&peer_id) {
                let _ = reply_tx.send(Ok(()));
                return;
            }
            let opts = DialOpts::peer_id(peer_id)
                .addresses(addrs)
                .extend_addresses_through_behaviour()
                .build();
            match swarm.dial(opts) {
                Ok(()) => pending_dials.entry(peer_id).or_default().push(reply_tx),
                // A dial to this peer is already in flight; wait on it.
                Err(DialError::DialPeerConditionFalse(_)) => {
                    pending_dials.entry(peer_id).or_default().push(reply_tx)
                }
                Err(e) => {
                    let _ = reply_tx.send(Err(e.to_string()));
                }
            }
        }
        HostCommand::ConnectionsTo { peer_id, reply_tx } => {
            let maddrs = connections
                .get(&peer_id)
                .map(|conns| conns.values().cloned().collect())
                .unwrap_or_default();
            let _ = reply_tx.send(maddrs);
        }
        HostCommand::KnownAddrs { peer_id, reply_tx } => {
            let addrs = addr_book
                .get(&peer_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            let _ = reply_tx.send(addrs);
        }
        HostCommand::ClosestPeers { key, reply_tx } => {
            match swarm.behaviour_mut().kademlia.as_mut() {
                Some(kad) => {
                    let query_id = kad.get_closest_peers(key);
                    pending_closest.insert(query_id, reply_tx);
                }
                None => {
                    let _ = reply_tx.send(Err("host has no DHT".into()));
                }
            }
        }
        HostCommand::Providers { key, cap, tx } => {
            match swarm.behaviour_mut().kademlia.as_mut() {
                Some(kad) => {
                    let query_id = kad.get_providers(key);
                    provider_queries.insert(
                        query_id,
                        ProviderQuery {
                            tx,
                            remaining: cap,
                            seen: HashSet::new(),
                        },
                    );
                }
                // No DHT: dropping the sender closes the stream as empty.
                None => drop(tx),
            }
        }
        HostCommand::Listen { addr, reply_tx } => match swarm.listen_on(addr) {
            Ok(listener_id) => {
                pending_listens.insert(listener_id, reply_tx);
            }
            Err(e) => {
                let _ = reply_tx.send(Err(e.to_string()));
            }
        },
        HostCommand::AwaitReady { reply_tx } => {
            if ready {
                let _ = reply_tx.send(());
            } else {
                ready_waiters.push(reply_tx);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_swarm_event(
    swarm: &mut ProbeSwarm,
    event: SwarmEvent<ProbeBehaviourEvent>,
    pending_dials: &mut HashMap<PeerId, Vec<oneshot::Sender<Result<(), String>>>>,
    pending_closest: &mut HashMap<kad::QueryId, oneshot::Sender<Result<Vec<PeerId>, String>>>,
    provider_queries: &mut HashMap<kad::QueryId, ProviderQuery>,
    pending_listens: &mut HashMap<
        libp2p::core::transport::ListenerId,
        oneshot::Sender<Result<Multiaddr, String>>,
    >,
    connections: &mut HashMap<PeerId, HashMap<libp2p::swarm::ConnectionId, Multiaddr>>,
    addr_book: &mut HashMap<PeerId, HashSet<Multiaddr>>,
    ready_waiters: &mut Vec<oneshot::Sender<()>>,
    ready: &mut bool,
) {
    match event {
        SwarmEvent::NewListenAddr {
            listener_id,
            address,
        } => {
            info!(%address, "listening");
            if let Some(reply_tx) = pending_listens.remove(&listener_id) {
                let _ = reply_tx.send(Ok(address));
            }
        }
        SwarmEvent::ConnectionEstablished {
            peer_id,
            connection_id,
            endpoint,
            ..
        } => {
            let remote = endpoint.get_remote_address().clone();
            trace!(%peer_id, %remote, "connection established");
            connections
                .entry(peer_id)
                .or_default()
                .insert(connection_id, remote);
            if let Some(waiters) = pending_dials.remove(&peer_id) {
                for reply_tx in waiters {
                    let _ = reply_tx.send(Ok(()));
                }
            }
        }
        SwarmEvent::ConnectionClosed {
            peer_id,
            connection_id,
            ..
        } => {
            if let Some(conns) = connections.get_mut(&peer_id) {
                conns.remove(&connection_id);
                if conns.is_empty() {
                    connections.remove(&peer_id);
                }
            }
        }
        SwarmEvent::OutgoingConnectionError {
            peer_id: Some(peer_id),
            error,
            ..
        } => {
            if let Some(waiters) = pending_dials.remove(&peer_id) {
                let msg = error.to_string();
                for reply_tx in waiters {
                    let _ = reply_tx.send(Err(msg.clone()));
                }
            }
        }
        SwarmEvent::Behaviour(ProbeBehaviourEvent::Identify(identify::Event::Received {
            peer_id,
            info,
            ..
        })) => {
            let book = addr_book.entry(peer_id).or_default();
            for addr in &info.listen_addrs {
                book.insert(addr.clone());
            }
            // Feed identify results into the routing table so PeerId-only
            // dials have addresses to work with.
            if let Some(kad) = swarm.behaviour_mut().kademlia.as_mut() {
                for addr in info.listen_addrs {
                    kad.add_address(&peer_id, addr);
                }
            }
        }
        SwarmEvent::Behaviour(ProbeBehaviourEvent::Kademlia(kad_event)) => handle_kad_event(
            swarm,
            kad_event,
            pending_closest,
            provider_queries,
            addr_book,
            ready_waiters,
            ready,
        ),
        _ => {}
    }
}

fn handle_kad_event(
    swarm: &mut ProbeSwarm,
    event: kad::Event,
    pending_closest: &mut HashMap<kad::QueryId, oneshot::Sender<Result<Vec<PeerId>, String>>>,
    provider_queries: &mut HashMap<kad::QueryId, ProviderQuery>,
    addr_book: &mut HashMap<PeerId, HashSet<Multiaddr>>,
    ready_waiters: &mut Vec<oneshot::Sender<()>>,
    ready: &mut bool,
) {
    match event {
        kad::Event::RoutingUpdated {
            peer, addresses, ..
        } => {
            let book = addr_book.entry(peer).or_default();
            for addr in addresses.iter() {
                book.insert(addr.clone());
            }
        }
        kad::Event::OutboundQueryProgressed {
            id, result, step, ..
        } => match result {
            kad::QueryResult::GetClosestPeers(res) => {
                let peers = match res {
                    Ok(kad::GetClosestPeersOk { peers, .. }) => Ok(peers),
                    // A timed-out lookup may still have produced usable
                    // peers; only a completely empty one is an error.
                    Err(kad::GetClosestPeersError::Timeout { peers, .. }) if !peers.is_empty() => {
                        Ok(peers)
                    }
                    Err(e) => Err(e.to_string()),
                };
                if let Some(reply_tx) = pending_closest.remove(&id) {
                    let _ = reply_tx.send(peers.map(|infos| {
                        infos
                            .into_iter()
                            .map(|info| {
                                let book = addr_book.entry(info.peer_id).or_default();
                                for addr in &info.addrs {
                                    book.insert(addr.clone());
                                }
                                info.peer_id
                            })
                            .collect()
                    }));
                }
            }
            kad::QueryResult::GetProviders(res) => {
                // Forward before consulting step.last: providers can ride
                // along on the final progress event.
                let stopped = match res {
                    Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                        forward_providers(swarm, id, providers, provider_queries, addr_book)
                    }
                    Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => true,
                    Err(_) => true,
                };
                if stopped || step.last {
                    // Dropping the sender closes the caller's stream.
                    provider_queries.remove(&id);
                }
            }
            kad::QueryResult::Bootstrap(res) => {
                let done = match res {
                    Ok(kad::BootstrapOk { num_remaining, .. }) => num_remaining == 0 || step.last,
                    Err(e) => {
                        warn!("dht bootstrap failed: {}", e);
                        true
                    }
                };
                if done && !*ready {
                    info!("dht routing table ready");
                    *ready = true;
                    for reply_tx in ready_waiters.drain(..) {
                        let _ = reply_tx.send(());
                    }
                }
            }
            _ => {}
        },
        _ => {}
    }
}

/// Push newly discovered providers into the caller's stream. Returns true
/// when the query should stop: cap reached or the caller went away.
fn forward_providers(
    swarm: &mut ProbeSwarm,
    id: kad::QueryId,
    providers: HashSet<PeerId>,
    provider_queries: &mut HashMap<kad::QueryId, ProviderQuery>,
    addr_book: &HashMap<PeerId, HashSet<Multiaddr>>,
) -> bool {
    let Some(query) = provider_queries.get_mut(&id) else {
        return true;
    };
    let mut stop = false;
    for peer_id in providers {
        if !query.seen.insert(peer_id) {
            continue;
        }
        let record = ProviderRecord {
            peer_id,
            addrs: addr_book
                .get(&peer_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default(),
        };
        if query.tx.try_send(record).is_err() {
            stop = true;
            break;
        }
        if let Some(remaining) = query.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                stop = true;
                break;
            }
        }
    }
    if stop {
        if let Some(mut q) = swarm.behaviour_mut().kademlia.as_mut().and_then(|k| k.query_mut(&id))
        {
            q.finish();
        }
    }
    stop
}
