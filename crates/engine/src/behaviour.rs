//! Probe swarm composition
//!
//! One behaviour stack for both host flavors: the shared host carries a
//! Kademlia client for DHT queries, ephemeral hosts toggle it off and keep
//! only what a single directed dial needs. The address gate vetoes
//! outbound connections to private, loopback, and link-local endpoints so
//! a probe can never report reachability via the operator's own LAN.

use std::convert::Infallible;
use std::task::{Context, Poll};
use std::time::Duration;

use cidcheck_core::{AddrFilter, CheckError};
use cidcheck_wire::KAD_PROTOCOL;
use libp2p::core::transport::PortUse;
use libp2p::core::Endpoint;
use libp2p::kad::store::MemoryStore;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::{
    dummy, ConnectionDenied, ConnectionId, FromSwarm, NetworkBehaviour, THandlerInEvent,
    THandlerOutEvent, ToSwarm,
};
use libp2p::{dcutr, identify, kad, noise, ping, relay, tcp, yamux, Multiaddr, PeerId, Swarm,
    SwarmBuilder};
use thiserror::Error;
use tracing::info;

/// Agent string advertised over identify.
pub const USER_AGENT: &str = concat!("cidcheck/", env!("CARGO_PKG_VERSION"));

/// Default bootstrap set of the Amino DHT.
pub const DEFAULT_BOOTSTRAP: [&str; 5] = [
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

pub type ProbeSwarm = Swarm<ProbeBehaviour>;

/// How a probe host is built.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Outbound dial policy.
    pub filter: AddrFilter,
    /// Whether to run a Kademlia client. Ephemeral hosts do not.
    pub enable_dht: bool,
    /// Widen DHT query parallelism and bootstrap aggressively, trading
    /// startup work for faster lookups.
    pub accelerated_dht: bool,
    /// Addresses to listen on. The probe usually dials only.
    pub listen_addrs: Vec<Multiaddr>,
    /// Bootstrap peers as `/p2p/`-suffixed multiaddrs.
    pub bootstrap_peers: Vec<Multiaddr>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            filter: AddrFilter::PublicOnly,
            enable_dht: true,
            accelerated_dht: false,
            listen_addrs: Vec::new(),
            bootstrap_peers: DEFAULT_BOOTSTRAP
                .iter()
                .map(|s| s.parse().expect("static bootstrap addr parses"))
                .collect(),
        }
    }
}

impl HostConfig {
    /// The configuration for an ephemeral host derived from this one:
    /// same gate policy, no DHT.
    pub fn ephemeral(&self) -> Self {
        Self {
            filter: self.filter,
            enable_dht: false,
            accelerated_dht: false,
            listen_addrs: Vec::new(),
            bootstrap_peers: Vec::new(),
        }
    }
}

/// Combined behaviour for probe hosts.
#[derive(NetworkBehaviour)]
pub struct ProbeBehaviour {
    pub gate: AddrGate,
    pub kademlia: Toggle<kad::Behaviour<MemoryStore>>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub relay_client: relay::client::Behaviour,
    pub dcutr: dcutr::Behaviour,
    pub stream: libp2p_stream::Behaviour,
}

/// Build a probe swarm per the config. The swarm still has to be driven
/// by a host task; listening and bootstrap kick off there.
pub fn build_swarm(config: &HostConfig) -> Result<(ProbeSwarm, PeerId), CheckError> {
    let bootstrap = resolve_bootstrap(&config.bootstrap_peers);
    let enable_dht = config.enable_dht;
    let accelerated = config.accelerated_dht;
    let filter = config.filter;

    let swarm = SwarmBuilder::with_new_identity()
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| CheckError::Bootstrap(e.to_string()))?
        .with_quic()
        .with_dns()
        .map_err(|e| CheckError::Bootstrap(e.to_string()))?
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| CheckError::Bootstrap(e.to_string()))?
        .with_behaviour(|key, relay_client| {
            let local_peer_id = PeerId::from(key.public());

            let kademlia = enable_dht.then(|| {
                let mut cfg = kad::Config::new(KAD_PROTOCOL);
                cfg.set_query_timeout(Duration::from_secs(60));
                if accelerated {
                    if let Some(p) = std::num::NonZeroUsize::new(16) {
                        cfg.set_parallelism(p);
                    }
                    cfg.set_periodic_bootstrap_interval(Some(Duration::from_secs(300)));
                }
                let store = MemoryStore::new(local_peer_id);
                let mut kad = kad::Behaviour::with_config(local_peer_id, store, cfg);
                kad.set_mode(Some(kad::Mode::Client));
                for (peer, addr) in &bootstrap {
                    kad.add_address(peer, addr.clone());
                }
                kad
            });

            ProbeBehaviour {
                gate: AddrGate::new(filter),
                kademlia: Toggle::from(kademlia),
                identify: identify::Behaviour::new(
                    identify::Config::new("/ipfs/id/1.0.0".into(), key.public())
                        .with_agent_version(USER_AGENT.into()),
                ),
                ping: ping::Behaviour::default(),
                relay_client,
                dcutr: dcutr::Behaviour::new(local_peer_id),
                stream: libp2p_stream::Behaviour::new(),
            }
        })
        .map_err(|e| CheckError::Bootstrap(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    let local_peer_id = *swarm.local_peer_id();
    info!(%local_peer_id, dht = enable_dht, "probe host built");
    Ok((swarm, local_peer_id))
}

/// Split `/p2p/`-suffixed bootstrap addrs into (peer, transport) pairs,
/// dropping malformed entries.
fn resolve_bootstrap(addrs: &[Multiaddr]) -> Vec<(PeerId, Multiaddr)> {
    addrs
        .iter()
        .filter_map(|ma| {
            let target = cidcheck_core::PeerTarget::from_multiaddr(ma)?;
            let addr = target.addrs.first().cloned().unwrap_or_else(|| ma.clone());
            Some((target.peer_id, addr))
        })
        .collect()
}

#[derive(Debug, Error)]
#[error("address {0} is not publicly dialable")]
struct AddressNotDialable(Multiaddr);

/// Connection gate: refuses outbound connections whose remote address the
/// dial policy forbids. Applies equally to addresses supplied by callers
/// and to addresses other behaviours injected into a dial.
pub struct AddrGate {
    filter: AddrFilter,
}

impl AddrGate {
    pub fn new(filter: AddrFilter) -> Self {
        Self { filter }
    }
}

impl NetworkBehaviour for AddrGate {
    type ConnectionHandler = dummy::ConnectionHandler;
    type ToSwarm = Infallible;

    fn handle_established_inbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        _peer: PeerId,
        _local_addr: &Multiaddr,
        _remote_addr: &Multiaddr,
    ) -> Result<Self::ConnectionHandler, ConnectionDenied> {
        Ok(dummy::ConnectionHandler)
    }

    fn handle_established_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        _peer: PeerId,
        addr: &Multiaddr,
        _role_override: Endpoint,
        _port_use: PortUse,
    ) -> Result<Self::ConnectionHandler, ConnectionDenied> {
        if self.filter.allows(addr) {
            Ok(dummy::ConnectionHandler)
        } else {
            Err(ConnectionDenied::new(AddressNotDialable(addr.clone())))
        }
    }

    fn on_swarm_event(&mut self, _event: FromSwarm) {}

    fn on_connection_handler_event(
        &mut self,
        _peer: PeerId,
        _connection: ConnectionId,
        event: THandlerOutEvent<Self>,
    ) {
        match event {}
    }

    fn poll(&mut self, _cx: &mut Context<'_>) -> Poll<ToSwarm<Self::ToSwarm, THandlerInEvent<Self>>> {
        Poll::Pending
    }
}
