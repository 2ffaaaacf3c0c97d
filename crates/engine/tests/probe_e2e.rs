//! End-to-end probe tests
//!
//! Spawns real probe hosts in-process, wired over loopback with the
//! permissive address gate, and exercises the connect / stream / bitswap
//! probe path without touching the public network.

use std::time::Duration;

use cid::Cid;
use cidcheck_core::{AddrFilter, PeerTarget};
use cidcheck_engine::{check_block, CheckEngine, HostConfig, ProbeHost};
use cidcheck_wire::{bitswap, framing, BITSWAP_PROTOCOLS};
use libp2p::{Multiaddr, PeerId};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const TEST_CID: &str = "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi";

fn test_host() -> ProbeHost {
    ProbeHost::new(HostConfig {
        filter: AddrFilter::AllowAll,
        enable_dht: false,
        accelerated_dht: false,
        listen_addrs: Vec::new(),
        bootstrap_peers: Vec::new(),
    })
    .expect("host builds")
}

/// Serve bitswap on `host`: answer every wantlist entry from `from` with
/// a HAVE/DONT_HAVE presence depending on `have`.
fn spawn_presence_responder(host: ProbeHost, from: PeerId, have: bool) {
    tokio::spawn(async move {
        let mut inbox = host.bitswap_messages(from);
        while let Some(message) = inbox.rx.recv().await {
            let Some(wantlist) = message.wantlist else {
                continue;
            };
            let presences: Vec<bitswap::BlockPresence> = wantlist
                .entries
                .iter()
                .map(|entry| bitswap::BlockPresence {
                    cid: entry.block.clone(),
                    r#type: if have {
                        bitswap::BlockPresenceType::Have as i32
                    } else {
                        bitswap::BlockPresenceType::DontHave as i32
                    },
                })
                .collect();
            let reply = bitswap::Message {
                block_presences: presences,
                ..Default::default()
            };
            // Bitswap answers on its own stream, never the request's.
            match host.open_stream(from, &BITSWAP_PROTOCOLS).await {
                Ok((_protocol, mut stream)) => {
                    let _ = framing::write_frame(&mut stream, &bitswap::encode(&reply)).await;
                }
                Err(e) => debug!("responder could not open stream: {}", e),
            }
        }
    });
}

async fn connected_pair() -> (ProbeHost, ProbeHost, Multiaddr) {
    let server = test_host();
    let server_addr = server
        .listen("/ip4/127.0.0.1/tcp/0".parse().unwrap())
        .await
        .expect("listen");
    let client = test_host();
    client
        .connect(
            server.local_peer_id(),
            vec![server_addr.clone()],
            Duration::from_secs(10),
        )
        .await
        .expect("connect");
    (client, server, server_addr)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_and_enumerate_connections() {
    let (client, server, server_addr) = connected_pair().await;

    let conns = client.connections_to(server.local_peer_id()).await;
    assert!(!conns.is_empty(), "connected peer must show connections");
    assert_eq!(conns[0], server_addr);

    // Reconnecting to an already-connected peer succeeds immediately.
    client
        .connect(server.local_peer_id(), Vec::new(), Duration::from_secs(1))
        .await
        .expect("reconnect is a no-op");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_check_block_found() {
    let (client, server, _) = connected_pair().await;
    spawn_presence_responder(server.clone(), client.local_peer_id(), true);

    let cid: Cid = TEST_CID.parse().unwrap();
    let target = PeerTarget {
        peer_id: server.local_peer_id(),
        addrs: Vec::new(),
    };
    let cancel = CancellationToken::new();
    let out = check_block(&cancel, &client, &cid, &target.p2p_multiaddr()).await;

    assert_eq!(out.error, "", "probe must not error: {}", out.error);
    assert!(out.responded);
    assert!(out.found);
    assert!(out.duration > Duration::ZERO);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_check_block_dont_have() {
    let (client, server, _) = connected_pair().await;
    spawn_presence_responder(server.clone(), client.local_peer_id(), false);

    let cid: Cid = TEST_CID.parse().unwrap();
    let target = PeerTarget {
        peer_id: server.local_peer_id(),
        addrs: Vec::new(),
    };
    let cancel = CancellationToken::new();
    let out = check_block(&cancel, &client, &cid, &target.p2p_multiaddr()).await;

    assert!(out.responded, "a DONT_HAVE still counts as a response");
    assert!(!out.found);
    assert_eq!(out.error, "");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cid_check_without_providers_is_empty() {
    // A host with no DHT yields an empty provider stream; the check must
    // return an empty list, not an error.
    let engine = CheckEngine::new(test_host());
    let cancel = CancellationToken::new();
    let out = engine.run_cid_check(&cancel, TEST_CID).await.expect("check runs");
    assert!(out.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cid_check_rejects_bad_input() {
    let engine = CheckEngine::new(test_host());
    let cancel = CancellationToken::new();
    assert!(engine.run_cid_check(&cancel, "not-a-cid").await.is_err());
    assert!(engine
        .run_peer_check(&cancel, "/ip4/127.0.0.1/tcp/1", TEST_CID)
        .await
        .is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_check_identity_only_without_dht() {
    // Identity-only target and a failing DHT lookup: the check reports
    // the DHT error as the connection error and never dials.
    let engine = CheckEngine::new(test_host());
    let cancel = CancellationToken::new();
    let peer = PeerId::random();
    let out = engine
        .run_peer_check(&cancel, &format!("/p2p/{}", peer), TEST_CID)
        .await
        .expect("check runs");

    assert_eq!(out.connection_error, "host had trouble querying the DHT");
    assert!(out.peer_found_in_dht.is_empty());
    assert!(!out.provider_record_from_peer_in_dht);
    assert!(out.connection_maddrs.is_empty());
    assert!(!out.data_available_over_bitswap.responded);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_check_unreachable_address() {
    // A concrete address nobody listens on: the ephemeral-host dial
    // fails, the error lands in the report, and the block probe is never
    // attempted.
    let engine = CheckEngine::new(test_host());
    let cancel = CancellationToken::new();
    let peer = PeerId::random();
    // Reserve a port and close it again so the dial is refused.
    let port = {
        let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        sock.local_addr().unwrap().port()
    };
    let maddr = format!("/ip4/127.0.0.1/tcp/{}/p2p/{}", port, peer);

    let out = engine
        .run_peer_check(&cancel, &maddr, TEST_CID)
        .await
        .expect("check runs");

    assert!(
        !out.connection_error.is_empty(),
        "refused dial must be reported"
    );
    assert!(!out.data_available_over_bitswap.responded);
    assert_eq!(out.data_available_over_bitswap.duration, Duration::ZERO);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_gate_refuses_private_addrs() {
    // A public-only host must refuse to dial loopback entirely.
    let server = test_host();
    let server_addr = server
        .listen("/ip4/127.0.0.1/tcp/0".parse().unwrap())
        .await
        .expect("listen");

    let gated = ProbeHost::new(HostConfig {
        filter: AddrFilter::PublicOnly,
        enable_dht: false,
        accelerated_dht: false,
        listen_addrs: Vec::new(),
        bootstrap_peers: Vec::new(),
    })
    .expect("host builds");

    let err = gated
        .connect(
            server.local_peer_id(),
            vec![server_addr],
            Duration::from_secs(5),
        )
        .await
        .expect_err("loopback dial must be gated");
    assert!(err.to_string().contains("unreachable"));
}
