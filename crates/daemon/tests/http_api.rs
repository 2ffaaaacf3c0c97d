//! HTTP surface tests
//!
//! Drives the router in-process with a real (DHT-less) engine behind it:
//! param routing between the two check forms, input rejection, CORS, and
//! the metrics auth gate.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use base64::Engine as _;
use cidcheck_core::AddrFilter;
use cidcheck_daemon::http::{router, AppState};
use cidcheck_daemon::metrics::Metrics;
use cidcheck_engine::{CheckEngine, HostConfig, ProbeHost};
use libp2p::PeerId;
use tower::ServiceExt;

const TEST_CID: &str = "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi";

/// State backed by a host with no DHT: CID checks see an empty provider
/// stream, peer checks hit the DHT-unavailable path. Both settle without
/// touching the network.
fn test_state(metrics_auth: Option<(String, String)>) -> AppState {
    let host = ProbeHost::new(HostConfig {
        filter: AddrFilter::AllowAll,
        enable_dht: false,
        accelerated_dht: false,
        listen_addrs: Vec::new(),
        bootstrap_peers: Vec::new(),
    })
    .expect("host builds");
    AppState {
        engine: CheckEngine::new(host),
        metrics: Arc::new(Metrics::default()),
        metrics_auth,
    }
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_check_requires_cid() {
    let state = test_state(None);
    let metrics = state.metrics.clone();
    let app = router(state);

    let response = app
        .oneshot(Request::get("/check").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_string(response).await.contains("missing argument"));
    assert_eq!(metrics.check_errors_total.load(Ordering::Relaxed), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_check_rejects_malformed_input() {
    let app = router(test_state(None));

    let response = app
        .clone()
        .oneshot(
            Request::get("/check?cid=not-a-cid")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(
            Request::get(format!("/check?cid={}&multiaddr=garbage", TEST_CID).as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cid_only_routes_to_provider_check() {
    let state = test_state(None);
    let metrics = state.metrics.clone();
    let app = router(state);

    let response = app
        .oneshot(
            Request::get(format!("/check?cid={}", TEST_CID).as_str())
                .header(header::ORIGIN, "http://example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
    // A CID check serializes as a list of provider reports; with no DHT
    // the list is empty.
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body, serde_json::json!([]));
    assert_eq!(metrics.cid_checks_total.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.peer_checks_total.load(Ordering::Relaxed), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_multiaddr_routes_to_peer_check() {
    let state = test_state(None);
    let metrics = state.metrics.clone();
    let app = router(state);

    let peer = PeerId::random();
    let response = app
        .oneshot(
            Request::get(format!("/check?cid={}&multiaddr=/p2p/{}", TEST_CID, peer).as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    // A peer report, with the failed DHT lookup surfaced as its
    // connection error.
    assert_eq!(
        body["ConnectionError"],
        "host had trouble querying the DHT"
    );
    assert_eq!(body["ProviderRecordFromPeerInDHT"], false);
    assert_eq!(metrics.peer_checks_total.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.cid_checks_total.load(Ordering::Relaxed), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_metrics_open_without_credentials() {
    let app = router(test_state(None));
    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_string(response).await.contains("cidcheck_cid_checks_total"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_metrics_auth_gate() {
    let app = router(test_state(Some(("scraper".into(), "hunter2".into()))));

    let response = app
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

    let token = base64::engine::general_purpose::STANDARD.encode("scraper:hunter2");
    let response = app
        .oneshot(
            Request::get("/metrics")
                .header(header::AUTHORIZATION, format!("Basic {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
