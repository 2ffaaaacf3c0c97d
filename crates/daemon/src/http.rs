//! HTTP surface
//!
//! `GET /check?cid=<cid>[&multiaddr=<maddr>]` runs a probe and returns
//! the report as JSON; the CID-only form enumerates providers, the
//! multiaddr form probes that one peer. `GET /metrics` exposes the probe
//! counters, behind basic auth when credentials are configured. Every
//! response carries a wildcard CORS origin so the endpoint can be driven
//! from a browser.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::Engine as _;
use cidcheck_core::CheckError;
use cidcheck_engine::CheckEngine;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub engine: CheckEngine,
    pub metrics: Arc<Metrics>,
    /// Basic-auth credentials guarding /metrics, if configured.
    pub metrics_auth: Option<(String, String)>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/check", get(handle_check))
        .route("/metrics", get(handle_metrics))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct CheckParams {
    cid: Option<String>,
    multiaddr: Option<String>,
}

async fn handle_check(
    State(state): State<AppState>,
    Query(params): Query<CheckParams>,
) -> Response {
    let Some(cid) = params.cid else {
        Metrics::incr(&state.metrics.check_errors_total);
        return (StatusCode::BAD_REQUEST, "missing argument: cid").into_response();
    };

    // Canceled when the handler is dropped, i.e. the client went away;
    // in-flight DHT queries and dials stop with it.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let result = match params.multiaddr {
        Some(multiaddr) => {
            Metrics::incr(&state.metrics.peer_checks_total);
            state
                .engine
                .run_peer_check(&cancel, &multiaddr, &cid)
                .await
                .map(|report| serde_json::to_value(report))
        }
        None => {
            Metrics::incr(&state.metrics.cid_checks_total);
            state
                .engine
                .run_cid_check(&cancel, &cid)
                .await
                .map(|report| serde_json::to_value(report))
        }
    };

    match result {
        Ok(Ok(body)) => axum::Json(body).into_response(),
        Ok(Err(e)) => {
            error!("report serialization failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            Metrics::incr(&state.metrics.check_errors_total);
            let status = match e {
                CheckError::InvalidCid(_) | CheckError::InvalidMultiaddr(_) => {
                    StatusCode::BAD_REQUEST
                }
                CheckError::Bootstrap(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, e.to_string()).into_response()
        }
    }
}

async fn handle_metrics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some((user, pass)) = &state.metrics_auth {
        if !authorized(&headers, user, pass) {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"metrics\"")],
                "unauthorized",
            )
                .into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

/// Validate an `Authorization: Basic` header against the configured
/// credentials.
fn authorized(headers: &HeaderMap, user: &str, pass: &str) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    match decoded.split_once(':') {
        Some((u, p)) => u == user && p == pass,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic_header(user: &str, pass: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let token =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {}", token).parse().unwrap(),
        );
        headers
    }

    #[test]
    fn test_authorized_accepts_matching_credentials() {
        let headers = basic_header("scraper", "hunter2");
        assert!(authorized(&headers, "scraper", "hunter2"));
    }

    #[test]
    fn test_authorized_rejects_wrong_password() {
        let headers = basic_header("scraper", "wrong");
        assert!(!authorized(&headers, "scraper", "hunter2"));
    }

    #[test]
    fn test_authorized_rejects_missing_header() {
        assert!(!authorized(&HeaderMap::new(), "scraper", "hunter2"));
    }

    #[test]
    fn test_authorized_rejects_non_basic_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer token".parse().unwrap());
        assert!(!authorized(&headers, "scraper", "hunter2"));
    }

    #[test]
    fn test_authorized_rejects_undecodable_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic !!!".parse().unwrap());
        assert!(!authorized(&headers, "scraper", "hunter2"));
    }
}
