//! Gateway traffic: serve here or relay to a peer.

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower::ServiceExt;

use gatemesh_core::wire::FROM_PEER_HEADER;
use gatemesh_core::NodeId;
use gatemesh_services::balancer::{select_peer, RouteDecision, Selection};

use crate::handlers::ApiState;

/// Largest request body buffered for relaying.
pub const MAX_RELAY_BODY: usize = 16 * 1024 * 1024;

/// Fallback handler for every non-API path.
///
/// The balancer decides where the request runs. A relay that cannot
/// connect falls back to the local backend. A relay that fails after the
/// request went out is answered with 504 or 502, since the peer may
/// already have run it. Without a local backend the best Connected peer
/// is used regardless of threshold, and with no peer either the answer
/// is 503.
pub async fn relay_or_serve(State(state): State<ApiState>, req: Request) -> Response {
    let from_peer = req.headers().contains_key(FROM_PEER_HEADER);

    let target = match state.balancer.route(&state.directory, &state.collector, from_peer) {
        RouteDecision::Forward { node_id, address } => Some((node_id, address)),
        RouteDecision::Local if state.local.is_none() && !from_peer => any_peer(&state),
        RouteDecision::Local => None,
    };

    let Some((peer, address)) = target else {
        return serve_local(&state, req).await;
    };

    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_RELAY_BODY).await {
        Ok(b) => b,
        Err(e) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, format!("request body: {e}")).into_response();
        }
    };

    match forward(&state, &address, &parts, body.clone()).await {
        Ok(resp) => {
            tracing::debug!(peer = %peer, path = %parts.uri.path(), status = %resp.status(), "request relayed");
            resp
        }
        Err(e) if e.is_connect() => {
            tracing::warn!(peer = %peer, addr = %address, error = %e, "peer unreachable, serving locally");
            serve_local(&state, Request::from_parts(parts, Body::from(body))).await
        }
        Err(e) => {
            tracing::warn!(peer = %peer, addr = %address, error = %e, "relay failed after send");
            let status = if e.is_timeout() {
                StatusCode::GATEWAY_TIMEOUT
            } else {
                StatusCode::BAD_GATEWAY
            };
            (status, "relay failed").into_response()
        }
    }
}

/// Best Connected peer with a known HTTP address.
fn any_peer(state: &ApiState) -> Option<(NodeId, String)> {
    match select_peer(&state.directory, &state.collector) {
        Selection::Peer(id) => {
            let address = state.collector.metrics_for(&id)?.address;
            (!address.is_empty()).then_some((id, address))
        }
        Selection::Local => None,
    }
}

async fn serve_local(state: &ApiState, req: Request) -> Response {
    match &state.local {
        Some(router) => match router.clone().oneshot(req).await {
            Ok(resp) => resp,
            Err(never) => match never {},
        },
        None => (StatusCode::SERVICE_UNAVAILABLE, "no backend available").into_response(),
    }
}

async fn forward(state: &ApiState, address: &str, parts: &Parts, body: Bytes) -> Result<Response, reqwest::Error> {
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let url = format!("http://{address}{path}");

    let mut headers = strip_hop_headers(&parts.headers);
    if let Ok(v) = HeaderValue::from_str(state.collector.node_id().as_str()) {
        headers.insert(HeaderName::from_static(FROM_PEER_HEADER), v);
    }

    let upstream = state
        .http
        .request(parts.method.clone(), url)
        .headers(headers)
        .body(body)
        .timeout(state.relay_timeout)
        .send()
        .await?;

    let status = upstream.status();
    let headers = strip_hop_headers(upstream.headers());
    let bytes = upstream.bytes().await?;

    let mut resp = Response::new(Body::from(bytes));
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    Ok(resp)
}

fn strip_hop_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in [HOST, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING] {
        out.remove(name);
    }
    out
}

/// Local backend that proxies every request to `upstream`
/// (`http://host:port`). Each request is bounded by `timeout`.
pub fn upstream_router(client: reqwest::Client, upstream: String, timeout: Duration) -> Router {
    Router::new().fallback(move |req: Request| {
        let client = client.clone();
        let upstream = upstream.clone();
        async move {
            match proxy(&client, &upstream, req, timeout).await {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!(upstream = %upstream, error = %e, "upstream request failed");
                    (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response()
                }
            }
        }
    })
}

async fn proxy(
    client: &reqwest::Client,
    upstream: &str,
    req: Request,
    timeout: Duration,
) -> anyhow::Result<Response> {
    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, MAX_RELAY_BODY).await?;
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let url = format!("{}{path}", upstream.trim_end_matches('/'));

    let mut headers = strip_hop_headers(&parts.headers);
    headers.remove(FROM_PEER_HEADER);
    let resp = client
        .request(parts.method, url)
        .headers(headers)
        .body(body)
        .timeout(timeout)
        .send()
        .await?;

    let status = resp.status();
    let headers = strip_hop_headers(resp.headers());
    let bytes = resp.bytes().await?;
    let mut out = Response::new(Body::from(bytes));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    Ok(out)
}
