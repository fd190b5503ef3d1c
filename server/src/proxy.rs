//! # Public HTTP Path
//!
//! Catch-all handler for the public listener. Every inbound request is
//! routed by its `Host` header, wrapped into a `proxy_request` envelope,
//! written down the owning agent session, and answered from the matching
//! `proxy_response`. When the tunnel cannot deliver one, the gateway
//! answers itself:
//!
//! - 400 invalid host / unreadable or oversized body
//! - 404 no binding for the hostname
//! - 503 binding exists but its session is gone
//! - 502 envelope write failed / response body undecodable
//! - 504 response timeout, or session torn down mid-flight
//!
//! Many requests can be in flight per session; the per-session write lock
//! serializes envelope writes and the `request_id` → slot map demultiplexes
//! responses.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::HOST;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, warn};
use tunnel_proto::{normalize_host_header, strip_hop_headers, Envelope, Headers, MAX_BODY_BYTES};

use crate::state::Gateway;

pub async fn handle_public(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let (parts, body) = req.into_parts();

    // HTTP/1.1 carries the host in the Host header; HTTP/2 in :authority,
    // which lands on the request URI.
    let host = parts
        .headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| parts.uri.host())
        .unwrap_or("");
    let host = normalize_host_header(host);
    if host.is_empty() {
        return text_response(StatusCode::BAD_REQUEST, "invalid host");
    }

    let Some(binding) = gateway.lookup_route(&host) else {
        return text_response(StatusCode::NOT_FOUND, "unknown host");
    };
    let Some(session) = gateway.session(&binding.token) else {
        return text_response(StatusCode::SERVICE_UNAVAILABLE, "tunnel offline");
    };

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return text_response(StatusCode::BAD_REQUEST, "read request failed"),
    };

    let mut headers = clone_headers(&parts.headers);
    // The original Host travels in the envelope's hostname field.
    headers.remove("host");
    strip_hop_headers(&mut headers);
    append_forwarded_headers(&mut headers, &host, peer);

    let request_id = gateway.next_request_id();
    let slot = session.register_pending(request_id.clone());

    let env = Envelope::ProxyRequest {
        request_id: request_id.clone(),
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().unwrap_or("").to_string(),
        headers,
        body: BASE64.encode(&body),
        hostname: host,
        target: binding.target,
    };

    if let Err(err) = session.write(&env).await {
        session.cancel_pending(&request_id);
        warn!("send to tunnel failed token={} err={}", session.token(), err);
        return text_response(StatusCode::BAD_GATEWAY, "send to tunnel failed");
    }

    match tokio::time::timeout(gateway.request_timeout(), slot).await {
        Ok(Ok(response)) => agent_response(response),
        // The session was torn down before the agent answered.
        Ok(Err(_)) => text_response(StatusCode::GATEWAY_TIMEOUT, "tunnel closed"),
        Err(_) => {
            session.cancel_pending(&request_id);
            debug!("request timed out token={} request_id={}", session.token(), request_id);
            text_response(StatusCode::GATEWAY_TIMEOUT, "tunnel timeout")
        }
    }
}

// ─── Response Construction ──────────────────────────────────────

fn agent_response(env: Envelope) -> Response {
    let Envelope::ProxyResponse {
        status,
        headers,
        body,
        ..
    } = env
    else {
        return text_response(StatusCode::BAD_GATEWAY, "malformed tunnel response");
    };

    let bytes = if body.is_empty() {
        Vec::new()
    } else {
        match BASE64.decode(body.as_bytes()) {
            Ok(bytes) => bytes,
            Err(_) => {
                return text_response(StatusCode::BAD_GATEWAY, "decode response body failed")
            }
        }
    };

    let status = StatusCode::from_u16(if status == 0 { 502 } else { status })
        .unwrap_or(StatusCode::BAD_GATEWAY);

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    for (name, values) in headers {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        for value in values {
            let Ok(value) = HeaderValue::from_str(&value) else {
                continue;
            };
            response.headers_mut().append(name.clone(), value);
        }
    }
    response
}

fn text_response(status: StatusCode, message: &'static str) -> Response {
    (status, message).into_response()
}

// ─── Header Plumbing ────────────────────────────────────────────

/// Copies an `http::HeaderMap` into the wire multi-map. Names come out
/// lowercase; values that are not valid UTF-8 are dropped.
fn clone_headers(map: &axum::http::HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in map {
        let Ok(value) = value.to_str() else { continue };
        out.entry(name.as_str().to_string())
            .or_default()
            .push(value.to_string());
    }
    out
}

/// Appends `x-forwarded-for` (never overwriting earlier hops) and sets
/// `x-forwarded-host`/`x-forwarded-proto`. TLS terminates at the front
/// proxy, so the scheme observed here is always plain HTTP.
fn append_forwarded_headers(headers: &mut Headers, host: &str, peer: SocketAddr) {
    headers
        .entry("x-forwarded-for".to_string())
        .or_default()
        .push(peer.ip().to_string());
    headers.insert("x-forwarded-host".to_string(), vec![host.to_string()]);
    headers.insert("x-forwarded-proto".to_string(), vec!["http".to_string()]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_for_appends_to_existing_hops() {
        let mut headers = Headers::new();
        headers.insert(
            "x-forwarded-for".to_string(),
            vec!["10.0.0.1".to_string()],
        );
        let peer: SocketAddr = "192.0.2.7:55555".parse().unwrap();

        append_forwarded_headers(&mut headers, "app.example.com", peer);

        assert_eq!(
            headers["x-forwarded-for"],
            vec!["10.0.0.1".to_string(), "192.0.2.7".to_string()]
        );
        assert_eq!(headers["x-forwarded-host"], vec!["app.example.com".to_string()]);
        assert_eq!(headers["x-forwarded-proto"], vec!["http".to_string()]);
    }

    #[test]
    fn agent_response_defaults_zero_status_to_502() {
        let response = agent_response(Envelope::ProxyResponse {
            request_id: "1".to_string(),
            status: 0,
            headers: Headers::new(),
            body: String::new(),
        });
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn agent_response_rejects_undecodable_body() {
        let response = agent_response(Envelope::ProxyResponse {
            request_id: "1".to_string(),
            status: 200,
            headers: Headers::new(),
            body: "not-base64!!!".to_string(),
        });
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
