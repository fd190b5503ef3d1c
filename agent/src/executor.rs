//! # Proxy Executor
//!
//! Turns one `proxy_request` envelope into an HTTP call against the local
//! target and queues the `proxy_response`. Local-side failures (refused
//! dial, timeout, unreadable body) never surface as session errors; they
//! come back as a well-formed 502 (or 400) response envelope with a
//! plaintext diagnostic, so the gateway always has something to relay.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use reqwest::Method;
use tokio::sync::mpsc;
use tracing::warn;
use tunnel_proto::{strip_hop_headers, Envelope, Headers, MAX_BODY_BYTES};

use crate::state::AgentService;

/// Handles one `proxy_request`. Spawned per request by the connector.
pub async fn handle(
    service: Arc<AgentService>,
    env: Envelope,
    tx: mpsc::UnboundedSender<Envelope>,
) {
    let Envelope::ProxyRequest {
        request_id,
        method,
        path,
        query,
        headers,
        body,
        hostname,
        target,
    } = env
    else {
        return;
    };

    let call = LocalCall {
        method,
        path,
        query,
        headers,
        body,
        hostname,
        target,
    };
    let (status, headers, body) = forward_to_local(&service, call).await;

    let response = Envelope::ProxyResponse {
        request_id: request_id.clone(),
        status,
        headers,
        body: BASE64.encode(&body),
    };
    if tx.send(response).is_err() {
        warn!("write proxy response failed request_id={}", request_id);
    }
}

struct LocalCall {
    method: String,
    path: String,
    query: String,
    headers: Headers,
    body: String,
    hostname: String,
    target: String,
}

async fn forward_to_local(service: &AgentService, mut call: LocalCall) -> (u16, Headers, Vec<u8>) {
    if call.target.is_empty() {
        return text_result(502, "missing target");
    }

    let body = match BASE64.decode(call.body.as_bytes()) {
        Ok(body) => body,
        Err(_) => return text_result(400, "invalid request body"),
    };

    // The agent only ever reaches local services; the scheme is plain HTTP.
    let mut url = format!("http://{}{}", call.target, call.path);
    if !call.query.is_empty() {
        url.push('?');
        url.push_str(&call.query);
    }

    let Ok(method) = Method::from_bytes(call.method.as_bytes()) else {
        return text_result(502, "build local request failed");
    };

    strip_hop_headers(&mut call.headers);
    let mut header_map = HeaderMap::new();
    for (name, values) in &call.headers {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        for value in values {
            let Ok(value) = HeaderValue::from_str(value) else {
                continue;
            };
            header_map.append(name.clone(), value);
        }
    }
    // Virtual-host-based local servers route on the original public name.
    if !call.hostname.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&call.hostname) {
            header_map.insert(HOST, value);
        }
    }

    let response = match service
        .http_client()
        .request(method, url)
        .headers(header_map)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => return text_result(502, format!("local request failed: {err}")),
    };

    let status = response.status().as_u16();
    let mut headers = Headers::new();
    for (name, value) in response.headers() {
        let Ok(value) = value.to_str() else { continue };
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(value.to_string());
    }
    strip_hop_headers(&mut headers);

    // Read the body up to the cap; anything beyond it is dropped.
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else {
            return text_result(502, "read local response failed");
        };
        let remaining = MAX_BODY_BYTES - body.len();
        if chunk.len() >= remaining {
            body.extend_from_slice(&chunk[..remaining]);
            break;
        }
        body.extend_from_slice(&chunk);
    }

    (status, headers, body)
}

fn text_result(status: u16, message: impl Into<String>) -> (u16, Headers, Vec<u8>) {
    let mut headers = Headers::new();
    headers.insert(
        "content-type".to_string(),
        vec!["text/plain; charset=utf-8".to_string()],
    );
    (status, headers, message.into().into_bytes())
}
