//! End-to-end wire tests: a real gateway bound to ephemeral ports, a
//! scripted agent speaking tokio-tungstenite, and reqwest as the public
//! client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use reqwest::header::HOST;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tunnel_proto::{Envelope, Headers, Route};
use tunnel_server::{control_router, public_router, Gateway};

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_gateway(timeout: Duration) -> (Arc<Gateway>, SocketAddr, SocketAddr) {
    let gateway = Arc::new(Gateway::new(timeout));

    let public = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let public_addr = public.local_addr().unwrap();
    let control_addr = control.local_addr().unwrap();

    let public_app = public_router(gateway.clone());
    tokio::spawn(async move {
        axum::serve(
            public,
            public_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    let control_app = control_router(gateway.clone());
    tokio::spawn(async move {
        axum::serve(
            control,
            control_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (gateway, public_addr, control_addr)
}

async fn connect_agent(
    control_addr: SocketAddr,
    token: &str,
    routes: &[(&str, &str)],
) -> AgentSocket {
    let url = format!("ws://{control_addr}/connect?token={token}");
    let (mut ws, _) = connect_async(url).await.unwrap();
    send_envelope(
        &mut ws,
        &Envelope::RegisterRoutes {
            routes: routes
                .iter()
                .map(|(hostname, target)| Route {
                    hostname: hostname.to_string(),
                    target: target.to_string(),
                })
                .collect(),
        },
    )
    .await;
    ws
}

async fn send_envelope(ws: &mut AgentSocket, env: &Envelope) {
    let text = serde_json::to_string(env).unwrap();
    ws.send(Message::Text(text)).await.unwrap();
}

/// Next protocol envelope, skipping transport ping/pong frames. Panics if
/// the socket ends first.
async fn next_envelope(ws: &mut AgentSocket) -> Envelope {
    loop {
        match ws.next().await.expect("socket ended") {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).unwrap(),
            Ok(_) => {}
            Err(err) => panic!("agent read failed: {err}"),
        }
    }
}

/// Spins until the gateway's routing table answers for `host`, or the
/// register_routes envelope is declared lost.
async fn wait_for_route(gateway: &Gateway, host: &str) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while gateway.lookup_route(host).is_none() {
        assert!(Instant::now() < deadline, "route {host} never appeared");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_route_gone(gateway: &Gateway, host: &str) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while gateway.lookup_route(host).is_some() {
        assert!(Instant::now() < deadline, "route {host} never disappeared");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn ok_response(request_id: &str, body: &str) -> Envelope {
    let mut headers = Headers::new();
    headers.insert(
        "content-type".to_string(),
        vec!["text/plain; charset=utf-8".to_string()],
    );
    headers.insert("x-upstream".to_string(), vec!["local".to_string()]);
    Envelope::ProxyResponse {
        request_id: request_id.to_string(),
        status: 200,
        headers,
        body: BASE64.encode(body),
    }
}

#[tokio::test]
async fn proxies_a_request_end_to_end() {
    let (gateway, public_addr, control_addr) = spawn_gateway(Duration::from_secs(30)).await;

    let mut ws = connect_agent(control_addr, "tok-e2e", &[("app.example.com", "127.0.0.1:3000")])
        .await;
    wait_for_route(&gateway, "app.example.com").await;

    let agent = tokio::spawn(async move {
        let env = next_envelope(&mut ws).await;
        let Envelope::ProxyRequest { ref request_id, .. } = env else {
            panic!("expected proxy_request, got {env:?}");
        };
        send_envelope(&mut ws, &ok_response(request_id, "ok")).await;
        env
    });

    let response = reqwest::Client::new()
        .post(format!("http://{public_addr}/hello/world?q=1"))
        .header(HOST, "app.example.com")
        .header("x-custom", "yes")
        .header("connection", "keep-alive")
        .body("ping")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-upstream"], "local");
    assert_eq!(response.text().await.unwrap(), "ok");

    let env = agent.await.unwrap();
    let Envelope::ProxyRequest {
        method,
        path,
        query,
        headers,
        body,
        hostname,
        target,
        ..
    } = env
    else {
        unreachable!();
    };
    assert_eq!(method, "POST");
    assert_eq!(path, "/hello/world");
    assert_eq!(query, "q=1");
    assert_eq!(hostname, "app.example.com");
    assert_eq!(target, "127.0.0.1:3000");
    assert_eq!(BASE64.decode(body).unwrap(), b"ping");

    assert_eq!(headers["x-custom"], vec!["yes".to_string()]);
    assert_eq!(headers["x-forwarded-host"], vec!["app.example.com".to_string()]);
    assert_eq!(headers["x-forwarded-proto"], vec!["http".to_string()]);
    assert_eq!(headers["x-forwarded-for"], vec!["127.0.0.1".to_string()]);
    assert!(!headers.contains_key("connection"));
    assert!(!headers.contains_key("host"));
}

#[tokio::test]
async fn unknown_host_is_404() {
    let (_gateway, public_addr, _control_addr) = spawn_gateway(Duration::from_secs(30)).await;

    let response = reqwest::Client::new()
        .get(format!("http://{public_addr}/"))
        .header(HOST, "nope.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn binding_without_session_is_503() {
    let (gateway, public_addr, _control_addr) = spawn_gateway(Duration::from_secs(30)).await;

    // A binding whose session is gone: seeded directly, since the normal
    // teardown path purges routes with the session.
    gateway.apply_routes(
        "ghost",
        &[Route {
            hostname: "app.example.com".to_string(),
            target: "127.0.0.1:3000".to_string(),
        }],
    );

    let response = reqwest::Client::new()
        .get(format!("http://{public_addr}/"))
        .header(HOST, "app.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    assert_eq!(response.text().await.unwrap(), "tunnel offline");
}

#[tokio::test]
async fn silent_agent_times_out_with_504_and_session_survives() {
    let (gateway, public_addr, control_addr) = spawn_gateway(Duration::from_millis(200)).await;

    let mut ws = connect_agent(
        control_addr,
        "tok-slow",
        &[("slow.example.com", "127.0.0.1:1")],
    )
    .await;
    wait_for_route(&gateway, "slow.example.com").await;

    // Swallow the first request, answer the second.
    let agent = tokio::spawn(async move {
        let first = next_envelope(&mut ws).await;
        let Envelope::ProxyRequest { .. } = first else {
            panic!("expected proxy_request");
        };
        let second = next_envelope(&mut ws).await;
        let Envelope::ProxyRequest { ref request_id, .. } = second else {
            panic!("expected proxy_request");
        };
        send_envelope(&mut ws, &ok_response(request_id, "late but fine")).await;
        // Answering the swallowed request now is benign: its slot is gone.
        let Envelope::ProxyRequest { ref request_id, .. } = first else {
            unreachable!();
        };
        send_envelope(&mut ws, &ok_response(request_id, "too late")).await;
        ws
    });

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{public_addr}/"))
        .header(HOST, "slow.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 504);

    let response = client
        .get(format!("http://{public_addr}/"))
        .header(HOST, "slow.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "late but fine");

    agent.await.unwrap();
}

#[tokio::test]
async fn killed_session_fails_inflight_requests_promptly() {
    let (gateway, public_addr, control_addr) = spawn_gateway(Duration::from_secs(30)).await;

    let mut ws = connect_agent(control_addr, "tok-kill", &[("die.example.com", "127.0.0.1:1")])
        .await;
    wait_for_route(&gateway, "die.example.com").await;

    // Drop the control channel as soon as the request arrives.
    let agent = tokio::spawn(async move {
        let _ = next_envelope(&mut ws).await;
        drop(ws);
    });

    let started = Instant::now();
    let response = reqwest::Client::new()
        .get(format!("http://{public_addr}/"))
        .header(HOST, "die.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 504);
    // Far below the 30 s request timeout: the slot died with the session.
    assert!(started.elapsed() < Duration::from_secs(5));

    agent.await.unwrap();
    wait_for_route_gone(&gateway, "die.example.com").await;
}

#[tokio::test]
async fn reconnect_replaces_the_session_and_its_routes() {
    let (gateway, public_addr, control_addr) = spawn_gateway(Duration::from_secs(30)).await;

    let mut first = connect_agent(control_addr, "tok-swap", &[("app.example.com", "127.0.0.1:1")])
        .await;
    wait_for_route(&gateway, "app.example.com").await;

    let mut second =
        connect_agent(control_addr, "tok-swap", &[("app.example.com", "127.0.0.1:2")]).await;

    // The predecessor is told to go away.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match first.next().await {
                None | Some(Ok(Message::Close(_))) | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .expect("old session never closed");

    // And the successor's publication owns the binding.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match gateway.lookup_route("app.example.com") {
            Some(binding) if binding.target == "127.0.0.1:2" => break,
            _ => {
                assert!(Instant::now() < deadline, "binding never swapped");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    let agent = tokio::spawn(async move {
        let env = next_envelope(&mut second).await;
        let Envelope::ProxyRequest { ref request_id, ref target, .. } = env else {
            panic!("expected proxy_request");
        };
        assert_eq!(target, "127.0.0.1:2");
        send_envelope(&mut second, &ok_response(request_id, "from successor")).await;
    });

    let response = reqwest::Client::new()
        .get(format!("http://{public_addr}/"))
        .header(HOST, "app.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "from successor");

    agent.await.unwrap();
    assert_eq!(gateway.debug_state(), "agents=1 routes=1");
}

#[tokio::test]
async fn republishing_drops_omitted_hostnames() {
    let (gateway, _public_addr, control_addr) = spawn_gateway(Duration::from_secs(30)).await;

    let mut ws = connect_agent(
        control_addr,
        "tok-replace",
        &[
            ("a.example.com", "127.0.0.1:1"),
            ("b.example.com", "127.0.0.1:2"),
        ],
    )
    .await;
    wait_for_route(&gateway, "a.example.com").await;
    wait_for_route(&gateway, "b.example.com").await;

    send_envelope(
        &mut ws,
        &Envelope::RegisterRoutes {
            routes: vec![Route {
                hostname: "b.example.com".to_string(),
                target: "127.0.0.1:2".to_string(),
            }],
        },
    )
    .await;

    wait_for_route_gone(&gateway, "a.example.com").await;
    assert!(gateway.lookup_route("b.example.com").is_some());
}

#[tokio::test]
async fn disconnect_purges_sessions_and_bindings() {
    let (gateway, _public_addr, control_addr) = spawn_gateway(Duration::from_secs(30)).await;

    let ws = connect_agent(control_addr, "tok-bye", &[("app.example.com", "127.0.0.1:1")])
        .await;
    wait_for_route(&gateway, "app.example.com").await;

    drop(ws);
    wait_for_route_gone(&gateway, "app.example.com").await;
    assert_eq!(gateway.debug_state(), "agents=0 routes=0");
}

#[tokio::test]
async fn connect_without_token_is_rejected() {
    let (_gateway, _public_addr, control_addr) = spawn_gateway(Duration::from_secs(30)).await;

    let result = connect_async(format!("ws://{control_addr}/connect")).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 400);
        }
        other => panic!("expected http 400 rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn healthz_and_debug_state_respond() {
    let (_gateway, _public_addr, control_addr) = spawn_gateway(Duration::from_secs(30)).await;

    let client = reqwest::Client::new();
    let health = client
        .get(format!("http://{control_addr}/healthz"))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), "ok");

    let state = client
        .get(format!("http://{control_addr}/debug/state"))
        .send()
        .await
        .unwrap();
    assert_eq!(state.text().await.unwrap(), "agents=0 routes=0");
}
