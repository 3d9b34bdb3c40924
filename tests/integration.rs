//! End-to-end tests: a real server on an ephemeral TCP port, driven by a
//! real WebSocket client and a real child process.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use webtty::config::{BindTarget, Config};
use webtty::registry::Registry;
use webtty::server;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn base_config(argv: Vec<&str>) -> Config {
    Config {
        argv: argv.into_iter().map(String::from).collect(),
        credential: None,
        client_opt: "{}".into(),
        reconnect: 10,
        sig_code: nix::sys::signal::Signal::SIGHUP,
        sig_name: "SIGHUP".into(),
        readonly: false,
        check_origin: false,
        max_clients: 0,
        once: false,
        bind: BindTarget::Tcp {
            iface: Some("127.0.0.1".into()),
            port: 0,
        },
        tls: None,
        index: None,
        browser: false,
        log: "warn".into(),
        uid: None,
        gid: None,
    }
}

/// Binds an ephemeral port, starts the accept loop on a background task,
/// and returns its address plus the registry (for asserting admission
/// state) and config (for building auth payloads).
async fn spawn_server(config: Config) -> (String, Arc<Registry>, Arc<Config>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = Arc::new(config);
    let registry = Registry::new(config.clone());

    let task_config = config.clone();
    let task_registry = registry.clone();
    tokio::spawn(async move {
        let _ = server::serve_tcp(listener, None, task_config, task_registry).await;
    });

    (format!("ws://{addr}/ws"), registry, config)
}

async fn connect(url: &str) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let (ws, _response) = timeout(RECV_TIMEOUT, tokio_tungstenite::connect_async(url))
        .await
        .expect("connect should not time out")
        .expect("connect should succeed");
    ws
}

async fn recv_text(
    ws: &mut futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    >,
) -> String {
    match timeout(RECV_TIMEOUT, ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        other => panic!("expected a text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn happy_path_without_auth_echoes_output_and_closes_normally() {
    let (url, registry, _config) = spawn_server(base_config(vec!["/bin/echo", "hi"])).await;
    let ws = connect(&url).await;
    let (mut tx, mut rx) = ws.split();

    let title = recv_text(&mut rx).await;
    assert!(title.starts_with('\u{2}'));
    let reconnect = recv_text(&mut rx).await;
    assert_eq!(reconnect, "\u{4}10");
    let prefs = recv_text(&mut rx).await;
    assert_eq!(prefs, "\u{3}{}");

    tx.send(Message::Text("{}".into())).await.unwrap();

    let mut decoded = Vec::new();
    loop {
        match timeout(RECV_TIMEOUT, rx.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Some(body) = text.strip_prefix('0') {
                    decoded.extend_from_slice(&BASE64.decode(body).unwrap());
                }
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            other => panic!("unexpected frame while waiting for echo output: {other:?}"),
        }
        if String::from_utf8_lossy(&decoded).contains("hi") {
            break;
        }
    }
    assert!(String::from_utf8_lossy(&decoded).contains("hi"));

    // allow the session to finish tearing down
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(registry.count(), 0);
}

#[tokio::test]
async fn wrong_auth_token_is_rejected_without_spawning_a_child() {
    let mut config = base_config(vec!["/bin/cat"]);
    config.credential = Some(BASE64.encode(b"u:p"));
    let (url, _registry, _config) = spawn_server(config).await;

    let ws = connect(&url).await;
    let (mut tx, mut rx) = ws.split();

    let _ = recv_text(&mut rx).await;
    let _ = recv_text(&mut rx).await;
    let _ = recv_text(&mut rx).await;

    tx.send(Message::Text(r#"{"AuthToken":"bogus"}"#.into())).await.unwrap();

    match timeout(RECV_TIMEOUT, rx.next()).await {
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {}
        other => panic!("expected the connection to close on bad auth, got {other:?}"),
    }
}

#[tokio::test]
async fn correct_auth_token_lets_the_session_proceed() {
    let mut config = base_config(vec!["/bin/echo", "authed"]);
    let credential = BASE64.encode(b"u:p");
    config.credential = Some(credential.clone());
    let (url, _registry, _config) = spawn_server(config).await;

    let ws = connect(&url).await;
    let (mut tx, mut rx) = ws.split();
    let _ = recv_text(&mut rx).await;
    let _ = recv_text(&mut rx).await;
    let _ = recv_text(&mut rx).await;

    tx.send(Message::Text(format!(r#"{{"AuthToken":"{credential}"}}"#))).await.unwrap();

    let mut decoded = Vec::new();
    loop {
        match timeout(RECV_TIMEOUT, rx.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Some(body) = text.strip_prefix('0') {
                    decoded.extend_from_slice(&BASE64.decode(body).unwrap());
                }
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            other => panic!("unexpected frame: {other:?}"),
        }
        if String::from_utf8_lossy(&decoded).contains("authed") {
            break;
        }
    }
    assert!(String::from_utf8_lossy(&decoded).contains("authed"));
}

#[tokio::test]
async fn once_mode_exits_after_the_first_session_closes() {
    let mut config = base_config(vec!["/bin/echo", "bye"]);
    config.once = true;
    let (url, registry, _config) = spawn_server(config).await;

    let ws = connect(&url).await;
    let (mut tx, mut rx) = ws.split();
    let _ = recv_text(&mut rx).await;
    let _ = recv_text(&mut rx).await;
    let _ = recv_text(&mut rx).await;
    tx.send(Message::Text("{}".into())).await.unwrap();

    loop {
        match timeout(RECV_TIMEOUT, rx.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(_))) => continue,
            other => panic!("unexpected: {other:?}"),
        }
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(registry.is_shutting_down());
}

#[tokio::test]
async fn max_clients_rejects_connections_past_the_limit() {
    let mut config = base_config(vec!["/bin/cat"]);
    config.max_clients = 1;
    let (url, registry, _config) = spawn_server(config).await;

    let _first = connect(&url).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.count(), 1);

    // The second connection's HTTP upgrade should be rejected (503) rather
    // than completing a WebSocket handshake.
    let result = timeout(RECV_TIMEOUT, tokio_tungstenite::connect_async(&url)).await.unwrap();
    assert!(result.is_err(), "second connection should have been refused");
}

#[tokio::test]
async fn resize_then_stty_size_reports_the_new_window() {
    let (url, _registry, _config) = spawn_server(base_config(vec!["/bin/sh", "-c", "sleep 0.2; stty size; sleep 0.2"])).await;
    let ws = connect(&url).await;
    let (mut tx, mut rx) = ws.split();
    let _ = recv_text(&mut rx).await;
    let _ = recv_text(&mut rx).await;
    let _ = recv_text(&mut rx).await;

    tx.send(Message::Text(r#"2{"columns":80,"rows":24}"#.into())).await.unwrap();
    tx.send(Message::Text("{}".into())).await.unwrap();

    let mut decoded = Vec::new();
    loop {
        match timeout(RECV_TIMEOUT, rx.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Some(body) = text.strip_prefix('0') {
                    decoded.extend_from_slice(&BASE64.decode(body).unwrap());
                }
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            other => panic!("unexpected: {other:?}"),
        }
        if String::from_utf8_lossy(&decoded).contains("24 80") {
            break;
        }
    }
    assert!(String::from_utf8_lossy(&decoded).contains("24 80"));
}
