//! Accepts connections, performs the HTTP/WebSocket routing in front of
//! `/ws`, and hands upgraded sockets off to [`crate::session::run`].

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{Context as _, Result};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpListener;
use tokio_rustls::rustls::{self, pki_types::PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::{BindTarget, Config};
use crate::http::{
    self, check_basic_auth, find_head_end, is_websocket_upgrade, origin_matches_host, parse_head,
    respond_forbidden, respond_index, respond_not_found, respond_service_unavailable,
    respond_unauthorized, MAX_HEAD_BYTES,
};
use crate::protocol::{WS_PATH, WS_SUBPROTOCOL};
use crate::registry::Registry;
use crate::session::{self, MAX_MESSAGE_BYTES};

/// Wraps a stream with bytes already consumed off the wire (the request
/// head, peeked while routing), so the WebSocket handshake reader sees the
/// same bytes it would have seen had it read the socket itself.
struct Prefixed<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Prefixed<S> {
    fn new(inner: S, prefix: Vec<u8>) -> Self {
        Self { prefix, pos: 0, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = self.prefix.len() - self.pos;
            let n = remaining.min(buf.remaining());
            let start = self.pos;
            buf.put_slice(&self.prefix[start..start + n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Binds per `config.bind`, optionally wraps incoming connections in TLS,
/// and dispatches each to [`handle_stream`] on its own task.
pub async fn run(config: Arc<Config>, registry: Arc<Registry>) -> Result<()> {
    let tls_acceptor = match &config.tls {
        Some(tls) => Some(build_tls_acceptor(tls)?),
        None => None,
    };

    let result = match &config.bind {
        BindTarget::Tcp { iface, port } => {
            let addr = format!("{}:{}", iface.clone().unwrap_or_else(|| "0.0.0.0".into()), port);
            let listener = TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;
            info!(%addr, "listening");
            drop_privileges(&config)?;
            serve_tcp(listener, tls_acceptor, config, registry).await
        }
        BindTarget::UnixSocket(path) => {
            if path.exists() {
                std::fs::remove_file(path).ok();
            }
            let listener = tokio::net::UnixListener::bind(path)
                .with_context(|| format!("binding unix socket {}", path.display()))?;
            info!(path = %path.display(), "listening on unix socket");
            drop_privileges(&config)?;
            accept_unix_loop(listener, config, registry).await
        }
    };
    result
}

/// Drives the accept loop over an already-bound listener. Split out from
/// [`run`] so tests can bind an ephemeral port, read back its address, and
/// hand the listener here directly.
pub async fn serve_tcp(
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    config: Arc<Config>,
    registry: Arc<Registry>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = registry.shutdown_notify.notified() => {
                info!("shutdown signal received, no longer accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => { warn!("accept failed: {e}"); continue; }
                };
                let config = config.clone();
                let registry = registry.clone();
                let tls_acceptor = tls_acceptor.clone();
                tokio::spawn(async move {
                    match tls_acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => handle_stream(tls_stream, peer.to_string(), config, registry).await,
                            Err(e) => warn!("TLS handshake failed: {e}"),
                        },
                        None => handle_stream(stream, peer.to_string(), config, registry).await,
                    }
                });
            }
        }
    }
}

async fn accept_unix_loop(listener: tokio::net::UnixListener, config: Arc<Config>, registry: Arc<Registry>) -> Result<()> {
    loop {
        tokio::select! {
            _ = registry.shutdown_notify.notified() => {
                if let BindTarget::UnixSocket(path) = &config.bind {
                    std::fs::remove_file(path).ok();
                }
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => { warn!("accept failed: {e}"); continue; }
                };
                let config = config.clone();
                let registry = registry.clone();
                tokio::spawn(handle_stream(stream, "unix-socket".to_string(), config, registry));
            }
        }
    }
}

/// Reads the request head (method/path/headers), then either upgrades to a
/// WebSocket on `/ws` or serves the embedded index page over plain HTTP.
async fn handle_stream<S>(mut stream: S, peer_addr: String, config: Arc<Config>, registry: Arc<Registry>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (prefix, head) = match read_head(&mut stream).await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(%peer_addr, "failed to read request head: {e}");
            return;
        }
    };

    if head.path == WS_PATH && is_websocket_upgrade(&head) {
        if let Err(reason) = registry.check_admission() {
            debug!(%peer_addr, ?reason, "rejecting connection at admission");
            let _ = respond_service_unavailable(&mut stream).await;
            return;
        }
        if config.check_origin && !origin_matches_host(&head) {
            warn!(%peer_addr, "origin check failed");
            let _ = respond_forbidden(&mut stream).await;
            return;
        }

        let hostname = head.header("host").unwrap_or("localhost").to_string();
        let wrapped = Prefixed::new(stream, prefix);
        let ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig {
            max_message_size: Some(MAX_MESSAGE_BYTES),
            ..Default::default()
        };
        match tokio_tungstenite::accept_hdr_async_with_config(wrapped, negotiate_subprotocol, Some(ws_config)).await {
            Ok(ws) => session::run(ws, config, registry, peer_addr, hostname).await,
            Err(e) => warn!(%peer_addr, "WS handshake failed: {e}"),
        }
        return;
    }

    if head.method == "GET" {
        if !check_basic_auth(&head, &config) {
            let _ = respond_unauthorized(&mut stream).await;
            return;
        }
        if head.path == "/" {
            if let Err(e) = respond_index(&mut stream, &config).await {
                warn!("failed to serve index: {e}");
            }
        } else {
            let _ = respond_not_found(&mut stream).await;
        }
        return;
    }

    let _ = http::respond(&mut stream, 400, "Bad Request", "text/plain", b"bad request", &[]).await;
}

/// Reads bytes until the request head's terminating blank line is seen (or
/// the size cap is hit), consuming exactly that many bytes from `stream`.
/// The consumed bytes are returned alongside the parsed head so the caller
/// can replay them to whatever reads the stream next.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<(Vec<u8>, crate::http::RequestHead)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed before request head"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            let head = parse_head(&buf[..end])
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed request head"))?;
            return Ok((buf, head));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "request head too large"));
        }
    }
}

/// Advertises the `tty` subprotocol on every upgrade response, matching the
/// wire protocol's `Sec-WebSocket-Protocol: tty` requirement.
fn negotiate_subprotocol(
    _request: &tokio_tungstenite::tungstenite::handshake::server::Request,
    mut response: tokio_tungstenite::tungstenite::handshake::server::Response,
) -> Result<
    tokio_tungstenite::tungstenite::handshake::server::Response,
    tokio_tungstenite::tungstenite::handshake::server::ErrorResponse,
> {
    response.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        WS_SUBPROTOCOL.parse().expect("static subprotocol name is a valid header value"),
    );
    Ok(response)
}

/// Drops to the configured gid/uid right after the listening socket is
/// bound, matching the original's privilege-drop-after-bind ordering
/// (group before user, since dropping uid first would forfeit the
/// permission to change gid).
fn drop_privileges(config: &Config) -> Result<()> {
    if let Some(gid) = config.gid {
        nix::unistd::setgid(nix::unistd::Gid::from_raw(gid))
            .with_context(|| format!("dropping to gid {gid}"))?;
        info!(gid, "dropped group privileges");
    }
    if let Some(uid) = config.uid {
        nix::unistd::setuid(nix::unistd::Uid::from_raw(uid))
            .with_context(|| format!("dropping to uid {uid}"))?;
        info!(uid, "dropped user privileges");
    }
    Ok(())
}

fn build_tls_acceptor(tls: &crate::config::TlsConfig) -> Result<TlsAcceptor> {
    let cert_bytes = std::fs::read(&tls.cert_path).with_context(|| format!("reading {}", tls.cert_path.display()))?;
    let key_bytes = std::fs::read(&tls.key_path).with_context(|| format!("reading {}", tls.key_path.display()))?;

    let cert_chain = certs(&mut cert_bytes.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parsing TLS certificate chain")?;
    let mut keys = pkcs8_private_keys(&mut key_bytes.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parsing TLS private key")?;
    let key = keys.pop().context("no private key found in --ssl-key file")?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, PrivateKeyDer::Pkcs8(key))
        .context("building TLS server config")?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_head_parses_a_simple_get() {
        let payload = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec();
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&payload).await.unwrap();

        let (prefix, head) = read_head(&mut server).await.unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/");
        assert_eq!(prefix, payload);
    }
}
