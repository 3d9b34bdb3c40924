//! Just enough HTTP to serve one static index page and gate it behind
//! Basic auth. The actual terminal traffic rides the `/ws` upgrade, handled
//! in [`crate::server`].

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::config::Config;

/// Bound on how much of a request head we'll buffer looking for the
/// terminating blank line; guards against a client that never sends one.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

const EMBEDDED_INDEX: &str = include_str!("../assets/index.html");

#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Parses a request line + headers out of a byte buffer that ends at the
/// blank line (`\r\n\r\n`). Returns `None` on a malformed head.
pub fn parse_head(buf: &[u8]) -> Option<RequestHead> {
    let text = std::str::from_utf8(buf).ok()?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_ascii_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Some(RequestHead { method, path, headers })
}

/// The byte offset just past the first `\r\n\r\n` in `buf`, if present.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

pub fn is_websocket_upgrade(head: &RequestHead) -> bool {
    let upgrade = head.header("upgrade").map(|v| v.eq_ignore_ascii_case("websocket")).unwrap_or(false);
    let connection = head
        .header("connection")
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgrade && connection
}

/// Host-vs-origin check for `--check-origin`: the Origin header's
/// `host:port` (port defaulted from scheme when the Origin omits it) must
/// exactly match the literal Host header, case-insensitively. Ports are
/// never stripped from either side.
pub fn origin_matches_host(head: &RequestHead) -> bool {
    let host = match head.header("host") {
        Some(h) => h,
        None => return false,
    };
    let origin = match head.header("origin") {
        Some(o) => o,
        None => return false,
    };
    match origin_host_port(origin) {
        Some(formatted) => formatted.eq_ignore_ascii_case(host),
        None => false,
    }
}

/// Reconstructs `address:port` from an Origin header value, defaulting the
/// port to 443 for `https`/`wss` and 80 otherwise when the Origin's
/// authority doesn't carry one explicitly.
fn origin_host_port(origin: &str) -> Option<String> {
    let (scheme, rest) = origin.split_once("://").unwrap_or(("http", origin));
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.is_empty() {
        return None;
    }
    if let Some((host, port)) = authority.rsplit_once(':') {
        if !host.is_empty() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
            return Some(format!("{host}:{port}"));
        }
    }
    let default_port = if scheme.eq_ignore_ascii_case("https") || scheme.eq_ignore_ascii_case("wss") {
        443
    } else {
        80
    };
    Some(format!("{authority}:{default_port}"))
}

/// Checks an `Authorization: Basic <token>` header against the already
/// base64-encoded credential stored in [`Config`].
pub fn check_basic_auth(head: &RequestHead, config: &Config) -> bool {
    match &config.credential {
        None => true,
        Some(expected) => match head.header("authorization") {
            Some(value) => match value.strip_prefix("Basic ") {
                Some(token) => token == expected,
                None => false,
            },
            None => false,
        },
    }
}

pub fn render_index(config: &Config) -> std::io::Result<String> {
    match &config.index {
        Some(path) => std::fs::read_to_string(path),
        None => Ok(EMBEDDED_INDEX.to_string()),
    }
}

/// Writes a minimal HTTP/1.1 response with a `Connection: close` header.
pub async fn respond<W: AsyncWrite + Unpin>(
    stream: &mut W,
    status: u16,
    reason: &str,
    content_type: &str,
    body: &[u8],
    extra_headers: &[(&str, &str)],
) -> std::io::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    for (k, v) in extra_headers {
        head.push_str(&format!("{k}: {v}\r\n"));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

pub async fn respond_unauthorized<W: AsyncWrite + Unpin>(stream: &mut W) -> std::io::Result<()> {
    respond(
        stream,
        401,
        "Unauthorized",
        "text/plain",
        b"authentication required",
        &[("WWW-Authenticate", "Basic realm=\"webtty\"")],
    )
    .await
}

pub async fn respond_not_found<W: AsyncWrite + Unpin>(stream: &mut W) -> std::io::Result<()> {
    respond(stream, 404, "Not Found", "text/plain", b"not found", &[]).await
}

pub async fn respond_forbidden<W: AsyncWrite + Unpin>(stream: &mut W) -> std::io::Result<()> {
    respond(stream, 403, "Forbidden", "text/plain", b"forbidden", &[]).await
}

pub async fn respond_service_unavailable<W: AsyncWrite + Unpin>(stream: &mut W) -> std::io::Result<()> {
    respond(stream, 503, "Service Unavailable", "text/plain", b"too many clients", &[]).await
}

pub async fn respond_index<W: AsyncWrite + Unpin>(stream: &mut W, config: &Config) -> std::io::Result<()> {
    let body = render_index(config)?;
    respond(stream, 200, "OK", "text/html; charset=utf-8", body.as_bytes(), &[]).await
}

/// Encodes a `username:password` pair the same way [`Config`] stores a
/// configured credential, for tests that need to build an Authorization header.
#[cfg(test)]
pub fn encode_basic(user_pass: &str) -> String {
    BASE64.encode(user_pass.as_bytes())
}
