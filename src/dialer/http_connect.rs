//! HTTP CONNECT tunnel dialer.
//!
//! Emits the exact preamble the reference gateway uses —
//! `CONNECT host:443 HTTP/1.1` with a Basic `Proxy-Authorization` header and
//! `Connection: close` — and discards the proxy's response line up to the
//! blank line terminating the header block before handing the caller a raw
//! tunnel.

use std::net::SocketAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{with_dial_timeout, BoxedStream, Dialer};
use crate::error::{GatewayError, Result};

/// `auth_header` is the already-base64-encoded `user:pass` credential (or
/// empty for an unauthenticated proxy), matching
/// [`crate::proxy::ProxyKind::HttpConnect`]'s stored form.
pub struct HttpConnectDialer {
    pub proxy_addr: SocketAddr,
    pub auth_header: String,
}

impl HttpConnectDialer {
    pub fn from_credentials(proxy_addr: SocketAddr, username: Option<&str>, password: Option<&str>) -> Self {
        let auth_header = match (username, password) {
            (Some(u), Some(p)) => BASE64.encode(format!("{u}:{p}")),
            _ => String::new(),
        };
        HttpConnectDialer { proxy_addr, auth_header }
    }
}

#[async_trait::async_trait]
impl Dialer for HttpConnectDialer {
    async fn dial(&self, target: SocketAddr) -> Result<BoxedStream> {
        let mut stream =
            with_dial_timeout(self.proxy_addr, TcpStream::connect(self.proxy_addr)).await?;
        let host = target.ip();
        let request = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nProxy-Authorization: Basic {auth}\r\nConnection: close\r\n\r\n",
            host = host,
            port = target.port(),
            auth = self.auth_header,
        );
        stream.write_all(request.as_bytes()).await?;
        read_response_headers(&mut stream).await?;
        Ok(Box::pin(stream))
    }
}

/// Reads and validates the proxy's HTTP status line, discarding headers up
/// to the blank line, leaving the stream positioned at the tunneled bytes.
async fn read_response_headers(stream: &mut TcpStream) -> Result<()> {
    let mut buf = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        buf.push(byte[0]);
        if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
            break;
        }
        if buf.len() > 8192 {
            return Err(handshake_error("proxy response headers too large"));
        }
    }
    let text = String::from_utf8_lossy(&buf);
    let status_line = text.lines().next().unwrap_or("");
    let status_code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok());
    match status_code {
        Some(200..=299) => Ok(()),
        Some(code) => Err(handshake_error(&format!("proxy returned status {code}"))),
        None => Err(handshake_error("malformed proxy status line")),
    }
}

fn handshake_error(detail: &str) -> GatewayError {
    GatewayError::ProxyHandshakeFailed {
        kind: "http-connect",
        detail: detail.to_string(),
    }
}

/// Rewrites a plain-HTTP request line to the absolute-URI form a forward
/// proxy expects, and injects a `Proxy-Authorization` header — the
/// byte-level wire patch applied to plaintext (port-80) flows sent through
/// an HTTP proxy, as opposed to the CONNECT tunnel used for port 443.
pub fn patch_plain_http_request(request: &[u8], host: &str, auth_header: &str) -> Vec<u8> {
    let text = String::from_utf8_lossy(request);
    let Some(first_line_end) = text.find("\r\n") else {
        return request.to_vec();
    };
    let first_line = &text[..first_line_end];
    let mut parts = first_line.splitn(3, ' ');
    let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return request.to_vec();
    };

    let absolute_uri = if path.starts_with("http://") {
        path.to_string()
    } else {
        format!("http://{host}{path}")
    };
    let new_first_line = format!("{method} {absolute_uri} {version}");
    let auth_field = format!("Proxy-Authorization: Basic {auth_header}\r\n");

    let mut out = Vec::with_capacity(request.len() + auth_field.len());
    out.extend_from_slice(new_first_line.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(auth_field.as_bytes());
    out.extend_from_slice(text[first_line_end + 2..].as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patches_relative_path_to_absolute_uri() {
        let request = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let patched = patch_plain_http_request(request, "example.com", "dG9rZW4=");
        let text = String::from_utf8(patched).unwrap();
        assert!(text.starts_with("GET http://example.com/index.html HTTP/1.1\r\n"));
        assert!(text.contains("Proxy-Authorization: Basic dG9rZW4=\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
    }

    #[test]
    fn leaves_already_absolute_uri_untouched() {
        let request = b"GET http://example.com/a HTTP/1.1\r\n\r\n";
        let patched = patch_plain_http_request(request, "example.com", "x");
        let text = String::from_utf8(patched).unwrap();
        assert!(text.starts_with("GET http://example.com/a HTTP/1.1\r\n"));
    }
}
