//! SOCKS5 dialer: greeting, optional username/password auth, CONNECT.
//!
//! Wire format grounded directly in the reference client's request/reply
//! framing (version byte, method negotiation, IPv4-host CONNECT, a single
//! reply byte to check against `SUCCEEDED`).

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{with_dial_timeout, BoxedStream, Dialer};
use crate::error::{GatewayError, Result};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

pub struct Socks5Dialer {
    pub proxy_addr: SocketAddr,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[async_trait::async_trait]
impl Dialer for Socks5Dialer {
    async fn dial(&self, target: SocketAddr) -> Result<BoxedStream> {
        let mut stream =
            with_dial_timeout(self.proxy_addr, TcpStream::connect(self.proxy_addr)).await?;
        self.greet(&mut stream).await?;
        self.connect(&mut stream, target).await?;
        Ok(Box::pin(stream))
    }
}

impl Socks5Dialer {
    async fn greet(&self, stream: &mut TcpStream) -> Result<()> {
        let methods: &[u8] = if self.username.is_some() {
            &[METHOD_NO_AUTH, METHOD_USER_PASS]
        } else {
            &[METHOD_NO_AUTH]
        };
        let mut req = vec![SOCKS_VERSION, methods.len() as u8];
        req.extend_from_slice(methods);
        stream.write_all(&req).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[0] != SOCKS_VERSION {
            return Err(handshake_error("unexpected SOCKS version in greeting reply"));
        }
        match reply[1] {
            METHOD_NO_AUTH => Ok(()),
            METHOD_USER_PASS => self.authenticate(stream).await,
            METHOD_NONE_ACCEPTABLE => Err(handshake_error("no acceptable auth method")),
            other => Err(handshake_error(&format!("unsupported auth method {other}"))),
        }
    }

    async fn authenticate(&self, stream: &mut TcpStream) -> Result<()> {
        let username = self.username.as_deref().unwrap_or("");
        let password = self.password.as_deref().unwrap_or("");
        let mut req = vec![0x01, username.len() as u8];
        req.extend_from_slice(username.as_bytes());
        req.push(password.len() as u8);
        req.extend_from_slice(password.as_bytes());
        stream.write_all(&req).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[1] != 0x00 {
            return Err(handshake_error("SOCKS5 username/password auth rejected"));
        }
        Ok(())
    }

    async fn connect(&self, stream: &mut TcpStream, target: SocketAddr) -> Result<()> {
        let mut req = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
        match target {
            SocketAddr::V4(v4) => {
                req.push(ATYP_IPV4);
                req.extend_from_slice(&v4.ip().octets());
            }
            SocketAddr::V6(v6) => {
                req.push(ATYP_IPV6);
                req.extend_from_slice(&v6.ip().octets());
            }
        }
        req.extend_from_slice(&target.port().to_be_bytes());
        stream.write_all(&req).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(handshake_error("unexpected SOCKS version in CONNECT reply"));
        }
        let rep = head[1];

        // drain the bound-address field so the stream is left positioned
        // at the start of the tunneled data.
        match head[3] {
            ATYP_IPV4 => {
                let mut rest = [0u8; 4 + 2];
                stream.read_exact(&mut rest).await?;
            }
            ATYP_IPV6 => {
                let mut rest = [0u8; 16 + 2];
                stream.read_exact(&mut rest).await?;
            }
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut rest = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut rest).await?;
            }
            other => return Err(handshake_error(&format!("unsupported ATYP {other} in reply"))),
        }

        if rep != REPLY_SUCCEEDED {
            return Err(handshake_error(&format!(
                "SOCKS5 CONNECT failed with reply code {rep}"
            )));
        }
        Ok(())
    }
}

fn handshake_error(detail: &str) -> GatewayError {
    GatewayError::ProxyHandshakeFailed {
        kind: "socks5",
        detail: detail.to_string(),
    }
}
