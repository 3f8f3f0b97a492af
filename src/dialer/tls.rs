//! TLS-wrapped dialer: TCP dial to a fixed upstream, then a TLS handshake
//! using the platform-ish default root store (`webpki-roots`).

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::{with_dial_timeout, BoxedStream, Dialer};
use crate::error::{GatewayError, Result};

pub struct TlsDialer {
    pub proxy_addr: SocketAddr,
    pub sni_hostname: String,
    connector: TlsConnector,
}

impl TlsDialer {
    pub fn new(proxy_addr: SocketAddr, sni_hostname: String) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        TlsDialer {
            proxy_addr,
            sni_hostname,
            connector: TlsConnector::from(Arc::new(config)),
        }
    }
}

#[async_trait::async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, _target: SocketAddr) -> Result<BoxedStream> {
        let tcp = with_dial_timeout(self.proxy_addr, TcpStream::connect(self.proxy_addr)).await?;
        let server_name = ServerName::try_from(self.sni_hostname.clone()).map_err(|_| {
            GatewayError::ProxyHandshakeFailed {
                kind: "tls",
                detail: format!("invalid SNI hostname {}", self.sni_hostname),
            }
        })?;
        let tls = with_dial_timeout(
            self.proxy_addr,
            self.connector.connect(server_name, tcp),
        )
        .await
        .map_err(|e| match e {
            GatewayError::UpstreamUnreachable { target, cause } => {
                GatewayError::ProxyHandshakeFailed {
                    kind: "tls",
                    detail: match cause {
                        Some(io) => format!("handshake with {target} failed: {io}"),
                        None => format!("handshake with {target} timed out"),
                    },
                }
            }
            other => other,
        })?;
        Ok(Box::pin(tls))
    }
}
