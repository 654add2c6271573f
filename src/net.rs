//! One-shot backend transport: a single TCP (or TLS) connection used by the
//! HTTP streaming path (C5 Phase C) and the WebSocket tunnel (C6), as
//! opposed to the pooled buffered-path client (C4). Grounded on the
//! teacher's manual `AsyncRead`/`AsyncWrite` delegation (`BufferedStream`),
//! generalized to a plain-vs-TLS enum instead of a prefix-sniffing buffer.

use std::pin::Pin;
use std::task::{Context, Poll};

use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::ProxyConfig;
use crate::error::ProxyError;

/// A one-shot connection to the backend, plain or TLS depending on
/// `cfg.scheme`. Released (dropped) at the end of whichever phase opened
/// it — never returned to a pool.
pub enum BackendStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_write(cx, data),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BackendStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

fn box_err(e: impl std::error::Error + Send + Sync + 'static) -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(e)
}

/// Open a fresh connection to `cfg`'s backend, honoring
/// `cfg.connect_timeout_ms` for both the TCP connect and (when applicable)
/// the TLS handshake.
pub async fn connect_backend(cfg: &ProxyConfig) -> Result<BackendStream, ProxyError> {
    let addr = format!("{}:{}", cfg.host, cfg.port);
    let tcp = tokio::time::timeout(cfg.connect_timeout(), TcpStream::connect(&addr))
        .await
        .map_err(|_| ProxyError::BackendConnect(format!("connect to {addr} timed out").into()))?
        .map_err(box_err)
        .map_err(ProxyError::BackendConnect)?;
    let _ = tcp.set_nodelay(true);

    if cfg.is_tls() {
        let connector = TlsConnector::from(cfg.tls_config.clone());
        let server_name = ServerName::try_from(cfg.host.clone())
            .map_err(box_err)
            .map_err(ProxyError::BackendConnect)?;
        let tls = tokio::time::timeout(cfg.connect_timeout(), connector.connect(server_name, tcp))
            .await
            .map_err(|_| ProxyError::BackendConnect("tls handshake timed out".into()))?
            .map_err(box_err)
            .map_err(ProxyError::BackendConnect)?;
        Ok(BackendStream::Tls(Box::new(tls)))
    } else {
        Ok(BackendStream::Plain(tcp))
    }
}
