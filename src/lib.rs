//! An embeddable reverse-proxy core: terminates HTTP/1.1, HTTP/2 and
//! WebSocket from clients and re-originates against one configured backend
//! per mount. [`ReverseProxy`] is a `tower::Service`-compatible handler, not
//! a standalone server — the host owns listening, TLS termination, and
//! routing to a mount; this crate owns what happens once a request has
//! been routed to one.
//!
//! A host that already tracks per-connection metadata (remote address,
//! whether the inbound connection is TLS) should insert a [`ConnectionInfo`]
//! extension on the request before calling the [`tower::Service`] impl; the
//! explicit [`ReverseProxy::handle`] method takes the same information as
//! plain arguments for hosts that would rather call it directly from a
//! `hyper::service::service_fn` closure.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::{CONNECTION, UPGRADE};
use http::{Request, Response};
use hyper::body::Incoming;
use tracing::warn;

mod config;
mod error;
mod headers;
mod http_engine;
mod net;
mod path;
mod pool;
mod tls;
mod ws_tunnel;

pub use config::{MaxBodySize, ProtocolSet, ProxyConfig, ProxyOptions, Scheme};
pub use error::{ConfigError, ProxyError};
pub use pool::{HttpPool, PoolHandle};
pub use tls::build_client_config;

pub(crate) type BoxBody = http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Per-connection facts a host stashes on the request (as an extension) so
/// [`ReverseProxy`]'s `tower::Service` impl can reach them without widening
/// `tower::Service`'s single-argument `call`. Mirrors the same shape axum's
/// `ConnectInfo` extractor carries.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub remote_addr: SocketAddr,
    pub is_https: bool,
}

/// One mounted backend. Cheap to clone — internally an `Arc<ProxyConfig>` —
/// so a host can hand a clone to every connection task or `tower::Service`
/// instance that serves this mount.
#[derive(Clone)]
pub struct ReverseProxy {
    cfg: Arc<ProxyConfig>,
}

impl ReverseProxy {
    pub fn new(cfg: ProxyConfig) -> Self {
        Self { cfg: Arc::new(cfg) }
    }

    pub fn from_arc(cfg: Arc<ProxyConfig>) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.cfg
    }

    /// Re-originate or tunnel `req` against this mount's backend, per the
    /// C7 dispatcher: exactly one of the HTTP re-origination engine or the
    /// WebSocket tunnel runs for any given request, never both.
    pub async fn handle(
        &self,
        remote_addr: SocketAddr,
        inbound_is_https: bool,
        req: Request<Incoming>,
    ) -> Response<BoxBody> {
        if is_ws_upgrade(&req) {
            ws_tunnel::handle(self.cfg.clone(), remote_addr, inbound_is_https, req).await
        } else {
            http_engine::handle(&self.cfg, remote_addr, inbound_is_https, req).await
        }
    }
}

/// True exactly for requests this core tunnels as WebSocket (§4.6): some
/// value of `Connection` contains the token `upgrade` AND some value of
/// `Upgrade` equals `websocket`, case-insensitive, per the spec's literal
/// iff — no method gate. Anything else (including other upgrade kinds, e.g.
/// HTTP/2 h2c) is left to HTTP re-origination, which will pass it through
/// and let the backend answer however it sees fit — load-balancing,
/// subprotocol negotiation and raw `CONNECT` tunnelling are non-goals of
/// this core (see spec §1).
fn is_ws_upgrade(req: &Request<Incoming>) -> bool {
    is_ws_upgrade_from_parts(req.headers())
}

fn is_ws_upgrade_from_parts(headers: &http::HeaderMap) -> bool {
    let has_conn_upgrade = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().split(',').any(|tok| tok.trim() == "upgrade"))
        .unwrap_or(false);
    let has_upgrade_hdr = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    has_conn_upgrade && has_upgrade_hdr
}

impl tower::Service<Request<Incoming>> for ReverseProxy {
    type Response = Response<BoxBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response<BoxBody>, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let proxy = self.clone();
        Box::pin(async move {
            let info = req.extensions().get::<ConnectionInfo>().copied().unwrap_or_else(|| {
                warn!("request has no ConnectionInfo extension; defaulting to a zero remote address");
                ConnectionInfo {
                    remote_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
                    is_https: false,
                }
            });
            Ok(proxy.handle(info.remote_addr, info.is_https, req).await)
        })
    }
}
