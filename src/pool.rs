//! The connection pool collaborator (C4). Out of scope per spec §1 beyond
//! the contract the core consumes: "issue one request at a time, keep-alive
//! and HTTP/2 multiplexing handled for us". [`HttpPool`] is a thin,
//! concrete stand-in a host builds once and shares (via [`PoolHandle`])
//! across every [`crate::ReverseProxy`] mount that needs one.
//!
//! Grounded on the teacher's `configure_http_client_builder` (pool sizing,
//! HTTP/2 keepalive interval/timeout), generalized to route through an
//! `HttpsConnector` so `https`/`wss` backends work on the buffered path.

use std::sync::Arc;
use std::time::Duration;

use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::BoxBody;

const HTTP2_KEEP_ALIVE_INTERVAL_SECS: u64 = 30;
const HTTP2_KEEP_ALIVE_TIMEOUT_SECS: u64 = 10;
const POOL_MAX_IDLE_PER_HOST: usize = 32;

pub type HttpsConnector = hyper_rustls::HttpsConnector<HttpConnector>;

/// Shared pooled HTTP client (C4). One `HttpPool` can back many
/// [`crate::ProxyConfig`] mounts; it is cheap to clone (an `Arc` under the
/// hood via `hyper_util`'s own connection pool).
#[derive(Clone)]
pub struct HttpPool {
    client: Client<HttpsConnector, BoxBody>,
}

pub type PoolHandle = Arc<HttpPool>;

impl HttpPool {
    /// Build a pool whose buffered-path connections honor
    /// `connect_timeout` and trust backends per `tls_config`. Build once
    /// per distinct TLS trust policy and share via `Arc`.
    pub fn new(connect_timeout: Duration, tls_config: Arc<rustls::ClientConfig>) -> PoolHandle {
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(connect_timeout));
        http.enforce_http(false);

        let https = HttpsConnectorBuilder::new()
            .with_tls_config((*tls_config).clone())
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let mut builder = Client::builder(TokioExecutor::new());
        builder.pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST);
        builder.http2_keep_alive_interval(Some(Duration::from_secs(
            HTTP2_KEEP_ALIVE_INTERVAL_SECS,
        )));
        builder.http2_keep_alive_timeout(Duration::from_secs(HTTP2_KEEP_ALIVE_TIMEOUT_SECS));
        builder.http2_keep_alive_while_idle(true);

        Arc::new(Self {
            client: builder.build(https),
        })
    }

    pub(crate) fn client(&self) -> &Client<HttpsConnector, BoxBody> {
        &self.client
    }
}
