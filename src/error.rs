//! Error taxonomy for the proxy core.
//!
//! `ConfigError` is mount-time only and fatal (the mount simply fails);
//! `ProxyError` is per-request and is always converted to a response via
//! [`ProxyError::into_response`] rather than ever propagating out of
//! [`crate::ReverseProxy::handle`].

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::{BodyExt, Full};
use std::convert::Infallible;

use crate::config::ProxyConfig;
use crate::BoxBody;

/// Raised while building a [`ProxyConfig`](crate::config::ProxyConfig) from
/// an options bag. Fatal at mount time; the host must not serve requests
/// through a mount whose config failed to build.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("backend url is required")]
    MissingBackend,
    #[error("invalid backend url {0:?}: {1}")]
    InvalidUrl(String, String),
    #[error("backend url {0:?} has no scheme")]
    MissingScheme(String),
    #[error("unsupported backend scheme {0:?} (expected http, https, ws or wss)")]
    UnsupportedScheme(String),
    #[error("backend url {0:?} has no host")]
    MissingHost(String),
}

/// Per-request failure kinds, per spec §7. Every variant maps to exactly
/// one wire outcome through [`ProxyError::into_response`].
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to read client request body: {0}")]
    ClientBodyRead(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("request body exceeds configured limit")]
    BodyTooLarge,

    #[error("failed to connect to backend: {0}")]
    BackendConnect(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to send request to backend: {0}")]
    BackendRequest(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to read response from backend: {0}")]
    BackendResponse(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("backend rejected websocket upgrade with status {0}")]
    UpgradeRejected(StatusCode),

    #[error("websocket tunnel io error: {0}")]
    TunnelIo(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub(crate) fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(
            Full::new(body.into())
                .map_err(|never: Infallible| match never {})
                .boxed(),
        )
        .expect("static response is always well-formed")
}

impl ProxyError {
    /// Map this error to the response the client sees, consulting
    /// `cfg.error_response` for the generic-failure cases. The 400/413
    /// cases are fixed per spec §6 and never consult `error_response`.
    pub fn into_response(&self, cfg: &ProxyConfig) -> Response<BoxBody> {
        match self {
            ProxyError::ClientBodyRead(_) => {
                text_response(StatusCode::BAD_REQUEST, "Bad Request")
            }
            ProxyError::BodyTooLarge => {
                text_response(StatusCode::PAYLOAD_TOO_LARGE, "Request Entity Too Large")
            }
            ProxyError::BackendConnect(e) => self.generic(cfg, format!("connect failed: {e}")),
            ProxyError::BackendRequest(e) => self.generic(cfg, format!("request failed: {e}")),
            ProxyError::BackendResponse(e) => self.generic(cfg, format!("response failed: {e}")),
            ProxyError::Timeout(ms) => self.generic(cfg, format!("timed out after {ms}ms")),
            ProxyError::UpgradeRejected(status) => {
                self.generic(cfg, format!("upgrade rejected with status {status}"))
            }
            ProxyError::TunnelIo(e) => self.generic(cfg, format!("tunnel error: {e}")),
        }
    }

    fn generic(&self, cfg: &ProxyConfig, detail: String) -> Response<BoxBody> {
        let (status, reason) = &cfg.error_response;
        text_response(*status, format!("{reason}: {detail}"))
    }
}
