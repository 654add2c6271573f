//! Mount-time configuration (C1). Parses and validates an options bag into
//! an immutable [`ProxyConfig`]; once built, a `ProxyConfig` is never
//! mutated — every behavior downstream is a pure function of it plus the
//! inbound request, per spec §3.

use std::sync::Arc;
use std::time::Duration;

use http::{HeaderName, HeaderValue, StatusCode};

use crate::error::ConfigError;
use crate::pool::PoolHandle;
use crate::tls;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_BODY_SIZE: u64 = 10 * 1024 * 1024;

/// Backend URL scheme. `Ws`/`Wss` and `Http`/`Https` share the same
/// host/port; which one applies to a given outbound connection depends on
/// whether it's a plain HTTP call or a WebSocket tunnel, not on this field
/// alone — see [`ProxyConfig::is_tls`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl Scheme {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            "ws" => Some(Scheme::Ws),
            "wss" => Some(Scheme::Wss),
            _ => None,
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Scheme::Http | Scheme::Ws => 80,
            Scheme::Https | Scheme::Wss => 443,
        }
    }

    fn is_tls(self) -> bool {
        matches!(self, Scheme::Https | Scheme::Wss)
    }
}

/// Which HTTP protocol versions are negotiated against the backend on the
/// buffered path. Both by default; restricting to one disables the
/// pooled client's ALPN negotiation of the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSet {
    pub http1: bool,
    pub http2: bool,
}

impl Default for ProtocolSet {
    fn default() -> Self {
        Self {
            http1: true,
            http2: true,
        }
    }
}

/// `max_body_size`: either a byte ceiling or explicitly unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxBodySize {
    Limited(u64),
    Unlimited,
}

impl Default for MaxBodySize {
    fn default() -> Self {
        MaxBodySize::Limited(DEFAULT_MAX_BODY_SIZE)
    }
}

/// The options bag a host passes to [`ProxyConfig::build`]. Only
/// `pool` and `backend` are required; everything else defaults per spec §3.
#[derive(Clone)]
pub struct ProxyOptions {
    pub pool: PoolHandle,
    pub backend: String,
    pub strip_path: Option<String>,
    pub timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub protocols: Option<ProtocolSet>,
    pub verify_tls: Option<bool>,
    pub add_headers: Vec<(String, String)>,
    pub remove_headers: Vec<String>,
    pub max_body_size: Option<MaxBodySize>,
    pub error_response: Option<(StatusCode, String)>,
}

impl ProxyOptions {
    /// Minimal valid options: just the required pool and backend.
    pub fn new(pool: PoolHandle, backend: impl Into<String>) -> Self {
        Self {
            pool,
            backend: backend.into(),
            strip_path: None,
            timeout_ms: None,
            connect_timeout_ms: None,
            protocols: None,
            verify_tls: None,
            add_headers: Vec::new(),
            remove_headers: Vec::new(),
            max_body_size: None,
            error_response: None,
        }
    }
}

fn normalize_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Immutable, mount-time-built proxy configuration (C1). Shared read-only
/// (`Arc<ProxyConfig>`) across every request the mount serves.
pub struct ProxyConfig {
    pub pool: PoolHandle,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path_prefix: Option<String>,
    pub strip_path: Option<String>,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub protocols: ProtocolSet,
    pub verify_tls: bool,
    pub add_headers: Vec<(HeaderName, HeaderValue)>,
    pub remove_headers: Vec<HeaderName>,
    pub max_body_size: MaxBodySize,
    pub error_response: (StatusCode, String),
    pub(crate) tls_config: Arc<rustls::ClientConfig>,
}

impl ProxyConfig {
    pub fn build(opts: ProxyOptions) -> Result<ProxyConfig, ConfigError> {
        if opts.backend.trim().is_empty() {
            return Err(ConfigError::MissingBackend);
        }

        let uri: http::Uri = opts
            .backend
            .parse()
            .map_err(|e: http::uri::InvalidUri| {
                ConfigError::InvalidUrl(opts.backend.clone(), e.to_string())
            })?;

        let scheme_str = uri
            .scheme_str()
            .ok_or_else(|| ConfigError::MissingScheme(opts.backend.clone()))?;
        let scheme = Scheme::parse(&scheme_str.to_ascii_lowercase())
            .ok_or_else(|| ConfigError::UnsupportedScheme(scheme_str.to_string()))?;

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::MissingHost(opts.backend.clone()))?
            .to_string();

        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());

        let path_prefix = uri
            .path_and_query()
            .map(|pq| pq.path())
            .and_then(normalize_path);

        let strip_path = opts.strip_path.as_deref().and_then(normalize_path);

        let verify_tls = opts.verify_tls.unwrap_or(true);
        let tls_config = tls::build_client_config(verify_tls);

        let mut add_headers = Vec::with_capacity(opts.add_headers.len());
        for (name, value) in opts.add_headers {
            let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
                .map_err(|e| ConfigError::InvalidUrl(name.clone(), e.to_string()))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| ConfigError::InvalidUrl(value.clone(), e.to_string()))?;
            add_headers.push((name, value));
        }

        let mut remove_headers = Vec::with_capacity(opts.remove_headers.len());
        for name in opts.remove_headers {
            let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
                .map_err(|e| ConfigError::InvalidUrl(name.clone(), e.to_string()))?;
            remove_headers.push(name);
        }

        Ok(ProxyConfig {
            pool: opts.pool,
            scheme,
            host,
            port,
            path_prefix,
            strip_path,
            timeout_ms: opts.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            connect_timeout_ms: opts.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            protocols: opts.protocols.unwrap_or_default(),
            verify_tls,
            add_headers,
            remove_headers,
            max_body_size: opts.max_body_size.unwrap_or_default(),
            error_response: opts
                .error_response
                .unwrap_or((StatusCode::BAD_GATEWAY, "Bad Gateway".to_string())),
            tls_config,
        })
    }

    pub fn is_tls(&self) -> bool {
        self.scheme.is_tls()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `host[:port]` for the outbound `host` header, per §4.2: the port
    /// suffix is present only when it differs from the scheme default.
    pub fn host_header_value(&self) -> String {
        let default_port = self.scheme.default_port();
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn http_scheme_str(&self) -> &'static str {
        if self.is_tls() {
            "https"
        } else {
            "http"
        }
    }

    pub fn ws_scheme_str(&self) -> &'static str {
        if self.is_tls() {
            "wss"
        } else {
            "ws"
        }
    }
}
