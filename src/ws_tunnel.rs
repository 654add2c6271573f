//! WebSocket tunnel (C6): accept the client upgrade immediately while
//! independently handshaking with the backend as our own WS client, then
//! broker frames bidirectionally per the state machine of spec §4.5/§5.
//!
//! The non-blocking client accept and the `client_stream`/`backend_stream`
//! split-and-forward shape are grounded on `global-proxy`'s
//! `pump_websocket` (a sibling of our teacher under the same monorepo),
//! generalized in two ways: the backend connect runs over our own one-shot
//! [`crate::net::BackendStream`] instead of `tokio-tungstenite`'s bundled
//! connector, so both the HTTP streaming path and the WS tunnel share one
//! TLS trust policy (`crate::tls`); and frames are no longer forwarded by
//! two independent `select!`-raced pump loops but through a single loop
//! with a `pending` buffer, since `global-proxy` connects to the backend
//! before accepting any client frames while this core must accept the
//! client upgrade non-blockingly per spec §4.5. The `pending` buffer itself
//! has no direct precedent in the pack; built from spec §4.5's state
//! machine and §5's single-event-loop-per-tunnel description using the
//! `tokio::select!` idiom the teacher already uses in its own accept loop.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::header::{CONNECTION, HOST, UPGRADE};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::client::Request as WsRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::error::{text_response, ProxyError};
use crate::headers;
use crate::net::{self, BackendStream};
use crate::path;

type CoreBody = BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;
type BackendWs = WebSocketStream<BackendStream>;

/// Lifecycle of one tunnel, per spec §4.5. Advanced only by [`run_tunnel`];
/// exists mainly to make the tunnel's progress legible in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelState {
    Connecting,
    Open,
    Closing,
    Failed,
    Closed,
}

fn box_err(e: impl std::error::Error + Send + Sync + 'static) -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(e)
}

fn upgrade_response_to_core_body(resp: Response<BoxBody<Bytes, Infallible>>) -> Response<CoreBody> {
    let (parts, body) = resp.into_parts();
    Response::from_parts(parts, body.map_err(|never| match never {}).boxed())
}

/// Accept the client's upgrade immediately (returns a 101 without waiting
/// on the backend), then spawn the backend handshake and frame broker as a
/// background task. This is the C6 entry point, called by the C7 dispatcher
/// whenever `dispatcher::is_ws_upgrade` is true.
pub async fn handle(
    cfg: Arc<ProxyConfig>,
    remote_addr: SocketAddr,
    inbound_is_https: bool,
    mut req: Request<Incoming>,
) -> Response<CoreBody> {
    let inbound_host = req.headers().get(HOST).cloned();
    let remote_ip = remote_addr.ip().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());
    let client_headers = req.headers().clone();

    let (response, websocket) = match hyper_tungstenite::upgrade(&mut req, None) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "client did not send a valid websocket upgrade request");
            return text_response(StatusCode::BAD_REQUEST, "Bad Request");
        }
    };

    info!(path = %path, "accepted client websocket upgrade, tunneling to backend");

    tokio::spawn(run_tunnel(
        cfg,
        remote_ip,
        inbound_is_https,
        inbound_host,
        path,
        query,
        client_headers,
        websocket,
    ));

    upgrade_response_to_core_body(response)
}

#[allow(clippy::too_many_arguments)]
async fn run_tunnel(
    cfg: Arc<ProxyConfig>,
    remote_ip: String,
    inbound_is_https: bool,
    inbound_host: Option<HeaderValue>,
    path: String,
    query: Option<String>,
    client_headers: HeaderMap,
    websocket: hyper_tungstenite::HyperWebsocket,
) {
    let client_ws = match websocket.await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "client websocket upgrade future failed");
            return;
        }
    };
    let (mut client_sink, mut client_stream) = client_ws.split();

    let backend_request = match build_backend_request(
        &cfg,
        &client_headers,
        &remote_ip,
        inbound_is_https,
        inbound_host.as_ref(),
        &path,
        query.as_deref(),
    ) {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "failed to build backend websocket request");
            let _ = client_sink.close().await;
            return;
        }
    };

    let mut backend_connect = Box::pin(connect_and_handshake(cfg.clone(), backend_request));
    let mut backend: Option<(SplitSink<BackendWs, Message>, SplitStream<BackendWs>)> = None;
    let mut pending: VecDeque<Message> = VecDeque::new();
    let mut state = TunnelState::Connecting;

    loop {
        tokio::select! {
            res = &mut backend_connect, if backend.is_none() => {
                match res {
                    Ok((mut sink, stream)) => {
                        info!(pending = pending.len(), "backend websocket handshake complete, draining buffered frames");
                        let mut failed = false;
                        while let Some(msg) = pending.pop_front() {
                            if sink.send(msg).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            state = TunnelState::Failed;
                            break;
                        }
                        state = TunnelState::Open;
                        backend = Some((sink, stream));
                    }
                    Err(e) => {
                        warn!(error = %e, "backend websocket handshake failed");
                        state = TunnelState::Failed;
                        break;
                    }
                }
            }

            msg = client_stream.next() => {
                match msg {
                    Some(Ok(msg)) => match backend.as_mut() {
                        Some((sink, _)) => {
                            let is_close = matches!(msg, Message::Close(_));
                            if sink.send(msg).await.is_err() {
                                state = TunnelState::Failed;
                                break;
                            }
                            if is_close {
                                state = TunnelState::Closing;
                                break;
                            }
                        }
                        // AWAITING_101: data frames are buffered for activation to
                        // drain; ping/pong are silently dropped and close
                        // terminates the tunnel immediately, per spec §4.5 — none
                        // of the three wait for the backend handshake to resolve.
                        None => match msg {
                            Message::Ping(_) | Message::Pong(_) => {}
                            Message::Close(_) => {
                                state = TunnelState::Closed;
                                break;
                            }
                            other => pending.push_back(other),
                        },
                    },
                    Some(Err(e)) => {
                        warn!(error = %e, "client websocket stream error");
                        state = TunnelState::Failed;
                        break;
                    }
                    None => {
                        state = TunnelState::Closing;
                        break;
                    }
                }
            }

            msg = next_from_backend(&mut backend), if backend.is_some() => {
                match msg {
                    Some(Ok(msg)) => {
                        let is_close = matches!(msg, Message::Close(_));
                        if client_sink.send(msg).await.is_err() {
                            state = TunnelState::Failed;
                            break;
                        }
                        if is_close {
                            state = TunnelState::Closing;
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "backend websocket stream error");
                        state = TunnelState::Failed;
                        break;
                    }
                    None => {
                        state = TunnelState::Closing;
                        break;
                    }
                }
            }
        }
    }

    info!(?state, "websocket tunnel closing");
    let _ = client_sink.close().await;
    if let Some((mut sink, _)) = backend {
        let _ = sink.close().await;
    }
    state = TunnelState::Closed;
    info!(?state, "websocket tunnel closed");
}

async fn next_from_backend(
    backend: &mut Option<(SplitSink<BackendWs, Message>, SplitStream<BackendWs>)>,
) -> Option<Result<Message, tungstenite::Error>> {
    match backend.as_mut() {
        Some((_, stream)) => stream.next().await,
        None => std::future::pending().await,
    }
}

fn build_backend_request(
    cfg: &ProxyConfig,
    client_headers: &HeaderMap,
    remote_ip: &str,
    inbound_is_https: bool,
    inbound_host: Option<&HeaderValue>,
    path: &str,
    query: Option<&str>,
) -> Result<WsRequest, ProxyError> {
    let rewritten_path = path::rewrite(cfg, path, query);
    let authority = format!("{}:{}", cfg.host, cfg.port);
    let uri = http::Uri::builder()
        .scheme(cfg.ws_scheme_str())
        .authority(authority)
        .path_and_query(rewritten_path)
        .build()
        .map_err(|e| ProxyError::BackendConnect(box_err(e)))?;

    let mut out_headers = headers::prepare_ws_request_headers(
        client_headers.clone(),
        cfg,
        remote_ip,
        inbound_is_https,
        inbound_host,
    );
    out_headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    out_headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    out_headers.insert("sec-websocket-version", HeaderValue::from_static("13"));
    out_headers.insert(
        "sec-websocket-key",
        HeaderValue::from_str(&generate_key()).map_err(|e| ProxyError::BackendConnect(box_err(e)))?,
    );

    let mut request = Request::builder()
        .method(http::Method::GET)
        .uri(uri)
        .version(http::Version::HTTP_11)
        .body(())
        .map_err(|e| ProxyError::BackendConnect(box_err(e)))?;
    *request.headers_mut() = out_headers;
    Ok(request)
}

/// Open a one-shot connection to the backend, bounded by `connect_timeout_ms`
/// (enforced inside [`net::connect_backend`] itself), then perform the WS
/// client handshake and await the backend's 101, bounded separately by
/// `timeout_ms` — the AWAITING_101 wait of spec §4.5/§5(c), distinct from
/// transport establishment.
async fn connect_and_handshake(
    cfg: Arc<ProxyConfig>,
    request: WsRequest,
) -> Result<(SplitSink<BackendWs, Message>, SplitStream<BackendWs>), ProxyError> {
    let stream = net::connect_backend(&cfg).await?;

    let handshake = async {
        let (ws_stream, _response) = tokio_tungstenite::client_async(request, stream)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(resp) => ProxyError::UpgradeRejected(resp.status()),
                other => ProxyError::BackendConnect(box_err(other)),
            })?;
        Ok(ws_stream.split())
    };

    match tokio::time::timeout(cfg.timeout(), handshake).await {
        Err(_) => Err(ProxyError::Timeout(cfg.timeout_ms)),
        Ok(result) => result,
    }
}
