//! HTTP re-origination engine (C5): header/path rewrite plus the
//! body-size-gated buffered-vs-streaming dispatch of spec §4.4.
//!
//! The buffered path is grounded on the teacher's `handle_http` (pooled
//! client, whole-body request/response). The streaming path is grounded on
//! `portless-rs`'s one-shot `hyper::client::conn::http1::handshake` usage,
//! generalized to carry the bytes Phase A already read as the first chunk
//! of the streamed body — no re-read of the client body, no data loss.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, StreamExt};
use http::{Request, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper_util::rt::TokioIo;
use tracing::{info, warn};

use crate::config::{MaxBodySize, ProxyConfig};
use crate::error::ProxyError;
use crate::headers;
use crate::net;
use crate::path;

fn box_body_err(e: impl std::error::Error + Send + Sync + 'static) -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(e)
}

fn full_body(bytes: Bytes) -> BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>> {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Buffer the inbound body up to `cfg.max_body_size`. Returns the bytes read
/// so far and, when the limit is finite and was exceeded, the remaining
/// body so the caller can fall through to the streaming path with no bytes
/// re-read (spec §4.4 Phase A).
async fn buffer_body(
    mut body: Incoming,
    limit: MaxBodySize,
) -> Result<(BytesMut, Option<Incoming>), ProxyError> {
    let cap = match limit {
        MaxBodySize::Limited(n) => Some(n),
        MaxBodySize::Unlimited => None,
    };
    let mut buf = BytesMut::new();

    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    buf.extend_from_slice(&data);
                    if let Some(cap) = cap {
                        if buf.len() as u64 > cap {
                            return Ok((buf, Some(body)));
                        }
                    }
                }
            }
            Some(Err(e)) => return Err(ProxyError::ClientBodyRead(box_body_err(e))),
            None => return Ok((buf, None)),
        }
    }
}

/// Build a request body that yields `first_chunk` before forwarding the
/// remainder of `rest` frame by frame, so the streaming path never re-reads
/// what Phase A already consumed.
fn chained_request_body(
    first_chunk: Bytes,
    rest: Incoming,
) -> BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>> {
    let head = if first_chunk.is_empty() {
        None
    } else {
        Some(Ok(Frame::data(first_chunk)))
    };
    let tail = stream::unfold(rest, |mut body| async move {
        match body.frame().await {
            Some(Ok(frame)) => Some((Ok(frame), body)),
            Some(Err(e)) => Some((Err(box_body_err(e)), body)),
            None => None,
        }
    });
    StreamBody::new(stream::iter(head).chain(tail)).boxed()
}

struct RewriteOutcome {
    request: Request<()>,
}

fn rewrite_request_head(
    cfg: &ProxyConfig,
    parts: &http::request::Parts,
    remote_addr: SocketAddr,
    inbound_is_https: bool,
) -> RewriteOutcome {
    let inbound_host = parts.headers.get(http::header::HOST).cloned();
    let remote_ip = remote_addr.ip().to_string();
    let rewritten_path = path::rewrite(cfg, parts.uri.path(), parts.uri.query());

    let authority = format!("{}:{}", cfg.host, cfg.port);
    let uri = http::Uri::builder()
        .scheme(cfg.http_scheme_str())
        .authority(authority)
        .path_and_query(rewritten_path)
        .build()
        .expect("scheme/authority/path are all already validated");

    let out_headers = headers::prepare_http_request_headers(
        parts.headers.clone(),
        cfg,
        &remote_ip,
        inbound_is_https,
        inbound_host.as_ref(),
    );

    let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
    if cfg.protocols.http2 && !cfg.protocols.http1 {
        builder = builder.version(http::Version::HTTP_2);
    } else {
        builder = builder.version(http::Version::HTTP_11);
    }
    let mut request = builder
        .body(())
        .expect("method/uri/version are all already validated");
    *request.headers_mut() = out_headers;

    RewriteOutcome { request }
}

fn incoming_response_to_box(resp: Response<Incoming>) -> Response<BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>> {
    let (mut parts, body) = resp.into_parts();
    parts.headers = headers::prepare_response_headers(parts.headers);
    Response::from_parts(parts, body.map_err(box_body_err).boxed())
}

/// Yield `body`'s frames until EOF, error, or `deadline`, whichever comes
/// first. A frame read that times out ends the stream with an error,
/// truncating the response the client sees — the single wall-clock budget
/// of §4.4 Phase C covers the whole streaming phase, not just the time to
/// the first response byte, so a backend that free-wheels its body past
/// `timeout_ms` gets cut off rather than held open indefinitely.
fn timed_response_body(
    body: Incoming,
    deadline: tokio::time::Instant,
) -> BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>> {
    let stream = stream::unfold(Some((body, deadline)), |state| async move {
        let (mut body, deadline) = state?;
        match tokio::time::timeout_at(deadline, body.frame()).await {
            Ok(Some(Ok(frame))) => Some((Ok(frame), Some((body, deadline)))),
            Ok(Some(Err(e))) => Some((Err(box_body_err(e)), None)),
            Ok(None) => None,
            Err(_) => Some((
                Err(box_body_err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "streaming response exceeded timeout_ms",
                ))),
                None,
            )),
        }
    });
    StreamBody::new(stream).boxed()
}

fn incoming_response_to_box_with_deadline(
    resp: Response<Incoming>,
    deadline: tokio::time::Instant,
) -> Response<BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>> {
    let (mut parts, body) = resp.into_parts();
    parts.headers = headers::prepare_response_headers(parts.headers);
    Response::from_parts(parts, timed_response_body(body, deadline))
}

/// Phase B: submit over the pooled client, honoring `timeout_ms` as the
/// whole request/response budget.
async fn run_buffered(
    cfg: &ProxyConfig,
    head: Request<()>,
    body: Bytes,
) -> Result<Response<BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>>, ProxyError> {
    let (parts, _) = head.into_parts();
    let request = Request::from_parts(parts, full_body(body));

    let outcome = tokio::time::timeout(cfg.timeout(), cfg.pool.client().request(request)).await;
    match outcome {
        Err(_) => Err(ProxyError::Timeout(cfg.timeout_ms)),
        Ok(Err(e)) => Err(ProxyError::BackendRequest(box_body_err(e))),
        Ok(Ok(resp)) => Ok(incoming_response_to_box(resp)),
    }
}

/// Phase C: a one-shot connection. A single wall-clock deadline, struck
/// once at the top of this phase, bounds connect + request send + response
/// headers *and* response body forwarding (§4.4, §5(b)) — the connect step
/// is additionally bounded by `connect_timeout_ms` inside
/// [`net::connect_backend`], which is always the tighter of the two.
async fn run_streaming(
    cfg: &ProxyConfig,
    head: Request<()>,
    first_chunk: Bytes,
    rest: Incoming,
) -> Result<Response<BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>>, ProxyError> {
    let deadline = tokio::time::Instant::now() + cfg.timeout();

    let fut = async {
        let stream = net::connect_backend(cfg).await?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ProxyError::BackendConnect(box_body_err(e)))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!(error = %e, "streaming backend connection ended with error");
            }
        });

        let (parts, _) = head.into_parts();
        let request = Request::from_parts(parts, chained_request_body(first_chunk, rest));

        let resp = sender
            .send_request(request)
            .await
            .map_err(|e| ProxyError::BackendRequest(box_body_err(e)))?;
        Ok(incoming_response_to_box_with_deadline(resp, deadline))
    };

    match tokio::time::timeout_at(deadline, fut).await {
        Err(_) => Err(ProxyError::Timeout(cfg.timeout_ms)),
        Ok(result) => result,
    }
}

/// Re-originate an inbound HTTP request against `cfg`'s backend (C5 entry
/// point, called by the C7 dispatcher for every non-WebSocket request).
pub async fn handle(
    cfg: &ProxyConfig,
    remote_addr: SocketAddr,
    inbound_is_https: bool,
    req: Request<Incoming>,
) -> Response<BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>> {
    let (parts, body) = req.into_parts();

    match buffer_body(body, cfg.max_body_size).await {
        Err(e) => e.into_response(cfg),
        Ok((buf, None)) => {
            let outcome = rewrite_request_head(cfg, &parts, remote_addr, inbound_is_https);
            info!(
                method = %parts.method,
                path = %parts.uri.path(),
                body_bytes = buf.len(),
                "http re-origination (buffered)"
            );
            match run_buffered(cfg, outcome.request, buf.freeze()).await {
                Ok(resp) => resp,
                Err(e) => e.into_response(cfg),
            }
        }
        Ok((buf, Some(rest))) => {
            let outcome = rewrite_request_head(cfg, &parts, remote_addr, inbound_is_https);
            info!(
                method = %parts.method,
                path = %parts.uri.path(),
                buffered_bytes = buf.len(),
                "http re-origination (streaming, body exceeds max_body_size)"
            );
            match run_streaming(cfg, outcome.request, buf.freeze(), rest).await {
                Ok(resp) => resp,
                Err(e) => e.into_response(cfg),
            }
        }
    }
}
