use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use reverse_proxy_core::{HttpPool, ProxyConfig, ProxyOptions, ReverseProxy};
use tokio::net::TcpListener;

/// An upstream that echoes back method, path, and every inbound header as
/// a small text body, plus the request body verbatim on `/echo`. Mirrors
/// the teacher's own `start_upstream_http` test servers.
pub async fn start_upstream_echo() -> SocketAddr {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .unwrap();
    let local = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let method = req.method().clone();
                    let path = req.uri().path().to_string();
                    let headers = req.headers().clone();
                    let body = req.collect().await.map(|c| c.to_bytes()).unwrap_or_default();

                    if path == "/echo" {
                        return Ok::<_, Infallible>(Response::new(Full::new(body)));
                    }
                    if path == "/nonexistent" {
                        return Ok::<_, Infallible>(
                            Response::builder()
                                .status(404)
                                .body(Full::new(Bytes::from("not found")))
                                .unwrap(),
                        );
                    }

                    let mut lines = vec![format!("method:{method}"), format!("path:{path}")];
                    for name in ["x-forwarded-for", "x-forwarded-proto", "x-forwarded-host", "host"] {
                        if let Some(v) = headers.get(name).and_then(|v| v.to_str().ok()) {
                            lines.push(format!("{name}:{v}"));
                        }
                    }
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(lines.join("\n")))))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    local
}

/// Boot a [`ReverseProxy`] behind a real `hyper` HTTP/1 server (with
/// upgrades enabled), the way a host embedding this crate would, and
/// return the address clients should connect to.
pub async fn start_proxy(backend: SocketAddr, configure: impl FnOnce(&mut ProxyOptions)) -> SocketAddr {
    let pool = HttpPool::new(Duration::from_secs(5), reverse_proxy_core::build_client_config(true));
    let mut opts = ProxyOptions::new(pool, format!("http://{backend}"));
    configure(&mut opts);
    let cfg = ProxyConfig::build(opts).unwrap();
    let proxy = ReverseProxy::new(cfg);

    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .unwrap();
    let local = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => break,
            };
            let proxy = proxy.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let proxy = proxy.clone();
                    async move { Ok::<_, Infallible>(proxy.handle(remote_addr, false, req).await) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });
    local
}
