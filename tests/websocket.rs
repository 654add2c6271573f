mod common;

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use common::start_proxy;

/// An upstream WebSocket server that echoes every frame it receives
/// verbatim, closing cleanly when the client closes.
async fn start_upstream_ws_echo() -> SocketAddr {
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
                let ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let (mut sink, mut stream) = ws.split();
                while let Some(msg) = stream.next().await {
                    let msg = match msg {
                        Ok(m) => m,
                        Err(_) => break,
                    };
                    let is_close = matches!(msg, Message::Close(_));
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                    if is_close {
                        break;
                    }
                }
            });
        }
    });
    local
}

async fn connect_ws(
    proxy_addr: SocketAddr,
    path: &str,
) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let url = format!("ws://{proxy_addr}{path}");
    let (ws, _resp) = timeout(Duration::from_secs(5), tokio_tungstenite::connect_async(url))
        .await
        .unwrap()
        .unwrap();
    ws
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn text_frame_round_trips_through_the_tunnel() {
    let backend = start_upstream_ws_echo().await;
    let proxy_addr = start_proxy(backend, |_| {}).await;
    let mut ws = connect_ws(proxy_addr, "/chat").await;

    ws.send(Message::Text("hello from client".into())).await.unwrap();
    let reply = timeout(Duration::from_secs(5), ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply, Message::Text("hello from client".into()));

    ws.close(None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn binary_frame_round_trips_through_the_tunnel() {
    let backend = start_upstream_ws_echo().await;
    let proxy_addr = start_proxy(backend, |_| {}).await;
    let mut ws = connect_ws(proxy_addr, "/chat").await;

    let payload = vec![0u8, 1, 2, 3, 255, 254, 253];
    ws.send(Message::Binary(payload.clone())).await.unwrap();
    let reply = timeout(Duration::from_secs(5), ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply, Message::Binary(payload));

    ws.close(None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_is_answered_with_pong() {
    let backend = start_upstream_ws_echo().await;
    let proxy_addr = start_proxy(backend, |_| {}).await;
    let mut ws = connect_ws(proxy_addr, "/chat").await;

    // tungstenite auto-answers pings on the client side too, so drive this
    // from the server-echo semantics instead: sending a Ping up the tunnel
    // is echoed back by the upstream as a Ping, which the client transport
    // auto-answers with a Pong that we never see here. Assert instead that a
    // large text payload still survives a full round trip immediately after
    // a ping/pong exchange, proving the tunnel stays open and ordered.
    ws.send(Message::Ping(b"ping-payload".to_vec())).await.unwrap();
    ws.send(Message::Text("after ping".into())).await.unwrap();

    let mut saw_text = false;
    for _ in 0..4 {
        match timeout(Duration::from_secs(5), ws.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => {
                assert_eq!(text, "after ping");
                saw_text = true;
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("unexpected error: {e}"),
            None => break,
        }
    }
    assert!(saw_text, "expected the text frame sent after the ping to come back");

    ws.close(None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_message_round_trips_intact() {
    let backend = start_upstream_ws_echo().await;
    let proxy_addr = start_proxy(backend, |_| {}).await;
    let mut ws = connect_ws(proxy_addr, "/chat").await;

    let big: String = "x".repeat(50_000);
    ws.send(Message::Text(big.clone())).await.unwrap();
    let reply = timeout(Duration::from_secs(5), ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply, Message::Text(big));

    ws.close(None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_tunnels_do_not_cross_talk() {
    let backend = start_upstream_ws_echo().await;
    let proxy_addr = start_proxy(backend, |_| {}).await;

    let mut ws_a = connect_ws(proxy_addr, "/chat").await;
    let mut ws_b = connect_ws(proxy_addr, "/chat").await;

    ws_a.send(Message::Text("from-a".into())).await.unwrap();
    ws_b.send(Message::Text("from-b".into())).await.unwrap();

    let reply_a = timeout(Duration::from_secs(5), ws_a.next()).await.unwrap().unwrap().unwrap();
    let reply_b = timeout(Duration::from_secs(5), ws_b.next()).await.unwrap().unwrap().unwrap();

    assert_eq!(reply_a, Message::Text("from-a".into()));
    assert_eq!(reply_b, Message::Text("from-b".into()));

    ws_a.close(None).await.unwrap();
    ws_b.close(None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn path_prefix_and_strip_path_apply_to_websocket_upgrades_too() {
    let backend = start_upstream_ws_echo().await;
    let proxy_addr = start_proxy(backend, |opts| {
        opts.strip_path = Some("/ws".to_string());
    })
    .await;
    let mut ws = connect_ws(proxy_addr, "/ws/room/42").await;

    ws.send(Message::Text("room traffic".into())).await.unwrap();
    let reply = timeout(Duration::from_secs(5), ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply, Message::Text("room traffic".into()));

    ws.close(None).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_close_propagates_to_backend_and_tunnel_ends() {
    let backend = start_upstream_ws_echo().await;
    let proxy_addr = start_proxy(backend, |_| {}).await;
    let mut ws = connect_ws(proxy_addr, "/chat").await;

    ws.send(Message::Text("last words".into())).await.unwrap();
    let reply = timeout(Duration::from_secs(5), ws.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply, Message::Text("last words".into()));

    ws.close(None).await.unwrap();

    // After close, the stream should terminate (Close frame echo, then None).
    loop {
        match timeout(Duration::from_secs(5), ws.next()).await.unwrap() {
            Some(Ok(Message::Close(_))) => continue,
            Some(Ok(_)) => continue,
            Some(Err(_)) => break,
            None => break,
        }
    }
}
