//! Talks to the server with a real WebSocket client implementation.

mod common;

use common::{start_server, wait_for_clients, WAIT};
use futures::{SinkExt, StreamExt};
use peerlink_server::ControlMessage;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn next_message(ws: &mut Client) -> ControlMessage {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return ControlMessage::parse(text.as_bytes()).expect("valid JSON");
        }
    }
}

async fn connect(addr: std::net::SocketAddr) -> (Client, String) {
    let (mut ws, response) = connect_async(format!("ws://{}/signal", addr))
        .await
        .expect("handshake");
    assert_eq!(response.status().as_u16(), 101);

    let welcome = next_message(&mut ws).await;
    assert_eq!(welcome.kind, "welcome");
    let id = welcome.data.unwrap()["id"].as_str().unwrap().to_string();
    (ws, id)
}

#[tokio::test]
async fn test_signaling_between_websocket_clients() {
    let (server, addr) = start_server().await;
    let (mut alice, alice_id) = connect(addr).await;
    let (mut bob, bob_id) = connect(addr).await;
    wait_for_clients(&server, 2).await;

    alice
        .send(Message::Text(
            json!({"type": "offer", "data": {"sdp": "v=0"}}).to_string(),
        ))
        .await
        .unwrap();
    let offer = next_message(&mut bob).await;
    assert_eq!(offer.kind, "offer");
    assert_eq!(offer.from.as_deref(), Some(alice_id.as_str()));

    bob.send(Message::Text(
        json!({"type": "answer", "to": alice_id, "data": {"sdp": "v=0"}}).to_string(),
    ))
    .await
    .unwrap();
    let answer = next_message(&mut alice).await;
    assert_eq!(answer.kind, "answer");
    assert_eq!(answer.from.as_deref(), Some(bob_id.as_str()));

    server.stop().await;
}

#[tokio::test]
async fn test_large_message_uses_extended_lengths() {
    let (server, addr) = start_server().await;
    let (mut alice, _) = connect(addr).await;
    let (mut bob, _) = connect(addr).await;
    wait_for_clients(&server, 2).await;

    let blob = "s".repeat(70_000);
    alice
        .send(Message::Text(json!({"type": "offer", "data": blob}).to_string()))
        .await
        .unwrap();
    let offer = next_message(&mut bob).await;
    assert_eq!(offer.data.unwrap().as_str().unwrap().len(), 70_000);

    server.stop().await;
}

#[tokio::test]
async fn test_client_ping_is_answered() {
    let (server, addr) = start_server().await;
    let (mut alice, _) = connect(addr).await;

    alice.send(Message::Ping(b"hb".to_vec())).await.unwrap();
    let reply = timeout(WAIT, alice.next())
        .await
        .expect("timed out")
        .expect("stream ended")
        .expect("websocket error");
    assert_eq!(reply, Message::Pong(b"hb".to_vec()));

    server.stop().await;
}

#[tokio::test]
async fn test_client_close_unregisters() {
    let (server, addr) = start_server().await;
    let (mut alice, _) = connect(addr).await;
    let (_bob, _) = connect(addr).await;
    wait_for_clients(&server, 2).await;

    let _ = alice.close(None).await;
    wait_for_clients(&server, 1).await;

    server.stop().await;
}

#[tokio::test]
async fn test_subprotocol_negotiation() {
    let (server, addr) = start_server().await;

    let mut request = format!("ws://{}/signal", addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("chat"));
    let (_ws, response) = connect_async(request).await.expect("handshake");
    assert_eq!(
        response.headers().get("Sec-WebSocket-Protocol").unwrap(),
        "chat"
    );

    server.stop().await;
}
