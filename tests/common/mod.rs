#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use peerlink_server::protocol::frame::apply_mask;
use peerlink_server::protocol::{encode_frame, ControlMessage, Frame, FrameCodec, Opcode};
use peerlink_server::{Server, Settings};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(250);

pub const UPGRADE_REQUEST: &str = "GET /signal HTTP/1.1\r\n\
    Host: 127.0.0.1\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Version: 13\r\n\r\n";

pub async fn start_server() -> (Arc<Server>, SocketAddr) {
    start_server_with(Settings::local_ephemeral()).await
}

pub async fn start_server_with(settings: Settings) -> (Arc<Server>, SocketAddr) {
    let server = Arc::new(Server::new(settings));
    let addr = server.start(0).await.expect("server should bind");
    (server, addr)
}

pub async fn wait_for_clients(server: &Server, expected: usize) {
    timeout(WAIT, async {
        while server.client_count().await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {} clients", expected));
}

/// Client frame masked with a random key.
pub fn masked_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let key: [u8; 4] = rand::random();
    let mut bytes = encode_frame(opcode, payload);
    let header_len = bytes.len() - payload.len();
    bytes[1] |= 0x80;
    let mut body = bytes.split_off(header_len);
    apply_mask(&mut body, key);
    bytes.extend_from_slice(&key);
    bytes.extend(body);
    bytes
}

/// Hand-rolled peer speaking the wire protocol over a plain TCP stream.
pub struct RawClient {
    pub id: String,
    pub stream: TcpStream,
    pending: Vec<u8>,
    codec: FrameCodec,
}

impl RawClient {
    pub async fn open(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        stream.set_nodelay(true).unwrap();
        Self {
            id: String::new(),
            stream,
            pending: Vec::new(),
            codec: FrameCodec::new(1 << 24, false),
        }
    }

    /// Connect, upgrade and consume the welcome message.
    pub async fn connect(addr: SocketAddr) -> Self {
        let mut client = Self::open(addr).await;
        client.write(UPGRADE_REQUEST.as_bytes()).await;
        client.finish_upgrade().await;
        client
    }

    pub async fn finish_upgrade(&mut self) -> String {
        let response = self.read_response().await;
        assert!(
            response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
            "unexpected response: {}",
            response
        );
        let welcome = self.next_message().await;
        assert_eq!(welcome.kind, "welcome");
        assert_eq!(welcome.from.as_deref(), Some("server"));
        self.id = welcome.data.expect("welcome data")["id"]
            .as_str()
            .expect("id string")
            .to_string();
        response
    }

    pub async fn write(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write");
    }

    pub async fn send(&mut self, opcode: Opcode, payload: &[u8]) {
        let frame = masked_frame(opcode, payload);
        self.write(&frame).await;
    }

    pub async fn send_json(&mut self, value: serde_json::Value) {
        self.send(Opcode::Text, value.to_string().as_bytes()).await;
    }

    async fn fill(&mut self) {
        let mut buf = [0u8; 8192];
        let n = timeout(WAIT, self.stream.read(&mut buf))
            .await
            .expect("timed out waiting for server")
            .expect("read");
        assert!(n > 0, "server closed the connection");
        self.pending.extend_from_slice(&buf[..n]);
    }

    async fn read_response(&mut self) -> String {
        loop {
            if let Some(pos) = self.pending.windows(4).position(|w| w == b"\r\n\r\n") {
                let head: Vec<u8> = self.pending.drain(..pos + 4).collect();
                return String::from_utf8(head).expect("utf-8 response");
            }
            self.fill().await;
        }
    }

    pub async fn next_frame(&mut self) -> Frame {
        loop {
            if let Some((frame, used)) = self.codec.decode(&self.pending).expect("valid frame") {
                self.pending.drain(..used);
                return frame;
            }
            self.fill().await;
        }
    }

    pub async fn next_message(&mut self) -> ControlMessage {
        let frame = self.next_frame().await;
        assert_eq!(frame.opcode, Opcode::Text);
        ControlMessage::parse(&frame.payload).expect("server sent valid JSON")
    }

    /// Nothing arrives for a short while.
    pub async fn expect_silence(&mut self) {
        assert!(self.pending.is_empty(), "unread bytes from server");
        let mut buf = [0u8; 256];
        if let Ok(read) = timeout(QUIET, self.stream.read(&mut buf)).await {
            panic!("expected silence, got {:?}", read.map(|n| buf[..n].to_vec()));
        }
    }

    /// The server closes the transport, possibly after sending some bytes.
    pub async fn expect_closed(&mut self) {
        let mut buf = [0u8; 8192];
        timeout(WAIT, async {
            loop {
                match self.stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => continue,
                }
            }
        })
        .await
        .expect("server kept the connection open");
    }
}
