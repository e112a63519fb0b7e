mod common;

use common::{start_server, wait_for_clients, RawClient, UPGRADE_REQUEST, WAIT};
use peerlink_server::{AppError, Server, ServerEvent, Settings};
use tokio::net::TcpListener;
use tokio::time::timeout;

#[tokio::test]
async fn test_bind_failure_leaves_server_stopped() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let server = Server::new(Settings::local_ephemeral());
    let mut events = server.subscribe();

    let result = server.start(port).await;
    assert!(matches!(result, Err(AppError::BindError(_))));
    assert!(!server.is_running().await);
    assert!(matches!(events.try_recv(), Ok(ServerEvent::ServerError(_))));
}

#[tokio::test]
async fn test_stop_closes_every_connection() {
    let (server, addr) = start_server().await;
    let mut events = server.subscribe();
    let mut open_a = RawClient::connect(addr).await;
    let mut open_b = RawClient::connect(addr).await;
    let mut pending = RawClient::open(addr).await;
    pending.write(&UPGRADE_REQUEST.as_bytes()[..20]).await;
    wait_for_clients(&server, 2).await;

    timeout(WAIT, server.stop()).await.expect("stop hung");

    assert!(!server.is_running().await);
    assert_eq!(server.client_count().await, 0);
    open_a.expect_closed().await;
    open_b.expect_closed().await;
    pending.expect_closed().await;

    let mut disconnects = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ServerEvent::Disconnected(_)) {
            disconnects += 1;
        }
    }
    assert_eq!(disconnects, 2);

    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_restart_after_stop() {
    let (server, addr) = start_server().await;
    server.stop().await;

    let addr = server.start(addr.port()).await.expect("rebind");
    let _client = RawClient::connect(addr).await;
    wait_for_clients(&server, 1).await;
    assert_eq!(server.local_addr().await, Some(addr));

    server.stop().await;
}

#[tokio::test]
async fn test_events_follow_connection_lifecycle() {
    let (server, addr) = start_server().await;
    let mut events = server.subscribe();

    let client = RawClient::connect(addr).await;
    drop(client);

    let mut seen = Vec::new();
    timeout(WAIT, async {
        while seen.len() < 2 {
            if let Ok(event) = events.recv().await {
                seen.push(event);
            }
        }
    })
    .await
    .expect("missing events");

    match (&seen[0], &seen[1]) {
        (ServerEvent::Connected(a), ServerEvent::Disconnected(b)) => assert_eq!(a, b),
        other => panic!("unexpected events: {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_keepalive_ping_sent_on_interval() {
    let mut settings = Settings::local_ephemeral();
    settings.keepalive.interval_secs = 1;
    let (server, addr) = common::start_server_with(settings).await;
    let mut client = RawClient::connect(addr).await;

    let ping = client.next_frame().await;
    assert_eq!(ping.opcode, peerlink_server::protocol::Opcode::Ping);
    assert!(ping.payload.is_empty());

    // A keep-alive that goes unanswered does not close the connection.
    let ping = client.next_frame().await;
    assert_eq!(ping.opcode, peerlink_server::protocol::Opcode::Ping);
    assert_eq!(server.client_count().await, 1);

    server.stop().await;
}
