use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::AppError;
use crate::protocol::{encode_frame, ControlMessage, Opcode, SERVER_SENDER};
use crate::websocket::connection::{ConnectionSession, KeepAlive, SessionEvent};
use crate::websocket::registry::{ConnectionId, ConnectionRegistry, Outbound, SessionHandle};
use crate::websocket::router::Router;

const READ_CHUNK: usize = 4096;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Byte stream a peer connection runs over.
pub trait Transport: AsyncRead + AsyncWrite + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + 'static {}

/// Lifecycle notifications for the host application.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Connected(ConnectionId),
    Message(ConnectionId, ControlMessage),
    Disconnected(ConnectionId),
    ServerError(String),
}

/// Everything a connection task needs, cloned into each one.
#[derive(Clone)]
struct ConnectionContext {
    settings: Arc<Settings>,
    router: Router,
    events: broadcast::Sender<ServerEvent>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionContext {
    fn emit(&self, event: ServerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

pub struct Server {
    settings: Arc<Settings>,
    registry: Arc<ConnectionRegistry>,
    router: Router,
    events: broadcast::Sender<ServerEvent>,
    running: Mutex<Option<Running>>,
}

impl Server {
    pub fn new(settings: Settings) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let (events, _) = broadcast::channel(settings.events.capacity.max(1));
        Self {
            settings: Arc::new(settings),
            router: Router::new(registry.clone()),
            registry,
            events,
            running: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Bind `server.host:port` and start accepting. Port 0 picks a free
    /// port; the bound address is returned.
    pub async fn start(&self, port: u16) -> crate::Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(AppError::AlreadyRunning);
        }

        let addr = format!("{}:{}", self.settings.server.host, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                let message = format!("{}: {}", addr, e);
                error!("Failed to bind {}", message);
                let _ = self.events.send(ServerEvent::ServerError(message.clone()));
                return Err(AppError::BindError(message));
            }
        };
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = ConnectionContext {
            settings: self.settings.clone(),
            router: self.router.clone(),
            events: self.events.clone(),
            shutdown: shutdown_rx,
        };
        let accept_task = tokio::spawn(accept_loop(listener, ctx));

        *running = Some(Running {
            local_addr,
            shutdown: shutdown_tx,
            accept_task,
        });
        info!("Signaling server listening on ws://{}", local_addr);
        Ok(local_addr)
    }

    /// Stop accepting, close every connection (including ones still in
    /// the handshake) and clear the registry. Stopping a stopped server
    /// does nothing.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.shutdown.send(true);
        if let Err(e) = running.accept_task.await {
            error!("Accept loop ended abnormally: {}", e);
        }

        for handle in self.registry.clear().await {
            handle.shutdown();
        }
        info!("Signaling server on {} stopped", running.local_addr);
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Run one connection over a transport supplied by the host, until
    /// it closes or the server stops.
    pub async fn serve_connection<S: Transport>(&self, stream: S) -> crate::Result<ConnectionId> {
        let ctx = {
            let running = self.running.lock().await;
            let Some(running) = running.as_ref() else {
                return Err(AppError::NotRunning);
            };
            ConnectionContext {
                settings: self.settings.clone(),
                router: self.router.clone(),
                events: self.events.clone(),
                shutdown: running.shutdown.subscribe(),
            }
        };
        let id = ConnectionId::new();
        handle_connection(stream, id, ctx).await;
        Ok(id)
    }

    /// Send a host message to every open peer.
    pub async fn broadcast(&self, message: ControlMessage) -> usize {
        self.router.broadcast(&from_server(message), None).await
    }

    /// Send a host message to one peer.
    pub async fn send_to(&self, id: ConnectionId, message: ControlMessage) -> bool {
        self.router.send_to(id, &from_server(message)).await
    }

    pub async fn client_count(&self) -> usize {
        self.registry.len().await
    }

    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        self.registry.ids().await
    }
}

fn from_server(mut message: ControlMessage) -> ControlMessage {
    if message.from.is_none() {
        message.from = Some(SERVER_SENDER.to_string());
    }
    message
}

/// Resolves once shutdown was requested or the server went away.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn accept_loop(listener: TcpListener, ctx: ConnectionContext) {
    let mut shutdown = ctx.shutdown.clone();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
                    }
                    let id = ConnectionId::new();
                    info!("New connection {} from {}", id, peer);
                    connections.spawn(handle_connection(stream, id, ctx.clone()));
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    ctx.emit(ServerEvent::ServerError(format!("accept failed: {}", e)));
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    error!("Connection task failed: {}", e);
                }
            }
        }
    }

    drop(listener);
    while let Some(joined) = connections.join_next().await {
        if let Err(e) = joined {
            error!("Connection task failed during shutdown: {}", e);
        }
    }
}

async fn handle_connection<S: Transport>(stream: S, id: ConnectionId, ctx: ConnectionContext) {
    let (mut reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(ctx.settings.protocol.send_queue_len.max(1));

    let mut session = ConnectionSession::new(id, &ctx.settings.protocol);
    let handle = SessionHandle::new(id, tx.clone(), session.shared_state());
    let mut writer_task = tokio::spawn(write_loop(id, writer, rx));
    let mut writer_done = false;

    let mut keep_alive: Option<KeepAlive> = None;
    let mut registered = false;
    let mut shutdown = ctx.shutdown.clone();
    let mut buf = vec![0u8; READ_CHUNK];

    'read: loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => {
                info!("Closing connection {} for server shutdown", id);
                break;
            }
            _ = handle.evicted() => {
                warn!("Dropping connection {}: evicted", id);
                break;
            }
            _ = &mut writer_task => {
                writer_done = true;
                break;
            }
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => {
                        info!("Connection {} closed by peer", id);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!("Read error on connection {}: {}", id, e);
                        break;
                    }
                };

                let outcome = session.feed(&buf[..n]);
                for event in outcome.events {
                    match event {
                        SessionEvent::Upgraded { response } => {
                            if tx.try_send(Outbound::Frame(response.into())).is_err() {
                                break 'read;
                            }
                            ctx.router.registry().insert(handle.clone()).await;
                            registered = true;
                            keep_alive = Some(KeepAlive::start(
                                id,
                                tx.clone(),
                                session.shared_state(),
                                ctx.settings.keepalive.interval(),
                            ));
                            info!("Connection {} upgraded", id);
                            ctx.emit(ServerEvent::Connected(id));
                            ctx.router
                                .send_to(id, &ControlMessage::welcome(&id.to_string()))
                                .await;
                        }
                        SessionEvent::Ping(payload) => {
                            debug!("Ping from connection {}", id);
                            let pong = encode_frame(Opcode::Pong, &payload);
                            if let Err(e) = tx.try_send(Outbound::Frame(pong.into())) {
                                warn!("Dropping connection {}: cannot queue pong: {}", id, e);
                                break 'read;
                            }
                        }
                        SessionEvent::Pong => {}
                        SessionEvent::Close => {
                            info!("Connection {} sent close", id);
                            break 'read;
                        }
                        SessionEvent::Message(msg) => {
                            debug!("Message '{}' from connection {}", msg.kind, id);
                            ctx.emit(ServerEvent::Message(id, msg.clone()));
                            ctx.router.relay(id, &msg).await;
                        }
                    }
                }
                if let Some(e) = outcome.error {
                    warn!("Dropping connection {}: {}", id, e);
                    break;
                }
            }
        }
    }

    session.close();
    if let Some(keep_alive) = keep_alive.take() {
        keep_alive.cancel();
    }
    if registered {
        ctx.router.registry().remove(&id).await;
        ctx.emit(ServerEvent::Disconnected(id));
    }
    drop(handle);

    if !writer_done {
        let abort = writer_task.abort_handle();
        let drained = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, async {
            // Queued frames go out first; a stalled peer hits the timeout.
            let _ = tx.send(Outbound::Shutdown).await;
            drop(tx);
            let _ = writer_task.await;
        })
        .await;
        if drained.is_err() {
            debug!("Writer for connection {} did not drain in time", id);
            abort.abort();
        }
    }
    info!("Connection {} closed", id);
}

async fn write_loop<W: AsyncWrite>(
    id: ConnectionId,
    mut writer: tokio::io::WriteHalf<W>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Frame(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    warn!("Write error on connection {}: {}", id, e);
                    return;
                }
            }
            Outbound::Shutdown => break,
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Shutdown of connection {} failed: {}", id, e);
    }
}
