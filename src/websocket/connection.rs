use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::ProtocolConfig;
use crate::error::AppError;
use crate::protocol::{encode_frame, ControlMessage, FrameCodec, HandshakeNegotiator, Opcode};
use crate::websocket::registry::{ConnectionId, Outbound};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Open,
    Closed,
}

impl SessionState {
    fn as_u8(self) -> u8 {
        match self {
            SessionState::AwaitingHandshake => 0,
            SessionState::Open => 1,
            SessionState::Closed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::AwaitingHandshake,
            1 => SessionState::Open,
            _ => SessionState::Closed,
        }
    }
}

/// Session state readable from other tasks (router, keep-alive).
#[derive(Debug, Clone)]
pub struct SharedState(Arc<AtomicU8>);

impl SharedState {
    pub fn new(state: SessionState) -> Self {
        Self(Arc::new(AtomicU8::new(state.as_u8())))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: SessionState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

/// What the connection driver has to act on after feeding bytes in.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Handshake accepted; the response must be written before anything else.
    Upgraded { response: Vec<u8> },
    Ping(Vec<u8>),
    Pong,
    Close,
    Message(ControlMessage),
}

/// What one call to [`ConnectionSession::feed`] produced.
#[derive(Debug, Default)]
pub struct FeedOutcome {
    pub events: Vec<SessionEvent>,
    /// Set when the connection must be dropped once `events` are handled.
    pub error: Option<AppError>,
}

/// Per-connection protocol state. Performs no I/O itself.
pub struct ConnectionSession {
    id: ConnectionId,
    state: SharedState,
    buffer: Vec<u8>,
    negotiator: HandshakeNegotiator,
    codec: FrameCodec,
    last_pong: Option<Instant>,
}

impl ConnectionSession {
    pub fn new(id: ConnectionId, protocol: &ProtocolConfig) -> Self {
        Self {
            id,
            state: SharedState::new(SessionState::AwaitingHandshake),
            buffer: Vec::new(),
            negotiator: HandshakeNegotiator::new(
                protocol.max_handshake_len,
                protocol.subprotocol.clone(),
            ),
            codec: FrameCodec::new(protocol.max_payload_len, protocol.require_masked_frames),
            last_pong: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn shared_state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn last_pong(&self) -> Option<Instant> {
        self.last_pong
    }

    /// Bytes received but not yet consumed by the handshake or a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed bytes read from the transport.
    ///
    /// Events are returned in the order their bytes arrived. When the
    /// bytes turn out to be invalid, the events decoded before the bad
    /// part are still returned alongside the error, and the session is
    /// `Closed` afterwards.
    pub fn feed(&mut self, bytes: &[u8]) -> FeedOutcome {
        let mut outcome = FeedOutcome::default();
        if self.state() == SessionState::Closed {
            return outcome;
        }
        self.buffer.extend_from_slice(bytes);

        loop {
            match self.state() {
                SessionState::AwaitingHandshake => {
                    let handshake = match self.negotiator.negotiate(&self.buffer) {
                        Ok(Some(handshake)) => handshake,
                        Ok(None) => break,
                        Err(e) => {
                            self.close();
                            outcome.error = Some(e.into());
                            break;
                        }
                    };
                    self.buffer.drain(..handshake.consumed);
                    self.state.set(SessionState::Open);
                    debug!("Connection {} upgraded (key {})", self.id, handshake.key);
                    outcome.events.push(SessionEvent::Upgraded {
                        response: handshake.response(),
                    });
                }
                SessionState::Open => {
                    let (frame, consumed) = match self.codec.decode(&self.buffer) {
                        Ok(Some(decoded)) => decoded,
                        Ok(None) => break,
                        Err(e) => {
                            self.close();
                            outcome.error = Some(e.into());
                            break;
                        }
                    };
                    self.buffer.drain(..consumed);

                    match frame.opcode {
                        Opcode::Ping => outcome.events.push(SessionEvent::Ping(frame.payload)),
                        Opcode::Pong => {
                            trace!("Pong from connection {}", self.id);
                            self.last_pong = Some(Instant::now());
                            outcome.events.push(SessionEvent::Pong);
                        }
                        Opcode::Close => {
                            self.close();
                            outcome.events.push(SessionEvent::Close);
                        }
                        Opcode::Text => match ControlMessage::parse(&frame.payload) {
                            Ok(msg) => outcome
                                .events
                                .push(SessionEvent::Message(msg.stamped(&self.id.to_string()))),
                            Err(e) => {
                                warn!("Dropping malformed message from {}: {}", self.id, e);
                            }
                        },
                    }
                }
                SessionState::Closed => break,
            }
        }

        outcome
    }

    /// Move to `Closed` and discard anything still buffered.
    pub fn close(&mut self) {
        self.state.set(SessionState::Closed);
        self.buffer.clear();
    }
}

/// Periodic ping sender owned by one open session.
///
/// Cancelling consumes the handle, so it can only happen once. A missed
/// pong does not close the connection.
#[derive(Debug)]
pub struct KeepAlive {
    task: JoinHandle<()>,
}

impl KeepAlive {
    pub fn start(
        id: ConnectionId,
        tx: mpsc::Sender<Outbound>,
        state: SharedState,
        period: Duration,
    ) -> Self {
        let ping: Arc<[u8]> = encode_frame(Opcode::Ping, &[]).into();

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;

                if state.get() != SessionState::Open {
                    break;
                }
                match tx.try_send(Outbound::Frame(ping.clone())) {
                    Ok(()) => trace!("Sent keep-alive ping to {}", id),
                    Err(TrySendError::Full(_)) => {
                        debug!("Skipped keep-alive ping to {}: outbound queue full", id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("Keep-alive for {} stopped: writer gone", id);
                        break;
                    }
                }
            }
        });

        Self { task }
    }

    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.task.abort();
    }
}
