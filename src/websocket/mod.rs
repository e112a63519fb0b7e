//! Peer connection handling.
//!
//! This module handles accepted connections, their per-connection
//! protocol sessions, the registry of open peers, and message relay
//! between them.

mod connection;
mod registry;
mod router;
mod server;

pub use connection::{
    ConnectionSession, FeedOutcome, KeepAlive, SessionEvent, SessionState, SharedState,
};
pub use registry::{ConnectionId, ConnectionRegistry, Outbound, SessionHandle};
pub use router::Router;
pub use server::{Server, ServerEvent, Transport};
