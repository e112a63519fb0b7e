//! Wire protocol for peer connections.
//!
//! Upgrade negotiation, frame encoding and decoding, and the JSON
//! signaling messages carried inside text frames.

pub mod frame;
pub mod handshake;
pub mod message;

pub use frame::{encode_frame, Frame, FrameCodec, Opcode};
pub use handshake::{accept_token, Handshake, HandshakeNegotiator};
pub use message::{ControlMessage, SignalKind, SERVER_SENDER};
