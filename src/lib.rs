pub mod config;
pub mod error;
pub mod protocol;
pub mod websocket;

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use protocol::{ControlMessage, SignalKind};
pub use websocket::{ConnectionId, Server, ServerEvent};
