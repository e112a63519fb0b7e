use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Handshake error: {0}")]
    HandshakeError(#[from] HandshakeError),

    #[error("Frame error: {0}")]
    FrameError(#[from] FrameError),

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] WebSocketError),

    #[error("Failed to bind listener: {0}")]
    BindError(String),

    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Server is not running")]
    NotRunning,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::WebSocketError(WebSocketError::InvalidFormat(err.to_string()))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl AppError {
    /// Whether the error only concerns a single connection.
    pub fn is_connection_local(&self) -> bool {
        matches!(
            self,
            AppError::HandshakeError(_) | AppError::FrameError(_) | AppError::WebSocketError(_)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Request is not a WebSocket upgrade")]
    NotUpgrade,

    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Request exceeds {limit} bytes without completing")]
    RequestTooLarge { limit: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Fragmented frames are not supported")]
    Fragmented,

    #[error("Reserved bits set: {0:#04x}")]
    ReservedBits(u8),

    #[error("Unsupported opcode: {0:#x}")]
    UnsupportedOpcode(u8),

    #[error("Client frame is not masked")]
    Unmasked,

    #[error("Control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLarge(u64),

    #[error("Payload of {declared} bytes exceeds limit of {limit}")]
    PayloadTooLarge { declared: u64, limit: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WebSocketError {
    #[error("Message sending failed: {0}")]
    SendError(String),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
}
