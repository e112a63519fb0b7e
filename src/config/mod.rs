use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KeepAliveConfig {
    pub interval_secs: u64,
}

impl KeepAliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProtocolConfig {
    pub max_payload_len: usize,
    pub max_handshake_len: usize,
    pub require_masked_frames: bool,
    pub subprotocol: String,
    /// Frames queued per peer before it counts as stalled and is dropped.
    pub send_queue_len: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventsConfig {
    pub capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub keepalive: KeepAliveConfig,
    pub protocol: ProtocolConfig,
    pub events: EventsConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 9142,
                workers: num_cpus::get() as u32,
            },
            keepalive: KeepAliveConfig { interval_secs: 30 },
            protocol: ProtocolConfig {
                max_payload_len: 16 * 1024 * 1024,
                max_handshake_len: 8 * 1024,
                require_masked_frames: true,
                subprotocol: "chat".to_string(),
                send_queue_len: 1024,
            },
            events: EventsConfig { capacity: 256 },
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Self::with_defaults(Config::builder())?
            // Add in settings from the config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // E.g., `APP_SERVER__PORT=5001` would set `Settings.server.port`
            .add_source(
                Environment::with_prefix("app")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let d = Settings::default();
        builder
            .set_default("environment", d.environment)?
            .set_default("server.host", d.server.host)?
            .set_default("server.port", d.server.port as i64)?
            .set_default("server.workers", d.server.workers as i64)?
            .set_default("keepalive.interval_secs", d.keepalive.interval_secs as i64)?
            .set_default("protocol.max_payload_len", d.protocol.max_payload_len as i64)?
            .set_default("protocol.max_handshake_len", d.protocol.max_handshake_len as i64)?
            .set_default("protocol.require_masked_frames", d.protocol.require_masked_frames)?
            .set_default("protocol.subprotocol", d.protocol.subprotocol)?
            .set_default("protocol.send_queue_len", d.protocol.send_queue_len as i64)?
            .set_default("events.capacity", d.events.capacity as i64)
    }

    /// Loopback on an ephemeral port, for tests that bind real sockets.
    pub fn local_ephemeral() -> Self {
        let mut settings = Settings::default();
        settings.environment = "test".to_string();
        settings.server.host = "127.0.0.1".to_string();
        settings.server.port = 0;
        settings
    }

    #[cfg(test)]
    pub fn new_for_test() -> Result<Self, ConfigError> {
        Self::with_defaults(Config::builder())?
            .set_override("environment", "test")?
            .set_override("server.host", "127.0.0.1")?
            .set_override("server.port", 0)?
            .add_source(
                Environment::with_prefix("app")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
