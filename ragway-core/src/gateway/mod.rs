//! # WebSocket Gateway
//!
//! Serves the streaming answer session over WebSocket alongside the plain
//! search endpoint. Each connection runs one ask through the answer pipeline
//! and receives a typed event stream terminated by `done` or `error`.

mod events;
mod server;
mod session;

pub use events::{ClientMessage, ServerMessage};
pub use server::{AppState, router as gateway_router, run as run_gateway};
pub use session::{EventWriter, Session, SessionPhase, run_session};

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing configuration for WebSocket sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// How long a new connection may take to send its ask frame.
    pub ask_timeout_secs: u64,
    /// Interval between keepalive pings.
    pub heartbeat_interval_secs: u64,
    /// Read deadline, pushed forward by every pong.
    pub read_deadline_secs: u64,
    /// Bound on each event write.
    pub write_deadline_secs: u64,
    /// Bound on each ping write.
    pub ping_write_deadline_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ask_timeout_secs: 60,
            heartbeat_interval_secs: 20,
            read_deadline_secs: 60,
            write_deadline_secs: 10,
            ping_write_deadline_secs: 5,
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("ask_timeout_secs", self.ask_timeout_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("read_deadline_secs", self.read_deadline_secs),
            ("write_deadline_secs", self.write_deadline_secs),
            ("ping_write_deadline_secs", self.ping_write_deadline_secs),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    message: format!("gateway.{name} must be at least one second"),
                });
            }
        }
        Ok(())
    }

    pub fn timings(&self) -> SessionTimings {
        SessionTimings {
            ask_timeout: Duration::from_secs(self.ask_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            read_deadline: Duration::from_secs(self.read_deadline_secs),
            write_deadline: Duration::from_secs(self.write_deadline_secs),
            ping_write_deadline: Duration::from_secs(self.ping_write_deadline_secs),
        }
    }
}

/// Resolved session timings. Tests use sub-second values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    pub ask_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub read_deadline: Duration,
    pub write_deadline: Duration,
    pub ping_write_deadline: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        GatewayConfig::default().timings()
    }
}
