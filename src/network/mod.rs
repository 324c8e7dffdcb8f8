//! Network module - Handles TCP communication with the bus
//!
//! Provides:
//! - A connection owning one socket to the bus and the registration handshake
//! - A receive loop that decodes inbound frames on its own task
//! - A correlator matching responses to outstanding requests
//! - A client bundling the above behind a single handle

mod client;
mod connection;
mod correlator;
mod receiver;

pub use client::*;
pub use connection::*;
pub use correlator::*;
pub use receiver::*;

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::DEFAULT_BUS_PORT;

/// Settings for a single bus connection
#[derive(Debug, Clone)]
pub struct BusSettings {
    /// Bus host name or IP
    pub host: String,
    /// Bus port
    pub port: u16,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Upper bound on how long the receive loop waits before rechecking its stop flag
    pub poll_interval_ms: u64,
    /// Capacity of the event and unsolicited-message channels
    pub channel_capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_BUS_PORT,
            connect_timeout_ms: 5000,
            poll_interval_ms: 250,
            channel_capacity: 256,
        }
    }
}

impl BusSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
