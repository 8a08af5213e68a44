//! Instance liveness probing.
//!
//! Only used when a pull comes back empty while empty-instance protection
//! is on: each previously known instance is probed, and kept only if it
//! answers.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use svcreg_core::MicroserviceInstance;

use crate::address::IpPort;

#[async_trait]
pub trait InstancePing: Send + Sync {
    async fn ping(&self, instance: &MicroserviceInstance) -> bool;
}

/// Pings by opening a TCP connection to each endpoint in turn.
///
/// The instance is alive as soon as one endpoint accepts a connection
/// within the timeout.
#[derive(Debug, Clone)]
pub struct TcpInstancePing {
    timeout: Duration,
}

impl TcpInstancePing {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpInstancePing {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl InstancePing for TcpInstancePing {
    async fn ping(&self, instance: &MicroserviceInstance) -> bool {
        for endpoint in &instance.endpoints {
            let Ok(address) = IpPort::parse(endpoint) else {
                debug!(instance_id = %instance.id(), %endpoint, "skipping unparseable endpoint");
                continue;
            };

            let addr = address.socket_addr();
            match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(&addr)).await {
                Ok(Ok(_)) => return true,
                Ok(Err(e)) => {
                    debug!(instance_id = %instance.id(), %addr, error = %e, "ping connection failed");
                }
                Err(_) => {
                    debug!(instance_id = %instance.id(), %addr, "ping timed out");
                }
            }
        }
        false
    }
}
