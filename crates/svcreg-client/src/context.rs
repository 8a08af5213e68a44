//! Per-process registry context.

use std::sync::Arc;

use svcreg_core::{EventBus, RegistryConfig};

use crate::client::RegistryClient;
use crate::ping::{InstancePing, TcpInstancePing};

/// Everything a registry component needs, built once and shared by clone.
#[derive(Clone)]
pub struct RegistryContext {
    pub config: Arc<RegistryConfig>,
    pub client: Arc<dyn RegistryClient>,
    pub ping: Arc<dyn InstancePing>,
    pub bus: Arc<EventBus>,
}

impl RegistryContext {
    /// Context with a fresh bus and a TCP ping using the configured timeout.
    pub fn new(config: RegistryConfig, client: Arc<dyn RegistryClient>) -> Self {
        let ping = Arc::new(TcpInstancePing::new(config.ping_timeout()));
        Self {
            config: Arc::new(config),
            client,
            ping,
            bus: Arc::new(EventBus::new()),
        }
    }

    pub fn with_ping(mut self, ping: Arc<dyn InstancePing>) -> Self {
        self.ping = ping;
        self
    }
}
