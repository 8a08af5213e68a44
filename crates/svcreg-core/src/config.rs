//! Registry client configuration.
//!
//! Every field has a default so an empty TOML document is a valid config.
//!
//! ```toml
//! addresses = ["http://10.0.0.1:30100", "http://10.0.0.2:30100"]
//! heartbeat_interval_secs = 30
//! watch = true
//! environment = "development"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::DEVELOPMENT_ENVIRONMENT;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Statically configured registry endpoints.
    pub addresses: Vec<String>,
    /// Seconds between heartbeats; also the scheduler's steady-state interval.
    pub heartbeat_interval_secs: u64,
    /// Missed heartbeats the registry tolerates before expiring our instance.
    pub heartbeat_resend_times: u32,
    /// Seconds between full instance pulls.
    pub instance_pull_interval_secs: u64,
    /// Open a watch stream and forward its events.
    pub watch: bool,
    /// Track the registry's own instances and rotate across them.
    pub registry_auto_discovery: bool,
    /// Ping previously known instances before accepting an empty pull.
    pub empty_instance_protection: bool,
    /// Publish the endpoint address instead of the host name.
    pub prefer_ip_address: bool,
    /// Registry environment; `development` permits schema overwrite.
    pub environment: String,
    /// Permit schema overwrite regardless of environment.
    pub always_override_schema: bool,
    /// Accept schema content differences with a warning.
    pub ignore_schema_difference: bool,
    /// Connect timeout of a single instance ping, in milliseconds.
    pub ping_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            addresses: vec!["http://127.0.0.1:30100".to_string()],
            heartbeat_interval_secs: 30,
            heartbeat_resend_times: 3,
            instance_pull_interval_secs: 30,
            watch: true,
            registry_auto_discovery: false,
            empty_instance_protection: true,
            prefer_ip_address: false,
            environment: String::new(),
            always_override_schema: false,
            ignore_schema_difference: false,
            ping_timeout_ms: 1000,
        }
    }
}

impl RegistryConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: RegistryConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Whether schema content registered on the registry may be replaced.
    pub fn is_dev_mode(&self) -> bool {
        self.environment.eq_ignore_ascii_case(DEVELOPMENT_ENVIRONMENT) || self.always_override_schema
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn instance_pull_interval(&self) -> Duration {
        Duration::from_secs(self.instance_pull_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}
