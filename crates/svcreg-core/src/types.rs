//! Domain types as the registry records them.
//!
//! Ids (`service_id`, `instance_id`) are assigned by the registry; `None`
//! means "not registered yet". All types serialize with camelCase field
//! names, matching the registry's JSON.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Registry-assigned microservice id.
pub type ServiceId = String;

/// Registry-assigned instance id.
pub type InstanceId = String;

/// App id under which the registry publishes itself.
pub const REGISTRY_APP_ID: &str = "default";

/// Service name under which the registry publishes itself.
pub const REGISTRY_SERVICE_NAME: &str = "SERVICECENTER";

/// Separator of the cross-app `app:service` naming form.
pub const APP_SERVICE_SEPARATOR: char = ':';

/// Environment value that enables schema overwrite.
pub const DEVELOPMENT_ENVIRONMENT: &str = "development";

// ── Microservice ──────────────────────────────────────────────────

/// A registered (or to-be-registered) microservice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Microservice {
    pub app_id: String,
    pub service_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<ServiceId>,
    #[serde(default)]
    pub environment: String,
    /// Schema ids declared by this microservice.
    #[serde(default)]
    pub schemas: BTreeSet<String>,
    /// Local schema documents: schema id → content. Never sent as part of
    /// the microservice record itself.
    #[serde(skip)]
    pub schema_contents: BTreeMap<String, String>,
    /// This process's own instance. Only meaningful for the local microservice.
    #[serde(skip)]
    pub instance: MicroserviceInstance,
}

impl Microservice {
    pub fn new(app_id: &str, service_name: &str, version: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            service_name: service_name.to_string(),
            version: version.to_string(),
            ..Default::default()
        }
    }

    /// Declare a schema document; its id joins the declared schema id set.
    pub fn add_schema(&mut self, schema_id: &str, content: &str) {
        self.schemas.insert(schema_id.to_string());
        self.schema_contents
            .insert(schema_id.to_string(), content.to_string());
    }

    pub fn key(&self) -> MicroserviceKey {
        MicroserviceKey {
            app_id: self.app_id.clone(),
            service_name: self.service_name.clone(),
            version: self.version.clone(),
        }
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// Registry-side status of an instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    #[default]
    Up,
    Down,
    Starting,
    OutOfService,
    Testing,
}

/// Who drives liveness for an instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckMode {
    /// The instance sends heartbeats.
    #[default]
    Push,
    /// The registry probes the instance.
    Pull,
    /// The hosting platform reports liveness.
    Platform,
}

/// Heartbeat contract registered with the instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub mode: HealthCheckMode,
    /// Seconds between heartbeats.
    pub interval: u64,
    /// Missed heartbeats tolerated before the registry expires the instance.
    pub times: u32,
}

/// One running endpoint of a microservice version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceInstance {
    #[serde(default)]
    pub instance_id: Option<InstanceId>,
    #[serde(default)]
    pub service_id: Option<ServiceId>,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub status: InstanceStatus,
    /// Endpoint URIs, e.g. `rest://10.0.0.1:8080?sslEnabled=false`.
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_timestamp: Option<String>,
}

impl MicroserviceInstance {
    /// Instance id, or `""` while unregistered.
    pub fn id(&self) -> &str {
        self.instance_id.as_deref().unwrap_or("")
    }

    /// Service id, or `""` while unregistered.
    pub fn owner(&self) -> &str {
        self.service_id.as_deref().unwrap_or("")
    }
}

// ── Keys and names ────────────────────────────────────────────────

/// Identifies a microservice version in watch events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceKey {
    pub app_id: String,
    pub service_name: String,
    #[serde(default)]
    pub version: String,
}

impl MicroserviceKey {
    pub fn new(app_id: &str, service_name: &str, version: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            service_name: service_name.to_string(),
            version: version.to_string(),
        }
    }

    /// Whether this key names the registry's own service.
    pub fn is_registry_service(&self) -> bool {
        self.app_id == REGISTRY_APP_ID && self.service_name == REGISTRY_SERVICE_NAME
    }

    /// The cross-app absolute name, `app:service`.
    pub fn absolute_name(&self) -> String {
        format!("{}{APP_SERVICE_SEPARATOR}{}", self.app_id, self.service_name)
    }
}

/// A microservice name resolved against the caller's app id.
///
/// `"other:orders"` asked from app `"mine"` resolves to app `"other"`,
/// short name `"orders"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MicroserviceName {
    pub app_id: String,
    pub short_name: String,
}

impl MicroserviceName {
    pub fn parse(app_id: &str, name: &str) -> Self {
        match name.split_once(APP_SERVICE_SEPARATOR) {
            Some((app, short)) => Self {
                app_id: app.to_string(),
                short_name: short.to_string(),
            },
            None => Self {
                app_id: app_id.to_string(),
                short_name: name.to_string(),
            },
        }
    }
}

/// Summary of a schema document: lowercase hex SHA-256 of its content.
pub fn schema_summary(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}
