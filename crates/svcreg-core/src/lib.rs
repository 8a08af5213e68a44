//! svcreg-core — shared model for the service registry client.
//!
//! Holds the types every other svcreg crate speaks in:
//!
//! - `Microservice` / `MicroserviceInstance` as the registry records them
//! - `Version` and `VersionRule` (exact, range, start-from, `latest`)
//! - `RegistryConfig`, loaded from TOML
//! - `RegistryEvent` and the synchronous, kind-keyed `EventBus`

pub mod bus;
pub mod config;
pub mod error;
pub mod event;
pub mod types;
pub mod version;

pub use bus::{EventBus, SubscriptionId};
pub use config::RegistryConfig;
pub use error::{CoreError, CoreResult};
pub use event::*;
pub use types::*;
pub use version::{Version, VersionRule, VersionRuleKind};
