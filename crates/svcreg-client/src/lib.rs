//! svcreg-client — the boundary between the registry client core and
//! the outside world.
//!
//! # Architecture
//!
//! ```text
//! RegistryContext (one per process)
//!   ├── RegistryConfig
//!   ├── Arc<dyn RegistryClient>   facade over the wire transport
//!   ├── Arc<dyn InstancePing>     liveness probe for empty-pull protection
//!   └── Arc<EventBus>
//!
//! IpPortManager
//!   ├── static addresses from config
//!   └── AddressSource             registry's own published instances
//! ```
//!
//! `InMemoryRegistry` implements `RegistryClient` in-process for local
//! development and tests.

pub mod address;
pub mod client;
pub mod context;
pub mod error;
pub mod memory;
pub mod ping;

pub use address::{AddressSource, IpPort, IpPortManager};
pub use client::{
    HeartbeatResponse, MicroserviceInstances, RegistryClient, SchemaSummary, WatchListener,
};
pub use context::RegistryContext;
pub use error::{RegistryError, RegistryResult};
pub use memory::InMemoryRegistry;
pub use ping::{InstancePing, TcpInstancePing};
