//! svcreg-registry — one registry client per process.
//!
//! # Architecture
//!
//! ```text
//! ServiceRegistry
//!   ├── RegistryContext          config, client, ping, event bus
//!   ├── AppManager               consumer cache, fed by pulls and watch pushes
//!   ├── IpPortManager            registry address rotation
//!   └── background tasks
//!       ├── ServiceCenterTask    register, watch, heartbeat with backoff
//!       └── instance pull loop   AppManager::pull_instances every interval
//! ```

pub mod error;
pub mod registry;

pub use error::{ServiceRegistryError, ServiceRegistryResult};
pub use registry::ServiceRegistry;
