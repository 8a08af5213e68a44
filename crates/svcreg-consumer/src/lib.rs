//! svcreg-consumer — the consumer-side view of registered services.
//!
//! # Architecture
//!
//! ```text
//! AppManager
//!   └── MicroserviceVersions        one per (app, service); owns:
//!         ├── MicroserviceVersion   one per service id, with its instances
//!         └── MicroserviceVersionRule
//!               └── ArcSwap<MicroserviceVersionRuleData>   read lock-free
//! ```
//!
//! Pulls and watch pushes flow down from `AppManager`. Load balancers
//! only ever read a rule's current snapshot.

pub mod app_manager;
pub mod error;
pub mod rule;
pub mod rule_data;
pub mod version;
pub mod versions;

pub use app_manager::AppManager;
pub use error::{ConsumerError, ConsumerResult};
pub use rule::{find_latest, MicroserviceVersionRule};
pub use rule_data::{
    InstanceCache, InstanceMap, MicroserviceVersionRuleData, VersionMap, VersionedCache,
};
pub use version::MicroserviceVersion;
pub use versions::MicroserviceVersions;
