//! svcreg-task — the registration engine.
//!
//! Four tasks bring this process's microservice and instance online and
//! keep them there: register the microservice, register the instance,
//! open a watch stream, send heartbeats. [`RegistrationChain`] owns the
//! tasks and moves them between statuses; [`ServiceCenterTask`] ticks the
//! chain on a tokio task and backs off while the registry is unhealthy.

pub mod backoff;
pub mod chain;
pub mod error;
pub mod heartbeat;
pub mod instance_register;
pub mod monitor;
pub mod register;
pub mod scheduler;
pub mod task;
pub mod watch;

pub use backoff::{BackoffLadder, BACKOFF_LADDER_SECS};
pub use chain::{ChainStage, RegistrationChain};
pub use error::{TaskError, TaskResult};
pub use heartbeat::MicroserviceInstanceHeartbeatTask;
pub use instance_register::MicroserviceInstanceRegisterTask;
pub use monitor::ServiceCenterTaskMonitor;
pub use register::MicroserviceRegisterTask;
pub use scheduler::ServiceCenterTask;
pub use task::Task;
pub use watch::{MicroserviceWatchTask, WatchForwarder};
