use thiserror::Error;

use svcreg_consumer::ConsumerError;

#[derive(Debug, Error)]
pub enum ServiceRegistryError {
    #[error("registry loops already started")]
    AlreadyRunning,

    #[error("registry address discovery: {0}")]
    Discovery(#[from] ConsumerError),
}

pub type ServiceRegistryResult<T> = Result<T, ServiceRegistryError>;
