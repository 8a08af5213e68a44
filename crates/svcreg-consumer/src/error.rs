use thiserror::Error;

use svcreg_client::RegistryError;
use svcreg_core::CoreError;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("invalid version data: {0}")]
    Version(#[from] CoreError),

    #[error("microservice {0} not found in registry")]
    MicroserviceNotFound(String),

    #[error("registry call failed: {0}")]
    Registry(#[from] RegistryError),
}

pub type ConsumerResult<T> = Result<T, ConsumerError>;
