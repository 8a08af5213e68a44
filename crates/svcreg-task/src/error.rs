use thiserror::Error;

use svcreg_client::RegistryError;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(
        "schema ids of microservice {service_id} differ from the registry: local {local:?}, registry {registry:?}"
    )]
    SchemaIdSetMismatch {
        service_id: String,
        local: Vec<String>,
        registry: Vec<String>,
    },

    #[error("schema {schema_id} of microservice {service_id} changed and may not be overwritten")]
    SchemaContentChanged {
        service_id: String,
        schema_id: String,
    },

    #[error("registry has schemas {schema_ids:?} not declared by microservice {service_id}")]
    UndeclaredRegistrySchemas {
        service_id: String,
        schema_ids: Vec<String>,
    },

    #[error("registry rejected schema {schema_id} of microservice {service_id}")]
    SchemaRejected {
        service_id: String,
        schema_id: String,
    },

    #[error("microservice {0} not found in registry")]
    MicroserviceNotFound(String),

    #[error("registry returned no {0}")]
    MissingId(&'static str),

    #[error("registry call failed: {0}")]
    Registry(#[from] RegistryError),
}

pub type TaskResult<T> = Result<T, TaskError>;
