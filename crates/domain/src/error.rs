use thiserror::Error;

/// Domain-level errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("Invalid target state: {0}")]
    InvalidTargetState(String),

    #[error("Invalid service configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Device is not provisioned")]
    NotProvisioned,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid shadow document: {0}")]
    InvalidShadowDocument(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
