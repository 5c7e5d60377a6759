//! Errors of the virtual device adapter.

use rascal_domain::error::{NotFoundError, RascalError, ValidationError};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VirtualError {
    /// The action targets an entity no virtual device provides.
    #[error("no virtual device provides {0}")]
    UnknownDevice(String),

    /// A declared device has an invalid entity id.
    #[error("invalid device declaration")]
    InvalidSpec(#[from] ValidationError),

    /// Two declarations share an entity id.
    #[error("device {0} is declared twice")]
    Duplicate(String),
}

impl From<VirtualError> for RascalError {
    fn from(err: VirtualError) -> Self {
        match err {
            VirtualError::UnknownDevice(id) => Self::NotFound(NotFoundError { entity: "Device", id }),
            VirtualError::InvalidSpec(inner) => Self::Validation(inner),
            VirtualError::Duplicate(id) => Self::Validation(ValidationError::InvalidId(id)),
        }
    }
}
