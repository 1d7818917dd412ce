use crate::objects::ObjectStoreError;
use crate::records::{IdentityId, InvalidRecord, OwnerId, PhotoId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("object storage: {0}")]
    Object(#[from] ObjectStoreError),
    #[error(transparent)]
    Invalid(#[from] InvalidRecord),
    #[error("photo {0} not found")]
    PhotoNotFound(PhotoId),
    #[error("identity {0} not found")]
    IdentityNotFound(IdentityId),
    #[error("owner mismatch: {what} belongs to {actual}, not {expected}")]
    OwnerMismatch {
        what: String,
        expected: OwnerId,
        actual: OwnerId,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
