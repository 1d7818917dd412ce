//! facetag-store: the durable side of face-identity resolution.
//!
//! Photos, identities and photo↔identity links live in SQLite (driven
//! through `tokio-rusqlite`); each identity's reference face image lives in
//! an [`ObjectStore`] at `faces/<owner_id>/<identity_id>.<ext>`.

pub mod error;
pub mod objects;
pub mod records;
pub mod registry;

pub use error::StoreError;
pub use objects::{FsObjectStore, ObjectStore, ObjectStoreError};
pub use records::{
    Identity, IdentityId, InvalidRecord, OwnerId, Photo, PhotoId, PhotoIdentityLink, ReferenceImage,
};
pub use registry::IdentityRegistry;
