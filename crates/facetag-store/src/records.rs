//! Typed rows for photos, identities and the photo↔identity join.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Prefix of generated identity display names (`Person_1`, `Person_2`, ...).
pub const DISPLAY_NAME_PREFIX: &str = "Person_";

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Fresh random id.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self)
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                self.0.to_sql()
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                Uuid::column_result(value).map(Self)
            }
        }
    };
}

uuid_id!(
    /// The user whose library and identity registry are being operated on.
    OwnerId
);
uuid_id!(
    /// An uploaded photo.
    PhotoId
);
uuid_id!(
    /// One recognized person within one owner's scope.
    IdentityId
);

/// An uploaded photo. Immutable apart from the pipeline's processed marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub id: PhotoId,
    pub owner_id: OwnerId,
    pub storage_path: String,
    pub created_at: DateTime<Utc>,
    /// Set once face resolution has reached a terminal success state.
    pub processed_at: Option<DateTime<Utc>>,
}

impl Photo {
    pub(crate) const COLUMNS: &'static str = "id, owner_id, storage_path, created_at, processed_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            storage_path: row.get(2)?,
            created_at: row.get(3)?,
            processed_at: row.get(4)?,
        })
    }
}

/// A distinct person recognized within one owner's library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub owner_id: OwnerId,
    /// Object-storage path of the single reference face image.
    pub reference_storage_path: String,
    /// Hex SHA-256 of the reference image bytes.
    pub reference_sha256: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    pub(crate) const COLUMNS: &'static str = "id, owner_id, storage_path, content_sha256, name, created_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            reference_storage_path: row.get(2)?,
            reference_sha256: row.get(3)?,
            display_name: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}

/// A photo contains an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhotoIdentityLink {
    pub photo_id: PhotoId,
    pub owner_id: OwnerId,
    pub identity_id: IdentityId,
}

/// Encoded face crop to be stored as an identity's reference image.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub bytes: Vec<u8>,
    /// File extension without the dot, e.g. `png`.
    pub extension: String,
}

impl ReferenceImage {
    /// Validate and wrap encoded image bytes.
    pub fn new(bytes: Vec<u8>, extension: impl Into<String>) -> Result<Self, InvalidRecord> {
        let extension = extension.into().trim_start_matches('.').to_ascii_lowercase();
        if bytes.is_empty() {
            return Err(InvalidRecord("reference image is empty".into()));
        }
        if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(InvalidRecord(format!("bad reference image extension: {extension:?}")));
        }
        Ok(Self { bytes, extension })
    }
}

/// A record failed validation at construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid record: {0}")]
pub struct InvalidRecord(pub String);

/// Display name for the `n`-th identity of an owner (1-based).
pub fn display_name(n: u64) -> String {
    format!("{DISPLAY_NAME_PREFIX}{n}")
}

/// Owner-scoped object path of an identity's reference image:
/// `faces/<owner_id>/<identity_id>.<ext>`.
pub fn reference_path(owner: OwnerId, identity: IdentityId, extension: &str) -> String {
    format!("faces/{owner}/{identity}.{extension}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_roundtrip_through_strings() {
        let id = IdentityId::generate();
        let parsed: IdentityId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<OwnerId>().is_err());
    }

    #[test]
    fn test_reference_path_layout() {
        let owner: OwnerId = "a4c661ae-7e74-4902-ad7a-2c03de3781f5".parse().unwrap();
        let identity: IdentityId = "00000000-0000-0000-0000-000000000001".parse().unwrap();
        assert_eq!(
            reference_path(owner, identity, "png"),
            "faces/a4c661ae-7e74-4902-ad7a-2c03de3781f5/00000000-0000-0000-0000-000000000001.png"
        );
    }

    #[test]
    fn test_display_name_sequence() {
        assert_eq!(display_name(1), "Person_1");
        assert_eq!(display_name(12), "Person_12");
    }

    #[test]
    fn test_reference_image_validation() {
        let ok = ReferenceImage::new(vec![1, 2, 3], ".PNG").unwrap();
        assert_eq!(ok.extension, "png");
        assert!(ReferenceImage::new(vec![], "png").is_err());
        assert!(ReferenceImage::new(vec![1], "../x").is_err());
        assert!(ReferenceImage::new(vec![1], "").is_err());
    }
}
