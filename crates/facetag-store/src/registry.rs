//! SQLite-backed identity registry.
//!
//! Owns the `photos`, `faces` and `photos_faces` tables and the reference
//! images behind each identity. Display-name allocation and the identity
//! insert happen in one `BEGIN IMMEDIATE` transaction, so concurrent
//! registrations for one owner can never hand out the same `Person_<n>`.

use crate::error::{Result, StoreError};
use crate::objects::ObjectStore;
use crate::records::{
    display_name, reference_path, Identity, IdentityId, InvalidRecord, OwnerId, Photo, PhotoId,
    PhotoIdentityLink, ReferenceImage,
};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_rusqlite::Connection;

/// Schema migrations, applied in order and tracked in `user_version`.
const MIGRATIONS: &[(usize, &str)] = &[(1, include_str!("../migrations/001_initial.sql"))];

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of the ownership checks done before writing a link.
enum LinkCheck {
    Written(bool),
    PhotoMissing,
    IdentityMissing,
    PhotoOwner(OwnerId),
    IdentityOwner(OwnerId),
}

/// Durable store of identities, photos and their links.
///
/// Cheap to clone: clones share the same database connection thread and
/// object store.
#[derive(Clone)]
pub struct IdentityRegistry {
    conn: Connection,
    objects: Arc<dyn ObjectStore>,
}

impl IdentityRegistry {
    /// Open (creating if needed) the registry database at `db_path`.
    pub async fn open(db_path: &Path, objects: Arc<dyn ObjectStore>) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = Connection::open(db_path).await?;
        Self::with_connection(conn, objects).await
    }

    /// Registry backed by a private in-memory database.
    pub async fn open_in_memory(objects: Arc<dyn ObjectStore>) -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::with_connection(conn, objects).await
    }

    async fn with_connection(conn: Connection, objects: Arc<dyn ObjectStore>) -> Result<Self> {
        conn.call(|conn| {
            conn.pragma_update(None, "foreign_keys", true)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            Ok(())
        })
        .await?;

        let registry = Self { conn, objects };
        registry.migrate().await?;
        Ok(registry)
    }

    /// Bring the schema up to date. Returns the resulting schema version.
    pub async fn migrate(&self) -> Result<usize> {
        let version = self
            .conn
            .call(|conn| {
                let mut version: usize =
                    conn.query_row("SELECT user_version FROM pragma_user_version;", [], |row| row.get(0))?;

                for &(target, sql) in MIGRATIONS {
                    if version < target {
                        conn.execute_batch(sql)?;
                        conn.pragma_update(None, "user_version", target)?;
                        version = target;
                        tracing::info!(version, "registry schema migrated");
                    }
                }
                Ok(version)
            })
            .await?;
        Ok(version)
    }

    /// The object store holding reference images.
    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    // ------------------------------------------------------------------
    // Photos
    // ------------------------------------------------------------------

    /// Record an uploaded photo.
    pub async fn register_photo(&self, owner_id: OwnerId, storage_path: &str) -> Result<Photo> {
        let storage_path = storage_path.trim();
        if storage_path.is_empty() {
            return Err(InvalidRecord("photo storage path is empty".into()).into());
        }

        let photo = Photo {
            id: PhotoId::generate(),
            owner_id,
            storage_path: storage_path.to_string(),
            created_at: Utc::now(),
            processed_at: None,
        };

        let row = photo.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO photos (id, owner_id, storage_path, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![row.id, row.owner_id, row.storage_path, row.created_at],
                )?;
                Ok(())
            })
            .await?;

        tracing::debug!(photo = %photo.id, owner = %owner_id, "photo registered");
        Ok(photo)
    }

    pub async fn get_photo(&self, photo_id: PhotoId) -> Result<Option<Photo>> {
        let photo = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {} FROM photos WHERE id = ?1", Photo::COLUMNS);
                Ok(conn.query_row(&sql, [photo_id], Photo::from_row).optional()?)
            })
            .await?;
        Ok(photo)
    }

    /// Stamp the photo as having completed face resolution. The first stamp wins.
    pub async fn mark_photo_processed(&self, photo_id: PhotoId) -> Result<()> {
        let exists = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE photos SET processed_at = ?1 WHERE id = ?2 AND processed_at IS NULL",
                    params![Utc::now(), photo_id],
                )?;
                let exists = conn
                    .query_row("SELECT 1 FROM photos WHERE id = ?1", [photo_id], |_| Ok(()))
                    .optional()?;
                Ok(exists.is_some())
            })
            .await?;

        if exists { Ok(()) } else { Err(StoreError::PhotoNotFound(photo_id)) }
    }

    // ------------------------------------------------------------------
    // Identities
    // ------------------------------------------------------------------

    pub async fn count_identities(&self, owner_id: OwnerId) -> Result<u64> {
        let count = self
            .conn
            .call(move |conn| Ok(count_for_owner(conn, owner_id)?))
            .await?;
        Ok(count)
    }

    /// The display name the next registered identity of `owner_id` would get.
    ///
    /// Informational only: [`register_identity`](Self::register_identity)
    /// allocates the name again inside its own insert transaction.
    pub async fn next_display_name(&self, owner_id: OwnerId) -> Result<String> {
        Ok(display_name(self.count_identities(owner_id).await? + 1))
    }

    /// All identities of an owner, in creation order.
    pub async fn list_identities(&self, owner_id: OwnerId) -> Result<Vec<Identity>> {
        let identities = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {} FROM faces WHERE owner_id = ?1 ORDER BY created_at, rowid",
                    Identity::COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([owner_id], Identity::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(identities)
    }

    pub async fn get_identity(&self, identity_id: IdentityId) -> Result<Option<Identity>> {
        let identity = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {} FROM faces WHERE id = ?1", Identity::COLUMNS);
                Ok(conn.query_row(&sql, [identity_id], Identity::from_row).optional()?)
            })
            .await?;
        Ok(identity)
    }

    /// Store `reference` as a new identity's reference image and insert the identity.
    ///
    /// The object is written first. If the row insert then fails, the object
    /// stays behind as an orphan (logged) rather than risking a second failing
    /// delete.
    pub async fn register_identity(&self, owner_id: OwnerId, reference: ReferenceImage) -> Result<Identity> {
        let id = IdentityId::generate();
        let path = reference_path(owner_id, id, &reference.extension);
        let sha256 = format!("{:x}", Sha256::digest(&reference.bytes));

        self.objects.put(&path, reference.bytes).await?;

        let (row_path, row_sha) = (path.clone(), sha256);
        let inserted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let identity = Identity {
                    id,
                    owner_id,
                    reference_storage_path: row_path,
                    reference_sha256: row_sha,
                    display_name: allocate_display_name(&tx, owner_id)?,
                    created_at: Utc::now(),
                };
                tx.execute(
                    "INSERT INTO faces (id, owner_id, storage_path, content_sha256, name, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        identity.id,
                        identity.owner_id,
                        identity.reference_storage_path,
                        identity.reference_sha256,
                        identity.display_name,
                        identity.created_at,
                    ],
                )?;
                tx.commit()?;
                Ok(identity)
            })
            .await;

        match inserted {
            Ok(identity) => {
                tracing::info!(
                    owner = %owner_id,
                    identity = %identity.id,
                    name = %identity.display_name,
                    "identity registered"
                );
                Ok(identity)
            }
            Err(e) => {
                tracing::warn!(
                    owner = %owner_id,
                    path = %path,
                    error = %e,
                    "identity insert failed; reference object left orphaned"
                );
                Err(e.into())
            }
        }
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    /// Record that `photo_id` contains `identity_id`.
    ///
    /// Returns `true` when a new link was written and `false` when it already
    /// existed. Photo and identity must both belong to `owner_id`.
    pub async fn link_photo_identity(
        &self,
        photo_id: PhotoId,
        owner_id: OwnerId,
        identity_id: IdentityId,
    ) -> Result<bool> {
        let check = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let photo_owner: Option<OwnerId> = tx
                    .query_row("SELECT owner_id FROM photos WHERE id = ?1", [photo_id], |r| r.get(0))
                    .optional()?;
                let identity_owner: Option<OwnerId> = tx
                    .query_row("SELECT owner_id FROM faces WHERE id = ?1", [identity_id], |r| r.get(0))
                    .optional()?;

                let check = match (photo_owner, identity_owner) {
                    (None, _) => LinkCheck::PhotoMissing,
                    (_, None) => LinkCheck::IdentityMissing,
                    (Some(p), _) if p != owner_id => LinkCheck::PhotoOwner(p),
                    (_, Some(i)) if i != owner_id => LinkCheck::IdentityOwner(i),
                    _ => {
                        let written = tx.execute(
                            "INSERT OR IGNORE INTO photos_faces (photo_id, owner_id, face_id, created_at)
                             VALUES (?1, ?2, ?3, ?4)",
                            params![photo_id, owner_id, identity_id, Utc::now()],
                        )?;
                        LinkCheck::Written(written > 0)
                    }
                };
                tx.commit()?;
                Ok(check)
            })
            .await?;

        match check {
            LinkCheck::Written(written) => {
                tracing::debug!(photo = %photo_id, identity = %identity_id, written, "photo linked");
                Ok(written)
            }
            LinkCheck::PhotoMissing => Err(StoreError::PhotoNotFound(photo_id)),
            LinkCheck::IdentityMissing => Err(StoreError::IdentityNotFound(identity_id)),
            LinkCheck::PhotoOwner(actual) => Err(StoreError::OwnerMismatch {
                what: format!("photo {photo_id}"),
                expected: owner_id,
                actual,
            }),
            LinkCheck::IdentityOwner(actual) => Err(StoreError::OwnerMismatch {
                what: format!("identity {identity_id}"),
                expected: owner_id,
                actual,
            }),
        }
    }

    pub async fn links_for_photo(&self, photo_id: PhotoId) -> Result<Vec<PhotoIdentityLink>> {
        let links = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT photo_id, owner_id, face_id FROM photos_faces
                     WHERE photo_id = ?1 ORDER BY created_at, rowid",
                )?;
                let rows = stmt
                    .query_map([photo_id], |row| {
                        Ok(PhotoIdentityLink {
                            photo_id: row.get(0)?,
                            owner_id: row.get(1)?,
                            identity_id: row.get(2)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(links)
    }

    pub async fn photo_has_links(&self, photo_id: PhotoId) -> Result<bool> {
        let found = self
            .conn
            .call(move |conn| {
                let found = conn
                    .query_row("SELECT 1 FROM photos_faces WHERE photo_id = ?1 LIMIT 1", [photo_id], |_| Ok(()))
                    .optional()?;
                Ok(found.is_some())
            })
            .await?;
        Ok(found)
    }

    /// Identities appearing in a photo.
    pub async fn identities_for_photo(&self, photo_id: PhotoId) -> Result<Vec<Identity>> {
        let identities = self
            .conn
            .call(move |conn| {
                let columns = Identity::COLUMNS
                    .split(", ")
                    .map(|c| format!("f.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "SELECT {columns} FROM faces f JOIN photos_faces pf ON pf.face_id = f.id
                     WHERE pf.photo_id = ?1 ORDER BY f.created_at, f.rowid"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([photo_id], Identity::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(identities)
    }

    /// Photos an identity appears in.
    pub async fn photos_for_identity(&self, identity_id: IdentityId) -> Result<Vec<PhotoId>> {
        let photos = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT photo_id FROM photos_faces WHERE face_id = ?1 ORDER BY created_at, rowid",
                )?;
                let rows = stmt
                    .query_map([identity_id], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<PhotoId>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(photos)
    }
}

fn count_for_owner(conn: &rusqlite::Connection, owner_id: OwnerId) -> rusqlite::Result<u64> {
    conn.query_row("SELECT COUNT(*) FROM faces WHERE owner_id = ?1", [owner_id], |r| r.get(0))
}

/// `Person_<count + 1>`, read inside the caller's write transaction.
fn allocate_display_name(tx: &Transaction<'_>, owner_id: OwnerId) -> rusqlite::Result<String> {
    Ok(display_name(count_for_owner(tx, owner_id)? + 1))
}
