//! Reference-image and camera persistence over SQLite.
//!
//! Reference images are the enrollment photographs the classifier is
//! trained from. The first image stored for an identity is its primary
//! reference. Image pixel data lives on disk under an identity-scoped
//! directory; rows here hold relative paths.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("reference image {0} not found")]
    ReferenceNotFound(i64),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// One stored reference image row.
#[derive(Debug, Clone)]
pub struct ReferenceRecord {
    pub id: i64,
    pub identity: String,
    /// Path relative to the media directory.
    pub path: String,
    pub is_primary: bool,
    pub created_at: String,
}

/// One registered networked camera.
#[derive(Debug, Clone)]
pub struct CameraRecord {
    pub id: i64,
    pub name: String,
    pub ip_address: String,
    pub is_active: bool,
    pub last_connected: Option<String>,
    pub created_at: String,
}

/// SQLite-backed store for reference images and cameras.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS reference_images (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                identity    TEXT NOT NULL,
                path        TEXT NOT NULL,
                is_primary  INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reference_identity
                ON reference_images(identity);
            CREATE TABLE IF NOT EXISTS cameras (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                name           TEXT NOT NULL,
                ip_address     TEXT NOT NULL UNIQUE,
                is_active      INTEGER NOT NULL DEFAULT 1,
                last_connected TEXT,
                created_at     TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    /// Insert a reference image row. The identity's first image becomes
    /// its primary reference.
    pub fn insert_reference(
        &self,
        identity: &str,
        path: &str,
    ) -> Result<ReferenceRecord, StoreError> {
        let existing = self.count_references_for(identity)?;
        let is_primary = existing == 0;
        let created_at = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO reference_images (identity, path, is_primary, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![identity, path, is_primary, created_at],
        )?;
        Ok(ReferenceRecord {
            id: self.conn.last_insert_rowid(),
            identity: identity.to_string(),
            path: path.to_string(),
            is_primary,
            created_at,
        })
    }

    /// Delete a reference row, returning it so the caller can remove
    /// the backing file.
    pub fn delete_reference(&self, id: i64) -> Result<ReferenceRecord, StoreError> {
        let record = self
            .conn
            .query_row(
                "SELECT id, identity, path, is_primary, created_at
                 FROM reference_images WHERE id = ?1",
                params![id],
                row_to_reference,
            )
            .optional()?
            .ok_or(StoreError::ReferenceNotFound(id))?;
        self.conn
            .execute("DELETE FROM reference_images WHERE id = ?1", params![id])?;
        Ok(record)
    }

    pub fn references_all(&self) -> Result<Vec<ReferenceRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, identity, path, is_primary, created_at
             FROM reference_images ORDER BY identity, created_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_reference)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn references_for(&self, identity: &str) -> Result<Vec<ReferenceRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, identity, path, is_primary, created_at
             FROM reference_images WHERE identity = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![identity], row_to_reference)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count_references(&self) -> Result<usize, StoreError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM reference_images", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn count_references_for(&self, identity: &str) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM reference_images WHERE identity = ?1",
            params![identity],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Identities that still have at least one reference image.
    pub fn identities_with_references(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT identity FROM reference_images ORDER BY identity")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Register or refresh a camera by IP, stamping `last_connected`.
    pub fn upsert_camera(&self, name: &str, ip_address: &str) -> Result<CameraRecord, StoreError> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO cameras (name, ip_address, is_active, last_connected, created_at)
             VALUES (?1, ?2, 1, ?3, ?3)
             ON CONFLICT(ip_address) DO UPDATE SET
                 name = excluded.name,
                 is_active = 1,
                 last_connected = excluded.last_connected",
            params![name, ip_address, now],
        )?;
        let record = self.conn.query_row(
            "SELECT id, name, ip_address, is_active, last_connected, created_at
             FROM cameras WHERE ip_address = ?1",
            params![ip_address],
            row_to_camera,
        )?;
        Ok(record)
    }

    pub fn cameras(&self) -> Result<Vec<CameraRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, ip_address, is_active, last_connected, created_at
             FROM cameras ORDER BY name",
        )?;
        let rows = stmt.query_map([], row_to_camera)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn row_to_reference(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReferenceRecord> {
    Ok(ReferenceRecord {
        id: row.get(0)?,
        identity: row.get(1)?,
        path: row.get(2)?,
        is_primary: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn row_to_camera(row: &rusqlite::Row<'_>) -> rusqlite::Result<CameraRecord> {
    Ok(CameraRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        ip_address: row.get(2)?,
        is_active: row.get(3)?,
        last_connected: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_image_is_primary() {
        let store = Store::open_in_memory().unwrap();
        let first = store.insert_reference("7", "7/face_a.jpg").unwrap();
        let second = store.insert_reference("7", "7/face_b.jpg").unwrap();
        assert!(first.is_primary);
        assert!(!second.is_primary);
    }

    #[test]
    fn test_counts_and_identities() {
        let store = Store::open_in_memory().unwrap();
        store.insert_reference("1", "1/a.jpg").unwrap();
        store.insert_reference("1", "1/b.jpg").unwrap();
        store.insert_reference("2", "2/a.jpg").unwrap();

        assert_eq!(store.count_references().unwrap(), 3);
        assert_eq!(store.count_references_for("1").unwrap(), 2);
        assert_eq!(store.count_references_for("3").unwrap(), 0);
        assert_eq!(
            store.identities_with_references().unwrap(),
            vec!["1".to_string(), "2".to_string()]
        );
    }

    #[test]
    fn test_delete_returns_record() {
        let store = Store::open_in_memory().unwrap();
        let inserted = store.insert_reference("5", "5/a.jpg").unwrap();
        let deleted = store.delete_reference(inserted.id).unwrap();
        assert_eq!(deleted.path, "5/a.jpg");
        assert_eq!(store.count_references().unwrap(), 0);
    }

    #[test]
    fn test_delete_missing_reference() {
        let store = Store::open_in_memory().unwrap();
        let err = store.delete_reference(42).unwrap_err();
        assert!(matches!(err, StoreError::ReferenceNotFound(42)));
    }

    #[test]
    fn test_references_for_identity() {
        let store = Store::open_in_memory().unwrap();
        store.insert_reference("a", "a/1.jpg").unwrap();
        store.insert_reference("b", "b/1.jpg").unwrap();
        store.insert_reference("a", "a/2.jpg").unwrap();

        let refs = store.references_for("a").unwrap();
        assert_eq!(refs.len(), 2);
        assert!(refs.iter().all(|r| r.identity == "a"));
    }

    #[test]
    fn test_camera_upsert_refreshes() {
        let store = Store::open_in_memory().unwrap();
        let first = store.upsert_camera("door", "10.0.0.9").unwrap();
        let second = store.upsert_camera("entrance", "10.0.0.9").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "entrance");
        assert!(second.is_active);
        assert!(second.last_connected.is_some());
        assert_eq!(store.cameras().unwrap().len(), 1);
    }
}
