//! SQLite-backed gallery and camera registry.

use chrono::Utc;
use facerelay_core::gallery::{CameraStore, GallerySnapshot, GalleryStore, StoreError};
use facerelay_core::types::{CameraSource, Embedding, FaceDescriptor};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS faces (
        name        TEXT PRIMARY KEY,
        descriptor  TEXT NOT NULL,
        owner       TEXT,
        photo_ref   TEXT,
        updated_at  TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS cameras (
        camera_id      TEXT PRIMARY KEY,
        url            TEXT NOT NULL DEFAULT '',
        registered_at  TEXT NOT NULL
    );
";

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Gallery and camera registry in a single SQLite database.
///
/// Descriptors are stored as JSON arrays of floats.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(unavailable)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(unavailable)?;
        let store = Self::with_connection(conn)?;
        tracing::info!(path = %path.display(), "opened gallery database");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory().map_err(unavailable)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("database connection poisoned".into()))
    }
}

struct FaceRow {
    name: String,
    descriptor: String,
    owner: Option<String>,
    photo_ref: Option<String>,
}

impl FaceRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            descriptor: row.get(1)?,
            owner: row.get(2)?,
            photo_ref: row.get(3)?,
        })
    }

    fn into_face(self) -> Result<FaceDescriptor, StoreError> {
        let values: Vec<f32> = serde_json::from_str(&self.descriptor).map_err(|e| StoreError::Corrupt {
            key: self.name.clone(),
            reason: e.to_string(),
        })?;
        if values.is_empty() {
            return Err(StoreError::Corrupt { key: self.name, reason: "empty descriptor".into() });
        }
        Ok(FaceDescriptor {
            name: self.name,
            embedding: Embedding::new(values),
            owner: self.owner,
            photo_ref: self.photo_ref,
        })
    }
}

const SELECT_FACE: &str = "SELECT name, descriptor, owner, photo_ref FROM faces";

impl GalleryStore for SqliteStore {
    fn get_all(&self) -> Result<GallerySnapshot, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(SELECT_FACE).map_err(unavailable)?;
        let rows = stmt
            .query_map([], FaceRow::from_row)
            .map_err(unavailable)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(unavailable)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            match row.into_face() {
                Ok(face) => entries.push((face.name, face.embedding)),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable gallery row"),
            }
        }
        Ok(GallerySnapshot::from_entries(entries))
    }

    fn get(&self, name: &str) -> Result<Option<FaceDescriptor>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(&format!("{SELECT_FACE} WHERE name = ?1"), params![name], FaceRow::from_row)
            .optional()
            .map_err(unavailable)?;
        row.map(FaceRow::into_face).transpose()
    }

    fn upsert(&self, face: &FaceDescriptor) -> Result<(), StoreError> {
        let descriptor = serde_json::to_string(&face.embedding.values).map_err(|e| StoreError::Corrupt {
            key: face.name.clone(),
            reason: e.to_string(),
        })?;
        self.conn()?
            .execute(
                "INSERT INTO faces (name, descriptor, owner, photo_ref, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                     descriptor = excluded.descriptor,
                     owner = excluded.owner,
                     photo_ref = excluded.photo_ref,
                     updated_at = excluded.updated_at",
                params![face.name, descriptor, face.owner, face.photo_ref, Utc::now().to_rfc3339()],
            )
            .map_err(unavailable)?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<Option<FaceDescriptor>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(&format!("{SELECT_FACE} WHERE name = ?1"), params![name], FaceRow::from_row)
            .optional()
            .map_err(unavailable)?;
        let Some(row) = row else {
            return Ok(None);
        };
        conn.execute("DELETE FROM faces WHERE name = ?1", params![name])
            .map_err(unavailable)?;

        let name = row.name.clone();
        let photo_ref = row.photo_ref.clone();
        let owner = row.owner.clone();
        match row.into_face() {
            Ok(face) => Ok(Some(face)),
            Err(e) => {
                tracing::warn!(name = %name, error = %e, "deleted unreadable gallery row");
                Ok(Some(FaceDescriptor { name, embedding: Embedding::new(Vec::new()), owner, photo_ref }))
            }
        }
    }
}

impl CameraStore for SqliteStore {
    fn list_cameras(&self) -> Result<Vec<CameraSource>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT camera_id, url FROM cameras ORDER BY camera_id")
            .map_err(unavailable)?;
        let cameras = stmt
            .query_map([], |row| Ok(CameraSource { camera_id: row.get(0)?, url: row.get(1)? }))
            .map_err(unavailable)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(unavailable)?;
        Ok(cameras)
    }

    fn upsert_camera(&self, camera: &CameraSource) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT INTO cameras (camera_id, url, registered_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(camera_id) DO UPDATE SET url = excluded.url",
                params![camera.camera_id, camera.url, Utc::now().to_rfc3339()],
            )
            .map_err(unavailable)?;
        Ok(())
    }
}
