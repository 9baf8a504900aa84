//! facerelay-store: durable storage behind the core storage contracts.
//!
//! [`SqliteStore`] keeps the gallery and the camera registry in one SQLite
//! database. [`PhotoDir`] keeps representative enrollment photos as files.

pub mod photos;
pub mod sqlite;

pub use photos::PhotoDir;
pub use sqlite::SqliteStore;
