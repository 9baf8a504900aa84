//! Gallery snapshots and the storage contracts the rest of the system consumes.
//!
//! Durable storage lives behind [`GalleryStore`], [`CameraStore`] and
//! [`PhotoStore`]. [`MemoryStore`] implements all three in process.

use crate::types::{CameraSource, Embedding, FaceDescriptor};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record for {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("photo asset error: {0}")]
    Photo(String),
}

/// Immutable view of every enrolled descriptor at one point in time.
///
/// Entries are keyed and iterated by name. All entries share one
/// dimensionality; see [`GallerySnapshot::from_entries`].
#[derive(Debug, Clone, Default)]
pub struct GallerySnapshot {
    entries: BTreeMap<String, Embedding>,
}

impl GallerySnapshot {
    /// Build a snapshot, keeping the entries of the most common
    /// dimensionality and dropping the rest. Ties go to the dimensionality
    /// seen first in name order.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Embedding)>,
    {
        let all: BTreeMap<String, Embedding> = entries.into_iter().collect();
        let Some(dim) = majority_dim(all.values()) else {
            return Self::default();
        };

        let mut kept = BTreeMap::new();
        for (name, embedding) in all {
            if embedding.dim() == dim {
                kept.insert(name, embedding);
            } else {
                tracing::warn!(
                    name = %name,
                    expected = dim,
                    actual = embedding.dim(),
                    "dropping gallery entry with mismatched dimensionality"
                );
            }
        }
        Self { entries: kept }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptor dimensionality, `None` for an empty gallery.
    pub fn dim(&self) -> Option<usize> {
        self.entries.values().next().map(Embedding::dim)
    }

    pub fn get(&self, name: &str) -> Option<&Embedding> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Embedding)> {
        self.entries.iter().map(|(name, e)| (name.as_str(), e))
    }
}

fn majority_dim<'a>(embeddings: impl Iterator<Item = &'a Embedding>) -> Option<usize> {
    // (dim, count), in first-seen order
    let mut counts: Vec<(usize, usize)> = Vec::new();
    for embedding in embeddings {
        match counts.iter_mut().find(|(dim, _)| *dim == embedding.dim()) {
            Some((_, count)) => *count += 1,
            None => counts.push((embedding.dim(), 1)),
        }
    }
    counts
        .iter()
        .rev()
        .max_by_key(|(_, count)| *count)
        .map(|(dim, _)| *dim)
}

/// Durable mapping from identity name to descriptor.
pub trait GalleryStore: Send + Sync {
    fn get_all(&self) -> Result<GallerySnapshot, StoreError>;

    fn get(&self, name: &str) -> Result<Option<FaceDescriptor>, StoreError>;

    /// Insert or fully replace the entry for `face.name`.
    fn upsert(&self, face: &FaceDescriptor) -> Result<(), StoreError>;

    /// Remove an entry, returning what was removed.
    fn delete(&self, name: &str) -> Result<Option<FaceDescriptor>, StoreError>;
}

/// Durable registry of camera sources.
pub trait CameraStore: Send + Sync {
    fn list_cameras(&self) -> Result<Vec<CameraSource>, StoreError>;

    fn upsert_camera(&self, camera: &CameraSource) -> Result<(), StoreError>;
}

/// Storage for representative enrollment photos.
pub trait PhotoStore: Send + Sync {
    /// Persist `bytes` as the photo for `name`, returning a reference to it.
    fn save(&self, name: &str, bytes: &[u8]) -> Result<String, StoreError>;

    fn remove(&self, photo_ref: &str) -> Result<(), StoreError>;
}

/// Load the current gallery, degrading to an empty snapshot when the store is
/// unreachable. Every face then matches as unknown.
pub fn load_snapshot(store: &dyn GalleryStore) -> GallerySnapshot {
    match store.get_all() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!(error = %e, "gallery unavailable; matching against empty gallery");
            GallerySnapshot::default()
        }
    }
}

/// Delete an identity together with its photo asset.
///
/// Returns `false` when no such identity was enrolled.
pub fn remove_face(
    gallery: &dyn GalleryStore,
    photos: &dyn PhotoStore,
    name: &str,
) -> Result<bool, StoreError> {
    let Some(removed) = gallery.delete(name)? else {
        return Ok(false);
    };
    if let Some(photo_ref) = removed.photo_ref.as_deref() {
        if let Err(e) = photos.remove(photo_ref) {
            tracing::warn!(name, photo_ref, error = %e, "failed to remove photo asset");
        }
    }
    tracing::info!(name, "face removed");
    Ok(true)
}

#[derive(Default)]
struct MemoryState {
    faces: HashMap<String, FaceDescriptor>,
    cameras: BTreeMap<String, String>,
    photos: HashMap<String, Vec<u8>>,
}

/// In-process store implementing every storage contract.
///
/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backing store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Bytes of a stored photo, if present.
    pub fn photo(&self, photo_ref: &str) -> Option<Vec<u8>> {
        self.lock().ok()?.photos.get(photo_ref).cloned()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))
    }
}

impl GalleryStore for MemoryStore {
    fn get_all(&self) -> Result<GallerySnapshot, StoreError> {
        let state = self.lock()?;
        Ok(GallerySnapshot::from_entries(
            state
                .faces
                .values()
                .map(|f| (f.name.clone(), f.embedding.clone())),
        ))
    }

    fn get(&self, name: &str) -> Result<Option<FaceDescriptor>, StoreError> {
        Ok(self.lock()?.faces.get(name).cloned())
    }

    fn upsert(&self, face: &FaceDescriptor) -> Result<(), StoreError> {
        self.lock()?.faces.insert(face.name.clone(), face.clone());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<Option<FaceDescriptor>, StoreError> {
        Ok(self.lock()?.faces.remove(name))
    }
}

impl CameraStore for MemoryStore {
    fn list_cameras(&self) -> Result<Vec<CameraSource>, StoreError> {
        Ok(self
            .lock()?
            .cameras
            .iter()
            .map(|(id, url)| CameraSource { camera_id: id.clone(), url: url.clone() })
            .collect())
    }

    fn upsert_camera(&self, camera: &CameraSource) -> Result<(), StoreError> {
        self.lock()?
            .cameras
            .insert(camera.camera_id.clone(), camera.url.clone());
        Ok(())
    }
}

impl PhotoStore for MemoryStore {
    fn save(&self, name: &str, bytes: &[u8]) -> Result<String, StoreError> {
        let photo_ref = format!("memory://{name}");
        self.lock()?.photos.insert(photo_ref.clone(), bytes.to_vec());
        Ok(photo_ref)
    }

    fn remove(&self, photo_ref: &str) -> Result<(), StoreError> {
        self.lock()?.photos.remove(photo_ref);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(name: &str, values: Vec<f32>) -> FaceDescriptor {
        FaceDescriptor {
            name: name.into(),
            embedding: Embedding::new(values),
            owner: None,
            photo_ref: None,
        }
    }

    #[test]
    fn test_snapshot_drops_mismatched_dims() {
        let snapshot = GallerySnapshot::from_entries(vec![
            ("alice".to_string(), Embedding::new(vec![0.0, 0.0])),
            ("bob".to_string(), Embedding::new(vec![0.0, 0.0, 0.0])),
            ("carol".to_string(), Embedding::new(vec![1.0, 1.0])),
        ]);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.dim(), Some(2));
        assert!(snapshot.get("bob").is_none());
    }

    #[test]
    fn test_snapshot_keeps_majority_dim() {
        // The odd one out sorts first by name.
        let snapshot = GallerySnapshot::from_entries(vec![
            ("aaron".to_string(), Embedding::new(vec![0.0; 3])),
            ("bob".to_string(), Embedding::new(vec![0.0; 512])),
            ("carol".to_string(), Embedding::new(vec![0.0; 512])),
        ]);
        assert_eq!(snapshot.dim(), Some(512));
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.get("aaron").is_none());
    }

    #[test]
    fn test_snapshot_dim_tie_goes_to_first_name() {
        let snapshot = GallerySnapshot::from_entries(vec![
            ("zed".to_string(), Embedding::new(vec![0.0; 4])),
            ("amy".to_string(), Embedding::new(vec![0.0; 2])),
        ]);
        assert_eq!(snapshot.dim(), Some(2));
        assert!(snapshot.get("amy").is_some());
    }

    #[test]
    fn test_snapshot_iterates_in_name_order() {
        let snapshot = GallerySnapshot::from_entries(vec![
            ("zoe".to_string(), Embedding::new(vec![0.0])),
            ("adam".to_string(), Embedding::new(vec![0.0])),
        ]);
        let names: Vec<&str> = snapshot.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["adam", "zoe"]);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = GallerySnapshot::from_entries(Vec::new());
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.dim(), None);
    }

    #[test]
    fn test_memory_store_upsert_overwrites() {
        let store = MemoryStore::new();
        store.upsert(&face("alice", vec![1.0, 1.0])).unwrap();
        store.upsert(&face("alice", vec![2.0, 2.0])).unwrap();
        let snapshot = store.get_all().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("alice").unwrap().values, vec![2.0, 2.0]);
    }

    #[test]
    fn test_load_snapshot_degrades_when_offline() {
        let store = MemoryStore::new();
        store.upsert(&face("alice", vec![1.0])).unwrap();
        store.set_available(false);
        assert!(load_snapshot(&store).is_empty());
        store.set_available(true);
        assert_eq!(load_snapshot(&store).len(), 1);
    }

    #[test]
    fn test_remove_face_removes_photo() {
        let store = MemoryStore::new();
        let photo_ref = store.save("alice", b"jpeg").unwrap();
        let mut alice = face("alice", vec![1.0]);
        alice.photo_ref = Some(photo_ref.clone());
        store.upsert(&alice).unwrap();

        assert!(remove_face(&store, &store, "alice").unwrap());
        assert!(store.get("alice").unwrap().is_none());
        assert!(store.photo(&photo_ref).is_none());
    }

    #[test]
    fn test_remove_face_unknown_is_false() {
        let store = MemoryStore::new();
        assert!(!remove_face(&store, &store, "nobody").unwrap());
    }

    #[test]
    fn test_camera_upsert_replaces_url() {
        let store = MemoryStore::new();
        let mut cam = CameraSource { camera_id: "cam1".into(), url: "http://a".into() };
        store.upsert_camera(&cam).unwrap();
        cam.url = "http://b".into();
        store.upsert_camera(&cam).unwrap();
        assert_eq!(store.list_cameras().unwrap(), vec![cam]);
    }
}
