//! Named image store shared between a caller and its pipelines.
//!
//! The store supplies image-valued analysis options by name and receives
//! pipeline outputs. Alongside images it keeps string "extras", such as the
//! recorded acquisition structure of each ASL dataset.

use crate::errors::{BasilError, Result};
use crate::image::SandboxImage;
use dashmap::DashMap;

/// A named collection of images plus string metadata.
pub trait ImageStore: Send + Sync {
    /// Looks up an image by name.
    fn get(&self, name: &str) -> Option<SandboxImage>;

    /// Adds or replaces an image under `name`.
    fn add(&self, name: &str, image: SandboxImage);

    /// Removes an image, returning it if present.
    fn remove(&self, name: &str) -> Option<SandboxImage>;

    /// Names of all stored images, sorted.
    fn names(&self) -> Vec<String>;

    /// Looks up a metadata value.
    fn extra(&self, key: &str) -> Option<String>;

    /// Sets a metadata value.
    fn set_extra(&self, key: &str, value: String);

    /// True if an image is stored under `name`.
    fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Looks up an image, failing with [`BasilError::ResourceNotFound`].
    fn require(&self, name: &str) -> Result<SandboxImage> {
        self.get(name).ok_or_else(|| BasilError::not_found(name))
    }
}

/// In-memory [`ImageStore`] backed by concurrent maps.
#[derive(Debug, Default)]
pub struct InMemoryImageStore {
    images: DashMap<String, SandboxImage>,
    extras: DashMap<String, String>,
}

impl InMemoryImageStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored images.
    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// True if no images are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl ImageStore for InMemoryImageStore {
    fn get(&self, name: &str) -> Option<SandboxImage> {
        self.images.get(name).map(|entry| entry.value().clone())
    }

    fn add(&self, name: &str, image: SandboxImage) {
        tracing::debug!(name = %name, source = %image.summary(), "Storing image");
        self.images.insert(name.to_string(), image);
    }

    fn remove(&self, name: &str) -> Option<SandboxImage> {
        self.images.remove(name).map(|(_, image)| image)
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.images.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    fn extra(&self, key: &str) -> Option<String> {
        self.extras.get(key).map(|entry| entry.value().clone())
    }

    fn set_extra(&self, key: &str, value: String) {
        self.extras.insert(key.to_string(), value);
    }

    fn contains(&self, name: &str) -> bool {
        self.images.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::VoxelArray;

    fn image(name: &str) -> SandboxImage {
        SandboxImage::from_array(name, VoxelArray::zeros(vec![2, 2, 1]).unwrap())
    }

    #[test]
    fn test_add_get_remove() {
        let store = InMemoryImageStore::new();
        store.add("pwm", image("pwm"));
        store.add("mask", image("brain_mask"));

        assert!(store.contains("pwm"));
        assert_eq!(store.get("mask").unwrap().name(), "brain_mask");
        assert_eq!(store.names(), vec!["mask", "pwm"]);

        assert!(store.remove("pwm").is_some());
        assert!(store.remove("pwm").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_require_missing_is_not_found() {
        let store = InMemoryImageStore::new();
        let err = store.require("t1map").unwrap_err();
        assert!(matches!(err, BasilError::ResourceNotFound { ref name } if name == "t1map"));
    }

    #[test]
    fn test_extras() {
        let store = InMemoryImageStore::new();
        assert!(store.extra("ASL_STRUCTURE_asl").is_none());
        store.set_extra("ASL_STRUCTURE_asl", "{}".to_string());
        assert_eq!(store.extra("ASL_STRUCTURE_asl").as_deref(), Some("{}"));
    }
}
