//! Image store abstraction.
//!
//! No storage assumptions: the in-memory implementation backs tests/dev, a
//! CDN-backed implementation can be swapped in without touching callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use uuid::Uuid;

/// Image content as submitted by a client, base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    data_base64: String,
}

impl ImagePayload {
    pub fn new(data_base64: impl Into<String>) -> Result<Self, ImageStoreError> {
        let data_base64 = data_base64.into();
        if data_base64.trim().is_empty() {
            return Err(ImageStoreError::EmptyPayload);
        }
        Ok(Self { data_base64 })
    }

    pub fn data_base64(&self) -> &str {
        &self.data_base64
    }
}

#[derive(Debug, Error)]
pub enum ImageStoreError {
    #[error("image payload is empty")]
    EmptyPayload,

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("deletion failed: {0}")]
    Delete(String),
}

/// Remote image storage.
///
/// `upload` returns the public link for the stored binary; `delete` removes
/// it again. Implementations must tolerate `delete` being called for links
/// they no longer hold.
pub trait ImageStore: Send + Sync {
    fn upload(&self, folder: &str, payload: &ImagePayload) -> Result<String, ImageStoreError>;
    fn delete(&self, link: &str) -> Result<(), ImageStoreError>;
}

impl<S> ImageStore for Arc<S>
where
    S: ImageStore + ?Sized,
{
    fn upload(&self, folder: &str, payload: &ImagePayload) -> Result<String, ImageStoreError> {
        (**self).upload(folder, payload)
    }

    fn delete(&self, link: &str) -> Result<(), ImageStoreError> {
        (**self).delete(link)
    }
}

/// In-memory image store for tests/dev.
///
/// `fail_uploads`/`fail_deletes` let tests exercise the best-effort paths.
#[derive(Debug, Default)]
pub struct InMemoryImageStore {
    objects: RwLock<HashMap<String, ImagePayload>>,
    fail_uploads: AtomicBool,
    fail_deletes: AtomicBool,
}

impl InMemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, link: &str) -> bool {
        self.objects
            .read()
            .map(|m| m.contains_key(link))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ImageStore for InMemoryImageStore {
    fn upload(&self, folder: &str, payload: &ImagePayload) -> Result<String, ImageStoreError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(ImageStoreError::Upload("simulated outage".to_string()));
        }

        let link = format!("mem://{folder}/{}", Uuid::now_v7());
        self.objects
            .write()
            .map_err(|_| ImageStoreError::Upload("lock poisoned".to_string()))?
            .insert(link.clone(), payload.clone());

        Ok(link)
    }

    fn delete(&self, link: &str) -> Result<(), ImageStoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ImageStoreError::Delete("simulated outage".to_string()));
        }

        // Deleting an unknown link is a no-op, not an error.
        if let Ok(mut objects) = self.objects.write() {
            objects.remove(link);
        }

        Ok(())
    }
}
