// crates/auditflow-core/src/payload.rs
// ============================================================================
// Module: Payload Store Contract
// Description: Content-addressed blob store trait.
// Purpose: Decouple the orchestrator from any one payload storage backend.
// Dependencies: crate::{error, hashing}
// ============================================================================

//! ## Overview
//! The payload store maps a content hash to a byte blob. Multiple logical
//! references (row source data, operation input/output, call request/
//! response, routing reasons) may share one hash. `put` is content-addressed
//! and therefore safe for concurrent use; `delete` must not run concurrently
//! with `put`/`get` against an in-flight run (enforced by the retention
//! purge manager only running against completed runs, §5).

use crate::error::PayloadError;
use crate::hashing::HashAlgorithm;
use crate::hashing::HashDigest;

/// Content-addressed blob store.
pub trait PayloadStore {
    /// Stores `bytes`, returning its content hash. Idempotent: storing the
    /// same bytes twice returns the same hash without error.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Io`] when the underlying store fails.
    fn put(&self, algorithm: HashAlgorithm, bytes: &[u8]) -> Result<HashDigest, PayloadError>;

    /// Retrieves the bytes for `hash`, or `None` if no such blob exists.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Io`] when the underlying store fails.
    fn get(&self, hash: &HashDigest) -> Result<Option<Vec<u8>>, PayloadError>;

    /// Reports whether a blob for `hash` is currently stored.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Io`] when the underlying store fails.
    fn exists(&self, hash: &HashDigest) -> Result<bool, PayloadError>;

    /// Deletes the blob for `hash`.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::Io`] when the underlying store fails. Callers
    /// are responsible for confirming no live reference remains before
    /// calling delete; the store itself does not track references.
    fn delete(&self, hash: &HashDigest) -> Result<bool, PayloadError>;
}

/// In-memory [`PayloadStore`] used by unit and integration tests.
#[derive(Debug, Default)]
pub struct InMemoryPayloadStore {
    blobs: std::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

impl InMemoryPayloadStore {
    /// Creates an empty in-memory payload store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadStore for InMemoryPayloadStore {
    fn put(&self, algorithm: HashAlgorithm, bytes: &[u8]) -> Result<HashDigest, PayloadError> {
        let digest = crate::hashing::hash_bytes(algorithm, bytes);
        let mut blobs = self.blobs.lock().map_err(|_| PayloadError::Io("poisoned lock".to_string()))?;
        blobs.insert(digest.value.clone(), bytes.to_vec());
        Ok(digest)
    }

    fn get(&self, hash: &HashDigest) -> Result<Option<Vec<u8>>, PayloadError> {
        let blobs = self.blobs.lock().map_err(|_| PayloadError::Io("poisoned lock".to_string()))?;
        Ok(blobs.get(&hash.value).cloned())
    }

    fn exists(&self, hash: &HashDigest) -> Result<bool, PayloadError> {
        let blobs = self.blobs.lock().map_err(|_| PayloadError::Io("poisoned lock".to_string()))?;
        Ok(blobs.contains_key(&hash.value))
    }

    fn delete(&self, hash: &HashDigest) -> Result<bool, PayloadError> {
        let mut blobs = self.blobs.lock().map_err(|_| PayloadError::Io("poisoned lock".to_string()))?;
        Ok(blobs.remove(&hash.value).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::DEFAULT_HASH_ALGORITHM;

    #[test]
    fn put_is_idempotent_and_content_addressed() {
        let store = InMemoryPayloadStore::new();
        let a = store.put(DEFAULT_HASH_ALGORITHM, b"hello").unwrap();
        let b = store.put(DEFAULT_HASH_ALGORITHM, b"hello").unwrap();
        assert_eq!(a, b);
        assert!(store.exists(&a).unwrap());
    }

    #[test]
    fn delete_removes_and_reports_absence() {
        let store = InMemoryPayloadStore::new();
        let hash = store.put(DEFAULT_HASH_ALGORITHM, b"payload").unwrap();
        assert!(store.delete(&hash).unwrap());
        assert!(!store.exists(&hash).unwrap());
        assert!(store.get(&hash).unwrap().is_none());
    }
}
