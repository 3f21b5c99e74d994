// crates/auditflow-payload-fs/src/lib.rs
// ============================================================================
// Module: Filesystem Payload Store
// Description: Content-addressed PayloadStore backed by the local filesystem.
// Purpose: Persist purged-from-memory payloads (row source data, operation
//          I/O, call request/response, routing reasons) durably on disk.
// Dependencies: auditflow-core
// ============================================================================

//! ## Overview
//! [`FilesystemPayloadStore`] lays out blobs under a root directory sharded
//! by the first two hex characters of the digest, mirroring how a
//! content-addressed object store avoids one directory holding millions of
//! entries. Because every path component is derived from a hex-encoded
//! [`HashDigest`] rather than caller-supplied text, there is no path to
//! validate beyond rejecting a digest whose `value` is not plain lowercase
//! hex — a malformed digest can therefore never escape the store root.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use auditflow_core::error::PayloadError;
use auditflow_core::hashing::HashAlgorithm;
use auditflow_core::hashing::HashDigest;
use auditflow_core::hashing::hash_bytes;
use auditflow_core::payload::PayloadStore;
use thiserror::Error;

/// Length of the shard-directory prefix taken from a digest's hex value.
const SHARD_PREFIX_LEN: usize = 2;

/// Errors raised while resolving or validating a payload path.
#[derive(Debug, Error)]
pub enum FilesystemPayloadStoreError {
    /// The store root could not be created.
    #[error("unable to create payload store root: {0}")]
    RootUnavailable(String),
    /// A digest's hex value contains characters other than `[0-9a-f]`.
    #[error("digest {0:?} is not lowercase hex and cannot be stored")]
    InvalidDigest(String),
}

impl From<FilesystemPayloadStoreError> for PayloadError {
    fn from(err: FilesystemPayloadStoreError) -> Self {
        Self::Io(err.to_string())
    }
}

/// Content-addressed [`PayloadStore`] rooted at a directory on the local
/// filesystem.
///
/// # Invariants
/// - Every stored path is derived solely from a digest's algorithm and
///   hex value; no caller-supplied path component is ever joined onto the
///   root.
pub struct FilesystemPayloadStore {
    root: PathBuf,
}

impl FilesystemPayloadStore {
    /// Opens a filesystem payload store rooted at `root`, creating the
    /// directory if it does not already exist.
    ///
    /// # Errors
    ///
    /// Returns [`FilesystemPayloadStoreError::RootUnavailable`] if `root`
    /// cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, FilesystemPayloadStoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| FilesystemPayloadStoreError::RootUnavailable(err.to_string()))?;
        Ok(Self { root })
    }

    /// Returns the on-disk path for a digest, without touching the
    /// filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`FilesystemPayloadStoreError::InvalidDigest`] if the
    /// digest's hex value contains non-hex characters.
    fn path_for(&self, hash: &HashDigest) -> Result<PathBuf, FilesystemPayloadStoreError> {
        if hash.value.is_empty() || !hash.value.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            return Err(FilesystemPayloadStoreError::InvalidDigest(hash.value.clone()));
        }
        let shard = &hash.value[..hash.value.len().min(SHARD_PREFIX_LEN)];
        Ok(self.root.join(algorithm_dir(hash.algorithm)).join(shard).join(&hash.value))
    }

    fn io_err(path: &Path, err: io::Error) -> PayloadError {
        PayloadError::Io(format!("{}: {err}", path.display()))
    }
}

/// Returns the directory name used to namespace one hash algorithm's blobs.
const fn algorithm_dir(algorithm: HashAlgorithm) -> &'static str {
    match algorithm {
        HashAlgorithm::Sha256Rfc8785 => "sha256-rfc8785",
    }
}

impl PayloadStore for FilesystemPayloadStore {
    fn put(&self, algorithm: HashAlgorithm, bytes: &[u8]) -> Result<HashDigest, PayloadError> {
        let digest = hash_bytes(algorithm, bytes);
        let path = self.path_for(&digest)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| Self::io_err(parent, err))?;
        }
        if !path.exists() {
            fs::write(&path, bytes).map_err(|err| Self::io_err(&path, err))?;
        }
        Ok(digest)
    }

    fn get(&self, hash: &HashDigest) -> Result<Option<Vec<u8>>, PayloadError> {
        let path = self.path_for(hash)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::io_err(&path, err)),
        }
    }

    fn exists(&self, hash: &HashDigest) -> Result<bool, PayloadError> {
        let path = self.path_for(hash)?;
        Ok(path.is_file())
    }

    fn delete(&self, hash: &HashDigest) -> Result<bool, PayloadError> {
        let path = self.path_for(hash)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Self::io_err(&path, err)),
        }
    }
}
