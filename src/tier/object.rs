/// Object tier: content-addressed blob storage.
///
/// Each blob lives in its own file named by the SHA-256 hex digest of its
/// content, prefixed with a CRC32 checksum that is verified on every read.
/// Writes are idempotent (same content, same digest, same file) and go
/// through a temp-file rename so partial writes never become visible.
use crate::error::{EngramError, EngramResult};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Length of the CRC32 prefix in a blob file.
const CRC_PREFIX_LEN: usize = 4;

/// The blob store backing the Object tier.
pub struct ObjectStore {
    dir: PathBuf,
}

impl ObjectStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> EngramResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create blob dir", e))?;
        Ok(Self { dir })
    }

    /// Compute the content address of a payload.
    pub fn digest_of(payload: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(payload);
        hex::encode(hasher.finalize())
    }

    /// Write a blob, returning its digest. A blob that already exists is
    /// left untouched.
    pub async fn put(&self, payload: &[u8]) -> EngramResult<String> {
        let digest = Self::digest_of(payload);
        let path = self.blob_path(&digest)?;

        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(digest);
        }

        let crc = crc32fast::hash(payload);
        let mut framed = Vec::with_capacity(CRC_PREFIX_LEN + payload.len());
        framed.extend_from_slice(&crc.to_be_bytes());
        framed.extend_from_slice(payload);

        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &framed)
            .await
            .map_err(|e| io_error("write blob", e))?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| io_error("commit blob", e))?;

        debug!(digest = %digest, bytes = payload.len(), "blob stored");
        Ok(digest)
    }

    /// Read a blob by digest. Returns `Ok(None)` when absent; a checksum
    /// or digest mismatch is an `IntegrityViolation`.
    pub async fn get(&self, digest: &str) -> EngramResult<Option<Vec<u8>>> {
        let path = self.blob_path(digest)?;

        let framed = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("read blob", e)),
        };

        if framed.len() < CRC_PREFIX_LEN {
            return Err(EngramError::IntegrityViolation {
                reason: format!("blob {} truncated below checksum prefix", digest),
            });
        }

        let (prefix, payload) = framed.split_at(CRC_PREFIX_LEN);
        let stored_crc = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        let actual_crc = crc32fast::hash(payload);
        if stored_crc != actual_crc {
            return Err(EngramError::IntegrityViolation {
                reason: format!(
                    "blob {} checksum mismatch: stored {:08x}, computed {:08x}",
                    digest, stored_crc, actual_crc
                ),
            });
        }

        if Self::digest_of(payload) != digest {
            return Err(EngramError::IntegrityViolation {
                reason: format!("blob {} content does not match its address", digest),
            });
        }

        Ok(Some(payload.to_vec()))
    }

    /// Delete a blob. Returns whether it existed.
    pub async fn delete(&self, digest: &str) -> EngramResult<bool> {
        let path = self.blob_path(digest)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error("delete blob", e)),
        }
    }

    pub async fn contains(&self, digest: &str) -> EngramResult<bool> {
        let path = self.blob_path(digest)?;
        Ok(tokio::fs::metadata(&path).await.is_ok())
    }

    /// All stored digests, for the reconciliation scan.
    pub async fn digests(&self) -> EngramResult<Vec<String>> {
        let mut out = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| io_error("list blob dir", e))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| io_error("list blob dir", e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if is_valid_digest(name) {
                    out.push(name.to_string());
                }
            }
        }
        Ok(out)
    }

    fn blob_path(&self, digest: &str) -> EngramResult<PathBuf> {
        if !is_valid_digest(digest) {
            return Err(EngramError::ValidationError {
                reason: format!("malformed blob digest: {:?}", digest),
            });
        }
        Ok(self.dir.join(digest))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// A digest names a file on disk, so it must be exactly 64 hex chars.
fn is_valid_digest(digest: &str) -> bool {
    digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit())
}

fn io_error(op: &str, e: std::io::Error) -> EngramError {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
            EngramError::TierUnavailable {
                tier: "object".to_string(),
                reason: format!("{}: {}", op, e),
            }
        }
        _ => EngramError::StorageError(format!("{}: {}", op, e)),
    }
}
