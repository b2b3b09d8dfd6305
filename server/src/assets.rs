//! Content-addressed asset directory.
//!
//! Files are named `<sha256 hex>.<ext>`. Storing a file whose name is already
//! present is a no-op, which is what lets clients skip uploads the server
//! already has.

use log::info;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("invalid asset filename {0:?}")]
    InvalidFilename(String),

    #[error("content does not match hash in {0:?}")]
    HashMismatch(String),

    #[error("upload of {size} bytes exceeds limit of {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lowercase hex sha256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Checks the `<64 hex>.<ext>` shape and returns the hash part.
pub fn parse_filename(filename: &str) -> Result<&str, AssetError> {
    let invalid = || AssetError::InvalidFilename(filename.to_string());
    let (hash, ext) = filename.split_once('.').ok_or_else(invalid)?;
    let hash_ok = hash.len() == 64
        && hash
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    let ext_ok =
        !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    if !hash_ok || !ext_ok {
        return Err(invalid());
    }
    Ok(hash)
}

pub struct AssetStore {
    dir: PathBuf,
    max_size: u64,
}

impl AssetStore {
    pub async fn open(dir: impl AsRef<Path>, max_size: u64) -> Result<Self, AssetError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir, max_size })
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn path(&self, filename: &str) -> Result<PathBuf, AssetError> {
        parse_filename(filename)?;
        Ok(self.dir.join(filename))
    }

    pub async fn exists(&self, filename: &str) -> Result<bool, AssetError> {
        Ok(tokio::fs::try_exists(self.path(filename)?).await?)
    }

    /// Stores `bytes` under `filename`. Returns false when it was already there.
    pub async fn put(&self, filename: &str, bytes: &[u8]) -> Result<bool, AssetError> {
        let size = bytes.len() as u64;
        if size > self.max_size {
            return Err(AssetError::TooLarge {
                size,
                max: self.max_size,
            });
        }
        let hash = parse_filename(filename)?;
        if content_hash(bytes) != hash {
            return Err(AssetError::HashMismatch(filename.to_string()));
        }

        let path = self.dir.join(filename);
        if tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }
        let tmp = self.dir.join(format!("{}.part", filename));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        info!("Stored asset {} ({} bytes)", filename, size);
        Ok(true)
    }

    pub async fn read(&self, filename: &str) -> Result<Vec<u8>, AssetError> {
        Ok(tokio::fs::read(self.path(filename)?).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_for(bytes: &[u8], ext: &str) -> String {
        format!("{}.{}", content_hash(bytes), ext)
    }

    #[test]
    fn test_content_hash_is_lowercase_sha256() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_filename_validation() {
        let good = name_for(b"model", "glb");
        assert!(parse_filename(&good).is_ok());
        assert!(parse_filename("model.glb").is_err());
        assert!(parse_filename(&format!("{}.", content_hash(b"x"))).is_err());
        assert!(parse_filename(&format!("{}.g/b", content_hash(b"x"))).is_err());
        assert!(parse_filename(&format!("../{}", good)).is_err());
        assert!(parse_filename(&good.to_uppercase()).is_err());
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssetStore::open(dir.path(), 1024).await.unwrap();
        let bytes = b"glTF binary";
        let filename = name_for(bytes, "glb");

        assert!(!store.exists(&filename).await.unwrap());
        assert!(store.put(&filename, bytes).await.unwrap());
        assert!(store.exists(&filename).await.unwrap());
        assert!(!store.put(&filename, bytes).await.unwrap());
        assert_eq!(store.read(&filename).await.unwrap(), bytes.to_vec());
    }

    #[tokio::test]
    async fn test_put_rejects_bad_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssetStore::open(dir.path(), 8).await.unwrap();

        let big = vec![0u8; 9];
        assert!(matches!(
            store.put(&name_for(&big, "bin"), &big).await,
            Err(AssetError::TooLarge { size: 9, max: 8 })
        ));
        assert!(matches!(
            store.put(&name_for(b"a", "txt"), b"b").await,
            Err(AssetError::HashMismatch(_))
        ));
    }
}
