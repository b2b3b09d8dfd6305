//! Content-addressed uploads over the HTTP side-channel.
//!
//! Files are named by the sha256 of their bytes, so the server can tell the
//! client it already has a file before any bytes are sent.

use crate::error::ClientError;
use async_trait::async_trait;
use log::{debug, info};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// The two calls the uploader needs from the server.
#[async_trait]
pub trait AssetApi: Send + Sync {
    async fn exists(&self, filename: &str) -> Result<bool, ClientError>;

    async fn put(&self, filename: &str, bytes: Vec<u8>) -> Result<(), ClientError>;
}

pub struct HttpAssetApi {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct UploadCheckResponse {
    exists: bool,
}

impl HttpAssetApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AssetApi for HttpAssetApi {
    async fn exists(&self, filename: &str) -> Result<bool, ClientError> {
        let response: UploadCheckResponse = self
            .http
            .get(format!("{}/upload-check", self.base_url))
            .query(&[("filename", filename)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.exists)
    }

    async fn put(&self, filename: &str, bytes: Vec<u8>) -> Result<(), ClientError> {
        let part = Part::bytes(bytes).file_name(filename.to_string());
        self.http
            .post(format!("{}/upload", self.base_url))
            .multipart(Form::new().part("file", part))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Uploaded {
    pub filename: String,
    /// False when the server already had the file.
    pub transferred: bool,
}

impl Uploaded {
    /// `asset://` URL blueprints refer to the file by.
    pub fn url(&self) -> String {
        format!("asset://{}", self.filename)
    }
}

/// `<sha256 hex>.<ext>` for `bytes`.
pub fn asset_filename(bytes: &[u8], ext: &str) -> String {
    let hash = hex::encode(Sha256::digest(bytes));
    format!("{}.{}", hash, ext.trim_start_matches('.').to_ascii_lowercase())
}

/// Hashes `bytes` and sends them only when the server does not have them yet.
pub async fn upload(
    api: &dyn AssetApi,
    bytes: Vec<u8>,
    ext: &str,
    max_size: u64,
) -> Result<Uploaded, ClientError> {
    let size = bytes.len() as u64;
    if size > max_size {
        return Err(ClientError::TooLarge {
            size,
            max: max_size,
        });
    }

    let filename = asset_filename(&bytes, ext);
    if api.exists(&filename).await? {
        debug!("Server already has {}", filename);
        return Ok(Uploaded {
            filename,
            transferred: false,
        });
    }

    api.put(&filename, bytes).await?;
    info!("Uploaded {} ({} bytes)", filename, size);
    Ok(Uploaded {
        filename,
        transferred: true,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Records puts and answers `exists` from what it has seen.
    #[derive(Default)]
    pub struct FakeAssetApi {
        pub stored: Mutex<HashSet<String>>,
        pub puts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AssetApi for FakeAssetApi {
        async fn exists(&self, filename: &str) -> Result<bool, ClientError> {
            Ok(self.stored.lock().unwrap().contains(filename))
        }

        async fn put(&self, filename: &str, _bytes: Vec<u8>) -> Result<(), ClientError> {
            self.stored.lock().unwrap().insert(filename.to_string());
            self.puts.lock().unwrap().push(filename.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_filename_is_content_hash() {
        let name = asset_filename(b"hello", ".GLB");
        assert_eq!(
            name,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824.glb"
        );
        assert_eq!(asset_filename(b"hello", "glb"), name);
    }

    #[tokio::test]
    async fn test_upload_skips_known_files() {
        let api = FakeAssetApi::default();

        let first = upload(&api, b"model".to_vec(), "glb", 1024).await.unwrap();
        assert!(first.transferred);
        assert!(first.url().starts_with("asset://"));

        let second = upload(&api, b"model".to_vec(), "glb", 1024).await.unwrap();
        assert!(!second.transferred);
        assert_eq!(second.filename, first.filename);
        assert_eq!(api.puts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_checks_size_first() {
        let api = FakeAssetApi::default();
        let result = upload(&api, vec![0; 16], "bin", 8).await;
        assert!(matches!(result, Err(ClientError::TooLarge { size: 16, max: 8 })));
        assert!(api.puts.lock().unwrap().is_empty());
    }
}
