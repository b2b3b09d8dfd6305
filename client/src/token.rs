//! Auth token persistence between sessions.

use crate::error::ClientError;
use log::debug;
use std::path::PathBuf;

#[derive(Debug, Default)]
pub struct TokenStore {
    path: Option<PathBuf>,
    token: Option<String>,
}

impl TokenStore {
    /// A store that forgets its token when dropped.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Reads the token kept at `path`, if any.
    pub async fn load(path: PathBuf) -> Result<Self, ClientError> {
        let token = match tokio::fs::read_to_string(&path).await {
            Ok(text) => Some(text.trim().to_string()).filter(|token| !token.is_empty()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded auth token from {} ({})", path.display(), token.is_some());
        Ok(Self {
            path: Some(path),
            token,
        })
    }

    pub fn get(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub async fn set(&mut self, token: String) -> Result<(), ClientError> {
        if self.token.as_deref() == Some(token.as_str()) {
            return Ok(());
        }
        if let Some(path) = &self.path {
            tokio::fs::write(path, &token).await?;
        }
        self.token = Some(token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_token_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");

        let mut store = assert_ok!(TokenStore::load(path.clone()).await);
        assert_eq!(store.get(), None);
        assert_ok!(store.set("abc.def".to_string()).await);

        let reloaded = assert_ok!(TokenStore::load(path).await);
        assert_eq!(reloaded.get(), Some("abc.def"));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let mut store = TokenStore::memory();
        store.set("t".to_string()).await.unwrap();
        assert_eq!(store.get(), Some("t"));
    }
}
