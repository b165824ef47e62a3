//! Secret sources.
//!
//! Provisioning the secret backend is someone else's job; the proxy and the
//! synchronizer only need to read one named value at startup.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::config::SecretsConfig;
use crate::secrets::types::{DecryptedSecret, SecretError};

/// Read-only access to named secrets.
#[async_trait]
pub trait SecretsStore: Send + Sync {
    /// Load a secret by name. Empty values are rejected.
    async fn get(&self, name: &str) -> Result<DecryptedSecret, SecretError>;
}

/// Reads secrets from the process environment.
#[derive(Debug, Default)]
pub struct EnvSecretsStore;

#[async_trait]
impl SecretsStore for EnvSecretsStore {
    async fn get(&self, name: &str) -> Result<DecryptedSecret, SecretError> {
        let raw = std::env::var_os(name).ok_or_else(|| SecretError::NotFound(name.to_string()))?;
        let raw = raw.into_string().map_err(|_| SecretError::InvalidUtf8)?;
        non_empty(name, DecryptedSecret::from_string(raw))
    }
}

/// Reads secrets from `<dir>/<name>`, the layout of mounted secret volumes.
#[derive(Debug)]
pub struct FileSecretsStore {
    dir: PathBuf,
}

impl FileSecretsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SecretsStore for FileSecretsStore {
    async fn get(&self, name: &str) -> Result<DecryptedSecret, SecretError> {
        if name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return Err(SecretError::NotFound(name.to_string()));
        }
        let path = self.dir.join(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SecretError::NotFound(name.to_string()));
            }
            Err(e) => {
                return Err(SecretError::Unreadable {
                    name: name.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        non_empty(name, DecryptedSecret::from_bytes(bytes)?)
    }
}

fn non_empty(name: &str, secret: DecryptedSecret) -> Result<DecryptedSecret, SecretError> {
    if secret.is_empty() {
        Err(SecretError::Empty(name.to_string()))
    } else {
        Ok(secret)
    }
}

/// Build the store selected by configuration.
pub fn store_from_config(config: &SecretsConfig) -> Box<dyn SecretsStore> {
    match &config.dir {
        Some(dir) => {
            tracing::debug!("Reading secrets from {}", dir.display());
            Box::new(FileSecretsStore::new(dir.clone()))
        }
        None => Box::new(EnvSecretsStore),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_reads_and_trims() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ANTHROPIC_API_KEY"), "sk-real\n").unwrap();

        let store = FileSecretsStore::new(dir.path());
        let secret = store.get("ANTHROPIC_API_KEY").await.unwrap();
        assert_eq!(secret.expose(), "sk-real");
    }

    #[tokio::test]
    async fn file_store_missing_secret() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretsStore::new(dir.path());
        let err = store.get("NOPE").await.unwrap_err();
        assert!(matches!(err, SecretError::NotFound(name) if name == "NOPE"));
    }

    #[tokio::test]
    async fn file_store_rejects_empty_secret() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("HF_TOKEN"), "  \n").unwrap();
        let store = FileSecretsStore::new(dir.path());
        assert!(matches!(
            store.get("HF_TOKEN").await,
            Err(SecretError::Empty(_))
        ));
    }

    #[tokio::test]
    async fn file_store_refuses_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretsStore::new(dir.path());
        assert!(store.get("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn env_store_missing_secret() {
        let err = EnvSecretsStore
            .get("SANDBRIDGE_TEST_SURELY_UNSET_SECRET")
            .await
            .unwrap_err();
        assert!(matches!(err, SecretError::NotFound(_)));
    }
}
