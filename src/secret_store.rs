//! Backing store for credential material.
//!
//! The CA bundle and the rotating join token live in named secrets, each a
//! small map of key → bytes. Two implementations ship with the crate:
//!
//! - [`FileSecretStore`]: one JSON file per secret in a directory, written
//!   atomically (temp file + rename) with owner-only permissions
//! - [`MemorySecretStore`]: process-local, for tests and embedding
//!
//! Values are hex-encoded in the JSON form so binary DER survives intact.

use crate::error::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Secret holding the CA certificate and key plus the server certificate and key.
pub const CA_SECRET: &str = "casecret";
/// Secret holding the current join token and the token signing key.
pub const TOKEN_SECRET: &str = "tokensecret";

pub type SecretFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A named bundle of binary values.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    data: BTreeMap<String, String>,
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Secret {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl AsRef<[u8]>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl AsRef<[u8]>) {
        self.data.insert(key.to_string(), hex::encode(value));
    }

    /// Decoded value, or `None` if absent or not valid hex.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.get(key).and_then(|v| hex::decode(v).ok())
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| String::from_utf8(v).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }
}

/// Named-secret persistence used by the credential manager.
pub trait SecretStore: Send + Sync + 'static {
    fn get(&self, name: &str) -> SecretFuture<'_, Option<Secret>>;
    fn put(&self, name: &str, secret: Secret) -> SecretFuture<'_, ()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemorySecretStore
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<String, Secret>>,
    writes: AtomicUsize,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, name: &str) -> SecretFuture<'_, Option<Secret>> {
        let name = name.to_string();
        Box::pin(async move { Ok(self.secrets.read().await.get(&name).cloned()) })
    }

    fn put(&self, name: &str, secret: Secret) -> SecretFuture<'_, ()> {
        let name = name.to_string();
        Box::pin(async move {
            self.secrets.write().await.insert(name, secret);
            self.writes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FileSecretStore
// ═══════════════════════════════════════════════════════════════════════════════

/// Directory-backed secret store.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    /// Open (creating if needed) a secret directory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| HubError::secret_store(dir.display().to_string(), e))?;
        info!(dir = %dir.display(), "Secret store opened");
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, name: &str) -> SecretFuture<'_, Option<Secret>> {
        let name = name.to_string();
        Box::pin(async move {
            let path = self.path_for(&name);
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let secret: Secret = serde_json::from_slice(&bytes)
                        .map_err(|e| HubError::secret_store(&name, format!("corrupt secret file: {}", e)))?;
                    Ok(Some(secret))
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(HubError::secret_store(&name, e)),
            }
        })
    }

    fn put(&self, name: &str, secret: Secret) -> SecretFuture<'_, ()> {
        let name = name.to_string();
        Box::pin(async move {
            let path = self.path_for(&name);
            let tmp = self.dir.join(format!(".{}.json.tmp", name));
            let bytes = serde_json::to_vec_pretty(&secret)?;

            tokio::fs::write(&tmp, &bytes)
                .await
                .map_err(|e| HubError::secret_store(&name, e))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                    .await
                    .map_err(|e| HubError::secret_store(&name, e))?;
            }
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|e| HubError::secret_store(&name, e))?;

            debug!(secret = %name, path = %path.display(), "Secret persisted");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_secret_binary_values() {
        let secret = Secret::new().with("ca.der", [0u8, 159, 255, 1]).with("name", "edge");
        assert_eq!(secret.get("ca.der"), Some(vec![0, 159, 255, 1]));
        assert_eq!(secret.get_str("name"), Some("edge".to_string()));
        assert!(secret.get("missing").is_none());
        assert!(secret.contains("ca.der"));
    }

    #[test]
    fn test_secret_debug_hides_values() {
        let secret = Secret::new().with("key.pem", "PRIVATE");
        let debug = format!("{:?}", secret);
        assert!(debug.contains("key.pem"));
        assert!(!debug.contains("PRIVATE"));
        assert!(!debug.contains(&hex::encode("PRIVATE")));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySecretStore::new();
        assert!(store.get(CA_SECRET).await.unwrap().is_none());

        store.put(CA_SECRET, Secret::new().with("a", "1")).await.unwrap();
        let got = store.get(CA_SECRET).await.unwrap().unwrap();
        assert_eq!(got.get_str("a"), Some("1".into()));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempdir().unwrap();
        {
            let store = FileSecretStore::open(dir.path()).await.unwrap();
            store.put(TOKEN_SECRET, Secret::new().with("token", "abc.def")).await.unwrap();
        }
        let store = FileSecretStore::open(dir.path()).await.unwrap();
        let got = store.get(TOKEN_SECRET).await.unwrap().unwrap();
        assert_eq!(got.get_str("token"), Some("abc.def".into()));
        assert!(store.get(CA_SECRET).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_overwrite() {
        let dir = tempdir().unwrap();
        let store = FileSecretStore::open(dir.path()).await.unwrap();
        store.put("s", Secret::new().with("v", "1")).await.unwrap();
        store.put("s", Secret::new().with("v", "2")).await.unwrap();
        let got = store.get("s").await.unwrap().unwrap();
        assert_eq!(got.get_str("v"), Some("2".into()));
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file_is_error() {
        let dir = tempdir().unwrap();
        let store = FileSecretStore::open(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("broken.json"), b"{not json").await.unwrap();
        let err = store.get("broken").await.unwrap_err();
        assert!(matches!(err, HubError::SecretStore { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_store_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let store = FileSecretStore::open(dir.path()).await.unwrap();
        store.put("perm", Secret::new().with("k", "v")).await.unwrap();
        let meta = std::fs::metadata(dir.path().join("perm.json")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
