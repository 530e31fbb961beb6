//! Token Storage
//!
//! Key-value persistence for credentials. Keys are plain strings (already namespaced by the
//! caller) and values are strings; an absent key reads as `None`.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{OAuth2Error, StorageError};

/// Token storage interface.
#[async_trait]
pub trait TokenStorage: Send + Sync {
    /// Read the value for a key.
    async fn get(&self, key: &str) -> Result<Option<String>, OAuth2Error>;

    /// Write the value for a key, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> Result<(), OAuth2Error>;

    /// Remove a key. Returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool, OAuth2Error>;
}

/// In-memory token storage implementation.
#[derive(Default)]
pub struct InMemoryTokenStorage {
    values: Mutex<HashMap<String, String>>,
}

impl InMemoryTokenStorage {
    /// Create new in-memory token storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.values.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TokenStorage for InMemoryTokenStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, OAuth2Error> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), OAuth2Error> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, OAuth2Error> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.remove(key).is_some())
    }
}

/// Token storage backed by a JSON object on disk.
///
/// Every write rewrites the whole file. A missing file reads as empty.
pub struct FileTokenStorage {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileTokenStorage {
    /// Create storage persisting to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, String>, OAuth2Error> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(OAuth2Error::Storage(StorageError::ReadFailed {
                    message: format!("{}: {}", self.path.display(), e),
                }))
            }
        };

        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&contents).map_err(|e| {
            OAuth2Error::Storage(StorageError::CorruptedData {
                message: format!("{}: {}", self.path.display(), e),
            })
        })
    }

    async fn save(&self, values: &BTreeMap<String, String>) -> Result<(), OAuth2Error> {
        let contents = serde_json::to_string_pretty(values).map_err(|e| {
            OAuth2Error::Storage(StorageError::WriteFailed {
                message: e.to_string(),
            })
        })?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    OAuth2Error::Storage(StorageError::WriteFailed {
                        message: format!("{}: {}", parent.display(), e),
                    })
                })?;
            }
        }

        tokio::fs::write(&self.path, contents).await.map_err(|e| {
            OAuth2Error::Storage(StorageError::WriteFailed {
                message: format!("{}: {}", self.path.display(), e),
            })
        })
    }
}

#[async_trait]
impl TokenStorage for FileTokenStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, OAuth2Error> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), OAuth2Error> {
        let _guard = self.lock.lock().await;
        let mut values = self.load().await?;
        values.insert(key.to_string(), value.to_string());
        self.save(&values).await
    }

    async fn remove(&self, key: &str) -> Result<bool, OAuth2Error> {
        let _guard = self.lock.lock().await;
        let mut values = self.load().await?;
        let existed = values.remove(key).is_some();
        if existed {
            self.save(&values).await?;
        }
        Ok(existed)
    }
}

/// Mock token storage for testing.
#[derive(Default)]
pub struct MockTokenStorage {
    values: Mutex<HashMap<String, String>>,
    set_history: Mutex<Vec<(String, String)>>,
    get_history: Mutex<Vec<String>>,
    remove_history: Mutex<Vec<String>>,
    next_error: Mutex<Option<OAuth2Error>>,
    should_fail: Mutex<bool>,
}

impl MockTokenStorage {
    /// Create new mock token storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set next error to return.
    pub fn set_next_error(&self, error: OAuth2Error) -> &Self {
        *self.next_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
        self
    }

    /// Set storage to fail all operations.
    pub fn set_should_fail(&self, should_fail: bool) -> &Self {
        *self.should_fail.lock().unwrap_or_else(|e| e.into_inner()) = should_fail;
        self
    }

    /// Pre-populate a value without recording history.
    pub fn insert(&self, key: &str, value: &str) -> &Self {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Current value for a key without recording history.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Get set history.
    pub fn get_set_history(&self) -> Vec<(String, String)> {
        self.set_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Get get history.
    pub fn get_get_history(&self) -> Vec<String> {
        self.get_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Get remove history.
    pub fn get_remove_history(&self) -> Vec<String> {
        self.remove_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn check_error(&self) -> Result<(), OAuth2Error> {
        if *self.should_fail.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(OAuth2Error::Storage(StorageError::WriteFailed {
                message: "Mock storage failure".to_string(),
            }));
        }

        if let Some(error) = self
            .next_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            return Err(error);
        }

        Ok(())
    }
}

#[async_trait]
impl TokenStorage for MockTokenStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, OAuth2Error> {
        self.check_error()?;

        self.get_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(key.to_string());
        Ok(self.peek(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), OAuth2Error> {
        self.check_error()?;

        self.set_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((key.to_string(), value.to_string()));
        self.insert(key, value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, OAuth2Error> {
        self.check_error()?;

        self.remove_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(key.to_string());
        Ok(self
            .values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some())
    }
}

/// Create in-memory token storage.
pub fn create_in_memory_token_storage() -> InMemoryTokenStorage {
    InMemoryTokenStorage::new()
}

/// Create mock token storage for testing.
pub fn create_mock_token_storage() -> MockTokenStorage {
    MockTokenStorage::new()
}
