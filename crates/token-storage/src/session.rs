//! Session-scoped storage
//!
//! A `Session` is the server-side half of one browser session: a string map
//! that lives as long as the caller keeps the handle. It may be backed by a
//! JSON file, in which case `commit` persists it with an atomic temp-file +
//! rename so a crash never leaves a half-written session on disk.
//!
//! `SessionStorage` adapts a session to `TokenStorage`, prefixing every key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::{Result, StorageError, StorageFuture, TokenStorage};

/// Shared handle to one session's key/value data.
///
/// Cloning is cheap and clones observe the same data.
#[derive(Debug, Clone, Default)]
pub struct Session {
    data: Arc<Mutex<HashMap<String, String>>>,
    path: Option<PathBuf>,
}

impl Session {
    /// In-memory session; `save` is a no-op.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a file-backed session.
    ///
    /// A missing file starts an empty session; the file is created on the first
    /// `save`.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| StorageError::Io(format!("reading session file: {e}")))?;
            let data: HashMap<String, String> = serde_json::from_str(&contents).map_err(|e| {
                StorageError::Serialization(format!("parsing session file: {e}"))
            })?;
            debug!(path = %path.display(), keys = data.len(), "loaded session");
            data
        } else {
            HashMap::new()
        };

        Ok(Self {
            data: Arc::new(Mutex::new(data)),
            path: Some(path),
        })
    }

    /// Persist the session if it is file-backed.
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = self.data.lock().await;
        write_atomic(path, &data).await
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.data.lock().await.get(key).cloned()
    }

    pub async fn insert(&self, key: String, value: String) {
        self.data.lock().await.insert(key, value);
    }

    pub async fn remove(&self, key: &str) -> Option<String> {
        self.data.lock().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.data.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// `TokenStorage` over a `Session`, with every key prefixed.
#[derive(Debug, Clone)]
pub struct SessionStorage {
    session: Session,
    prefix: String,
}

impl SessionStorage {
    pub fn new(session: Session, prefix: impl Into<String>) -> Self {
        Self {
            session,
            prefix: prefix.into(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

impl TokenStorage for SessionStorage {
    fn id(&self) -> &str {
        "session"
    }

    fn put<'a>(&'a self, key: &'a str, value: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.session.insert(self.key(key), value.to_owned()).await;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.session.get(&self.key(key)).await) })
    }

    fn forget<'a>(&'a self, key: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            self.session.remove(&self.key(key)).await;
            Ok(())
        })
    }

    fn commit(&self) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.session.save().await })
    }
}

/// Write session data to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over the
/// target. Permissions are 0600 on unix since the file holds nonces and tokens.
async fn write_atomic(path: &Path, data: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string(data)
        .map_err(|e| StorageError::Serialization(format!("serializing session: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| StorageError::Io("session path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".session.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| StorageError::Io(format!("writing temp session file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| StorageError::Io(format!("setting session file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| StorageError::Io(format!("renaming temp session file: {e}")))?;

    debug!(path = %path.display(), "persisted session");
    Ok(())
}
