//! Browser sessions
//!
//! Each browser carries an `oidc_session` cookie holding a v4 UUID. The id
//! selects the server-side storage backing its `TokenManager` and the tokens
//! from its last completed flow.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use axum::http::header::COOKIE;
use common::Secret;
use oidc_client::{TokenManager, TokenSet};
use tokio::sync::Mutex;
use tokio::time::Instant;
use token_storage::{
    Cache, CacheStorage, NullStorage, Session, SessionStorage, StorageDriver, TokenStorage,
};
use tracing::debug;
use uuid::Uuid;

use crate::config::StorageConfig;

pub const SESSION_COOKIE: &str = "oidc_session";

/// Session id from the request cookie, if present and well formed.
pub fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .and_then(|(_, value)| Uuid::parse_str(value).ok())
        .map(|id| id.to_string())
}

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// `Set-Cookie` value for `id`. Secure cookies use `SameSite=None` so the
/// provider's cross-site form post still carries them.
pub fn session_cookie(id: &str, secure: bool) -> String {
    if secure {
        format!("{SESSION_COOKIE}={id}; Path=/; HttpOnly; Secure; SameSite=None")
    } else {
        format!("{SESSION_COOKIE}={id}; Path=/; HttpOnly; SameSite=Lax")
    }
}

/// Server-side state for every browser session.
///
/// Entries are dropped once idle for `session_idle`, and the least recently
/// used one is evicted when `max_sessions` is reached.
#[derive(Clone)]
pub struct SessionStore {
    driver: StorageDriver,
    key_prefix: String,
    signing_key: Option<Secret<String>>,
    session_dir: Option<PathBuf>,
    cache: Cache,
    cache_ttl: Option<Duration>,
    idle: Duration,
    max_sessions: usize,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

struct Entry {
    session: Option<Session>,
    tokens: Option<TokenSet>,
    last_seen: Instant,
}

impl Entry {
    fn is_idle(&self, now: Instant, idle: Duration) -> bool {
        now.duration_since(self.last_seen) >= idle
    }
}

impl SessionStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            driver: config.driver,
            key_prefix: config.key_prefix.clone(),
            signing_key: config.state_signing_key.clone(),
            session_dir: config.session_dir.clone(),
            cache: Cache::new(),
            cache_ttl: config.cache_ttl(),
            idle: config.session_idle(),
            max_sessions: config.max_sessions.max(1),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn driver(&self) -> StorageDriver {
        self.driver
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Number of sessions held in memory.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Token manager for session `id`, with tokens from its last flow restored.
    pub async fn token_manager(&self, id: &str) -> token_storage::Result<TokenManager> {
        let mut entries = self.entries.lock().await;
        let entry = self.touch(&mut entries, id);
        let storage: Arc<dyn TokenStorage> = match self.driver {
            StorageDriver::Session => {
                let session = match entry.session.clone() {
                    Some(session) => session,
                    None => {
                        let session = match &self.session_dir {
                            Some(dir) => Session::load(dir.join(format!("{id}.json"))).await?,
                            None => Session::new(),
                        };
                        debug!(persistent = self.session_dir.is_some(), "opened session");
                        entry.session = Some(session.clone());
                        session
                    }
                };
                Arc::new(SessionStorage::new(session, self.key_prefix.clone()))
            }
            // One shared cache; the session id keeps browsers apart
            StorageDriver::Cache => Arc::new(CacheStorage::new(
                self.cache.clone(),
                format!("{}{id}:", self.key_prefix),
                self.cache_ttl,
            )),
            StorageDriver::Null => Arc::new(NullStorage::new()),
        };

        let mut manager = TokenManager::new(storage, self.signing_key.clone());
        if let Some(tokens) = &entry.tokens {
            manager.set_tokens(tokens.clone());
        }
        Ok(manager)
    }

    /// Remember the tokens `manager` holds for later requests in session `id`.
    pub async fn store_tokens(&self, id: &str, manager: &TokenManager) {
        let mut entries = self.entries.lock().await;
        self.touch(&mut entries, id).tokens = Some(manager.tokens().clone());
    }

    pub async fn has_tokens(&self, id: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(id)
            .and_then(|entry| entry.tokens.as_ref())
            .is_some_and(|t| t.access_token.is_some())
    }

    /// Drop sessions idle for longer than the configured limit. Returns how
    /// many were dropped.
    pub async fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_idle(now, self.idle));
        before - entries.len()
    }

    /// Entry for `id` marked as seen now, created (evicting if full) when absent.
    fn touch<'a>(&self, entries: &'a mut HashMap<String, Entry>, id: &str) -> &'a mut Entry {
        let now = Instant::now();
        if !entries.contains_key(id) && entries.len() >= self.max_sessions {
            entries.retain(|_, entry| !entry.is_idle(now, self.idle));
            if entries.len() >= self.max_sessions {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_seen)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                    debug!(max_sessions = self.max_sessions, "evicted least recently used session");
                }
            }
        }
        let entry = entries.entry(id.to_string()).or_insert_with(|| Entry {
            session: None,
            tokens: None,
            last_seen: now,
        });
        entry.last_seen = now;
        entry
    }
}
