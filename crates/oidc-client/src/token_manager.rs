//! Token and session-state manager
//!
//! Binds nonce, state and PKCE verifier to one authorization attempt as a
//! state-scoped bundle:
//!
//! ```text
//! state-bundle:<state>  →  {"nonce": ..., "code_verifier": ..., "sid": ...}
//! state-used:<state>    →  "1"   (tombstone, written on every terminal outcome)
//! ```
//!
//! `sid` is `hex(HMAC-SHA256(signing_key, state))`. A bundle whose `sid` does
//! not match is treated as absent, so a bundle lifted from another session
//! context cannot be replayed here.
//!
//! Sessions created before bundles existed kept `nonce`, `state` and
//! `code_verifier` as plain keys. `load_state_bundle` still honours them when
//! the stored `state` matches exactly, and migrates them into a bundle.

use std::sync::Arc;

use common::Secret;
use hmac::{Hmac, Mac};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use token_storage::TokenStorage;
use tracing::{debug, warn};

use crate::constants::{
    CODE_VERIFIER_KEY, NONCE_KEY, STATE_BUNDLE_PREFIX, STATE_KEY, STATE_USED_PREFIX,
    TOMBSTONE_MARKER,
};
use crate::error::{Error, Result};

/// Secrets for one pending authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBundle {
    pub nonce: String,
    #[serde(default)]
    pub code_verifier: Option<String>,
    #[serde(default)]
    pub sid: Option<String>,
}

/// Tokens from the last completed flow. Overwritten wholesale on success.
#[derive(Debug, Clone, Default)]
pub struct TokenSet {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub raw_response: Option<Map<String, Value>>,
}

pub struct TokenManager {
    storage: Arc<dyn TokenStorage>,
    signing_key: Option<Secret<String>>,
    tokens: TokenSet,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("storage", &self.storage.id())
            .field("session_binding", &self.signing_key.is_some())
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    /// `signing_key = None` disables session binding (`sid` is not recorded).
    pub fn new(storage: Arc<dyn TokenStorage>, signing_key: Option<Secret<String>>) -> Self {
        Self {
            storage,
            signing_key: signing_key.filter(|k| !k.is_empty()),
            tokens: TokenSet::default(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn TokenStorage> {
        &self.storage
    }

    // Final tokens

    pub fn tokens(&self) -> &TokenSet {
        &self.tokens
    }

    pub fn access_token(&self) -> Option<&str> {
        self.tokens.access_token.as_deref()
    }

    pub fn set_access_token(&mut self, token: impl Into<String>) {
        self.tokens.access_token = Some(token.into());
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.tokens.refresh_token.as_deref()
    }

    pub fn set_refresh_token(&mut self, token: Option<String>) {
        self.tokens.refresh_token = token;
    }

    pub fn id_token(&self) -> Option<&str> {
        self.tokens.id_token.as_deref()
    }

    pub fn set_id_token(&mut self, token: impl Into<String>) {
        self.tokens.id_token = Some(token.into());
    }

    pub fn token_response(&self) -> Option<&Map<String, Value>> {
        self.tokens.raw_response.as_ref()
    }

    pub fn set_token_response(&mut self, response: Map<String, Value>) {
        self.tokens.raw_response = Some(response);
    }

    /// Replace every stored token at once.
    pub fn set_tokens(&mut self, tokens: TokenSet) {
        self.tokens = tokens;
    }

    // Raw storage access

    pub async fn set_session_key(&self, key: &str, value: &str) -> Result<()> {
        Ok(self.storage.put(key, value).await?)
    }

    pub async fn session_key(&self, key: &str) -> Result<Option<String>> {
        Ok(self.storage.get(key).await?)
    }

    pub async fn unset_session_key(&self, key: &str) -> Result<()> {
        Ok(self.storage.forget(key).await?)
    }

    pub async fn commit_session(&self) -> Result<()> {
        Ok(self.storage.commit().await?)
    }

    // Legacy ambient values

    pub async fn set_nonce(&self, nonce: &str) -> Result<()> {
        self.set_session_key(NONCE_KEY, nonce).await
    }

    pub async fn nonce(&self) -> Result<Option<String>> {
        self.session_key(NONCE_KEY).await
    }

    pub async fn unset_nonce(&self) -> Result<()> {
        self.unset_session_key(NONCE_KEY).await
    }

    pub async fn set_state(&self, state: &str) -> Result<()> {
        self.set_session_key(STATE_KEY, state).await
    }

    pub async fn state(&self) -> Result<Option<String>> {
        self.session_key(STATE_KEY).await
    }

    pub async fn unset_state(&self) -> Result<()> {
        self.unset_session_key(STATE_KEY).await
    }

    pub async fn set_code_verifier(&self, verifier: &str) -> Result<()> {
        self.set_session_key(CODE_VERIFIER_KEY, verifier).await
    }

    pub async fn code_verifier(&self) -> Result<Option<String>> {
        self.session_key(CODE_VERIFIER_KEY).await
    }

    pub async fn unset_code_verifier(&self) -> Result<()> {
        self.unset_session_key(CODE_VERIFIER_KEY).await
    }

    /// Hex-encoded CSPRNG output, `2 * bytes` characters long.
    pub fn generate_rand_string(bytes: usize) -> String {
        let mut buf = vec![0u8; bytes];
        rand::rng().fill(buf.as_mut_slice());
        hex::encode(buf)
    }

    // State bundles

    /// Store a bundle for `state`, bound to this session when a signing key
    /// is configured.
    pub async fn save_state_bundle(
        &self,
        state: &str,
        nonce: &str,
        code_verifier: Option<&str>,
    ) -> Result<()> {
        let bundle = StateBundle {
            nonce: nonce.to_owned(),
            code_verifier: code_verifier.map(str::to_owned),
            sid: self.session_id(state),
        };
        let payload = serde_json::to_string(&bundle)
            .map_err(|e| Error::Storage(format!("serializing state bundle: {e}")))?;
        self.storage.put(&bundle_key(state), &payload).await?;
        debug!(
            storage = self.storage.id(),
            pkce = bundle.code_verifier.is_some(),
            bound = bundle.sid.is_some(),
            "saved state bundle"
        );
        Ok(())
    }

    /// Load the bundle for `state`.
    ///
    /// `None` when the state was already used, no bundle exists, or the
    /// bundle belongs to another session.
    pub async fn load_state_bundle(&self, state: &str) -> Result<Option<StateBundle>> {
        if state.is_empty() {
            return Ok(None);
        }

        if self.storage.get(&tombstone_key(state)).await?.is_some() {
            warn!(storage = self.storage.id(), "state already used, rejecting replay");
            return Ok(None);
        }

        if let Some(raw) = self.storage.get(&bundle_key(state)).await? {
            let bundle: StateBundle = match serde_json::from_str(&raw) {
                Ok(bundle) => bundle,
                Err(e) => {
                    warn!(error = %e, "unreadable state bundle");
                    return Ok(None);
                }
            };
            return Ok(self.check_binding(state, bundle));
        }

        self.load_legacy_bundle(state).await
    }

    /// Delete the bundle for `state` and tombstone it.
    pub async fn clear_state_bundle(&self, state: &str) -> Result<()> {
        self.storage.forget(&bundle_key(state)).await?;
        self.storage
            .put(&tombstone_key(state), TOMBSTONE_MARKER)
            .await?;
        debug!(storage = self.storage.id(), "state bundle tombstoned");
        Ok(())
    }

    fn check_binding(&self, state: &str, bundle: StateBundle) -> Option<StateBundle> {
        let Some(stored) = bundle.sid.as_deref() else {
            return Some(bundle);
        };
        // A bound bundle cannot be checked without a key; fail closed
        let Some(expected) = self.session_id(state) else {
            warn!("state bundle carries a session binding but no signing key is configured");
            return None;
        };
        if bool::from(stored.as_bytes().ct_eq(expected.as_bytes())) {
            Some(bundle)
        } else {
            warn!("state bundle session binding mismatch");
            None
        }
    }

    async fn load_legacy_bundle(&self, state: &str) -> Result<Option<StateBundle>> {
        let Some(ambient_state) = self.state().await? else {
            return Ok(None);
        };
        if !bool::from(ambient_state.as_bytes().ct_eq(state.as_bytes())) {
            return Ok(None);
        }
        let Some(nonce) = self.nonce().await? else {
            return Ok(None);
        };
        let code_verifier = self.code_verifier().await?;

        self.save_state_bundle(state, &nonce, code_verifier.as_deref())
            .await?;
        debug!("migrated legacy nonce/state into a state bundle");

        Ok(Some(StateBundle {
            nonce,
            code_verifier,
            sid: self.session_id(state),
        }))
    }

    fn session_id(&self, state: &str) -> Option<String> {
        let key = self.signing_key.as_ref()?;
        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).ok()?;
        mac.update(state.as_bytes());
        Some(hex::encode(mac.finalize().into_bytes()))
    }
}

fn bundle_key(state: &str) -> String {
    format!("{STATE_BUNDLE_PREFIX}{state}")
}

fn tombstone_key(state: &str) -> String {
    format!("{STATE_USED_PREFIX}{state}")
}
