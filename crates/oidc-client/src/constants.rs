//! Protocol constants and defaults

/// Discovery document path, appended to the provider URL.
pub const WELL_KNOWN_PATH: &str = "/.well-known/openid-configuration";

/// Clock skew tolerated on `exp`/`nbf`.
pub const DEFAULT_LEEWAY_SECS: u64 = 300;

/// Scope always requested alongside configured scopes.
pub const OPENID_SCOPE: &str = "openid";

/// Response type when neither overrides nor discovery declare one.
pub const DEFAULT_RESPONSE_TYPE: &str = "code";

/// Storage key prefix for state-scoped bundles.
pub const STATE_BUNDLE_PREFIX: &str = "state-bundle:";

/// Storage key prefix for consumed-state tombstones.
pub const STATE_USED_PREFIX: &str = "state-used:";

/// Value written under a tombstone key.
pub const TOMBSTONE_MARKER: &str = "1";

/// Legacy ambient keys, read only by the migration path.
pub const NONCE_KEY: &str = "nonce";
pub const STATE_KEY: &str = "state";
pub const CODE_VERIFIER_KEY: &str = "code_verifier";

/// Random bytes behind nonce and state values (32 hex chars).
pub const DEFAULT_RAND_BYTES: usize = 16;

/// Random bytes behind a PKCE verifier (128 hex chars).
pub const PKCE_VERIFIER_BYTES: usize = 64;

/// Outbound request timeout.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

/// Content type signalling a signed userinfo response.
pub const JWT_CONTENT_TYPE: &str = "application/jwt";
