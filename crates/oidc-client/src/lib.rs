//! OpenID Connect relying-party engine
//!
//! Drives the authorization-code and implicit flows against a remote identity
//! provider, verifies returned ID tokens and guards each attempt against
//! replay and cross-session state confusion.
//!
//! Layering, leaf first:
//! 1. `base64url` codec and `pkce` helpers
//! 2. `ProviderConfig`: static client settings plus memoized discovery
//! 3. `JwtProcessor`: decoding, signature verification, PKCE challenges
//! 4. `TokenManager`: state bundles, tombstones, session binding, final tokens
//! 5. `Authenticator`: the protocol state machine tying the above together
//!
//! Storage is injected as `Arc<dyn token_storage::TokenStorage>`; the HTTP
//! transport is the `HttpClient` wrapper over reqwest.

pub mod base64url;
pub mod claims;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod http;
pub mod jwt;
pub mod pkce;
pub mod token;
pub mod token_manager;

#[cfg(test)]
pub(crate) mod testutil;

pub use client::{AuthOutcome, AuthorizationResponse, Authenticator, FlowState};
pub use config::{ClientSettings, EncodingType, ProviderConfig};
pub use error::{Error, Result};
pub use http::{HttpClient, HttpOptions, HttpResponse};
pub use jwt::{Jwk, JwtProcessor, decode_jwt};
pub use token::TokenResponse;
pub use token_manager::{StateBundle, TokenManager, TokenSet};
