//! Authentication manager: the OIDC protocol state machine
//!
//! `Authenticator::authenticate` inspects the provider's response parameters
//! and picks one path:
//! 1. `error` present: fail with the provider's error and description
//! 2. `code` present: authorization-code flow (back-channel token exchange)
//! 3. `id_token` present and implicit flow allowed: implicit flow
//! 4. otherwise: build the authorization redirect and report
//!    `AuthOutcome::Redirect` (not a failure)
//!
//! Every terminal outcome that names a `state` tombstones it, success or not,
//! so a state value can never complete a second flow.
//!
//! An `Authenticator` is built per request; the `ProviderConfig` (and its
//! cached discovery document), the `JwtProcessor` and the `HttpClient` are
//! shared across requests.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::claims::{self, Expectations, NonceCheck};
use crate::config::ProviderConfig;
use crate::constants::{
    DEFAULT_RAND_BYTES, DEFAULT_RESPONSE_TYPE, JWT_CONTENT_TYPE, OPENID_SCOPE,
    PKCE_VERIFIER_BYTES,
};
use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::jwt::{Jwk, JwtProcessor, decode_jwt};
use crate::token::{self, ClientAuth, TokenResponse};
use crate::token_manager::{TokenManager, TokenSet};

/// Where one authentication attempt stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowState {
    #[default]
    Idle,
    /// Authorization requested; the caller must redirect the user agent
    AwaitingRedirect,
    Completed,
    Failed,
}

/// Successful result of `authenticate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Tokens verified and stored
    Authenticated,
    /// Not yet authenticated; send the user agent to `url`
    Redirect { url: String },
}

/// Parameters the provider sent back to the redirect URL, from either the
/// query string or a form post.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizationResponse {
    pub error: Option<String>,
    pub error_description: Option<String>,
    pub code: Option<String>,
    pub id_token: Option<String>,
    pub access_token: Option<String>,
    pub state: Option<String>,
}

pub struct Authenticator {
    config: Arc<ProviderConfig>,
    jwt: Arc<JwtProcessor>,
    tokens: TokenManager,
    http: Arc<HttpClient>,
    flow_state: FlowState,
}

impl Authenticator {
    pub fn new(
        config: Arc<ProviderConfig>,
        jwt: Arc<JwtProcessor>,
        tokens: TokenManager,
        http: Arc<HttpClient>,
    ) -> Self {
        Self {
            config,
            jwt,
            tokens,
            http,
            flow_state: FlowState::Idle,
        }
    }

    pub fn flow_state(&self) -> FlowState {
        self.flow_state
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn token_manager(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn token_manager_mut(&mut self) -> &mut TokenManager {
        &mut self.tokens
    }

    /// Give back the token manager, e.g. to persist its tokens.
    pub fn into_token_manager(self) -> TokenManager {
        self.tokens
    }

    /// Drive one step of the flow for the given redirect parameters.
    pub async fn authenticate(&mut self, response: &AuthorizationResponse) -> Result<AuthOutcome> {
        let result = self.dispatch(response).await;
        self.flow_state = match &result {
            Ok(AuthOutcome::Authenticated) => FlowState::Completed,
            Ok(AuthOutcome::Redirect { .. }) => FlowState::AwaitingRedirect,
            Err(_) => FlowState::Failed,
        };
        if let Err(e) = &result {
            warn!(kind = e.kind(), error = %e, "authentication failed");
        }
        result
    }

    async fn dispatch(&mut self, response: &AuthorizationResponse) -> Result<AuthOutcome> {
        if let Some(error) = &response.error {
            let description = response
                .error_description
                .as_deref()
                .map(|d| format!(" Description: {d}"))
                .unwrap_or_default();
            let failure = Error::Protocol(format!("Error: {error}{description}"));
            return self
                .finish_state(response.state.as_deref(), Err(failure))
                .await;
        }

        if let Some(code) = &response.code {
            let state = response.state.as_deref();
            let result = self.code_flow(code, state).await;
            self.finish_state(state, result).await?;
            info!(flow = "code", "authenticated");
            return Ok(AuthOutcome::Authenticated);
        }

        if let Some(id_token) = &response.id_token
            && self.config.allow_implicit_flow()
        {
            let state = response.state.as_deref();
            let result = self
                .implicit_flow(id_token, response.access_token.as_deref(), state)
                .await;
            self.finish_state(state, result).await?;
            info!(flow = "implicit", "authenticated");
            return Ok(AuthOutcome::Authenticated);
        }

        let url = self.request_authorization().await?;
        Ok(AuthOutcome::Redirect { url })
    }

    /// Tombstone `state` and persist storage, then hand back the flow result.
    async fn finish_state<T>(&self, state: Option<&str>, result: Result<T>) -> Result<T> {
        if let Some(state) = state.filter(|s| !s.is_empty()) {
            let cleared = self.tokens.clear_state_bundle(state).await;
            let committed = self.tokens.commit_session().await;
            if result.is_ok() {
                cleared?;
                committed?;
            } else if let Err(e) = cleared.and(committed) {
                warn!(error = %e, "failed to tombstone state after failed flow");
            }
        }
        result
    }

    async fn code_flow(&mut self, code: &str, state: Option<&str>) -> Result<()> {
        let state = state
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::ReplayRejected("no state in response".into()))?;
        let bundle = self
            .tokens
            .load_state_bundle(state)
            .await?
            .ok_or_else(|| Error::ReplayRejected("no pending authorization for state".into()))?;

        let token_endpoint = self.config.provider_string(&self.http, "token_endpoint").await?;
        let exchange = token::exchange_code(
            &self.http,
            &token_endpoint,
            self.client_auth(),
            code,
            self.config.redirect_url(),
            bundle.code_verifier.as_deref(),
        )
        .await;
        // The verifier is spent once the code has been presented
        self.tokens.unset_code_verifier().await?;
        let response = exchange?;

        let id_token = response
            .id_token
            .clone()
            .ok_or_else(|| Error::Protocol("User did not authorize openid scope.".into()))?;
        let (header, claims) = self.verify_id_token(&id_token).await?;
        let access_token = response.access_token.clone().unwrap_or_default();
        self.verify_claims(
            &claims,
            &header,
            &access_token,
            NonceCheck::Expected(Some(bundle.nonce.as_str())),
        )
        .await?;

        self.tokens.set_tokens(TokenSet {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            id_token: Some(id_token),
            raw_response: Some(response.raw),
        });
        self.tokens.unset_nonce().await?;
        Ok(())
    }

    async fn implicit_flow(
        &mut self,
        id_token: &str,
        access_token: Option<&str>,
        state: Option<&str>,
    ) -> Result<()> {
        let state = state
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::ReplayRejected("no state in response".into()))?;
        let bundle = self
            .tokens
            .load_state_bundle(state)
            .await?
            .ok_or_else(|| Error::ReplayRejected("no pending authorization for state".into()))?;

        let (header, claims) = self.verify_id_token(id_token).await?;
        self.verify_claims(
            &claims,
            &header,
            access_token.unwrap_or_default(),
            NonceCheck::Expected(Some(bundle.nonce.as_str())),
        )
        .await?;

        self.tokens.set_tokens(TokenSet {
            access_token: access_token.map(str::to_owned),
            refresh_token: None,
            id_token: Some(id_token.to_owned()),
            raw_response: None,
        });
        self.tokens.unset_nonce().await?;
        Ok(())
    }

    /// Build the authorization redirect URL and persist a fresh state bundle.
    pub async fn request_authorization(&mut self) -> Result<String> {
        let auth_endpoint = self
            .config
            .provider_string(&self.http, "authorization_endpoint")
            .await?;

        if self.config.redirect_url().is_empty() {
            return Err(Error::Configuration("redirect URL is not set".into()));
        }
        if self.config.client_id().is_empty() {
            return Err(Error::Configuration("client ID is not set".into()));
        }
        if self.config.scopes().is_empty() {
            return Err(Error::Configuration("scope is not set".into()));
        }

        let nonce = TokenManager::generate_rand_string(DEFAULT_RAND_BYTES);
        let state = TokenManager::generate_rand_string(DEFAULT_RAND_BYTES);
        let response_type = self.response_type().await?;

        let mut scopes: Vec<&str> = self.config.scopes().iter().map(String::as_str).collect();
        if !scopes.contains(&OPENID_SCOPE) {
            scopes.push(OPENID_SCOPE);
        }

        let mut params: Vec<(String, String)> = self
            .config
            .auth_params()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        merge_param(&mut params, "response_type", response_type);
        merge_param(&mut params, "redirect_uri", self.config.redirect_url().to_owned());
        merge_param(&mut params, "client_id", self.config.client_id().to_owned());
        merge_param(&mut params, "nonce", nonce.clone());
        merge_param(&mut params, "state", state.clone());
        merge_param(&mut params, "scope", scopes.join(" "));

        let mut code_verifier = None;
        if let Some(method) = self.jwt.code_challenge_method() {
            let supported = self
                .config
                .provider_config_value_or(
                    &self.http,
                    "code_challenge_methods_supported",
                    Value::Array(Vec::new()),
                )
                .await?;
            let advertised = supported
                .as_array()
                .is_some_and(|methods| methods.iter().any(|m| m.as_str() == Some(method)));
            if advertised {
                let verifier = TokenManager::generate_rand_string(PKCE_VERIFIER_BYTES);
                merge_param(&mut params, "code_challenge", self.jwt.code_challenge(&verifier));
                merge_param(&mut params, "code_challenge_method", method.to_owned());
                code_verifier = Some(verifier);
            } else {
                debug!(method, "provider does not advertise PKCE method, skipping");
            }
        }

        self.tokens
            .save_state_bundle(&state, &nonce, code_verifier.as_deref())
            .await?;
        // Force later lookups through the scoped bundle
        self.tokens.unset_nonce().await?;
        self.tokens.unset_state().await?;
        self.tokens.unset_code_verifier().await?;
        self.tokens.commit_session().await?;

        let separator = if auth_endpoint.contains('?') { '&' } else { '?' };
        let query = self.config.encoding().build_query(&params);
        info!(pkce = code_verifier.is_some(), "authorization requested");
        Ok(format!("{auth_endpoint}{separator}{query}"))
    }

    /// Fetch user claims from the userinfo endpoint with the stored access
    /// token. With `attribute`, only that member is returned.
    pub async fn request_user_info(
        &self,
        attribute: Option<&str>,
        openid_schema: bool,
    ) -> Result<Option<Value>> {
        let mut endpoint = self
            .config
            .provider_string(&self.http, "userinfo_endpoint")
            .await?;
        if openid_schema {
            endpoint.push(if endpoint.contains('?') { '&' } else { '?' });
            endpoint.push_str("schema=openid");
        }
        let access_token = self
            .tokens
            .access_token()
            .ok_or_else(|| Error::Configuration("no access token available".into()))?;

        let response = self
            .http
            .get(
                &endpoint,
                &[
                    ("Authorization", format!("Bearer {access_token}")),
                    ("Accept", "application/json".to_string()),
                ],
            )
            .await?;
        if response.status != 200 {
            return Err(Error::Protocol(format!(
                "the communication to retrieve user data has failed with status code {}",
                response.status
            )));
        }

        let user = if response.content_type.as_deref() == Some(JWT_CONTENT_TYPE) {
            let jwt = response.body.trim();
            let (header, claims) = self.verify_id_token(jwt).await?;
            self.verify_claims(&claims, &header, access_token, NonceCheck::Skip)
                .await?;
            Value::Object(claims)
        } else {
            response
                .json::<Value>()
                .map_err(|e| Error::Protocol(format!("invalid userinfo response: {e}")))?
        };

        Ok(match attribute {
            Some(name) => user.get(name).cloned(),
            None => Some(user),
        })
    }

    /// Use the stored refresh token to obtain new tokens.
    pub async fn refresh_tokens(&mut self) -> Result<TokenResponse> {
        let refresh = self
            .tokens
            .refresh_token()
            .map(str::to_owned)
            .ok_or_else(|| Error::Configuration("no refresh token available".into()))?;
        let token_endpoint = self.config.provider_string(&self.http, "token_endpoint").await?;

        let response =
            token::refresh_token(&self.http, &token_endpoint, self.client_auth(), &refresh).await?;

        if let Some(id_token) = &response.id_token {
            let (header, claims) = self.verify_id_token(id_token).await?;
            let access_token = response.access_token.as_deref().unwrap_or_default();
            self.verify_claims(&claims, &header, access_token, NonceCheck::Skip)
                .await?;
            self.tokens.set_id_token(id_token.clone());
        }
        if let Some(access_token) = &response.access_token {
            self.tokens.set_access_token(access_token.clone());
        }
        if let Some(rotated) = &response.refresh_token {
            self.tokens.set_refresh_token(Some(rotated.clone()));
        }
        self.tokens.set_token_response(response.raw.clone());
        info!(rotated = response.refresh_token.is_some(), "tokens refreshed");
        Ok(response)
    }

    /// The provider's published signing keys.
    pub async fn jwks(&self) -> Result<Vec<Jwk>> {
        #[derive(Deserialize)]
        struct KeySet {
            #[serde(default)]
            keys: Vec<Jwk>,
        }

        let jwks_uri = self.config.provider_string(&self.http, "jwks_uri").await?;
        let response = self.http.get(&jwks_uri, &[]).await?;
        if !response.is_success() {
            return Err(Error::Transport(format!(
                "JWKS fetch returned status {}",
                response.status
            )));
        }
        let set: KeySet = response
            .json()
            .map_err(|e| Error::Protocol(format!("invalid JWKS document: {e}")))?;
        debug!(keys = set.keys.len(), "fetched JWKS");
        Ok(set.keys)
    }

    fn client_auth(&self) -> ClientAuth<'_> {
        ClientAuth {
            client_id: self.config.client_id(),
            client_secret: self.config.client_secret().expose(),
        }
    }

    /// Reject JWE, decode, and check the signature. Returns header and claims.
    async fn verify_id_token(&self, token: &str) -> Result<(Map<String, Value>, Map<String, Value>)> {
        let header = decode_jwt(token, 0)
            .ok_or_else(|| Error::MalformedToken("error decoding token header".into()))?;
        if header.contains_key("enc") {
            return Err(Error::UnsupportedAlgorithm(
                "JWE response is not supported".into(),
            ));
        }
        let claims = decode_jwt(token, 1)
            .ok_or_else(|| Error::MalformedToken("error decoding token payload".into()))?;

        // HMAC tokens are keyed by the client secret; skip the JWKS round trip
        let hmac = header
            .get("alg")
            .and_then(Value::as_str)
            .is_some_and(|alg| alg.starts_with("HS"));
        let keys = if hmac { Vec::new() } else { self.jwks().await? };

        if !self.jwt.verify_jwt_signature(token, &keys)? {
            return Err(Error::TokenValidation("invalid JWT signature".into()));
        }
        Ok((header, claims))
    }

    async fn verify_claims(
        &self,
        claims: &Map<String, Value>,
        header: &Map<String, Value>,
        access_token: &str,
        nonce: NonceCheck<'_>,
    ) -> Result<()> {
        let issuers = self.config.accepted_issuers(&self.http).await?;
        let expect = Expectations {
            issuers: &issuers,
            client_id: self.config.client_id(),
            leeway_secs: self.config.leeway_secs(),
            nonce,
            access_token,
            id_token_alg: header.get("alg").and_then(Value::as_str),
            now: unix_now(),
        };
        claims::check(claims, &expect).map_err(|failure| {
            warn!(reason = %failure, "JWT claims rejected");
            Error::TokenValidation(format!("unable to verify JWT claims: {failure}"))
        })
    }

    async fn response_type(&self) -> Result<String> {
        let value = self
            .config
            .provider_config_value_or(
                &self.http,
                "response_type",
                Value::String(DEFAULT_RESPONSE_TYPE.into()),
            )
            .await?;
        Ok(match value {
            Value::String(s) if !s.is_empty() => s,
            Value::Array(types) => {
                let types: Vec<&str> = types.iter().filter_map(Value::as_str).collect();
                if types.contains(&DEFAULT_RESPONSE_TYPE) {
                    DEFAULT_RESPONSE_TYPE.to_string()
                } else {
                    types
                        .first()
                        .map_or_else(|| DEFAULT_RESPONSE_TYPE.to_string(), |t| (*t).to_string())
                }
            }
            _ => DEFAULT_RESPONSE_TYPE.to_string(),
        })
    }
}

/// Replace `key` in place if present, else append.
fn merge_param(params: &mut Vec<(String, String)>, key: &str, value: String) {
    match params.iter_mut().find(|(k, _)| k == key) {
        Some((_, existing)) => *existing = value,
        None => params.push((key.to_string(), value)),
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
