//! Provider configuration resolver
//!
//! Holds the static client settings and lazily fetches the provider's
//! discovery document. The document is fetched at most once per
//! `ProviderConfig` (a failed fetch is not memoized, so a later attempt can
//! succeed once the provider recovers). Static `metadata` overrides win over
//! discovered values.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use common::Secret;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info};
use url::Url;

use crate::constants::{DEFAULT_LEEWAY_SECS, OPENID_SCOPE, WELL_KNOWN_PATH};
use crate::error::{Error, Result};
use crate::http::HttpClient;

/// Query-string encoding for the authorization redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingType {
    /// Form encoding: space becomes `+`
    #[default]
    Rfc1738,
    /// Percent encoding of everything outside the unreserved set
    Rfc3986,
}

impl EncodingType {
    pub fn encode<'a>(&self, value: &'a str) -> Cow<'a, str> {
        match self {
            EncodingType::Rfc1738 => {
                Cow::Owned(url::form_urlencoded::byte_serialize(value.as_bytes()).collect())
            }
            EncodingType::Rfc3986 => urlencoding::encode(value),
        }
    }

    /// Build `k=v&k=v` with both sides encoded.
    pub fn build_query(&self, params: &[(String, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", self.encode(k), self.encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Client settings as read from configuration. The client secret is supplied
/// separately so it never passes through a config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub provider_url: String,
    pub client_id: String,
    pub redirect_url: String,
    pub scopes: Vec<String>,
    pub leeway_secs: u64,
    pub allow_implicit_flow: bool,
    /// PKCE method to request (`S256` or `plain`); unset disables PKCE
    pub code_challenge_method: Option<String>,
    pub encoding: EncodingType,
    /// Extra parameters merged into the authorization request
    pub auth_params: BTreeMap<String, String>,
    /// Static provider metadata consulted before discovery
    pub metadata: HashMap<String, Value>,
    /// Extra query parameters for the discovery request
    pub well_known_params: BTreeMap<String, String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            provider_url: String::new(),
            client_id: String::new(),
            redirect_url: String::new(),
            scopes: Vec::new(),
            leeway_secs: DEFAULT_LEEWAY_SECS,
            allow_implicit_flow: false,
            code_challenge_method: None,
            encoding: EncodingType::default(),
            auth_params: BTreeMap::new(),
            metadata: HashMap::new(),
            well_known_params: BTreeMap::new(),
        }
    }
}

/// Validated provider configuration with memoized discovery.
#[derive(Debug)]
pub struct ProviderConfig {
    provider_url: String,
    client_id: String,
    client_secret: Secret<String>,
    redirect_url: String,
    scopes: Vec<String>,
    encoding: EncodingType,
    leeway_secs: u64,
    allow_implicit_flow: bool,
    code_challenge_method: Option<String>,
    auth_params: BTreeMap<String, String>,
    registration_params: Map<String, Value>,
    metadata: HashMap<String, Value>,
    well_known_params: BTreeMap<String, String>,
    well_known: OnceCell<Map<String, Value>>,
}

impl ProviderConfig {
    /// Validate settings. Fails closed on any missing or malformed required
    /// value.
    pub fn new(settings: ClientSettings, client_secret: Secret<String>) -> Result<Self> {
        if settings.provider_url.trim().is_empty() {
            return Err(Error::Configuration("provider URL is not set".into()));
        }
        if settings.client_id.trim().is_empty() {
            return Err(Error::Configuration("client ID is not set".into()));
        }
        if client_secret.is_empty() {
            return Err(Error::Configuration("client secret is not set".into()));
        }
        if settings.redirect_url.trim().is_empty() {
            return Err(Error::Configuration("redirect URL is not set".into()));
        }
        validate_url("provider URL", &settings.provider_url)?;
        validate_url("redirect URL", &settings.redirect_url)?;

        let mut scopes = Vec::new();
        for scope in settings.scopes.iter().filter(|s| !s.trim().is_empty()) {
            if !scopes.contains(scope) {
                scopes.push(scope.clone());
            }
        }
        if scopes.is_empty() {
            scopes.push(OPENID_SCOPE.to_string());
        }

        Ok(Self {
            provider_url: settings.provider_url,
            client_id: settings.client_id,
            client_secret,
            redirect_url: settings.redirect_url,
            scopes,
            encoding: settings.encoding,
            leeway_secs: settings.leeway_secs,
            allow_implicit_flow: settings.allow_implicit_flow,
            code_challenge_method: settings
                .code_challenge_method
                .filter(|m| !m.is_empty() && m != "0"),
            auth_params: settings.auth_params,
            registration_params: Map::new(),
            metadata: settings.metadata,
            well_known_params: settings.well_known_params,
            well_known: OnceCell::new(),
        })
    }

    pub fn provider_url(&self) -> &str {
        &self.provider_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_secret(&self) -> &Secret<String> {
        &self.client_secret
    }

    pub fn redirect_url(&self) -> &str {
        &self.redirect_url
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn encoding(&self) -> EncodingType {
        self.encoding
    }

    pub fn leeway_secs(&self) -> u64 {
        self.leeway_secs
    }

    pub fn allow_implicit_flow(&self) -> bool {
        self.allow_implicit_flow
    }

    pub fn code_challenge_method(&self) -> Option<&str> {
        self.code_challenge_method.as_deref()
    }

    pub fn auth_params(&self) -> &BTreeMap<String, String> {
        &self.auth_params
    }

    pub fn registration_params(&self) -> &Map<String, Value> {
        &self.registration_params
    }

    /// Add scopes, skipping duplicates.
    pub fn add_scopes<I, S>(&mut self, scopes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for scope in scopes {
            let scope = scope.into();
            if !scope.is_empty() && !self.scopes.contains(&scope) {
                self.scopes.push(scope);
            }
        }
    }

    pub fn set_auth_params(&mut self, params: BTreeMap<String, String>) {
        self.auth_params = params;
    }

    pub fn add_auth_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.auth_params.insert(key.into(), value.into());
    }

    pub fn set_leeway(&mut self, secs: u64) {
        self.leeway_secs = secs;
    }

    pub fn set_allow_implicit_flow(&mut self, allow: bool) {
        self.allow_implicit_flow = allow;
    }

    pub fn set_encoding(&mut self, encoding: EncodingType) {
        self.encoding = encoding;
    }

    /// Stored for completeness; dynamic registration is not performed.
    pub fn add_registration_params(&mut self, params: Map<String, Value>) {
        self.registration_params.extend(params);
    }

    /// Full discovery URL, including any extra query parameters.
    pub fn well_known_url(&self) -> String {
        let mut url = format!(
            "{}{}",
            self.provider_url.trim_end_matches('/'),
            WELL_KNOWN_PATH
        );
        if !self.well_known_params.is_empty() {
            let query: String = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.well_known_params.iter())
                .finish();
            url.push('?');
            url.push_str(&query);
        }
        url
    }

    /// Look up a provider value: static override first, then discovery.
    ///
    /// Errors when discovery fails or the key is absent.
    pub async fn provider_config_value(&self, http: &HttpClient, key: &str) -> Result<Value> {
        if let Some(value) = self.metadata.get(key) {
            return Ok(value.clone());
        }
        self.well_known_value(http, key).await?.ok_or_else(|| {
            Error::Discovery(format!(
                "the provider {key} could not be fetched; make sure the provider has a well-known configuration available"
            ))
        })
    }

    /// Like `provider_config_value`, falling back to `default` when the key
    /// is absent. Discovery failures still propagate.
    pub async fn provider_config_value_or(
        &self,
        http: &HttpClient,
        key: &str,
        default: Value,
    ) -> Result<Value> {
        if let Some(value) = self.metadata.get(key) {
            return Ok(value.clone());
        }
        Ok(self.well_known_value(http, key).await?.unwrap_or(default))
    }

    /// String-valued provider lookup (endpoints, issuer).
    pub async fn provider_string(&self, http: &HttpClient, key: &str) -> Result<String> {
        match self.provider_config_value(http, key).await? {
            Value::String(s) => Ok(s),
            other => Err(Error::Discovery(format!(
                "provider {key} is not a string: {other}"
            ))),
        }
    }

    /// The discovered `issuer`, optionally with a trailing slash.
    pub async fn well_known_issuer(&self, http: &HttpClient, append_slash: bool) -> Result<String> {
        let issuer = match self.well_known_value(http, "issuer").await? {
            Some(Value::String(issuer)) => issuer,
            _ => {
                return Err(Error::Discovery(
                    "the provider issuer could not be fetched".into(),
                ));
            }
        };
        if append_slash && !issuer.ends_with('/') {
            Ok(format!("{issuer}/"))
        } else {
            Ok(issuer)
        }
    }

    /// Issuers an ID token may carry: the discovered issuer and any static
    /// `issuer` override. Discovery errors only matter when there is no
    /// override to fall back on.
    pub async fn accepted_issuers(&self, http: &HttpClient) -> Result<Vec<String>> {
        let static_issuer = self
            .metadata
            .get("issuer")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let mut issuers = Vec::new();
        match self.well_known_issuer(http, false).await {
            Ok(issuer) => issuers.push(issuer),
            Err(e) if static_issuer.is_none() => return Err(e),
            Err(e) => debug!(error = %e, "discovery issuer unavailable, using static issuer"),
        }
        if let Some(issuer) = static_issuer
            && !issuers.contains(&issuer)
        {
            issuers.push(issuer);
        }
        Ok(issuers)
    }

    async fn well_known_value(&self, http: &HttpClient, key: &str) -> Result<Option<Value>> {
        let document = self
            .well_known
            .get_or_try_init(|| self.fetch_well_known(http))
            .await?;
        Ok(document.get(key).cloned())
    }

    async fn fetch_well_known(&self, http: &HttpClient) -> Result<Map<String, Value>> {
        let url = self.well_known_url();
        debug!(url = %url, "fetching discovery document");

        let response = http.get(&url, &[]).await.map_err(|e| {
            Error::Discovery(format!("error fetching well-known configuration: {e}"))
        })?;
        if !response.is_success() {
            return Err(Error::Discovery(format!(
                "failed to fetch well-known configuration: status {}",
                response.status
            )));
        }
        let document: Map<String, Value> = response.json().map_err(|e| {
            Error::Discovery(format!("invalid well-known configuration: {e}"))
        })?;

        info!(
            provider = %self.provider_url,
            keys = document.len(),
            "discovery document cached"
        );
        Ok(document)
    }
}

fn validate_url(field: &str, value: &str) -> Result<()> {
    let url = Url::parse(value)
        .map_err(|e| Error::Configuration(format!("{field} {value:?} is not a valid URL: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::Configuration(format!(
            "{field} {value:?} must use http or https"
        )));
    }
    Ok(())
}
