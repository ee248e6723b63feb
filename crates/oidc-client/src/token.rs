//! Token endpoint calls
//!
//! Both grants POST an `application/x-www-form-urlencoded` body and
//! authenticate the client twice over: an HTTP Basic header built from the
//! form-encoded client id and secret, plus `client_id`/`client_secret` form
//! fields, which keeps providers that only read one of them happy.
//!
//! A JSON body carrying `error` is a provider rejection (`Error::Protocol`);
//! a non-2xx status without one is a transport failure.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::http::{HttpClient, HttpResponse};

/// Token endpoint response. The raw JSON object is kept alongside the typed
/// fields for callers that need provider-specific members.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(skip)]
    pub raw: Map<String, Value>,
}

/// Client credentials for token endpoint authentication.
#[derive(Clone, Copy)]
pub struct ClientAuth<'a> {
    pub client_id: &'a str,
    pub client_secret: &'a str,
}

impl ClientAuth<'_> {
    /// `Basic base64(urlencode(id):urlencode(secret))`
    pub fn basic_header(&self) -> String {
        let encode = |s: &str| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
        let pair = format!("{}:{}", encode(self.client_id), encode(self.client_secret));
        format!("Basic {}", STANDARD.encode(pair))
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Authorization", self.basic_header()),
            ("Accept", "application/json".to_string()),
        ]
    }
}

/// Exchange an authorization code for tokens.
pub async fn exchange_code(
    http: &HttpClient,
    token_endpoint: &str,
    auth: ClientAuth<'_>,
    code: &str,
    redirect_uri: &str,
    code_verifier: Option<&str>,
) -> Result<TokenResponse> {
    let mut form = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", auth.client_id),
        ("client_secret", auth.client_secret),
    ];
    if let Some(verifier) = code_verifier {
        form.push(("code_verifier", verifier));
    }

    let response = http
        .post_form(token_endpoint, &form, &auth.headers())
        .await?;
    let tokens = parse_token_response(&response, "token exchange")?;
    debug!(
        has_id_token = tokens.id_token.is_some(),
        has_refresh_token = tokens.refresh_token.is_some(),
        pkce = code_verifier.is_some(),
        "authorization code exchanged"
    );
    Ok(tokens)
}

/// Obtain fresh tokens with a refresh token.
pub async fn refresh_token(
    http: &HttpClient,
    token_endpoint: &str,
    auth: ClientAuth<'_>,
    refresh_token: &str,
) -> Result<TokenResponse> {
    let form = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", auth.client_id),
        ("client_secret", auth.client_secret),
    ];

    let response = http
        .post_form(token_endpoint, &form, &auth.headers())
        .await?;
    parse_token_response(&response, "token refresh")
}

fn parse_token_response(response: &HttpResponse, operation: &str) -> Result<TokenResponse> {
    let raw: Map<String, Value> = match response.json() {
        Ok(raw) => raw,
        Err(e) if response.is_success() => {
            return Err(Error::Protocol(format!("invalid {operation} response: {e}")));
        }
        Err(_) => {
            return Err(Error::Transport(format!(
                "{operation} returned status {}",
                response.status
            )));
        }
    };

    if let Some(error) = raw.get("error") {
        let error = error.as_str().map_or_else(|| error.to_string(), str::to_owned);
        let description = raw
            .get("error_description")
            .and_then(Value::as_str)
            .map_or_else(|| format!("Got response: {error}"), str::to_owned);
        warn!(operation, status = response.status, error = %error, "provider rejected token request");
        return Err(Error::Protocol(description));
    }

    if !response.is_success() {
        return Err(Error::Transport(format!(
            "{operation} returned status {}",
            response.status
        )));
    }

    let mut tokens: TokenResponse = serde_json::from_value(Value::Object(raw.clone()))
        .map_err(|e| Error::Protocol(format!("invalid {operation} response: {e}")))?;
    tokens.raw = raw;
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpOptions;
    use crate::testutil::MockProvider;
    use serde_json::json;

    const AUTH: ClientAuth<'static> = ClientAuth {
        client_id: "client-123",
        client_secret: "s3cr3t",
    };

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            content_type: Some("application/json".into()),
            body: body.to_string(),
        }
    }

    #[test]
    fn basic_header_form_encodes_credentials() {
        let auth = ClientAuth {
            client_id: "my client",
            client_secret: "p@ss:word",
        };
        // base64("my+client:p%40ss%3Aword")
        assert_eq!(
            auth.basic_header(),
            format!("Basic {}", STANDARD.encode("my+client:p%40ss%3Aword"))
        );
    }

    #[test]
    fn token_response_keeps_raw_json() {
        let tokens = parse_token_response(
            &response(
                200,
                r#"{"access_token":"at","id_token":"it","expires_in":3600,"custom":"x"}"#,
            ),
            "test",
        )
        .unwrap();
        assert_eq!(tokens.access_token.as_deref(), Some("at"));
        assert_eq!(tokens.id_token.as_deref(), Some("it"));
        assert_eq!(tokens.refresh_token, None);
        assert_eq!(tokens.expires_in, Some(3600));
        assert_eq!(tokens.raw["custom"], "x");
    }

    #[test]
    fn error_payload_is_protocol_error() {
        let err = parse_token_response(
            &response(400, r#"{"error":"invalid_grant","error_description":"code expired"}"#),
            "test",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m == "code expired"), "{err:?}");

        let err = parse_token_response(&response(200, r#"{"error":"invalid_grant"}"#), "test")
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m == "Got response: invalid_grant"));
    }

    #[test]
    fn bare_failure_status_is_transport_error() {
        let err = parse_token_response(&response(502, "<html>bad gateway</html>"), "test")
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));

        let err = parse_token_response(&response(500, "{}"), "test").unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn non_json_success_is_protocol_error() {
        let err = parse_token_response(&response(200, "ok"), "test").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn exchange_sends_basic_auth_and_form() {
        let provider = MockProvider::start().await;
        provider.set_token_response(200, json!({"access_token": "at", "id_token": "it"}));
        let http = HttpClient::new(&HttpOptions::default()).unwrap();

        let tokens = exchange_code(
            &http,
            &format!("{}/token", provider.base_url),
            AUTH,
            "code-abc",
            "https://app.test/callback",
            Some("verifier-1"),
        )
        .await
        .unwrap();
        assert_eq!(tokens.access_token.as_deref(), Some("at"));

        let request = provider.last_token_request().unwrap();
        assert_eq!(request.authorization.as_deref(), Some(AUTH.basic_header().as_str()));
        assert_eq!(request.form["grant_type"], "authorization_code");
        assert_eq!(request.form["code"], "code-abc");
        assert_eq!(request.form["redirect_uri"], "https://app.test/callback");
        assert_eq!(request.form["client_id"], "client-123");
        assert_eq!(request.form["client_secret"], "s3cr3t");
        assert_eq!(request.form["code_verifier"], "verifier-1");
    }

    #[tokio::test]
    async fn refresh_sends_refresh_grant() {
        let provider = MockProvider::start().await;
        provider.set_token_response(200, json!({"access_token": "at-2", "refresh_token": "rt-2"}));
        let http = HttpClient::new(&HttpOptions::default()).unwrap();

        let tokens = refresh_token(&http, &format!("{}/token", provider.base_url), AUTH, "rt-1")
            .await
            .unwrap();
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt-2"));

        let request = provider.last_token_request().unwrap();
        assert_eq!(request.form["grant_type"], "refresh_token");
        assert_eq!(request.form["refresh_token"], "rt-1");
        assert!(!request.form.contains_key("redirect_uri"));
    }
}
