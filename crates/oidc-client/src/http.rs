//! Outbound HTTP transport
//!
//! Thin wrapper over `reqwest::Client` for the four provider calls (discovery,
//! token, JWKS, userinfo). Network-level failures surface as
//! `Error::Transport`; any response, including non-2xx, is handed back so the
//! caller decides whether the status or an error payload matters more.

use std::path::PathBuf;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::constants::DEFAULT_HTTP_TIMEOUT_SECS;
use crate::error::{Error, Result};

/// Transport settings.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub timeout: Duration,
    /// Disable only against test providers with self-signed certificates
    pub verify_peer: bool,
    pub proxy: Option<String>,
    /// PEM file holding a client certificate and its private key
    pub client_cert: Option<PathBuf>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            verify_peer: true,
            proxy: None,
            client_cert: None,
        }
    }
}

/// Buffered response from the provider.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Media type without parameters (`application/json; charset=utf-8`
    /// becomes `application/json`)
    pub content_type: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Shared HTTP client; cheap to wrap in an `Arc` and reuse across flows.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(options: &HttpOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(options.timeout)
            .danger_accept_invalid_certs(!options.verify_peer);

        if let Some(proxy) = &options.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| Error::Configuration(format!("invalid proxy URL {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        }

        if let Some(path) = &options.client_cert {
            let pem = std::fs::read(path).map_err(|e| {
                Error::Configuration(format!(
                    "reading client certificate {}: {e}",
                    path.display()
                ))
            })?;
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| Error::Configuration(format!("invalid client certificate: {e}")))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| Error::Configuration(format!("building HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn get(&self, url: &str, headers: &[(&str, String)]) -> Result<HttpResponse> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        self.send(request, url).await
    }

    /// POST an `application/x-www-form-urlencoded` body.
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
        headers: &[(&str, String)],
    ) -> Result<HttpResponse> {
        let mut request = self.client.post(url).form(form);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        self.send(request, url).await
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &str) -> Result<HttpResponse> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::Transport(format!("request to {url} failed: {e}")))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase());
        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("reading response from {url}: {e}")))?;

        debug!(url, status, bytes = body.len(), "provider response");
        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}
