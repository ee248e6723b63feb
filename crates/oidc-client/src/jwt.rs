//! JWT decoding and signature verification
//!
//! `JwtProcessor` is stateless apart from the client secret (HMAC key), a
//! list of supplementary verification keys and the selected PKCE method.
//!
//! Supported signatures:
//! - `RS256`/`RS384`/`RS512`: RSA PKCS#1 v1.5
//! - `PS256`/`PS512`: RSA-PSS, MGF1 hash matching the signature hash
//! - `HS256`/`HS384`/`HS512`: HMAC with the client secret, constant-time compare
//!
//! Anything else fails closed with `Error::UnsupportedAlgorithm`.

use common::Secret;
use hmac::{Hmac, Mac};
use ring::signature::{self, RsaParameters, RsaPublicKeyComponents};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Sha256, Sha384, Sha512};
use tracing::debug;

use crate::base64url;
use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::pkce;

/// One entry of a JSON Web Key Set. Unknown members are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    #[serde(default)]
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

/// Decode one JWT section as a JSON object: 0 is the header, 1 the payload.
///
/// Returns `None` for an out-of-range section or one that is not a
/// base64url-encoded JSON object.
pub fn decode_jwt(token: &str, section: usize) -> Option<Map<String, Value>> {
    let part = token.split('.').nth(section)?;
    let bytes = base64url::decode(part).ok()?;
    match serde_json::from_slice(&bytes).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

pub struct JwtProcessor {
    client_secret: Secret<String>,
    additional_jwks: Vec<Jwk>,
    code_challenge_method: Option<String>,
}

impl std::fmt::Debug for JwtProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtProcessor")
            .field("additional_jwks", &self.additional_jwks.len())
            .field("code_challenge_method", &self.code_challenge_method)
            .finish_non_exhaustive()
    }
}

impl JwtProcessor {
    /// `additional_jwks` are consulted after the provider's keys.
    pub fn new(client_secret: Secret<String>, additional_jwks: Vec<Jwk>) -> Self {
        Self {
            client_secret,
            additional_jwks,
            code_challenge_method: None,
        }
    }

    /// Processor keyed by the provider's client secret, using its PKCE method.
    pub fn for_provider(config: &ProviderConfig, additional_jwks: Vec<Jwk>) -> Self {
        let mut processor = Self::new(config.client_secret().clone(), additional_jwks);
        processor.set_code_challenge_method(config.code_challenge_method().map(str::to_owned));
        processor
    }

    pub fn add_jwks(&mut self, keys: impl IntoIterator<Item = Jwk>) {
        self.additional_jwks.extend(keys);
    }

    /// Verify the signature of `token` against `keys`.
    ///
    /// `Ok(false)` means the token is well formed but the signature does not
    /// match. Structural problems, unsupported algorithms and key lookup
    /// failures are errors.
    pub fn verify_jwt_signature(&self, token: &str, keys: &[Jwk]) -> Result<bool> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(Error::MalformedToken(format!(
                "expected 3 segments, found {}",
                parts.len()
            )));
        }

        let signature = base64url::decode(parts[2])
            .map_err(|e| Error::MalformedToken(format!("error decoding signature: {e}")))?;
        if signature.is_empty() {
            return Err(Error::MalformedToken("empty signature".into()));
        }

        let header = decode_jwt(token, 0)
            .ok_or_else(|| Error::MalformedToken("error decoding JSON from token header".into()))?;
        let alg = header
            .get("alg")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedToken("missing signature type in token header".into()))?;
        let kid = header.get("kid").and_then(Value::as_str);

        let signing_input = format!("{}.{}", parts[0], parts[1]);

        let valid = match alg {
            "RS256" | "RS384" | "RS512" | "PS256" | "PS512" => {
                let key = self.key_for_header(keys, alg, kid)?;
                verify_rsa(alg, key, signing_input.as_bytes(), &signature)?
            }
            "HS256" | "HS384" | "HS512" => verify_hmac(
                alg,
                self.client_secret.as_bytes(),
                signing_input.as_bytes(),
                &signature,
            ),
            other => {
                return Err(Error::UnsupportedAlgorithm(format!(
                    "no support for signature type: {other}"
                )));
            }
        };

        debug!(alg, kid, valid, "verified token signature");
        Ok(valid)
    }

    /// Supported PKCE methods and their hashing.
    pub fn pkce_supported_algs(&self) -> &'static [(&'static str, pkce::ChallengeHash)] {
        pkce::SUPPORTED_METHODS
    }

    pub fn code_challenge_method(&self) -> Option<&str> {
        self.code_challenge_method.as_deref()
    }

    /// Select the PKCE method; an empty value disables PKCE.
    pub fn set_code_challenge_method(&mut self, method: Option<String>) {
        self.code_challenge_method = method.filter(|m| !m.is_empty());
    }

    /// Challenge for the selected method. Methods missing from
    /// `pkce_supported_algs` degrade to the plain verifier.
    pub fn code_challenge(&self, verifier: &str) -> String {
        match self.code_challenge_method() {
            Some(method) => pkce::challenge_for(method, verifier),
            None => verifier.to_owned(),
        }
    }

    /// Base64url without padding, as used for `at_hash`.
    pub fn url_encode(&self, bytes: &[u8]) -> String {
        base64url::encode(bytes)
    }

    fn key_for_header<'a>(&'a self, keys: &'a [Jwk], alg: &str, kid: Option<&str>) -> Result<&'a Jwk> {
        for key in keys.iter().chain(self.additional_jwks.iter()) {
            if key.kty == "RSA" {
                if kid.is_none() || key.kid.as_deref() == kid {
                    return Ok(key);
                }
            } else if key.alg.as_deref() == Some(alg) && key.kid.as_deref() == kid {
                return Ok(key);
            }
        }

        match kid {
            Some(kid) => Err(Error::KeyNotFound(format!("({alg}, {kid})"))),
            None => Err(Error::KeyNotFound("RSA".into())),
        }
    }
}

fn rsa_parameters(alg: &str) -> Option<&'static RsaParameters> {
    match alg {
        "RS256" => Some(&signature::RSA_PKCS1_2048_8192_SHA256),
        "RS384" => Some(&signature::RSA_PKCS1_2048_8192_SHA384),
        "RS512" => Some(&signature::RSA_PKCS1_2048_8192_SHA512),
        "PS256" => Some(&signature::RSA_PSS_2048_8192_SHA256),
        "PS512" => Some(&signature::RSA_PSS_2048_8192_SHA512),
        _ => None,
    }
}

fn verify_rsa(alg: &str, key: &Jwk, message: &[u8], sig: &[u8]) -> Result<bool> {
    let (Some(n), Some(e)) = (key.n.as_deref(), key.e.as_deref()) else {
        return Err(Error::MalformedToken("malformed key object".into()));
    };
    let n = base64url::decode(n)
        .map_err(|e| Error::MalformedToken(format!("invalid key modulus: {e}")))?;
    let e = base64url::decode(e)
        .map_err(|e| Error::MalformedToken(format!("invalid key exponent: {e}")))?;
    let params = rsa_parameters(alg)
        .ok_or_else(|| Error::UnsupportedAlgorithm(format!("no support for signature type: {alg}")))?;

    let components = RsaPublicKeyComponents {
        n: strip_leading_zeros(&n),
        e: strip_leading_zeros(&e),
    };
    Ok(components.verify(params, message, sig).is_ok())
}

// ring rejects big-endian integers with leading zero bytes
fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

fn verify_hmac(alg: &str, key: &[u8], message: &[u8], sig: &[u8]) -> bool {
    fn check<M: Mac>(mut mac: M, message: &[u8], sig: &[u8]) -> bool {
        mac.update(message);
        mac.verify_slice(sig).is_ok()
    }

    // HMAC accepts keys of any length, so construction cannot fail
    match alg {
        "HS256" => Hmac::<Sha256>::new_from_slice(key).is_ok_and(|m| check(m, message, sig)),
        "HS384" => Hmac::<Sha384>::new_from_slice(key).is_ok_and(|m| check(m, message, sig)),
        "HS512" => Hmac::<Sha512>::new_from_slice(key).is_ok_and(|m| check(m, message, sig)),
        _ => false,
    }
}
