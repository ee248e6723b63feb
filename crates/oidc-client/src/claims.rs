//! ID token claims verification
//!
//! Pure checks over decoded claims. Every check must pass; the first failure
//! is reported so the caller can log which one tripped.

use std::fmt;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::base64url;

/// How the `nonce` claim is checked.
#[derive(Debug, Clone, Copy)]
pub enum NonceCheck<'a> {
    /// A `nonce` claim, when present, must equal this stored value (a claim
    /// with nothing stored fails)
    Expected(Option<&'a str>),
    /// Userinfo responses and refreshed ID tokens are not nonce-bound
    Skip,
}

/// What the claims are checked against.
#[derive(Debug, Clone)]
pub struct Expectations<'a> {
    pub issuers: &'a [String],
    pub client_id: &'a str,
    pub leeway_secs: u64,
    pub nonce: NonceCheck<'a>,
    /// Access token bound by `at_hash`; empty when none was issued
    pub access_token: &'a str,
    /// `alg` from the ID token header; selects the `at_hash` digest
    pub id_token_alg: Option<&'a str>,
    /// Current unix time in seconds
    pub now: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimFailure {
    Issuer,
    Audience,
    Subject,
    Expired,
    NotYetValid,
    Nonce,
    AccessTokenHash,
}

impl fmt::Display for ClaimFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ClaimFailure::Issuer => "issuer mismatch",
            ClaimFailure::Audience => "audience does not contain client id",
            ClaimFailure::Subject => "subject missing",
            ClaimFailure::Expired => "token expired",
            ClaimFailure::NotYetValid => "token not yet valid",
            ClaimFailure::Nonce => "nonce mismatch",
            ClaimFailure::AccessTokenHash => "at_hash mismatch",
        };
        f.write_str(reason)
    }
}

/// Run every check, returning the first failure.
pub fn check(claims: &Map<String, Value>, expect: &Expectations<'_>) -> Result<(), ClaimFailure> {
    match claims.get("iss").and_then(Value::as_str) {
        Some(iss) if expect.issuers.iter().any(|i| i == iss) => {}
        _ => return Err(ClaimFailure::Issuer),
    }

    let audience_ok = match claims.get("aud") {
        Some(Value::String(aud)) => aud == expect.client_id,
        Some(Value::Array(auds)) => auds.iter().any(|a| a.as_str() == Some(expect.client_id)),
        _ => false,
    };
    if !audience_ok {
        return Err(ClaimFailure::Audience);
    }

    if claims.get("sub").is_none_or(Value::is_null) {
        return Err(ClaimFailure::Subject);
    }

    let leeway = i64::try_from(expect.leeway_secs).unwrap_or(i64::MAX);
    // Non-integer exp/nbf values are ignored
    if let Some(exp) = claims.get("exp").and_then(Value::as_i64)
        && exp < expect.now.saturating_sub(leeway)
    {
        return Err(ClaimFailure::Expired);
    }
    if let Some(nbf) = claims.get("nbf").and_then(Value::as_i64)
        && nbf > expect.now.saturating_add(leeway)
    {
        return Err(ClaimFailure::NotYetValid);
    }

    if let NonceCheck::Expected(stored) = expect.nonce
        && let Some(nonce) = claims.get("nonce")
        && nonce.as_str().is_none_or(|n| Some(n) != stored)
    {
        return Err(ClaimFailure::Nonce);
    }

    if let Some(at_hash) = claims.get("at_hash") {
        let expected = access_token_hash(expect.access_token, expect.id_token_alg);
        match (at_hash.as_str(), expected) {
            (Some(actual), Some(expected)) if actual == expected => {}
            _ => return Err(ClaimFailure::AccessTokenHash),
        }
    }

    Ok(())
}

/// Boolean form of `check`.
pub fn verify(claims: &Map<String, Value>, expect: &Expectations<'_>) -> bool {
    check(claims, expect).is_ok()
}

/// `at_hash` for an access token: base64url of the left half of the digest
/// whose width matches the ID token `alg` (RS256 when absent). `None` for
/// widths with no matching digest.
pub fn access_token_hash(access_token: &str, alg: Option<&str>) -> Option<String> {
    let alg = alg.unwrap_or("RS256");
    let digest = match alg.get(2..)? {
        "256" => Sha256::digest(access_token.as_bytes()).to_vec(),
        "384" => Sha384::digest(access_token.as_bytes()).to_vec(),
        "512" => Sha512::digest(access_token.as_bytes()).to_vec(),
        _ => return None,
    };
    Some(base64url::encode(&digest[..digest.len() / 2]))
}
