//! PKCE (Proof Key for Code Exchange) per RFC 7636
//!
//! The verifier is kept server-side in the state bundle and sent during the
//! code exchange; the challenge goes into the authorization URL so the
//! provider can tie the exchange back to the party that started the flow.

use sha2::{Digest, Sha256};

use crate::base64url;

/// Hashing applied to the verifier for a challenge method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeHash {
    Sha256,
    /// The challenge is the verifier itself
    Identity,
}

/// Challenge methods this client can compute.
pub const SUPPORTED_METHODS: &[(&str, ChallengeHash)] =
    &[("S256", ChallengeHash::Sha256), ("plain", ChallengeHash::Identity)];

/// Look up the hashing for a challenge method name.
pub fn hash_for(method: &str) -> Option<ChallengeHash> {
    SUPPORTED_METHODS
        .iter()
        .find(|(name, _)| *name == method)
        .map(|(_, hash)| *hash)
}

/// Compute the S256 challenge: `BASE64URL(SHA256(verifier))`.
pub fn compute_challenge(verifier: &str) -> String {
    base64url::encode(Sha256::digest(verifier.as_bytes()))
}

/// Challenge for `method`; unknown methods degrade to the plain verifier.
pub fn challenge_for(method: &str, verifier: &str) -> String {
    match hash_for(method) {
        Some(ChallengeHash::Sha256) => compute_challenge(verifier),
        Some(ChallengeHash::Identity) | None => verifier.to_owned(),
    }
}
