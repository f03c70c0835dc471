#![forbid(unsafe_code)]

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use sharehub_contracts::identity::{fallback_display_name, AuthProviderKind, SessionIdentity};
use sharehub_contracts::ContractViolation;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential is not a three-part token")]
    Malformed,
    #[error("credential payload is not base64url: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("credential claims are unreadable: {0}")]
    Claims(#[from] serde_json::Error),
    #[error("credential claims are invalid: {0}")]
    Invalid(#[from] ContractViolation),
}

#[derive(Debug, Deserialize)]
struct FederatedClaims {
    sub: String,
    email: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

/// Reads the identity claims out of a federated ID token.
///
/// Only the payload segment is decoded. Signature checks belong to the issuing
/// provider's client library, which hands this credential over.
pub fn decode_federated_credential(credential: &str) -> Result<SessionIdentity, CredentialError> {
    let mut parts = credential.trim().split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(CredentialError::Malformed);
    };
    let raw = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
    let claims: FederatedClaims = serde_json::from_slice(&raw)?;
    let name = claims
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| fallback_display_name(&claims.email));
    let identity = SessionIdentity::v1(
        claims.sub,
        name,
        claims.email,
        claims.picture.filter(|p| !p.trim().is_empty()),
        AuthProviderKind::Google,
    )?;
    Ok(identity)
}

#[cfg(test)]
pub(crate) fn encode_test_credential(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    format!("{header}.{payload}.c2ln")
}
