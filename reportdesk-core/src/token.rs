//! Access tokens and their expiry claims.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

use crate::error::TokenError;

/// Opaque bearer token. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken(len={})", self.0.len())
    }
}

/// A token together with its expiry, as returned by login or the refresh
/// endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub token: AccessToken,
    /// Epoch seconds.
    pub expires_at: i64,
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

impl TokenGrant {
    pub fn new(token: AccessToken, expires_at: i64) -> Self {
        Self { token, expires_at }
    }

    /// Builds a grant from a JWT, reading the expiry from its `exp` claim.
    ///
    /// The signature is not verified; the backend is the authority on token
    /// validity and this is only used to schedule refresh and logout.
    ///
    /// # Errors
    ///
    /// Returns `TokenError` if the token is not three segments, the payload is
    /// not base64url JSON, or the `exp` claim is absent.
    pub fn from_jwt(raw: &str) -> Result<Self, TokenError> {
        let mut parts = raw.split('.');
        let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(payload), Some(_), None) => payload,
            _ => return Err(TokenError::Malformed),
        };
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
        let claims: Claims = serde_json::from_slice(&bytes)?;
        let expires_at = claims.exp.ok_or(TokenError::MissingExpiry)?;
        Ok(Self {
            token: AccessToken::new(raw),
            expires_at,
        })
    }
}
