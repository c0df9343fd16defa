//! Token verification for the WebSocket handshake.
//!
//! The gateway does not mint tokens; it only verifies them. The trait keeps
//! the verification backend swappable (a JWT or introspection verifier slots
//! in behind the same seam), and the rejection is deliberately opaque so the
//! close frame never leaks whether a token was expired, revoked, or unknown.

use crate::config::AuthConfig;
use async_trait::async_trait;
use relay_core::Identity;
use std::collections::HashMap;
use thiserror::Error;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The token did not verify. No further detail crosses the wire.
    #[error("invalid token")]
    InvalidToken,
}

/// Verifies handshake tokens and resolves them to an identity.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a token and return the identity it was issued to.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidToken`] for any token that does not
    /// verify.
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Verifier backed by the static token table in the config file.
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        let tokens = config
            .tokens
            .iter()
            .map(|(token, identity)| {
                (
                    token.clone(),
                    Identity {
                        user_id: identity.user_id.clone(),
                        username: identity.username.clone(),
                    },
                )
            })
            .collect();
        Self { tokens }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenIdentity;

    fn verifier() -> StaticTokenVerifier {
        let mut config = AuthConfig::default();
        config.tokens.insert(
            "tok-alice".to_string(),
            TokenIdentity {
                user_id: "u1".to_string(),
                username: "alice".to_string(),
            },
        );
        StaticTokenVerifier::from_config(&config)
    }

    #[tokio::test]
    async fn test_known_token_resolves_identity() {
        let identity = verifier().verify("tok-alice").await.unwrap();
        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.username, "alice");
    }

    #[tokio::test]
    async fn test_unknown_token_is_rejected() {
        let err = verifier().verify("tok-mallory").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
    }
}
