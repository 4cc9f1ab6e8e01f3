//! Credential context shared by every authorised APS call.
//!
//! The SDK never acquires tokens itself. A caller injects a bearer token,
//! the client attaches it per request, and an HTTP 401 moves the context to
//! `Invalidated` until the caller replaces the token.

use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Opaque bearer value. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value for an `Authorization` header.
    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(***)")
    }
}

/// Why no bearer value is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// No token was ever supplied.
    Missing,
    /// The service rejected the token; the caller must supply a new one.
    Invalidated,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Missing => {
                write!(f, "no access token supplied (use --token or APS_ACCESS_TOKEN)")
            }
            AuthError::Invalidated => {
                write!(f, "access token was rejected by the service and must be replaced")
            }
        }
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug)]
enum TokenState {
    Empty,
    Valid(BearerToken),
    Invalidated,
}

/// Cloneable handle to the token state; clones share the same state.
#[derive(Debug, Clone)]
pub struct AuthContext {
    state: Arc<RwLock<TokenState>>,
}

impl AuthContext {
    /// A context with no token. Every authorised call fails with `AuthError::Missing`.
    pub fn empty() -> Self {
        Self {
            state: Arc::new(RwLock::new(TokenState::Empty)),
        }
    }

    /// A context holding `token`. Blank tokens are treated as missing.
    pub fn with_token(token: BearerToken) -> Self {
        let state = if token.as_str().trim().is_empty() {
            TokenState::Empty
        } else {
            TokenState::Valid(token)
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// The bearer value to attach to the next call.
    pub async fn bearer(&self) -> Result<BearerToken, AuthError> {
        match &*self.state.read().await {
            TokenState::Valid(token) => Ok(token.clone()),
            TokenState::Empty => Err(AuthError::Missing),
            TokenState::Invalidated => Err(AuthError::Invalidated),
        }
    }

    /// Mark the current token as unusable.
    pub async fn invalidate(&self) {
        let mut state = self.state.write().await;
        if matches!(*state, TokenState::Valid(_)) {
            tracing::warn!("access token rejected, invalidating credential context");
            *state = TokenState::Invalidated;
        }
    }

    /// Install a fresh token, ending any invalidated period.
    pub async fn replace(&self, token: BearerToken) {
        *self.state.write().await = TokenState::Valid(token);
    }

    pub async fn is_valid(&self) -> bool {
        matches!(*self.state.read().await, TokenState::Valid(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_header_value() {
        let token = BearerToken::new("abc123");
        assert_eq!(token.header_value(), "Bearer abc123");
    }

    #[test]
    fn test_debug_hides_secret() {
        let token = BearerToken::new("super-secret");
        let printed = format!("{token:?}");
        assert!(!printed.contains("super-secret"));
    }

    #[tokio::test]
    async fn test_empty_context_reports_missing() {
        let auth = AuthContext::empty();
        assert_eq!(auth.bearer().await.unwrap_err(), AuthError::Missing);
        assert!(!auth.is_valid().await);
    }

    #[tokio::test]
    async fn test_blank_token_is_missing() {
        let auth = AuthContext::with_token(BearerToken::new("   "));
        assert_eq!(auth.bearer().await.unwrap_err(), AuthError::Missing);
    }

    #[tokio::test]
    async fn test_invalidate_then_replace() {
        let auth = AuthContext::with_token(BearerToken::new("first"));
        assert_eq!(auth.bearer().await.unwrap().as_str(), "first");

        auth.invalidate().await;
        assert_eq!(auth.bearer().await.unwrap_err(), AuthError::Invalidated);

        auth.replace(BearerToken::new("second")).await;
        assert_eq!(auth.bearer().await.unwrap().as_str(), "second");
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let auth = AuthContext::with_token(BearerToken::new("shared"));
        let other = auth.clone();
        other.invalidate().await;
        assert!(!auth.is_valid().await);
    }

    #[tokio::test]
    async fn test_invalidate_empty_stays_missing() {
        let auth = AuthContext::empty();
        auth.invalidate().await;
        assert_eq!(auth.bearer().await.unwrap_err(), AuthError::Missing);
    }
}
