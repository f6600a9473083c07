use std::sync::Arc;

use tracing::debug;

use circle_types::api::AccessClaims;
use circle_types::models::Role;

use crate::error::AuthError;
use crate::tokens::TokenService;

/// Authorizes inbound calls against the [`TokenService`]. Fails closed:
/// anything other than a valid, unrevoked access token is `Unauthorized`.
#[derive(Clone)]
pub struct SessionGate {
    tokens: Arc<TokenService>,
}

impl SessionGate {
    pub fn new(tokens: Arc<TokenService>) -> Self {
        Self { tokens }
    }

    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    /// Authorize a raw `Authorization` header value.
    pub async fn authorize(&self, raw_auth_header: Option<&str>) -> Result<AccessClaims, AuthError> {
        let token = raw_auth_header
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::Unauthorized)?;
        self.authorize_token(token).await
    }

    /// Authorize a bare token, e.g. one passed as a WebSocket query parameter.
    pub async fn authorize_token(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let claims = self.tokens.validate_access(token).map_err(|_| AuthError::Unauthorized)?;

        if self.tokens.is_jti_revoked(claims.jti, claims.sub).await? {
            debug!("Rejected revoked access token {} of {}", claims.jti, claims.sub);
            return Err(AuthError::Unauthorized);
        }

        Ok(claims)
    }

    pub fn require_role(claims: &AccessClaims, allowed: &[Role]) -> Result<(), AuthError> {
        if allowed.contains(&claims.role) {
            Ok(())
        } else {
            Err(AuthError::Forbidden)
        }
    }
}
