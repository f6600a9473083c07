use axum::{
    Extension,
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use circle_auth::SessionGate;
use circle_types::api::AccessClaims;
use circle_types::models::Role;

use crate::AppState;
use crate::error::ApiError;

/// Authorize the bearer token through the [`SessionGate`] and put the
/// claims into request extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let claims = state
        .gate
        .authorize(auth_header)
        .await
        .map_err(|_| ApiError::unauthorized())?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Must run after [`require_auth`].
pub async fn require_admin(
    Extension(claims): Extension<AccessClaims>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    SessionGate::require_role(&claims, &[Role::Admin])?;
    Ok(next.run(req).await)
}

/// The caller is `user_id` or an administrator.
pub fn ensure_self_or_admin(claims: &AccessClaims, user_id: uuid::Uuid) -> Result<(), ApiError> {
    if claims.sub == user_id || claims.role == Role::Admin {
        Ok(())
    } else {
        Err(ApiError::forbidden("isOwnerOrAdmin", "Not allowed to access this user."))
    }
}
