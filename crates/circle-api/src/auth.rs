use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};
use axum_extra::typed_header::TypedHeaderRejection;
use tracing::{debug, info};
use validator::Validate;

use circle_auth::AuthError;
use circle_auth::password::{hash_password, verify_password};
use circle_db::models::parse_id;
use circle_types::api::{
    AccessClaims, ChangePasswordRequest, LoginRequest, RefreshRequest, TokenPairResponse,
};

use crate::error::ApiError;
use crate::extract::Body;
use crate::{AppState, blocking};

fn bad_credentials() -> ApiError {
    ApiError::not_found("isLoginCorrect", "Incorrect email or password.")
}

pub async fn login(
    State(state): State<AppState>,
    Body(req): Body<LoginRequest>,
) -> Result<Json<TokenPairResponse>, ApiError> {
    let email = req.email.clone();
    let user = state
        .db
        .call(move |db| db.get_user_by_email(&email))
        .await?
        .ok_or_else(bad_credentials)?;

    let hash = user.password.clone();
    let password = req.password;
    if !blocking(move || Ok(verify_password(&password, &hash))).await? {
        debug!("Failed login for {}", req.email);
        return Err(bad_credentials());
    }

    if !user.is_activated() {
        return Err(ApiError::forbidden("isAccountActive", "Account is not activated."));
    }

    let access_token = state.tokens.issue_access_token(&user)?;
    let refresh_token = state
        .tokens
        .issue_refresh_token(parse_id(&user.id, "user id"))?;

    info!("{} ({}) logged in", user.username, user.id);

    Ok(Json(TokenPairResponse {
        access_token,
        refresh_token,
    }))
}

/// Rotate the access token. The old access token comes in the
/// `Authorization` header (expired is fine), the refresh token in the body.
/// Every refusal is a 403.
pub async fn token(
    State(state): State<AppState>,
    bearer: Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>,
    Body(req): Body<RefreshRequest>,
) -> Result<Json<TokenPairResponse>, ApiError> {
    let TypedHeader(Authorization(bearer)) =
        bearer.map_err(|_| ApiError::forbidden("isTokenValid", "Missing access token."))?;

    let pair = state
        .tokens
        .refresh(&req.refresh_token, bearer.token())
        .await
        .map_err(|e| match e {
            AuthError::Storage(e) => ApiError::Internal(e),
            AuthError::Hashing(e) => ApiError::Internal(anyhow::anyhow!(e)),
            AuthError::AlreadyRevoked => {
                ApiError::forbidden("isTokenValid", "Access token was already refreshed.")
            }
            other => ApiError::forbidden("isTokenValid", other.to_string()),
        })?;

    Ok(Json(TokenPairResponse {
        access_token: pair.access_token,
        refresh_token: pair.refresh_token,
    }))
}

pub async fn change_password(
    State(state): State<AppState>,
    Extension(claims): Extension<AccessClaims>,
    Body(req): Body<ChangePasswordRequest>,
) -> Result<StatusCode, ApiError> {
    req.validate()?;

    let uid = claims.sub.to_string();
    let user = state
        .db
        .call(move |db| db.get_user_by_id(&uid))
        .await?
        .ok_or_else(|| ApiError::not_found("isUserExist", "User not found."))?;

    let hash = user.password;
    let old_password = req.old_password;
    if !blocking(move || Ok(verify_password(&old_password, &hash))).await? {
        return Err(ApiError::Unauthorized {
            key: "isOldPasswordCorrect",
            message: "Old password is incorrect.".to_string(),
        });
    }

    let new_password = req.new_password;
    let new_hash = blocking(move || Ok(hash_password(&new_password)?)).await?;

    let uid = claims.sub.to_string();
    state
        .db
        .call(move |db| db.update_password(&uid, &new_hash))
        .await?;

    info!("{} changed their password", claims.sub);
    Ok(StatusCode::NO_CONTENT)
}
