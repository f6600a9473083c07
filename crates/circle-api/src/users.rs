use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use circle_auth::SessionGate;
use circle_auth::password::{generate_activation_code, hash_password};
use circle_db::models::UserRow;
use circle_db::users::{NewUser, ProfileChanges, ProfileUpdate};
use circle_types::api::{
    AccessClaims, ActivateRequest, ActivateResponse, EditUserRequest, EditUserResponse,
    RegisterRequest, RegisterResponse, SearchRequest, SearchResult,
};
use circle_types::models::{Role, UserProfile};

use crate::error::ApiError;
use crate::extract::{Body, Params};
use crate::friends::status_between;
use crate::middleware::ensure_self_or_admin;
use crate::{AppState, blocking};

const SEARCH_LIMIT: u32 = 50;

fn user_not_found() -> ApiError {
    ApiError::not_found("isUserExist", "User not found.")
}

fn email_taken() -> ApiError {
    ApiError::conflict("isEmailUnique", "E-mail address is already registered.")
}

pub async fn register(
    State(state): State<AppState>,
    Body(req): Body<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()?;
    if req.password != req.r_password {
        return Err(ApiError::invalid(
            Some("rPassword"),
            "isPasswordsMatch",
            "Passwords do not match.",
        ));
    }

    let password = req.password;
    let password_hash = blocking(move || Ok(hash_password(&password)?)).await?;

    let user_id = Uuid::new_v4();
    let code = generate_activation_code();

    let email = req.email.clone();
    let username = req.username;
    let surname = req.surname;
    let activation_code = code.clone();
    let created = state
        .db
        .call(move |db| {
            db.create_user(&NewUser {
                id: &user_id.to_string(),
                email: &email,
                username: &username,
                surname: &surname,
                password_hash: &password_hash,
                role: Role::User,
                activation_code: Some(&activation_code),
            })
        })
        .await?;
    if !created {
        return Err(email_taken());
    }

    info!("Registered user {} ({})", user_id, req.email);
    if let Err(e) = state.mailer.send_activation(&req.email, &code) {
        warn!("Could not send activation mail to {}: {}", req.email, e);
    }

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            id: user_id,
            email: req.email,
        }),
    ))
}

pub async fn activate(
    State(state): State<AppState>,
    Body(req): Body<ActivateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = state
        .db
        .call(move |db| db.activate_user(&req.code))
        .await?
        .ok_or_else(|| ApiError::not_found("isCodeValid", "Activation code not found."))?;

    info!("Activated account {}", email);
    Ok((StatusCode::CREATED, Json(ActivateResponse { email })))
}

/// Substring search over username and surname, excluding the caller. Each
/// hit carries the caller's relationship to it.
pub async fn search(
    State(state): State<AppState>,
    Extension(claims): Extension<AccessClaims>,
    Body(req): Body<SearchRequest>,
) -> Result<Json<Vec<SearchResult>>, ApiError> {
    req.validate()?;

    let me = claims.sub.to_string();
    let results = state
        .db
        .call(move |db| {
            let rows = db.search_users(req.query.trim(), &me, SEARCH_LIMIT)?;
            rows.iter()
                .map(|row| {
                    Ok(SearchResult {
                        user: row.to_summary(),
                        status: status_between(db, &me, &row.id)?,
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()
        })
        .await?;

    Ok(Json(results))
}

pub async fn list_all(State(state): State<AppState>) -> Result<Json<Vec<UserProfile>>, ApiError> {
    let users = state.db.call(|db| db.list_users()).await?;
    Ok(Json(users.iter().map(UserRow::to_profile).collect()))
}

pub async fn get_one(
    State(state): State<AppState>,
    Extension(claims): Extension<AccessClaims>,
    Params(id): Params<Uuid>,
) -> Result<Json<UserProfile>, ApiError> {
    SessionGate::require_role(&claims, &[Role::Admin])?;

    let user = state
        .db
        .call(move |db| db.get_user_by_id(&id.to_string()))
        .await?
        .ok_or_else(user_not_found)?;
    Ok(Json(user.to_profile()))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(claims): Extension<AccessClaims>,
    Params(id): Params<Uuid>,
) -> Result<StatusCode, ApiError> {
    SessionGate::require_role(&claims, &[Role::Admin])?;

    let deleted = state
        .db
        .call(move |db| db.delete_user(&id.to_string()))
        .await?;
    if !deleted {
        return Err(user_not_found());
    }

    info!("{} deleted user {}", claims.sub, id);
    Ok(StatusCode::NO_CONTENT)
}

/// Edit a profile. Changing the email clears the activation and mails a new
/// code, answered with 204; otherwise the edited profile comes back with a
/// fresh access token for the caller so its claims match the stored user.
pub async fn edit(
    State(state): State<AppState>,
    Extension(claims): Extension<AccessClaims>,
    Params(id): Params<Uuid>,
    Body(req): Body<EditUserRequest>,
) -> Result<Response, ApiError> {
    ensure_self_or_admin(&claims, id)?;
    req.validate()?;

    let avatar = match req.avatar.as_deref() {
        None => None,
        Some(encoded) => Some(B64.decode(encoded).map_err(|_| {
            ApiError::invalid(Some("avatar"), "isBase64", "Avatar must be base64 encoded.")
        })?),
    };

    let uid = id.to_string();
    let current = state
        .db
        .call(move |db| db.get_user_by_id(&uid))
        .await?
        .ok_or_else(user_not_found)?;

    let email_changed = !current.email.eq_ignore_ascii_case(&req.email);
    let code = email_changed.then(generate_activation_code);

    let uid = id.to_string();
    let activation_code = code.clone();
    let email = req.email.clone();
    let outcome = state
        .db
        .call(move |db| {
            db.update_profile(
                &uid,
                &ProfileChanges {
                    username: &req.username,
                    surname: &req.surname,
                    email: &email,
                    public_profile: req.public_profile,
                    avatar: avatar.as_deref(),
                    activation_code: activation_code.as_deref(),
                },
            )
        })
        .await?;

    match outcome {
        ProfileUpdate::Updated => {}
        ProfileUpdate::NotFound => return Err(user_not_found()),
        ProfileUpdate::EmailTaken => return Err(email_taken()),
    }

    info!("{} edited profile of {}", claims.sub, id);

    if let Some(code) = code {
        if let Err(e) = state.mailer.send_activation(&req.email, &code) {
            warn!("Could not send activation mail to {}: {}", req.email, e);
        }
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let (uid, caller) = (id.to_string(), claims.sub.to_string());
    let (edited, caller) = state
        .db
        .call(move |db| Ok((db.get_user_by_id(&uid)?, db.get_user_by_id(&caller)?)))
        .await?;
    let edited = edited.ok_or_else(user_not_found)?;
    let caller = caller.ok_or_else(user_not_found)?;

    let access_token = state.tokens.issue_access_token(&caller)?;
    Ok(Json(EditUserResponse {
        user: edited.to_profile(),
        access_token,
    })
    .into_response())
}
