use std::collections::BTreeMap;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;
use validator::ValidationErrors;

use circle_auth::AuthError;
use circle_types::api::ConstraintError;

/// Error returned by every handler.
///
/// Renders as `[{"property": .., "constraints": {key: message}}]` so clients
/// can branch on the constraint key instead of parsing messages.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation failed")]
    Validation(Vec<ConstraintError>),

    #[error("{message}")]
    NotFound { key: &'static str, message: String },

    #[error("{message}")]
    Conflict { key: &'static str, message: String },

    #[error("{message}")]
    Unauthorized { key: &'static str, message: String },

    #[error("{message}")]
    Forbidden { key: &'static str, message: String },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn invalid(property: Option<&str>, key: &str, message: impl Into<String>) -> Self {
        Self::Validation(vec![ConstraintError {
            property: property.map(str::to_string),
            constraints: BTreeMap::from([(key.to_string(), message.into())]),
        }])
    }

    pub fn not_found(key: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound { key, message: message.into() }
    }

    pub fn conflict(key: &'static str, message: impl Into<String>) -> Self {
        Self::Conflict { key, message: message.into() }
    }

    pub fn unauthorized() -> Self {
        Self::Unauthorized {
            key: "isAuthorized",
            message: "Missing or invalid access token.".to_string(),
        }
    }

    pub fn forbidden(key: &'static str, message: impl Into<String>) -> Self {
        Self::Forbidden { key, message: message.into() }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn into_constraints(self) -> Vec<ConstraintError> {
        let single = |key: &str, message: String| {
            vec![ConstraintError {
                property: None,
                constraints: BTreeMap::from([(key.to_string(), message)]),
            }]
        };

        match self {
            Self::Validation(errors) => errors,
            Self::NotFound { key, message }
            | Self::Conflict { key, message }
            | Self::Unauthorized { key, message }
            | Self::Forbidden { key, message } => single(key, message),
            Self::Internal(e) => {
                error!("Internal error: {:#}", e);
                single("internal", "Internal server error.".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self.into_constraints())).into_response()
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        // BTreeMap keeps the property order stable.
        let mut by_field: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (field, errs) in errors.field_errors() {
            let constraints = by_field.entry(camel_case(&field)).or_default();
            for err in errs.iter() {
                let message = err
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("Invalid value for {}.", field));
                constraints.insert(err.code.to_string(), message);
            }
        }

        Self::Validation(
            by_field
                .into_iter()
                .map(|(property, constraints)| ConstraintError {
                    property: Some(property),
                    constraints,
                })
                .collect(),
        )
    }
}

/// Default mapping for auth failures outside the token endpoint.
impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidToken | AuthError::Unauthorized => Self::unauthorized(),
            AuthError::AlreadyRevoked => Self::forbidden("isTokenValid", "Token was already used."),
            AuthError::Forbidden => Self::forbidden("isRoleAllowed", "Insufficient role."),
            AuthError::UserNotFound => Self::not_found("isUserExist", "User not found."),
            AuthError::Hashing(e) => Self::Internal(anyhow::anyhow!("password hashing failed: {}", e)),
            AuthError::Storage(e) => Self::Internal(e),
        }
    }
}

fn camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for c in field.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}
