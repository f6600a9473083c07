use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::{Decision, FriendshipStatus, Role, UserProfile, UserSummary};

// -- JWT Claims --

/// Version stamped into every token. Tokens carrying any other value are
/// rejected on decode.
pub const CLAIMS_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Access token claims, shared by circle-auth (issuing and validation),
/// circle-api (request extensions) and circle-gateway (connect-time auth).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub ver: u8,
    pub typ: TokenKind,
    pub sub: Uuid,
    pub username: String,
    pub surname: String,
    pub email: String,
    pub role: Role,
    pub jti: Uuid,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub ver: u8,
    pub typ: TokenKind,
    pub sub: Uuid,
    pub jti: Uuid,
    pub iat: i64,
    pub exp: i64,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPairResponse {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    #[validate(length(
        min = 4,
        max = 100,
        code = "length",
        message = "Password must be between 4 and 100 characters."
    ))]
    pub new_password: String,
}

// -- Users --

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RegisterRequest {
    #[validate(email(code = "isEmail", message = "Invalid e-mail address format."))]
    pub email: String,
    #[validate(length(
        min = 2,
        max = 20,
        code = "length",
        message = "Username must be between 2 and 20 characters."
    ))]
    pub username: String,
    #[validate(length(
        min = 2,
        max = 50,
        code = "length",
        message = "Surname must be between 2 and 50 characters."
    ))]
    pub surname: String,
    #[validate(length(
        min = 4,
        max = 100,
        code = "length",
        message = "Password must be between 4 and 100 characters."
    ))]
    pub password: String,
    pub r_password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: Uuid,
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivateRequest {
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActivateResponse {
    pub email: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EditUserRequest {
    #[validate(length(
        min = 2,
        max = 20,
        code = "length",
        message = "Username must be between 2 and 20 characters."
    ))]
    pub username: String,
    #[validate(length(
        min = 2,
        max = 50,
        code = "length",
        message = "Surname must be between 2 and 50 characters."
    ))]
    pub surname: String,
    #[validate(email(code = "isEmail", message = "Invalid e-mail address format."))]
    pub email: String,
    #[serde(default)]
    pub public_profile: Option<bool>,
    /// Base64-encoded image. An empty string clears the avatar.
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditUserResponse {
    pub user: UserProfile,
    /// Fresh access token carrying the edited profile claims.
    pub access_token: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SearchRequest {
    #[validate(length(min = 1, max = 50, code = "length", message = "Search query must not be empty."))]
    pub query: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub user: UserSummary,
    pub status: FriendshipStatus,
}

// -- Friends --

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SaveFriendsRequest {
    pub target_user_id: Uuid,
    #[serde(default)]
    #[validate(length(max = 500, code = "length", message = "Message must be at most 500 characters."))]
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SaveFriendsResponse {
    pub id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FriendsRequestDecision {
    #[serde(rename = "reqID")]
    pub req_id: Uuid,
    pub decision: Decision,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FriendshipStatusResponse {
    pub status: FriendshipStatus,
}

// -- Chats --

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    #[validate(length(min = 1, max = 4000, code = "length", message = "Message must be between 1 and 4000 characters."))]
    pub text: String,
}

// -- Errors --

/// One entry of an error payload: the offending property (if any) and a map
/// from machine-readable constraint key to a human message.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConstraintError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    pub constraints: std::collections::BTreeMap<String, String>,
}
