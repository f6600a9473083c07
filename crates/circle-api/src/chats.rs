use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;
use validator::Validate;

use circle_db::models::ChatListing;
use circle_types::api::{AccessClaims, SendMessageRequest};
use circle_types::models::{ChatSummary, Message};

use crate::AppState;
use crate::error::ApiError;
use crate::extract::{Body, Params, QueryArgs};
use crate::middleware::ensure_self_or_admin;

pub const CHATS_PAGE_SIZE: u32 = 30;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// `createdAt` of the oldest message of the previous page.
    pub before: Option<DateTime<Utc>>,
    /// Id of that message; breaks ties between messages sharing `before`.
    pub before_id: Option<Uuid>,
}

fn default_limit() -> u32 {
    50
}

pub async fn list_chats(
    state: State<AppState>,
    claims: Extension<AccessClaims>,
    Params(user_id): Params<Uuid>,
) -> Result<Json<Vec<ChatSummary>>, ApiError> {
    list_chats_page(state, claims, Params((user_id, 0))).await
}

pub async fn list_chats_page(
    State(state): State<AppState>,
    Extension(claims): Extension<AccessClaims>,
    Params((user_id, page)): Params<(Uuid, u32)>,
) -> Result<Json<Vec<ChatSummary>>, ApiError> {
    ensure_self_or_admin(&claims, user_id)?;

    let chats = state
        .db
        .call(move |db| db.chats_for_user(&user_id.to_string(), page, CHATS_PAGE_SIZE))
        .await?;
    Ok(Json(chats.iter().map(ChatListing::to_summary).collect()))
}

async fn ensure_participant(state: &AppState, chat_id: Uuid, user_id: Uuid) -> Result<(), ApiError> {
    let (exists, participant) = state
        .db
        .call(move |db| {
            let cid = chat_id.to_string();
            Ok((db.get_chat(&cid)?.is_some(), db.is_participant(&cid, &user_id.to_string())?))
        })
        .await?;

    if !exists {
        return Err(ApiError::not_found("isChatExist", "Chat not found."));
    }
    if !participant {
        return Err(ApiError::forbidden("isParticipant", "Not a participant of this chat."));
    }
    Ok(())
}

pub async fn get_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<AccessClaims>,
    Params(chat_id): Params<Uuid>,
    QueryArgs(query): QueryArgs<MessageQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    ensure_participant(&state, chat_id, claims.sub).await?;

    let limit = query.limit.clamp(1, 200);
    let rows = state
        .db
        .call(move |db| {
            // Stored timestamps always carry milliseconds.
            let before = query
                .before
                .map(|ts| ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string());
            let before_id = query.before_id.map(|id| id.to_string());
            db.get_messages(&chat_id.to_string(), limit, before.as_deref(), before_id.as_deref())
        })
        .await?;
    Ok(Json(rows.iter().map(|r| r.to_message()).collect()))
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<AccessClaims>,
    Params(chat_id): Params<Uuid>,
    Body(req): Body<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()?;
    ensure_participant(&state, chat_id, claims.sub).await?;

    let message_id = Uuid::new_v4();
    let author = claims.sub;
    let row = state
        .db
        .call(move |db| {
            db.insert_message(
                &message_id.to_string(),
                &chat_id.to_string(),
                &author.to_string(),
                &req.text,
            )
        })
        .await?;

    debug!("{} posted {} to chat {}", author, message_id, chat_id);
    Ok((StatusCode::CREATED, Json(row.to_message())))
}
