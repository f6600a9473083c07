//! Database row types. These map directly to SQLite rows and stay distinct
//! from circle-types API models; the `to_*` / `into_*` helpers do the
//! conversion so both the REST layer and the gateway share it.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use circle_types::models::{
    Chat, ChatSummary, Decision, IncomingRequest, Message, OutgoingRequest, Role, UserProfile,
    UserSummary,
};

pub struct UserRow {
    pub id: String,
    pub email: String,
    pub username: String,
    pub surname: String,
    pub password: String,
    pub role: String,
    pub activation_code: Option<String>,
    pub avatar: Vec<u8>,
    pub public_profile: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// The columns of `users` needed for a [`UserSummary`].
pub struct SummaryRow {
    pub id: String,
    pub username: String,
    pub surname: String,
    pub role: String,
    pub avatar: Vec<u8>,
}

pub struct FriendRequestRow {
    pub id: String,
    pub request_user_id: String,
    pub target_user_id: String,
    pub message: String,
    pub status: bool,
    pub decision: Option<String>,
    pub seen: bool,
    pub send_request: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// A friend request joined with the user on the other side: the requester
/// for incoming lists, the target for outgoing lists.
pub struct RequestWithUser {
    pub request: FriendRequestRow,
    pub user: SummaryRow,
}

pub struct ChatRow {
    pub id: String,
    pub conversation_name: Option<String>,
    pub created_at: String,
    pub participants: Vec<String>,
}

/// A chat as listed for one user, with the other participants.
pub struct ChatListing {
    pub chat: ChatRow,
    pub others: Vec<SummaryRow>,
}

pub struct MessageRow {
    pub id: String,
    pub chat_id: String,
    pub author_id: String,
    pub author_username: String,
    pub text: String,
    pub is_visible: bool,
    pub created_at: String,
    pub updated_at: String,
}

pub fn parse_id(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, raw, e);
        Uuid::default()
    })
}

pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>().unwrap_or_else(|e| {
        warn!("Corrupt timestamp '{}': {}", raw, e);
        DateTime::default()
    })
}

fn parse_role(raw: &str) -> Role {
    raw.parse().unwrap_or_else(|e| {
        warn!("{}, treating as USER", e);
        Role::User
    })
}

fn encode_avatar(avatar: &[u8]) -> Option<String> {
    if avatar.is_empty() {
        None
    } else {
        Some(B64.encode(avatar))
    }
}

impl UserRow {
    pub fn role(&self) -> Role {
        parse_role(&self.role)
    }

    pub fn is_activated(&self) -> bool {
        self.activation_code.is_none()
    }

    pub fn to_profile(&self) -> UserProfile {
        UserProfile {
            id: parse_id(&self.id, "user id"),
            email: self.email.clone(),
            username: self.username.clone(),
            surname: self.surname.clone(),
            role: self.role(),
            activated: self.is_activated(),
            public_profile: self.public_profile,
            avatar: encode_avatar(&self.avatar),
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
        }
    }
}

impl SummaryRow {
    pub fn to_summary(&self) -> UserSummary {
        UserSummary {
            id: parse_id(&self.id, "user id"),
            username: self.username.clone(),
            surname: self.surname.clone(),
            role: parse_role(&self.role),
            avatar: encode_avatar(&self.avatar),
        }
    }
}

impl FriendRequestRow {
    pub fn decision(&self) -> Option<Decision> {
        self.decision.as_deref().and_then(|d| match d.parse() {
            Ok(decision) => Some(decision),
            Err(e) => {
                warn!("Corrupt decision on request '{}': {}", self.id, e);
                None
            }
        })
    }
}

impl RequestWithUser {
    pub fn to_incoming(&self) -> IncomingRequest {
        IncomingRequest {
            id: parse_id(&self.request.id, "request id"),
            message: self.request.message.clone(),
            seen: self.request.seen,
            created_at: parse_timestamp(&self.request.created_at),
            requester: self.user.to_summary(),
        }
    }

    pub fn to_outgoing(&self) -> OutgoingRequest {
        OutgoingRequest {
            id: parse_id(&self.request.id, "request id"),
            message: self.request.message.clone(),
            seen: self.request.seen,
            created_at: parse_timestamp(&self.request.created_at),
            target: self.user.to_summary(),
        }
    }
}

impl ChatRow {
    pub fn to_chat(&self) -> Chat {
        Chat {
            id: parse_id(&self.id, "chat id"),
            conversation_name: self.conversation_name.clone(),
            participants: self
                .participants
                .iter()
                .map(|p| parse_id(p, "participant id"))
                .collect(),
            created_at: parse_timestamp(&self.created_at),
        }
    }
}

impl ChatListing {
    pub fn to_summary(&self) -> ChatSummary {
        ChatSummary {
            id: parse_id(&self.chat.id, "chat id"),
            conversation_name: self.chat.conversation_name.clone(),
            created_at: parse_timestamp(&self.chat.created_at),
            users: self.others.iter().map(SummaryRow::to_summary).collect(),
        }
    }
}

impl MessageRow {
    pub fn to_message(&self) -> Message {
        Message {
            id: parse_id(&self.id, "message id"),
            chat_id: parse_id(&self.chat_id, "chat id"),
            author_id: parse_id(&self.author_id, "author id"),
            author_username: self.author_username.clone(),
            text: self.text.clone(),
            is_visible: self.is_visible,
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
        }
    }
}
