use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use circle_db::Database;
use circle_db::friends::{NewRequestOutcome, ResolveOutcome};
use circle_db::models::{SummaryRow, parse_id, parse_timestamp};
use circle_types::api::{
    AccessClaims, FriendsRequestDecision, FriendshipStatusResponse, SaveFriendsRequest,
    SaveFriendsResponse,
};
use circle_types::models::{
    Decision, FriendshipStatus, IncomingRequest, OutgoingRequest, ResolvedRequest, UserSummary,
};

use crate::AppState;
use crate::error::ApiError;
use crate::extract::{Body, Params};

#[derive(Debug, thiserror::Error)]
pub enum FriendError {
    #[error("User not found")]
    UserNotFound,

    #[error("Cannot send a friend request to yourself")]
    SelfRequest,

    #[error("Users are already friends")]
    AlreadyFriends,

    #[error("A friend request is already pending")]
    DuplicateRequest,

    #[error("Friend request not found")]
    RequestNotFound,

    #[error("Only the target of a friend request may act on it")]
    NotTarget,

    #[error("Friend request was already resolved")]
    RequestAlreadyResolved,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<FriendError> for ApiError {
    fn from(err: FriendError) -> Self {
        let message = err.to_string();
        match err {
            FriendError::UserNotFound => ApiError::not_found("isUserExist", message),
            FriendError::SelfRequest => ApiError::invalid(Some("targetUserId"), "isNotSelf", message),
            FriendError::AlreadyFriends => ApiError::conflict("isNotFriend", message),
            FriendError::DuplicateRequest => ApiError::conflict("isRequestUnique", message),
            FriendError::RequestNotFound => ApiError::not_found("isRequestExist", message),
            FriendError::NotTarget => ApiError::forbidden("isRequestTarget", message),
            FriendError::RequestAlreadyResolved => ApiError::conflict("isRequestOpen", message),
            FriendError::Storage(e) => ApiError::Internal(e),
        }
    }
}

/// Friend-request state machine and friendship queries.
///
/// A request goes `open -> accepted | rejected` exactly once. Acceptance
/// writes the friendship and provisions the pair's chat in the same
/// transaction as the status flip.
#[derive(Clone)]
pub struct FriendGraph {
    db: Arc<Database>,
}

impl FriendGraph {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn send_request(
        &self,
        requester: Uuid,
        target: Uuid,
        message: String,
    ) -> Result<Uuid, FriendError> {
        if requester == target {
            return Err(FriendError::SelfRequest);
        }

        let id = Uuid::new_v4();
        let outcome = self
            .db
            .call(move |db| {
                db.create_friend_request(
                    &id.to_string(),
                    &requester.to_string(),
                    &target.to_string(),
                    &message,
                )
            })
            .await?;

        match outcome {
            NewRequestOutcome::Created => {
                info!("Friend request {} sent from {} to {}", id, requester, target);
                Ok(id)
            }
            NewRequestOutcome::RequesterNotFound | NewRequestOutcome::TargetNotFound => {
                Err(FriendError::UserNotFound)
            }
            NewRequestOutcome::AlreadyFriends => Err(FriendError::AlreadyFriends),
            NewRequestOutcome::Duplicate => Err(FriendError::DuplicateRequest),
        }
    }

    /// Open requests targeting `user`. The ones not pushed before are
    /// flagged as sent.
    pub async fn list_incoming(&self, user: Uuid) -> Result<Vec<IncomingRequest>, FriendError> {
        let uid = user.to_string();
        let rows = self.db.call(move |db| db.incoming_requests(&uid)).await?;

        let unsent: Vec<String> = rows
            .iter()
            .filter(|r| !r.request.send_request)
            .map(|r| r.request.id.clone())
            .collect();
        if !unsent.is_empty() {
            if let Err(e) = self.db.call(move |db| db.mark_requests_sent(&unsent)).await {
                warn!("Could not flag requests of {} as sent: {}", user, e);
            }
        }

        Ok(rows.iter().map(|r| r.to_incoming()).collect())
    }

    pub async fn list_outgoing(&self, user: Uuid) -> Result<Vec<OutgoingRequest>, FriendError> {
        let uid = user.to_string();
        let rows = self.db.call(move |db| db.outgoing_requests(&uid)).await?;
        Ok(rows.iter().map(|r| r.to_outgoing()).collect())
    }

    pub async fn mark_seen(&self, request_id: Uuid, actor: Uuid) -> Result<(), FriendError> {
        let rid = request_id.to_string();
        let request = self
            .db
            .call(move |db| db.get_friend_request(&rid))
            .await?
            .ok_or(FriendError::RequestNotFound)?;
        if request.target_user_id != actor.to_string() {
            return Err(FriendError::NotTarget);
        }

        let rid = request_id.to_string();
        self.db.call(move |db| db.mark_request_seen(&rid)).await?;
        Ok(())
    }

    pub async fn decide(
        &self,
        request_id: Uuid,
        decision: Decision,
        actor: Uuid,
    ) -> Result<ResolvedRequest, FriendError> {
        let outcome = self
            .db
            .call(move |db| {
                db.resolve_friend_request(&request_id.to_string(), decision, &actor.to_string())
            })
            .await?;

        let (request, chat) = match outcome {
            ResolveOutcome::NotFound => return Err(FriendError::RequestNotFound),
            ResolveOutcome::NotTarget => return Err(FriendError::NotTarget),
            ResolveOutcome::AlreadyResolved => return Err(FriendError::RequestAlreadyResolved),
            ResolveOutcome::Resolved { request, chat } => (request, chat),
        };

        info!(
            "Friend request {} resolved by {} with {}",
            request_id,
            actor,
            decision.as_str()
        );

        Ok(ResolvedRequest {
            id: parse_id(&request.id, "request id"),
            request_user_id: parse_id(&request.request_user_id, "user id"),
            target_user_id: parse_id(&request.target_user_id, "user id"),
            message: request.message.clone(),
            status: request.status,
            decision: request.decision().unwrap_or(decision),
            chat: chat.map(|c| c.to_chat()),
            updated_at: parse_timestamp(&request.updated_at),
        })
    }

    pub async fn are_friends(&self, a: Uuid, b: Uuid) -> Result<bool, FriendError> {
        Ok(self
            .db
            .call(move |db| db.are_friends(&a.to_string(), &b.to_string()))
            .await?)
    }

    /// Relationship seen from `a`.
    pub async fn friendship_status(&self, a: Uuid, b: Uuid) -> Result<FriendshipStatus, FriendError> {
        Ok(self
            .db
            .call(move |db| status_between(db, &a.to_string(), &b.to_string()))
            .await?)
    }

    pub async fn list_friends(&self, user: Uuid) -> Result<Vec<UserSummary>, FriendError> {
        let uid = user.to_string();
        let friends = self
            .db
            .call(move |db| {
                if db.get_user_by_id(&uid)?.is_none() {
                    return Ok(None);
                }
                db.friends_of(&uid).map(Some)
            })
            .await?
            .ok_or(FriendError::UserNotFound)?;
        Ok(friends.iter().map(SummaryRow::to_summary).collect())
    }
}

/// Blocking status lookup, shared with search so it can run inside one
/// `Database::call`.
pub(crate) fn status_between(db: &Database, a: &str, b: &str) -> anyhow::Result<FriendshipStatus> {
    if db.are_friends(a, b)? {
        Ok(FriendshipStatus::AlreadyFriends)
    } else if db.has_open_request(a, b)? {
        Ok(FriendshipStatus::RequestSent)
    } else {
        Ok(FriendshipStatus::NotFriends)
    }
}

// -- Handlers --

pub async fn save_friends_request(
    State(state): State<AppState>,
    Extension(claims): Extension<AccessClaims>,
    Body(req): Body<SaveFriendsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()?;
    let id = FriendGraph::new(state.db.clone())
        .send_request(claims.sub, req.target_user_id, req.message)
        .await?;
    Ok((StatusCode::CREATED, Json(SaveFriendsResponse { id })))
}

pub async fn notifications(
    State(state): State<AppState>,
    Extension(claims): Extension<AccessClaims>,
) -> Result<Json<Vec<IncomingRequest>>, ApiError> {
    let requests = FriendGraph::new(state.db.clone())
        .list_incoming(claims.sub)
        .await?;
    Ok(Json(requests))
}

pub async fn mark_notification_seen(
    State(state): State<AppState>,
    Extension(claims): Extension<AccessClaims>,
    Params(id): Params<Uuid>,
) -> Result<StatusCode, ApiError> {
    FriendGraph::new(state.db.clone())
        .mark_seen(id, claims.sub)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn sent_requests(
    State(state): State<AppState>,
    Extension(claims): Extension<AccessClaims>,
) -> Result<Json<Vec<OutgoingRequest>>, ApiError> {
    let requests = FriendGraph::new(state.db.clone())
        .list_outgoing(claims.sub)
        .await?;
    Ok(Json(requests))
}

pub async fn friends_request_decision(
    State(state): State<AppState>,
    Extension(claims): Extension<AccessClaims>,
    Body(req): Body<FriendsRequestDecision>,
) -> Result<Json<ResolvedRequest>, ApiError> {
    let resolved = FriendGraph::new(state.db.clone())
        .decide(req.req_id, req.decision, claims.sub)
        .await?;
    Ok(Json(resolved))
}

pub async fn friendship(
    State(state): State<AppState>,
    Extension(claims): Extension<AccessClaims>,
    Params(id): Params<Uuid>,
) -> Result<Json<FriendshipStatusResponse>, ApiError> {
    let status = FriendGraph::new(state.db.clone())
        .friendship_status(claims.sub, id)
        .await?;
    Ok(Json(FriendshipStatusResponse { status }))
}

pub async fn friends(
    State(state): State<AppState>,
    Params(id): Params<Uuid>,
) -> Result<Json<Vec<UserSummary>>, ApiError> {
    let friends = FriendGraph::new(state.db.clone()).list_friends(id).await?;
    Ok(Json(friends))
}

#[cfg(test)]
mod tests {
    use super::*;
    use circle_db::users::NewUser;
    use circle_types::models::Role;

    fn add_user(db: &Database, username: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(&NewUser {
            id: &id.to_string(),
            email: &format!("{}@example.com", username),
            username,
            surname: "Tester",
            password_hash: "hash",
            role: Role::User,
            activation_code: None,
        })
        .unwrap();
        id
    }

    fn setup() -> (FriendGraph, Arc<Database>, Uuid, Uuid) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let alice = add_user(&db, "alice");
        let bob = add_user(&db, "bob");
        (FriendGraph::new(db.clone()), db, alice, bob)
    }

    #[tokio::test]
    async fn send_request_rejects_self_and_unknown_users() {
        let (graph, _db, alice, _bob) = setup();

        assert!(matches!(
            graph.send_request(alice, alice, String::new()).await,
            Err(FriendError::SelfRequest)
        ));
        assert!(matches!(
            graph.send_request(alice, Uuid::new_v4(), String::new()).await,
            Err(FriendError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn duplicate_request_conflicts() {
        let (graph, _db, alice, bob) = setup();
        graph.send_request(alice, bob, "hi".into()).await.unwrap();
        assert!(matches!(
            graph.send_request(alice, bob, "hi".into()).await,
            Err(FriendError::DuplicateRequest)
        ));
    }

    #[tokio::test]
    async fn incoming_and_outgoing_agree() {
        let (graph, _db, alice, bob) = setup();
        let id = graph.send_request(alice, bob, "hi".into()).await.unwrap();

        let outgoing = graph.list_outgoing(alice).await.unwrap();
        let incoming = graph.list_incoming(bob).await.unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(incoming.len(), 1);
        assert_eq!(outgoing[0].id, id);
        assert_eq!(incoming[0].id, id);
        assert_eq!(incoming[0].requester.username, "alice");
        assert_eq!(outgoing[0].target.username, "bob");
    }

    #[tokio::test]
    async fn listing_incoming_flags_requests_as_sent() {
        let (graph, db, alice, bob) = setup();
        let id = graph.send_request(alice, bob, "hi".into()).await.unwrap();

        graph.list_incoming(bob).await.unwrap();
        let row = db.get_friend_request(&id.to_string()).unwrap().unwrap();
        assert!(row.send_request);
        assert!(row.status);
    }

    #[tokio::test]
    async fn status_moves_from_not_friends_to_already_friends() {
        let (graph, db, alice, bob) = setup();
        assert_eq!(
            graph.friendship_status(alice, bob).await.unwrap(),
            FriendshipStatus::NotFriends
        );

        let id = graph.send_request(alice, bob, "hi".into()).await.unwrap();
        assert_eq!(
            graph.friendship_status(alice, bob).await.unwrap(),
            FriendshipStatus::RequestSent
        );
        assert_eq!(
            graph.friendship_status(bob, alice).await.unwrap(),
            FriendshipStatus::NotFriends
        );

        let resolved = graph.decide(id, Decision::Accept, bob).await.unwrap();
        assert!(!resolved.status);
        assert_eq!(resolved.decision, Decision::Accept);
        assert_eq!(resolved.chat.as_ref().map(|c| c.participants.len()), Some(2));

        assert_eq!(
            graph.friendship_status(alice, bob).await.unwrap(),
            FriendshipStatus::AlreadyFriends
        );
        assert!(graph.are_friends(bob, alice).await.unwrap());
        assert_eq!(
            db.count_chats_between(&alice.to_string(), &bob.to_string()).unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn second_decision_conflicts_without_side_effects() {
        let (graph, db, alice, bob) = setup();
        let id = graph.send_request(alice, bob, "hi".into()).await.unwrap();
        graph.decide(id, Decision::Accept, bob).await.unwrap();

        assert!(matches!(
            graph.decide(id, Decision::Accept, bob).await,
            Err(FriendError::RequestAlreadyResolved)
        ));
        assert_eq!(graph.list_friends(alice).await.unwrap().len(), 1);
        assert_eq!(
            db.count_chats_between(&alice.to_string(), &bob.to_string()).unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn only_target_decides_or_marks_seen() {
        let (graph, _db, alice, bob) = setup();
        let id = graph.send_request(alice, bob, "hi".into()).await.unwrap();

        assert!(matches!(
            graph.decide(id, Decision::Accept, alice).await,
            Err(FriendError::NotTarget)
        ));
        assert!(matches!(graph.mark_seen(id, alice).await, Err(FriendError::NotTarget)));
        assert!(matches!(
            graph.decide(Uuid::new_v4(), Decision::Reject, bob).await,
            Err(FriendError::RequestNotFound)
        ));

        graph.mark_seen(id, bob).await.unwrap();
        assert!(graph.list_incoming(bob).await.unwrap()[0].seen);
    }

    #[tokio::test]
    async fn concurrent_accepts_resolve_once() {
        let (graph, db, alice, bob) = setup();
        let id = graph.send_request(alice, bob, "hi".into()).await.unwrap();

        let (a, b) = tokio::join!(
            graph.decide(id, Decision::Accept, bob),
            graph.decide(id, Decision::Accept, bob)
        );
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert_eq!(
            db.count_chats_between(&alice.to_string(), &bob.to_string()).unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn unknown_user_has_no_friend_list() {
        let (graph, _db, _alice, _bob) = setup();
        assert!(matches!(
            graph.list_friends(Uuid::new_v4()).await,
            Err(FriendError::UserNotFound)
        ));
    }
}
