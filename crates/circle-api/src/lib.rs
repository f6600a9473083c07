//! REST surface: handlers, the friend graph, error mapping and the router.

pub mod auth;
pub mod chats;
pub mod error;
pub mod extract;
pub mod friends;
pub mod gateway;
pub mod mailer;
pub mod middleware;
pub mod users;

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use circle_auth::{SessionGate, TokenService};
use circle_db::Database;
use circle_gateway::DEFAULT_POLL_INTERVAL;
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::mailer::Mailer;
use crate::middleware::{require_admin, require_auth};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub tokens: Arc<TokenService>,
    pub gate: SessionGate,
    pub mailer: Arc<dyn Mailer>,
    pub gateway: GatewaySettings,
}

/// How `/gateway` connections poll, and the token that closes them all.
#[derive(Clone)]
pub struct GatewaySettings {
    pub poll_interval: Duration,
    pub shutdown: CancellationToken,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown: CancellationToken::new(),
        }
    }
}

impl AppStateInner {
    pub fn new(tokens: Arc<TokenService>, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            db: tokens.db().clone(),
            gate: SessionGate::new(tokens.clone()),
            tokens,
            mailer,
            gateway: GatewaySettings::default(),
        }
    }

    pub fn with_gateway(mut self, gateway: GatewaySettings) -> Self {
        self.gateway = gateway;
        self
    }
}

/// Run CPU-heavy work (password hashing) on the blocking pool.
pub(crate) async fn blocking<F, T>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(anyhow!("spawn_blocking join error: {}", e)))?
}

/// All REST routes plus the `/gateway` upgrade, which authorizes itself.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/login", post(auth::login))
        .route("/auth/token", post(auth::token))
        .route("/user/register", post(users::register))
        .route("/user/activate", post(users::activate))
        .route("/gateway", get(gateway::ws_upgrade))
        .route("/health", get(|| async { "ok" }));

    let protected_routes = Router::new()
        .route("/auth/change-password", post(auth::change_password))
        .route("/user/friends/{id}", get(friends::friends))
        .route("/user/search", post(users::search))
        .route("/user/friendship/{id}", get(friends::friendship))
        .route("/user/saveFriendsRequest", post(friends::save_friends_request))
        .route("/user/notifications", get(friends::notifications))
        .route("/user/notifications/{id}/seen", post(friends::mark_notification_seen))
        .route("/user/sentRequests", get(friends::sent_requests))
        .route("/user/friendsRequestDecision", post(friends::friends_request_decision))
        .route(
            "/user/{id}",
            get(users::get_one).patch(users::edit).delete(users::delete),
        )
        .route("/chat/{id}", get(chats::list_chats))
        .route("/chat/{id}/{page}", get(chats::list_chats_page))
        .route(
            "/chat/{id}/messages",
            get(chats::get_messages).post(chats::send_message),
        )
        .layer(axum_middleware::from_fn_with_state(state.clone(), require_auth));

    let admin_routes = Router::new()
        .route("/user", get(users::list_all))
        .layer(axum_middleware::from_fn(require_admin))
        .layer(axum_middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(admin_routes)
        .with_state(state)
}
