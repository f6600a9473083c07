use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum_test::TestServer;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use circle_api::mailer::Mailer;
use circle_api::{AppState, AppStateInner, GatewaySettings, router};
use circle_auth::TokenService;
use circle_auth::password::hash_password;
use circle_db::Database;
use circle_db::users::NewUser;
use circle_types::models::Role;

pub const PASSWORD: &str = "hunter22";

/// Keeps every activation mail so tests can complete registration.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<(String, String)>>,
}

impl Mailer for RecordingMailer {
    fn send_activation(&self, email: &str, code: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((email.to_string(), code.to_string()));
        Ok(())
    }
}

impl RecordingMailer {
    pub fn last_code_for(&self, email: &str) -> Option<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(to, _)| to == email)
            .map(|(_, code)| code.clone())
    }
}

// Allow dead_code for utilities used by other test files
#[allow(dead_code)]
pub struct TestContext {
    pub server: TestServer,
    pub state: AppState,
    pub db: Arc<Database>,
    pub tokens: Arc<TokenService>,
    pub mailer: Arc<RecordingMailer>,
}

/// A registered, activated and logged-in user.
#[allow(dead_code)]
pub struct TestUser {
    pub id: Uuid,
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
}

#[allow(dead_code)]
impl TestContext {
    pub fn new() -> Self {
        Self::with_access_ttl(120)
    }

    pub fn with_access_ttl(secs: i64) -> Self {
        let db = Arc::new(Database::open_in_memory().expect("Failed to open test database"));
        let tokens = Arc::new(TokenService::with_ttls(
            "test-secret-key-for-testing-only",
            db.clone(),
            chrono::Duration::seconds(secs),
            chrono::Duration::seconds(1800),
        ));
        let mailer = Arc::new(RecordingMailer::default());
        let state = Arc::new(
            AppStateInner::new(tokens.clone(), mailer.clone()).with_gateway(GatewaySettings {
                poll_interval: Duration::from_millis(50),
                shutdown: CancellationToken::new(),
            }),
        );
        let server = TestServer::new(router(state.clone())).expect("Failed to create test server");

        Self {
            server,
            state,
            db,
            tokens,
            mailer,
        }
    }

    /// Serve the same app on a real socket, for WebSocket clients.
    pub async fn serve_tcp(&self) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().unwrap();
        let app = router(self.state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    pub async fn register(&self, username: &str) -> Value {
        let response = self
            .server
            .post("/user/register")
            .json(&json!({
                "email": test_email(username),
                "username": username,
                "surname": "Tester",
                "password": PASSWORD,
                "rPassword": PASSWORD,
            }))
            .await;
        assert_eq!(response.status_code(), 201, "register failed: {}", response.text());
        response.json()
    }

    pub async fn activate(&self, username: &str) {
        let code = self
            .mailer
            .last_code_for(&test_email(username))
            .expect("no activation mail");
        let response = self
            .server
            .post("/user/activate")
            .json(&json!({ "code": code }))
            .await;
        assert_eq!(response.status_code(), 201, "activate failed: {}", response.text());
    }

    pub async fn login(&self, email: &str, password: &str) -> axum_test::TestResponse {
        self.server
            .post("/auth/login")
            .json(&json!({ "email": email, "password": password }))
            .await
    }

    /// Register, activate and log in.
    pub async fn user(&self, username: &str) -> TestUser {
        let registered = self.register(username).await;
        self.activate(username).await;

        let email = test_email(username);
        let response = self.login(&email, PASSWORD).await;
        assert_eq!(response.status_code(), 200, "login failed: {}", response.text());
        let tokens: Value = response.json();

        TestUser {
            id: registered["id"].as_str().unwrap().parse().unwrap(),
            email,
            access_token: tokens["accessToken"].as_str().unwrap().to_string(),
            refresh_token: tokens["refreshToken"].as_str().unwrap().to_string(),
        }
    }

    /// Insert an activated administrator directly and log in.
    pub async fn admin(&self, username: &str) -> TestUser {
        let id = Uuid::new_v4();
        let email = test_email(username);
        let hash = hash_password(PASSWORD).unwrap();
        self.db
            .create_user(&NewUser {
                id: &id.to_string(),
                email: &email,
                username,
                surname: "Admin",
                password_hash: &hash,
                role: Role::Admin,
                activation_code: None,
            })
            .unwrap();

        let tokens: Value = self.login(&email, PASSWORD).await.json();
        TestUser {
            id,
            email,
            access_token: tokens["accessToken"].as_str().unwrap().to_string(),
            refresh_token: tokens["refreshToken"].as_str().unwrap().to_string(),
        }
    }

    pub async fn befriend(&self, a: &TestUser, b: &TestUser) -> Value {
        let sent: Value = self
            .server
            .post("/user/saveFriendsRequest")
            .authorization_bearer(&a.access_token)
            .json(&json!({ "targetUserId": b.id, "message": "hi" }))
            .await
            .json();

        let response = self
            .server
            .post("/user/friendsRequestDecision")
            .authorization_bearer(&b.access_token)
            .json(&json!({ "reqID": sent["id"], "decision": "ACCEPT" }))
            .await;
        assert_eq!(response.status_code(), 200, "decision failed: {}", response.text());
        response.json()
    }
}

// Helper to generate test email
pub fn test_email(username: &str) -> String {
    format!("{}@example.com", username)
}

/// First constraint key of an error payload.
#[allow(dead_code)]
pub fn constraint_key(body: &Value) -> String {
    body[0]["constraints"]
        .as_object()
        .and_then(|c| c.keys().next().cloned())
        .unwrap_or_default()
}
