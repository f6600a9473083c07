use std::sync::Arc;

use anyhow::anyhow;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use uuid::Uuid;

use circle_db::Database;
use circle_db::models::UserRow;
use circle_types::api::{AccessClaims, CLAIMS_VERSION, RefreshClaims, TokenKind};

use crate::error::AuthError;

pub const DEFAULT_ACCESS_TTL_SECS: i64 = 2 * 60;
pub const DEFAULT_REFRESH_TTL_SECS: i64 = 30 * 60;

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Issues and validates access/refresh tokens and keeps the access-token
/// deny-list.
///
/// Both token kinds are HS256 JWTs signed with the same secret; the `typ`
/// claim keeps them apart. Deny-list rows are keyed by `(jti, user)` and
/// carry a retention deadline so [`prune_revocations`](Self::prune_revocations)
/// can drop them once the token could no longer be presented anyway.
pub struct TokenService {
    db: Arc<Database>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(secret: &str, db: Arc<Database>) -> Self {
        Self::with_ttls(
            secret,
            db,
            Duration::seconds(DEFAULT_ACCESS_TTL_SECS),
            Duration::seconds(DEFAULT_REFRESH_TTL_SECS),
        )
    }

    pub fn with_ttls(secret: &str, db: Arc<Database>, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            db,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn issue_access_token(&self, user: &UserRow) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = AccessClaims {
            ver: CLAIMS_VERSION,
            typ: TokenKind::Access,
            sub: parse_user_id(&user.id)?,
            username: user.username.clone(),
            surname: user.surname.clone(),
            email: user.email.clone(),
            role: user.role(),
            jti: Uuid::new_v4(),
            iat: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
        };
        self.sign(&claims)
    }

    pub fn issue_refresh_token(&self, user_id: Uuid) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = RefreshClaims {
            ver: CLAIMS_VERSION,
            typ: TokenKind::Refresh,
            sub: user_id,
            jti: Uuid::new_v4(),
            iat: now.timestamp(),
            exp: (now + self.refresh_ttl).timestamp(),
        };
        self.sign(&claims)
    }

    /// Signature, expiry, claims version and kind. Does not consult the
    /// deny-list; see [`SessionGate`](crate::SessionGate) for that.
    pub fn validate_access(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let claims: AccessClaims = self.decode(token, true)?;
        check_schema(claims.ver, claims.typ, TokenKind::Access)?;
        Ok(claims)
    }

    pub fn validate_refresh(&self, token: &str) -> Result<RefreshClaims, AuthError> {
        let claims: RefreshClaims = self.decode(token, true)?;
        check_schema(claims.ver, claims.typ, TokenKind::Refresh)?;
        Ok(claims)
    }

    /// Record `access_token` as revoked for `user_id`, retained until the
    /// token's own expiry.
    pub async fn revoke(&self, access_token: &str, user_id: Uuid) -> Result<(), AuthError> {
        let claims = self.decode_access_any_expiry(access_token)?;
        self.revoke_jti(claims.jti, user_id, claims.exp).await
    }

    pub async fn is_revoked(&self, access_token: &str, user_id: Uuid) -> Result<bool, AuthError> {
        let claims = self.decode_access_any_expiry(access_token)?;
        self.is_jti_revoked(claims.jti, user_id).await
    }

    pub async fn is_jti_revoked(&self, jti: Uuid, user_id: Uuid) -> Result<bool, AuthError> {
        let revoked = self
            .db
            .call(move |db| db.is_revoked(&jti.to_string(), &user_id.to_string()))
            .await?;
        Ok(revoked)
    }

    /// Rotate an access token.
    ///
    /// Validates the refresh token, re-reads the user so the new claims pick
    /// up profile or role changes, revokes the presented access token and
    /// only then issues its replacement. The refresh token is returned as is.
    /// The deny-list row is kept until the later of the two expiries, so the
    /// same pair cannot be replayed while the refresh token is alive.
    pub async fn refresh(&self, refresh_token: &str, access_token: &str) -> Result<TokenPair, AuthError> {
        let refresh = self.validate_refresh(refresh_token)?;

        let user_id = refresh.sub;
        let user = self
            .db
            .call(move |db| db.get_user_by_id(&user_id.to_string()))
            .await?
            .ok_or(AuthError::UserNotFound)?;

        let presented = self.decode_access_any_expiry(access_token)?;
        if presented.sub != user_id {
            debug!("Refresh for {} presented an access token of {}", user_id, presented.sub);
            return Err(AuthError::InvalidToken);
        }

        self.revoke_jti(presented.jti, user_id, presented.exp.max(refresh.exp))
            .await?;

        let access_token = self.issue_access_token(&user)?;
        info!("Rotated access token for {}", user_id);

        Ok(TokenPair {
            access_token,
            refresh_token: refresh_token.to_string(),
        })
    }

    /// Drop deny-list rows whose retention has passed.
    pub async fn prune_revocations(&self) -> Result<usize, AuthError> {
        let now = Utc::now().timestamp();
        Ok(self.db.call(move |db| db.prune_revocations(now)).await?)
    }

    async fn revoke_jti(&self, jti: Uuid, user_id: Uuid, retain_until: i64) -> Result<(), AuthError> {
        let inserted = self
            .db
            .call(move |db| db.insert_revocation(&jti.to_string(), &user_id.to_string(), retain_until))
            .await?;
        if inserted {
            debug!("Revoked access token {} for {}", jti, user_id);
            Ok(())
        } else {
            Err(AuthError::AlreadyRevoked)
        }
    }

    /// Signature and schema only; expired access tokens are exactly what
    /// gets presented for rotation.
    fn decode_access_any_expiry(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let claims: AccessClaims = self.decode(token, false)?;
        check_schema(claims.ver, claims.typ, TokenKind::Access)?;
        Ok(claims)
    }

    fn sign<T: serde::Serialize>(&self, claims: &T) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| AuthError::Storage(anyhow!("Token encoding failed: {}", e)))
    }

    fn decode<T: DeserializeOwned>(&self, token: &str, validate_exp: bool) -> Result<T, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = validate_exp;

        decode::<T>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("Token rejected: {}", e);
                AuthError::InvalidToken
            })
    }
}

fn check_schema(ver: u8, typ: TokenKind, expected: TokenKind) -> Result<(), AuthError> {
    if ver != CLAIMS_VERSION || typ != expected {
        debug!("Token rejected: ver={} typ={:?}, expected {:?}", ver, typ, expected);
        return Err(AuthError::InvalidToken);
    }
    Ok(())
}

fn parse_user_id(raw: &str) -> Result<Uuid, AuthError> {
    raw.parse()
        .map_err(|e| AuthError::Storage(anyhow!("Corrupt user id '{}': {}", raw, e)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use circle_db::users::NewUser;
    use circle_types::models::Role;

    pub(crate) const SECRET: &str = "test-secret";

    pub(crate) fn setup() -> (Arc<Database>, UserRow) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let user = add_user(&db, "alice");
        (db, user)
    }

    pub(crate) fn add_user(db: &Database, username: &str) -> UserRow {
        let id = Uuid::new_v4().to_string();
        db.create_user(&NewUser {
            id: &id,
            email: &format!("{}@x.com", username),
            username,
            surname: "Tester",
            password_hash: "hash",
            role: Role::User,
            activation_code: None,
        })
        .unwrap();
        db.get_user_by_id(&id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn access_token_claims_match_user() {
        let (db, user) = setup();
        let tokens = TokenService::new(SECRET, db);

        let token = tokens.issue_access_token(&user).unwrap();
        let claims = tokens.validate_access(&token).unwrap();
        assert_eq!(claims.sub.to_string(), user.id);
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.email, "alice@x.com");
        assert_eq!(claims.role, Role::User);
        assert_eq!(claims.ver, CLAIMS_VERSION);
        assert_eq!(claims.exp - claims.iat, 120);
    }

    #[tokio::test]
    async fn expired_token_fails_validation() {
        let (db, user) = setup();
        let tokens = TokenService::with_ttls(SECRET, db, Duration::seconds(-5), Duration::seconds(-5));

        let access = tokens.issue_access_token(&user).unwrap();
        assert!(matches!(tokens.validate_access(&access), Err(AuthError::InvalidToken)));

        let refresh = tokens.issue_refresh_token(user.id.parse().unwrap()).unwrap();
        assert!(matches!(tokens.validate_refresh(&refresh), Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn token_kinds_are_not_interchangeable() {
        let (db, user) = setup();
        let tokens = TokenService::new(SECRET, db);

        let access = tokens.issue_access_token(&user).unwrap();
        let refresh = tokens.issue_refresh_token(user.id.parse().unwrap()).unwrap();
        assert!(tokens.validate_refresh(&access).is_err());
        assert!(tokens.validate_access(&refresh).is_err());
    }

    #[tokio::test]
    async fn foreign_signature_is_rejected() {
        let (db, user) = setup();
        let ours = TokenService::new(SECRET, db.clone());
        let theirs = TokenService::new("other-secret", db);

        let token = theirs.issue_access_token(&user).unwrap();
        assert!(matches!(ours.validate_access(&token), Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn revocation_is_per_user() {
        let (db, alice) = setup();
        let bob = add_user(&db, "bob");
        let tokens = TokenService::new(SECRET, db);
        let alice_id: Uuid = alice.id.parse().unwrap();
        let bob_id: Uuid = bob.id.parse().unwrap();

        let token = tokens.issue_access_token(&alice).unwrap();
        assert!(!tokens.is_revoked(&token, alice_id).await.unwrap());

        tokens.revoke(&token, alice_id).await.unwrap();
        assert!(tokens.is_revoked(&token, alice_id).await.unwrap());
        assert!(!tokens.is_revoked(&token, bob_id).await.unwrap());

        assert!(matches!(tokens.revoke(&token, alice_id).await, Err(AuthError::AlreadyRevoked)));
    }

    #[tokio::test]
    async fn refresh_revokes_old_token_and_keeps_refresh_token() {
        let (db, user) = setup();
        let tokens = TokenService::new(SECRET, db);
        let user_id: Uuid = user.id.parse().unwrap();

        let access = tokens.issue_access_token(&user).unwrap();
        let refresh = tokens.issue_refresh_token(user_id).unwrap();

        let pair = tokens.refresh(&refresh, &access).await.unwrap();
        assert_eq!(pair.refresh_token, refresh);
        assert_ne!(pair.access_token, access);
        assert!(tokens.is_revoked(&access, user_id).await.unwrap());
        assert!(!tokens.is_revoked(&pair.access_token, user_id).await.unwrap());

        // Replaying the same pair is refused.
        assert!(matches!(
            tokens.refresh(&refresh, &access).await,
            Err(AuthError::AlreadyRevoked)
        ));
    }

    #[tokio::test]
    async fn refresh_accepts_expired_access_token() {
        let (db, user) = setup();
        let user_id: Uuid = user.id.parse().unwrap();
        let short = TokenService::with_ttls(SECRET, db.clone(), Duration::seconds(-5), Duration::seconds(DEFAULT_REFRESH_TTL_SECS));
        let tokens = TokenService::new(SECRET, db);

        let stale = short.issue_access_token(&user).unwrap();
        let refresh = tokens.issue_refresh_token(user_id).unwrap();

        let pair = tokens.refresh(&refresh, &stale).await.unwrap();
        assert!(tokens.validate_access(&pair.access_token).is_ok());
    }

    #[tokio::test]
    async fn refresh_picks_up_profile_changes() {
        let (db, user) = setup();
        let tokens = TokenService::new(SECRET, db.clone());
        let user_id: Uuid = user.id.parse().unwrap();

        let access = tokens.issue_access_token(&user).unwrap();
        let refresh = tokens.issue_refresh_token(user_id).unwrap();

        db.update_profile(
            &user.id,
            &circle_db::users::ProfileChanges {
                username: "alicia",
                surname: "Tester",
                email: "alice@x.com",
                public_profile: None,
                avatar: None,
                activation_code: None,
            },
        )
        .unwrap();

        let pair = tokens.refresh(&refresh, &access).await.unwrap();
        let claims = tokens.validate_access(&pair.access_token).unwrap();
        assert_eq!(claims.username, "alicia");
    }

    #[tokio::test]
    async fn refresh_rejects_mismatched_owner() {
        let (db, alice) = setup();
        let bob = add_user(&db, "bob");
        let tokens = TokenService::new(SECRET, db);

        let bob_access = tokens.issue_access_token(&bob).unwrap();
        let alice_refresh = tokens.issue_refresh_token(alice.id.parse().unwrap()).unwrap();

        assert!(matches!(
            tokens.refresh(&alice_refresh, &bob_access).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn refresh_for_deleted_user_fails() {
        let (db, user) = setup();
        let tokens = TokenService::new(SECRET, db.clone());
        let user_id: Uuid = user.id.parse().unwrap();

        let access = tokens.issue_access_token(&user).unwrap();
        let refresh = tokens.issue_refresh_token(user_id).unwrap();
        db.delete_user(&user.id).unwrap();

        assert!(matches!(
            tokens.refresh(&refresh, &access).await,
            Err(AuthError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn prune_keeps_live_revocations() {
        let (db, user) = setup();
        let tokens = TokenService::new(SECRET, db.clone());
        let user_id: Uuid = user.id.parse().unwrap();

        let token = tokens.issue_access_token(&user).unwrap();
        tokens.revoke(&token, user_id).await.unwrap();
        db.insert_revocation("stale-jti", &user.id, 1).unwrap();

        assert_eq!(tokens.prune_revocations().await.unwrap(), 1);
        assert!(tokens.is_revoked(&token, user_id).await.unwrap());
    }
}
