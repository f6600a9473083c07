#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Bad signature, expired, wrong token kind or unknown claims version.
    #[error("Invalid token")]
    InvalidToken,

    #[error("Token was already revoked")]
    AlreadyRevoked,

    #[error("User not found")]
    UserNotFound,

    /// Missing, malformed, invalid or revoked credentials at the gate.
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Password hashing failed: {0}")]
    Hashing(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}
