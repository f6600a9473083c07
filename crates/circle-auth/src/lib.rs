//! Token lifecycle, request authorization and credential helpers.

pub mod cleanup;
pub mod error;
pub mod gate;
pub mod password;
pub mod tokens;

pub use error::AuthError;
pub use gate::SessionGate;
pub use tokens::{TokenPair, TokenService};
