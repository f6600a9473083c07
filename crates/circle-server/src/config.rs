use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use circle_auth::tokens::{DEFAULT_ACCESS_TTL_SECS, DEFAULT_REFRESH_TTL_SECS};

/// Secrets that ship in sample `.env` files and must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "secret",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
    pub access_ttl: chrono::Duration,
    pub refresh_ttl: chrono::Duration,
    pub poll_interval: Duration,
    pub revocation_sweep: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jwt_secret = lookup("CIRCLE_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("CIRCLE_JWT_SECRET is unset or still a placeholder");
        }

        let host = lookup("CIRCLE_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse_or(&lookup, "CIRCLE_PORT", 5000)?;
        let addr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        let access_secs: i64 = parse_or(&lookup, "CIRCLE_ACCESS_TTL_SECS", DEFAULT_ACCESS_TTL_SECS)?;
        let refresh_secs: i64 = parse_or(&lookup, "CIRCLE_REFRESH_TTL_SECS", DEFAULT_REFRESH_TTL_SECS)?;
        if access_secs <= 0 || refresh_secs <= 0 {
            bail!("token lifetimes must be positive");
        }

        let poll_secs: u64 = parse_or(&lookup, "CIRCLE_POLL_INTERVAL_SECS", 3)?;
        let sweep_secs: u64 = parse_or(&lookup, "CIRCLE_REVOCATION_SWEEP_SECS", 300)?;
        if poll_secs == 0 || sweep_secs == 0 {
            bail!("intervals must be at least one second");
        }

        Ok(Self {
            jwt_secret,
            db_path: PathBuf::from(lookup("CIRCLE_DB_PATH").unwrap_or_else(|| "circle.db".into())),
            addr,
            access_ttl: chrono::Duration::seconds(access_secs),
            refresh_ttl: chrono::Duration::seconds(refresh_secs),
            poll_interval: Duration::from_secs(poll_secs),
            revocation_sweep: Duration::from_secs(sweep_secs),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", key, raw, e)),
    }
}
