use std::{net::SocketAddr, str::FromStr};

use anyhow::Context;
use rand::{distr::Alphanumeric, Rng};

/// An account created at startup when it is missing.
#[derive(Debug, Clone)]
pub struct Seed {
    pub email: String,
    pub password: String,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub jwt_secret: String,
    pub client_url: String,
    /// Frames buffered per connection before the broker starts dropping.
    pub outbound_queue: usize,
    pub max_frame_bytes: usize,
    pub session_idle_minutes: i64,
    pub admin: Option<Seed>,
    /// Demo member account, off unless `MEMBER_EMAIL` and `MEMBER_PASSWORD` are set.
    pub member: Option<Seed>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            database_url: "sqlite::memory:".to_owned(),
            jwt_secret: random_secret(),
            client_url: "http://localhost:3000".to_owned(),
            outbound_queue: 256,
            max_frame_bytes: 50 * 1024 * 1024,
            session_idle_minutes: 60,
            admin: None,
            member: None,
        }
    }
}

impl Config {
    /// Reads the process environment, honoring a `.env` file if one exists.
    pub fn from_env() -> anyhow::Result<Config> {
        let _ = dotenv::dotenv();
        let defaults = Config::default();

        let jwt_secret = match dotenv::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                tracing::warn!("JWT_SECRET not set, tokens will not survive a restart");
                defaults.jwt_secret
            }
        };


        Ok(Config {
            bind_addr: parsed("BIND_ADDR", defaults.bind_addr)?,
            database_url: dotenv::var("DATABASE_URL").unwrap_or(defaults.database_url),
            jwt_secret,
            client_url: dotenv::var("CLIENT_URL").unwrap_or(defaults.client_url),
            outbound_queue: parsed("OUTBOUND_QUEUE", defaults.outbound_queue)?,
            max_frame_bytes: parsed("MAX_FRAME_BYTES", defaults.max_frame_bytes)?,
            session_idle_minutes: parsed("SESSION_IDLE_MINUTES", defaults.session_idle_minutes)?,
            admin: seed("ADMIN", "Admin"),
            member: seed("MEMBER", "John Doe"),
        })
    }
}

fn parsed<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match dotenv::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("invalid {key}={raw:?}")),
        Err(_) => Ok(default),
    }
}

/// `{PREFIX}_EMAIL` and `{PREFIX}_PASSWORD` are both required; `{PREFIX}_NAME` is optional.
fn seed(prefix: &str, default_name: &str) -> Option<Seed> {
    let email = dotenv::var(format!("{prefix}_EMAIL")).ok()?;
    let password = dotenv::var(format!("{prefix}_PASSWORD")).ok()?;
    let username = dotenv::var(format!("{prefix}_NAME")).unwrap_or_else(|_| default_name.to_owned());
    Some(Seed { email, password, username })
}

fn random_secret() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}
