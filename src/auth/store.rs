use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use uuid::Uuid;

use crate::{
    broker::Directory,
    config::Seed,
    model::{Role, User},
    AppError, AppResult,
};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        role TEXT NOT NULL,
        profile_picture TEXT,
        created_at TEXT NOT NULL
    )"#,
    "CREATE UNIQUE INDEX IF NOT EXISTS users_single_admin ON users(role) WHERE role = 'admin'",
];

type UserRow = (String, String, String, String, Option<String>);

/// A registration request that passed validation.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: Role,
    pub profile_picture: Option<String>,
}

/// SQLite-backed Identity Store.
#[derive(Clone)]
pub struct Identities {
    db_pool: SqlitePool,
    hash_cost: u32,
}

impl Identities {
    pub async fn connect(database_url: &str) -> anyhow::Result<Identities> {
        // every connection to :memory: is its own database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 16 };
        let db_pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(database_url)
            .await
            .with_context(|| format!("opening {database_url}"))?;

        Identities::from_pool(db_pool, bcrypt::DEFAULT_COST).await
    }

    pub async fn from_pool(db_pool: SqlitePool, hash_cost: u32) -> anyhow::Result<Identities> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&db_pool)
                .await
                .context("creating identity schema")?;
        }
        Ok(Identities { db_pool, hash_cost })
    }

    pub async fn register(&self, new_user: NewUser) -> AppResult<User> {
        if self.email_taken(&new_user.email).await? {
            return Err(AppError::DuplicateEmail);
        }
        if new_user.role.is_admin() && self.admin_exists().await? {
            return Err(AppError::AdminExists);
        }

        let id = format!("user_{}", Uuid::now_v7().simple());
        match self.insert(&id, &new_user).await {
            Ok(user) => Ok(user),
            // lost a race with a concurrent registration
            Err(AppError::Internal(err)) if is_unique_violation(&err) => {
                if self.email_taken(&new_user.email).await? {
                    Err(AppError::DuplicateEmail)
                } else {
                    Err(AppError::AdminExists)
                }
            }
            Err(err) => Err(err),
        }
    }

    pub async fn authenticate(&self, email: &str, password: &str) -> AppResult<User> {
        let row: Option<(String, String, String, String, Option<String>, String)> = sqlx::query_as(
            "SELECT id,username,email,role,profile_picture,password_hash FROM users WHERE email=?",
        )
        .bind(email)
        .fetch_optional(&self.db_pool)
        .await?;

        let Some((id, username, email, role, profile_picture, password_hash)) = row else {
            return Err(AppError::InvalidCredentials);
        };

        let password = password.to_owned();
        let valid = tokio::task::spawn_blocking(move || bcrypt::verify(password, &password_hash))
            .await
            .context("password verification task")??;
        if !valid {
            return Err(AppError::InvalidCredentials);
        }

        Ok(into_user((id, username, email, role, profile_picture))?)
    }

    /// Creates the `admin1` account unless an admin already exists.
    pub async fn seed_admin(&self, seed: &Seed) -> anyhow::Result<()> {
        if self.admin_exists().await? {
            tracing::debug!("admin account present, not seeding");
            return Ok(());
        }
        self.seed("admin1", Role::Admin, seed).await
    }

    /// Creates the `user1` demo account unless it already exists.
    pub async fn seed_member(&self, seed: &Seed) -> anyhow::Result<()> {
        if self.find("user1").await?.is_some() {
            tracing::debug!("demo member present, not seeding");
            return Ok(());
        }
        self.seed("user1", Role::Member, seed).await
    }

    async fn seed(&self, id: &str, role: Role, seed: &Seed) -> anyhow::Result<()> {
        if self.email_taken(&seed.email).await? {
            tracing::warn!(%id, email = %seed.email, "seed email already registered, not seeding");
            return Ok(());
        }

        let new_user = NewUser {
            username: seed.username.clone(),
            email: seed.email.clone(),
            password: seed.password.clone(),
            role,
            profile_picture: None,
        };
        self.insert(id, &new_user)
            .await
            .map_err(|err| anyhow!("seeding {id}: {err}"))?;
        tracing::info!(%id, email = %seed.email, "account seeded");
        Ok(())
    }

    /// Non-administrative users, oldest first.
    pub async fn members(&self) -> anyhow::Result<Vec<User>> {
        let rows: Vec<UserRow> = sqlx::query_as(
            "SELECT id,username,email,role,profile_picture FROM users WHERE role != 'admin' ORDER BY created_at, rowid",
        )
        .fetch_all(&self.db_pool)
        .await?;
        rows.into_iter().map(into_user).collect()
    }

    async fn insert(&self, id: &str, new_user: &NewUser) -> AppResult<User> {
        let password = new_user.password.clone();
        let cost = self.hash_cost;
        let password_hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .context("password hashing task")??;

        sqlx::query(
            "INSERT INTO users (id,username,email,password_hash,role,profile_picture,created_at) VALUES (?,?,?,?,?,?,?)",
        )
        .bind(id)
        .bind(&new_user.username)
        .bind(&new_user.email)
        .bind(&password_hash)
        .bind(new_user.role.as_str())
        .bind(&new_user.profile_picture)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db_pool)
        .await?;

        tracing::info!(%id, email = %new_user.email, role = %new_user.role, "user registered");
        Ok(User {
            id: id.to_owned(),
            username: new_user.username.clone(),
            email: new_user.email.clone(),
            role: new_user.role,
            profile_picture: new_user.profile_picture.clone(),
        })
    }

    async fn email_taken(&self, email: &str) -> anyhow::Result<bool> {
        Ok(sqlx::query("SELECT 1 FROM users WHERE email=?")
            .bind(email)
            .fetch_optional(&self.db_pool)
            .await?
            .is_some())
    }

    async fn admin_exists(&self) -> anyhow::Result<bool> {
        Ok(sqlx::query("SELECT 1 FROM users WHERE role='admin'")
            .fetch_optional(&self.db_pool)
            .await?
            .is_some())
    }
}

#[async_trait]
impl Directory for Identities {
    async fn roster(&self) -> anyhow::Result<Vec<User>> {
        let rows: Vec<UserRow> = sqlx::query_as(
            "SELECT id,username,email,role,profile_picture FROM users ORDER BY created_at, rowid",
        )
        .fetch_all(&self.db_pool)
        .await?;
        rows.into_iter().map(into_user).collect()
    }

    async fn find(&self, id: &str) -> anyhow::Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as("SELECT id,username,email,role,profile_picture FROM users WHERE id=?")
            .bind(id)
            .fetch_optional(&self.db_pool)
            .await?;
        row.map(into_user).transpose()
    }

    async fn remove(&self, id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id=?")
            .bind(id)
            .execute(&self.db_pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn into_user((id, username, email, role, profile_picture): UserRow) -> anyhow::Result<User> {
    Ok(User {
        role: role.parse().map_err(|err: String| anyhow!("user {id}: {err}"))?,
        id,
        username,
        email,
        profile_picture,
    })
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<sqlx::Error>(),
        Some(sqlx::Error::Database(db_err)) if db_err.is_unique_violation()
    )
}
