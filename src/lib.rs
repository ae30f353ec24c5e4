pub mod api;
pub mod appresult;
pub mod auth;
pub mod broker;
pub mod config;
pub mod gateway;
pub mod model;
pub mod protocol;
pub mod session;

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, FromRef},
    http::{header, HeaderValue, Method},
    Router,
};
use tokio::task::JoinHandle;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tower_sessions::{cookie::SameSite, Expiry, MemoryStore, SessionManagerLayer};

pub use appresult::{AppError, AppResult};

use auth::{Identities, Tokens};
use broker::Broker;
use config::Config;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub identities: Identities,
    pub tokens: Tokens,
    pub broker: Broker,
    pub config: Arc<Config>,
}

impl AppState {
    /// Opens the Identity Store, seeds the configured accounts and starts
    /// the broker task.
    pub async fn build(config: Config) -> anyhow::Result<(AppState, JoinHandle<()>)> {
        let identities = Identities::connect(&config.database_url).await?;
        if let Some(seed) = &config.admin {
            identities.seed_admin(seed).await?;
        }
        if let Some(seed) = &config.member {
            identities.seed_member(seed).await?;
        }
        Ok(AppState::with_identities(config, identities))
    }

    pub fn with_identities(config: Config, identities: Identities) -> (AppState, JoinHandle<()>) {
        let (broker, task) = Broker::spawn(Arc::new(identities.clone()));
        let state = AppState {
            identities,
            tokens: Tokens::new(&config.jwt_secret),
            broker,
            config: Arc::new(config),
        };
        (state, task)
    }
}

pub fn app(state: AppState) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(
            state.config.session_idle_minutes,
        )));

    let origin = match state.config.client_url.parse::<HeaderValue>() {
        Ok(origin) => AllowOrigin::exact(origin),
        Err(_) => {
            tracing::warn!(client_url = %state.config.client_url, "CLIENT_URL is not a valid origin, mirroring request origins");
            AllowOrigin::mirror_request()
        }
    };
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    let body_limit = state.config.max_frame_bytes;

    Router::new()
        .nest("/api", api::router().nest("/auth", auth::router()))
        .merge(gateway::router())
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(session_layer)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
