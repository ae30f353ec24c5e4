use axum::{
    debug_handler,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap},
    Json,
};
use tower_sessions::Session;

use crate::{broker::Directory, model::User, session::USER_ID, AppError, AppResult, AppState};

use super::{Identities, Tokens};

/// The caller's own record, found by bearer token or, failing that, by session.
#[debug_handler(state = AppState)]
pub(crate) async fn me(
    State(identities): State<Identities>,
    State(tokens): State<Tokens>,
    headers: HeaderMap,
    session: Session,
) -> AppResult<Json<User>> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let user_id = match bearer {
        Some(token) => tokens.verify(token)?.sub,
        None => session
            .get::<String>(USER_ID)
            .await?
            .ok_or(AppError::Unauthenticated)?,
    };

    identities
        .find(&user_id)
        .await?
        .map(Json)
        .ok_or(AppError::Unauthenticated)
}
