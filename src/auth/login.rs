use axum::{debug_handler, extract::State, Json};
use serde::Deserialize;
use tower_sessions::Session;

use crate::{session::USER_ID, AppError, AppResult, AppState};

use super::{required, AuthResponse, Identities, Tokens};

#[derive(Debug, Deserialize)]
pub(crate) struct LoginQuery {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn login(
    State(identities): State<Identities>,
    State(tokens): State<Tokens>,
    session: Session,

    Json(LoginQuery { email, password }): Json<LoginQuery>,
) -> AppResult<Json<AuthResponse>> {
    let (Some(email), Some(password)) = (required(email), super::password(password)) else {
        return Err(AppError::Validation("Email and password required".to_owned()));
    };

    let user = identities.authenticate(&email, &password).await?;
    session.insert(USER_ID, user.id.clone()).await?;
    let token = tokens.issue(&user)?;

    tracing::info!(user_id = %user.id, %email, "user logged in");
    Ok(Json(AuthResponse::new(token, user)))
}
