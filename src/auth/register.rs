use axum::{debug_handler, extract::State, http::StatusCode, Json};
use serde::Deserialize;
use tower_sessions::Session;

use crate::{model::Role, session::USER_ID, AppError, AppResult, AppState};

use super::{required, AuthResponse, Identities, NewUser, Tokens};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegisterQuery {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    profile_picture: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn register(
    State(identities): State<Identities>,
    State(tokens): State<Tokens>,
    session: Session,

    Json(RegisterQuery { username, email, password, role, profile_picture }): Json<RegisterQuery>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    let (Some(username), Some(email), Some(password)) =
        (required(username), required(email), super::password(password))
    else {
        return Err(AppError::Validation("All fields required".to_owned()));
    };

    let user = identities
        .register(NewUser {
            username,
            email,
            password,
            role: role.unwrap_or_default(),
            profile_picture,
        })
        .await?;

    session.insert(USER_ID, user.id.clone()).await?;
    let token = tokens.issue(&user)?;

    Ok((StatusCode::CREATED, Json(AuthResponse::new(token, user))))
}
