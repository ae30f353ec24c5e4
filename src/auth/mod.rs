mod login;
mod logout;
mod me;
mod register;
mod store;
mod token;

use axum::{routing::{get, post}, Router};
use serde::Serialize;

use crate::{model::User, AppState};

pub use store::{Identities, NewUser};
pub use token::{Claims, Tokens};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register::register))
        .route("/login", post(login::login))
        .route("/logout", post(logout::logout))
        .route("/me", get(me::me))
}

#[derive(Debug, Serialize)]
pub(crate) struct AuthResponse {
    success: bool,
    token: String,
    user: User,
}

impl AuthResponse {
    fn new(token: String, user: User) -> Self {
        Self { success: true, token, user }
    }
}

/// Trims the field and treats blank as absent.
fn required(field: Option<String>) -> Option<String> {
    field
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

/// Passwords are taken exactly as typed; only an empty one counts as absent.
fn password(field: Option<String>) -> Option<String> {
    field.filter(|value| !value.is_empty())
}
