mod messages;
mod users;

use axum::{debug_handler, routing::get, Json, Router};
use chrono::Utc;
use serde_json::{json, Value};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/users", get(users::members))
        .route("/messages", get(messages::history))
        .route("/messages/{a}/{b}", get(messages::conversation))
}

#[debug_handler]
async fn health() -> Json<Value> {
    Json(json!({ "status": "Server running", "timestamp": Utc::now() }))
}
