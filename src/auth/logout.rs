use axum::{debug_handler, Json};
use serde_json::{json, Value};
use tower_sessions::Session;

#[debug_handler]
pub(crate) async fn logout(session: Session) -> Json<Value> {
    session.clear().await;
    Json(json!({ "success": true }))
}
