//! Live connections: one WebSocket per client, bridged onto the broker.

mod ws;

use axum::{routing::get, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws::socket))
}
