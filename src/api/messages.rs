use axum::{debug_handler, extract::{Path, State}, Json};

use crate::{broker::Broker, model::{Message, UserId}, AppResult};

#[debug_handler(state = crate::AppState)]
pub(crate) async fn history(State(broker): State<Broker>) -> AppResult<Json<Vec<Message>>> {
    Ok(Json(broker.history().await?))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn conversation(
    State(broker): State<Broker>,
    Path((a, b)): Path<(UserId, UserId)>,
) -> AppResult<Json<Vec<Message>>> {
    Ok(Json(broker.conversation(a, b).await?))
}
