use axum::{debug_handler, extract::State, Json};

use crate::{auth::Identities, broker::Broker, model::RosterEntry, AppResult, AppState};

/// Members with their current presence. The admin is not part of the roster.
#[debug_handler(state = AppState)]
pub(crate) async fn members(
    State(identities): State<Identities>,
    State(broker): State<Broker>,
) -> AppResult<Json<Vec<RosterEntry>>> {
    let online = broker.online().await?;
    let roster = identities
        .members()
        .await?
        .into_iter()
        .map(|user| RosterEntry {
            online: online.contains(&user.id),
            user,
        })
        .collect();

    Ok(Json(roster))
}
