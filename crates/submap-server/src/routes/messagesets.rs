//! Messageset choices for run submission.

use axum::{extract::State, routing::get, Json, Router};

use crate::error::ServerError;
use crate::json::MessagesetChoice;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/messagesets", get(list_messagesets))
}

/// All messagesets as `(id, short_name)`, sorted by short name.
async fn list_messagesets(
    State(state): State<AppState>,
) -> Result<Json<Vec<MessagesetChoice>>, ServerError> {
    let mut choices: Vec<MessagesetChoice> = state
        .gateway
        .messagesets(None)
        .await
        .map_err(|e| ServerError::Upstream(e.to_string()))?
        .into_iter()
        .map(|ms| MessagesetChoice {
            id: ms.id,
            short_name: ms.short_name,
        })
        .collect();
    choices.sort_by(|a, b| a.short_name.cmp(&b.short_name).then(a.id.cmp(&b.id)));
    Ok(Json(choices))
}
