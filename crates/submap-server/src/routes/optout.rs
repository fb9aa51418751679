//! RapidPro optout trigger.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use crate::error::ServerError;
use crate::json::{OptoutRequest, OptoutResponse};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/rapidpro_optout", post(rapidpro_optout))
}

/// Revert the latest migration of the contact's identity.
async fn rapidpro_optout(
    State(state): State<AppState>,
    body: Result<Json<OptoutRequest>, JsonRejection>,
) -> Result<Json<OptoutResponse>, ServerError> {
    let Json(request) = body.map_err(|e| ServerError::BadRequest(e.body_text()))?;
    let summary = state.optout.revert(request.contact).await?;

    Ok(Json(OptoutResponse {
        cancelled_subscriptions: summary.cancelled_subscriptions,
        created_subscriptions: summary.created_subscriptions,
    }))
}
