use axum::{Json, Router, extract::State, routing::post};

use crate::{
    dto::payments::{CallbackAck, StkCallbackEnvelope},
    error::AppResult,
    services::payment_service,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/mpesa/callback", post(mpesa_callback))
}

// Invoked by the gateway, not by users; no bearer auth. The gateway retries
// on non-2xx, so the handler must stay idempotent.
#[utoipa::path(
    post,
    path = "/api/payments/mpesa/callback",
    request_body = StkCallbackEnvelope,
    responses(
        (status = 200, description = "Callback accepted", body = CallbackAck),
        (status = 400, description = "Malformed callback payload"),
        (status = 404, description = "No order matches the callback reference"),
    ),
    tag = "Payments"
)]
pub async fn mpesa_callback(
    State(state): State<AppState>,
    Json(payload): Json<StkCallbackEnvelope>,
) -> AppResult<Json<CallbackAck>> {
    let ack = payment_service::resolve_callback(&state, payload).await?;
    Ok(Json(ack))
}
