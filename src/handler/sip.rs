//! Admin API for the SIP engine and the live call table.
use crate::app::AppState;
use crate::useragent::RegistrationConfig;
use crate::useragent::RegistrationError;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use tracing::info;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sip/status", get(sip_status))
        .route("/sip/dialogs", get(list_dialogs))
        .route("/sip/register", get(sip_status).post(register).delete(unregister))
        .route("/sip/routes", get(list_routes))
        .route("/sip/routes/{number}", put(set_route).delete(remove_route))
        .route("/calls", get(list_calls))
}

async fn sip_status(State(state): State<AppState>) -> Response {
    Json(state.useragent.status()).into_response()
}

async fn list_dialogs(State(state): State<AppState>) -> Response {
    Json(state.useragent.dialogs().await).into_response()
}

fn registration_error_status(e: &RegistrationError) -> StatusCode {
    match e {
        RegistrationError::MissingCredentials => StatusCode::BAD_REQUEST,
        RegistrationError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        RegistrationError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    }
}

async fn register(
    State(state): State<AppState>,
    Json(config): Json<RegistrationConfig>,
) -> Response {
    info!(server = config.server, username = config.username, "registration requested");
    match state.useragent.register(config).await {
        Ok(()) => Json(state.useragent.status()).into_response(),
        Err(e) => (
            registration_error_status(&e),
            Json(serde_json::json!({
                "error": e.to_string(),
                "status": state.useragent.status(),
            })),
        )
            .into_response(),
    }
}

async fn unregister(State(state): State<AppState>) -> Response {
    state.useragent.unregister().await;
    Json(state.useragent.status()).into_response()
}

async fn list_routes(State(state): State<AppState>) -> Response {
    Json(state.useragent.routes.list()).into_response()
}

#[derive(Debug, Deserialize)]
struct RouteBody {
    destination: String,
}

async fn set_route(
    State(state): State<AppState>,
    Path(number): Path<String>,
    Json(body): Json<RouteBody>,
) -> Response {
    let destination = body.destination.trim();
    if number.trim().is_empty() || destination.is_empty() {
        return (StatusCode::BAD_REQUEST, "number and destination are required").into_response();
    }
    state.useragent.routes.set(number.trim(), destination);
    info!(number, destination, "phone route set");
    Json(state.useragent.routes.list()).into_response()
}

async fn remove_route(State(state): State<AppState>, Path(number): Path<String>) -> Response {
    match state.useragent.routes.remove(&number) {
        Some(destination) => {
            info!(number, destination, "phone route removed");
            StatusCode::NO_CONTENT.into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn list_calls(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({
        "calls": state.orchestrator.calls.list(),
        "dialogs": state.useragent.dialogs().await,
    }))
    .into_response()
}
