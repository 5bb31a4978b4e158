//! Provider-facing webhook endpoints.
use crate::app::AppState;
use crate::call::{CallError, ResponseDocument, ResponseFormat};
use axum::{
    extract::{Form, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tracing::{info, warn};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/inbound", get(inbound_call).post(inbound_call))
        .route("/gather/{call_id}/{turn}", get(gather).post(gather))
        .route("/audio/{call_id}/{turn}", get(audio))
        .route("/status", get(status_callback).post(status_callback))
}

/// Webhook fields under the names different gateways use for them.
#[derive(Debug, Default, Deserialize)]
pub struct VoiceParams {
    #[serde(alias = "CallSid", alias = "callId", alias = "callSid", alias = "call_sid")]
    pub call_id: Option<String>,
    #[serde(alias = "From", alias = "caller")]
    pub from: Option<String>,
    #[serde(alias = "To", alias = "called")]
    pub to: Option<String>,
    #[serde(alias = "SpeechResult", alias = "speechResult", alias = "speech_result")]
    pub speech: Option<String>,
    #[serde(alias = "CallStatus", alias = "callStatus", alias = "call_status")]
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FormatQuery {
    pub format: Option<String>,
}

fn response_format(query: &FormatQuery, headers: &HeaderMap) -> ResponseFormat {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok());
    ResponseFormat::negotiate(query.format.as_deref(), accept)
}

fn render(doc: ResponseDocument, format: ResponseFormat) -> Response {
    (
        [(header::CONTENT_TYPE, format.content_type())],
        doc.render(format),
    )
        .into_response()
}

fn call_error(e: CallError) -> Response {
    let status = match e {
        CallError::MissingParameter(_) => StatusCode::BAD_REQUEST,
        CallError::UnknownCall(_) | CallError::UnknownTurn { .. } => StatusCode::NOT_FOUND,
    };
    (status, e.to_string()).into_response()
}

async fn inbound_call(
    State(state): State<AppState>,
    Query(query): Query<FormatQuery>,
    headers: HeaderMap,
    Form(params): Form<VoiceParams>,
) -> Response {
    let format = response_format(&query, &headers);
    let call_id = params.call_id.unwrap_or_default();
    let caller = params.from.unwrap_or_default();
    let called = params.to.unwrap_or_default();
    info!(call_id, caller, called, "inbound webhook call");
    match state
        .orchestrator
        .start_call(&call_id, &caller, &called, format)
        .await
    {
        Ok(doc) => render(doc, format),
        Err(e) => {
            warn!(call_id, "inbound webhook rejected: {}", e);
            call_error(e)
        }
    }
}

async fn gather(
    State(state): State<AppState>,
    Path((call_id, turn)): Path<(String, u32)>,
    Query(query): Query<FormatQuery>,
    headers: HeaderMap,
    Form(params): Form<VoiceParams>,
) -> Response {
    let format = response_format(&query, &headers);
    let speech = params.speech.unwrap_or_default();
    match state
        .orchestrator
        .handle_gather(&call_id, turn, &speech, format)
        .await
    {
        Ok(doc) => render(doc, format),
        Err(e) => call_error(e),
    }
}

async fn audio(
    State(state): State<AppState>,
    Path((call_id, turn)): Path<(String, u32)>,
) -> Response {
    match state.orchestrator.audio(&call_id, turn) {
        Ok(audio) => (
            [(
                header::CONTENT_TYPE,
                state.orchestrator.config.audio_format.content_type(),
            )],
            audio,
        )
            .into_response(),
        Err(e) => call_error(e),
    }
}

async fn status_callback(
    State(state): State<AppState>,
    Form(params): Form<VoiceParams>,
) -> Response {
    let (Some(call_id), Some(status)) = (params.call_id, params.status) else {
        return (StatusCode::BAD_REQUEST, "call id and status are required").into_response();
    };
    let ended = state.orchestrator.handle_status(&call_id, &status);
    Json(serde_json::json!({
        "call_id": call_id,
        "status": status,
        "ended": ended.is_some(),
    }))
    .into_response()
}
