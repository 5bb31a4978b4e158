use crate::app::AppState;
use axum::Router;

pub mod sip;
pub mod voice;

pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/voice", voice::router())
        .merge(sip::router())
}
