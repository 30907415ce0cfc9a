use axum::{
    Router,
    routing::get,
};

use crate::handler::{self, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(handler::healthcheck))
        .route(
            "/api/custom-css/:theme",
            get(handler::get_custom_css)
                .put(handler::save_custom_css)
                .delete(handler::delete_custom_css),
        )
        .fallback(handler::dispatch)
}
