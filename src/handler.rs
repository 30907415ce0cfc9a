use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use tracing::info;

use crate::api::{APIResponse, SaveCustomCss};
use crate::db::Database;
use crate::error::HandlerError;
use crate::request::SiteRequest;
use crate::site::Site;
use crate::{bad_request, good_response, server_error};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub site: Arc<Site>,
}

pub async fn healthcheck() -> impl IntoResponse {
    info!("got healthcheck request");
    Json(APIResponse::new(Some("ok"), None))
}

/// Hands every request without a dedicated route to the site.
pub async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    let (parts, _body) = req.into_parts();
    let request = SiteRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
    };
    let path = request.uri.path().to_string();

    match state.site.handle(request).await {
        Ok(response) => response.into_response(),
        Err(e) => {
            let e = HandlerError::from(e);
            tracing::error!(error = %e, path = %path, "failed to handle request");
            server_error(APIResponse::new_from_msg("failed to handle request"))
        }
    }
}

fn validate_theme(theme: &str) -> Result<(), HandlerError> {
    let valid = !theme.is_empty()
        && theme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(HandlerError::Validation(format!("invalid theme slug: {}", theme)))
    }
}

pub async fn get_custom_css(State(state): State<AppState>, Path(theme): Path<String>) -> Response {
    if let Err(e) = validate_theme(&theme) {
        return bad_request(APIResponse::new_from_msg(&e.to_string()));
    }

    match state.db.find_custom_css_post(&theme).await {
        Ok(Some(post)) => good_response(APIResponse::new(Some("got custom css"), Some(post))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(APIResponse::new_from_msg("custom css not found")),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to get custom css. db_error: {}", e);
            server_error(APIResponse::new_from_msg("failed to get custom css"))
        }
    }
}

pub async fn save_custom_css(
    State(state): State<AppState>,
    Path(theme): Path<String>,
    Json(payload): Json<SaveCustomCss>,
) -> Response {
    if let Err(e) = validate_theme(&theme) {
        return bad_request(APIResponse::new_from_msg(&e.to_string()));
    }

    match state.db.upsert_custom_css(&theme, &payload.css).await {
        Ok(post) => {
            tracing::info!(theme = %theme, post_id = post.id, "saved custom css");
            good_response(APIResponse::new(Some("saved custom css"), Some(post)))
        }
        Err(e) => {
            tracing::error!("failed to save custom css. db_error: {}", e);
            server_error(APIResponse::new_from_msg("failed to save custom css"))
        }
    }
}

pub async fn delete_custom_css(State(state): State<AppState>, Path(theme): Path<String>) -> Response {
    if let Err(e) = validate_theme(&theme) {
        return bad_request(APIResponse::new_from_msg(&e.to_string()));
    }

    match state.db.delete_custom_css(&theme).await {
        Ok(true) => good_response(APIResponse::new_from_msg("deleted custom css")),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(APIResponse::new_from_msg("custom css not found")),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to delete custom css. db_error: {}", e);
            server_error(APIResponse::new_from_msg("failed to delete custom css"))
        }
    }
}
