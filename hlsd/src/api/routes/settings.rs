//! Settings endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;

use crate::api::models;
use crate::api::server::AppState;
use crate::settings::Settings;

pub async fn get_settings(State(state): State<AppState>) -> Response {
    models::ok("settings fetched", state.settings.get())
}

/// Validate, clamp, apply live knobs, then persist.
pub async fn save_settings(
    State(state): State<AppState>,
    Json(incoming): Json<Settings>,
) -> Response {
    if incoming.default_output_path.trim().is_empty() {
        return models::fail(
            StatusCode::BAD_REQUEST,
            "default output path must not be empty",
        );
    }

    let settings = incoming.clamped();

    // The path must be usable before it is persisted as a default.
    if let Err(error) = std::fs::create_dir_all(&settings.default_output_path) {
        return models::fail(
            StatusCode::BAD_REQUEST,
            format!("cannot create download directory: {error}"),
        );
    }

    state
        .manager
        .set_max_concurrent(settings.max_concurrent_download);
    state.manager.set_rate_limit(settings.download_speed_limit);

    match state.settings.save(settings) {
        Ok(()) => models::ok_empty("settings saved"),
        Err(error) => models::fail(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to save settings: {error}"),
        ),
    }
}
