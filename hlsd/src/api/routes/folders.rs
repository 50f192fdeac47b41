//! Folder browse and create endpoints.

use std::path::PathBuf;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;

use crate::api::models::{self, CreateFolderRequest, FolderQuery};
use crate::api::server::AppState;
use crate::utils::folders;

pub async fn list_folders(
    State(state): State<AppState>,
    Query(query): Query<FolderQuery>,
) -> Response {
    let target = match query.path.filter(|p| !p.trim().is_empty()) {
        Some(path) => PathBuf::from(path),
        None => {
            // Default to the configured download directory, creating it on
            // first use.
            let default = state.settings.get().default_output_path;
            if let Err(error) = std::fs::create_dir_all(&default) {
                return models::fail(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("cannot create default download directory: {error}"),
                );
            }
            PathBuf::from(default)
        }
    };

    let listing = tokio::task::spawn_blocking(move || folders::folder_list(&target)).await;
    match listing {
        Ok(Ok(list)) => models::ok("folder list fetched", list),
        Ok(Err(error)) => models::fail(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to list folders: {error}"),
        ),
        Err(error) => models::fail(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to list folders: {error}"),
        ),
    }
}

pub async fn create_folder(
    State(_state): State<AppState>,
    Json(request): Json<CreateFolderRequest>,
) -> Response {
    let parent = PathBuf::from(&request.path);
    if let Err(error) = folders::validate_path(&parent) {
        return models::fail(
            StatusCode::BAD_REQUEST,
            format!("path validation failed: {error}"),
        );
    }

    match folders::create_folder(&parent, &request.name) {
        Ok(_) => models::ok_empty("folder created"),
        Err(error) => models::fail(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to create folder: {error}"),
        ),
    }
}
