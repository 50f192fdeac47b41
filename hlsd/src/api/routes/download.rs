//! Task creation.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use hlsfetch::playlist;

use crate::api::models::{self, DownloadRequest, TaskInfo};
use crate::api::server::AppState;
use crate::settings::THREAD_COUNT_RANGE;
use crate::task::TaskOptions;
use crate::utils::name;

pub async fn create_download(
    State(state): State<AppState>,
    Json(request): Json<DownloadRequest>,
) -> Response {
    if request.url.trim().is_empty() {
        return models::fail(StatusCode::BAD_REQUEST, "url must not be empty");
    }
    if request.output.trim().is_empty() {
        return models::fail(StatusCode::BAD_REQUEST, "output must not be empty");
    }

    let settings = state.settings.get();
    let workers = if THREAD_COUNT_RANGE.contains(&request.c) {
        request.c
    } else {
        settings.default_thread_count
    };
    let options = TaskOptions {
        workers,
        delete_ts: request.delete_ts.unwrap_or(settings.default_delete_ts),
        convert_to_mp4: request
            .convert_to_mp4
            .unwrap_or(settings.default_convert_to_mp4),
    };

    let resolved =
        match playlist::load(state.manager.http_client(), &request.url, &CancellationToken::new())
            .await
        {
            Ok(resolved) => resolved,
            Err(error) => {
                warn!(url = %request.url, %error, "playlist resolution failed");
                return models::fail(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to create download task: {error}"),
                );
            }
        };

    let task = match state
        .manager
        .create_task(&request.url, &request.output, resolved, options)
        .await
    {
        Ok(task) => task,
        Err(error) => {
            return models::fail(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to create download task: {error}"),
            );
        }
    };

    if let Some(custom) = request
        .custom_file_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
    {
        let normalized = name::normalize_custom_name(custom, task.options.convert_to_mp4);
        state.manager.rename_reservation(&task, &normalized);
    }

    state.manager.enqueue(task.clone());

    models::ok("download task created", TaskInfo::from_task(&task))
}
