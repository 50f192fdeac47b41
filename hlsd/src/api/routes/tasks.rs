//! Task lifecycle endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use hlsfetch::playlist;

use crate::api::models::{self, TaskInfo};
use crate::api::server::AppState;
use crate::task::TaskOptions;

pub async fn list_tasks(State(state): State<AppState>) -> Response {
    let tasks: Vec<TaskInfo> = state
        .manager
        .list_all()
        .iter()
        .map(|task| TaskInfo::from_task(task))
        .collect();
    models::ok("task list fetched", tasks)
}

pub async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.get(&id) {
        Some(task) => models::ok("task fetched", TaskInfo::from_task(&task)),
        None => models::fail(StatusCode::NOT_FOUND, "task does not exist"),
    }
}

pub async fn resume_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.manager.get(&id).is_none() {
        return models::fail(StatusCode::NOT_FOUND, "task does not exist");
    }
    if state.manager.resume(&id) {
        models::ok_empty("task resumed")
    } else {
        models::fail(StatusCode::BAD_REQUEST, "task cannot be resumed")
    }
}

pub async fn clear_completed(State(state): State<AppState>) -> Response {
    let count = state.manager.clear_completed();
    models::ok(format!("cleared {count} completed tasks"), count)
}

pub async fn delete_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.stop_and_delete(&id).await {
        Ok(true) => models::ok_empty("task deleted"),
        Ok(false) => models::fail(StatusCode::NOT_FOUND, "task does not exist"),
        Err(error) => models::fail(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to delete task files: {error}"),
        ),
    }
}

/// Stop and delete the task, then recreate it with the same URL and options
/// and put it back in the queue.
pub async fn retry_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(previous) = state.manager.get(&id) else {
        return models::fail(StatusCode::NOT_FOUND, "task does not exist");
    };

    let url = previous.url.clone();
    let output = previous.output.clone();
    let options = TaskOptions {
        workers: previous.options.workers,
        delete_ts: previous.options.delete_ts,
        convert_to_mp4: previous.options.convert_to_mp4,
    };
    let file_name = previous.file_name();

    match state.manager.stop_and_delete(&id).await {
        Ok(true) => {}
        Ok(false) => return models::fail(StatusCode::BAD_REQUEST, "cannot stop current task"),
        Err(error) => {
            warn!(task = %id, %error, "file cleanup failed during retry, continuing");
        }
    }

    let resolved = match playlist::load(
        state.manager.http_client(),
        &url,
        &CancellationToken::new(),
    )
    .await
    {
        Ok(resolved) => resolved,
        Err(error) => {
            return models::fail(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to recreate task: {error}"),
            );
        }
    };

    let task = match state
        .manager
        .create_task(&url, &output, resolved, options)
        .await
    {
        Ok(task) => task,
        Err(error) => {
            return models::fail(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to recreate task: {error}"),
            );
        }
    };

    // The retried task keeps the old output name when it is still free.
    state.manager.rename_reservation(&task, &file_name);
    state.manager.enqueue(task.clone());

    models::ok("task restarted", TaskInfo::from_task(&task))
}
