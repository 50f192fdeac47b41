//! API request and response models.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::task::{Task, TaskStatus};

/// Envelope every endpoint answers with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// `200 {success: true}` with a payload.
pub fn ok<T: Serialize>(message: impl Into<String>, data: T) -> Response {
    (
        StatusCode::OK,
        Json(ApiResponse {
            success: true,
            message: message.into(),
            data: Some(data),
        }),
    )
        .into_response()
}

/// `200 {success: true}` without a payload.
pub fn ok_empty(message: impl Into<String>) -> Response {
    (
        StatusCode::OK,
        Json(ApiResponse::<()> {
            success: true,
            message: message.into(),
            data: None,
        }),
    )
        .into_response()
}

/// `{success: false}` with the given status code.
pub fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            message: message.into(),
            data: None,
        }),
    )
        .into_response()
}

/// Task state as presented over the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: String,
    pub url: String,
    pub output: String,
    pub c: u32,
    pub progress: u8,
    pub status: TaskStatus,
    pub message: String,
    /// Creation time, epoch seconds.
    pub created: i64,
    pub file_name: String,
    /// Current download speed in bytes per second.
    pub speed: f64,
}

impl TaskInfo {
    pub fn from_task(task: &Task) -> Self {
        let view = task.view();
        Self {
            id: task.id.clone(),
            url: task.url.clone(),
            output: task.output.clone(),
            c: task.options.workers,
            progress: view.progress,
            status: view.status,
            message: view.message,
            created: task.created,
            file_name: view.file_name,
            speed: view.speed,
        }
    }
}

/// Body of `POST /api/download`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub url: String,
    pub output: String,
    /// Segment worker count; falls back to the configured default.
    #[serde(default)]
    pub c: u32,
    #[serde(default)]
    pub custom_file_name: Option<String>,
    /// Falls back to the configured default when absent.
    #[serde(default)]
    pub delete_ts: Option<bool>,
    /// Falls back to the configured default when absent.
    #[serde(default)]
    pub convert_to_mp4: Option<bool>,
}

/// Body of `POST /api/folders/create`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateFolderRequest {
    pub path: String,
    pub name: String,
}

/// Query of `GET /api/folders`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FolderQuery {
    #[serde(default)]
    pub path: Option<String>,
}
