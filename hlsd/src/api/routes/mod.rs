//! Route table.
//!
//! | Method | Path | Effect |
//! |--------|------|--------|
//! | POST | `/api/download` | Create and enqueue a task |
//! | GET | `/api/tasks` | List tasks, newest first |
//! | GET | `/api/tasks/{id}` | Fetch one task |
//! | POST | `/api/tasks/{id}/resume` | Resume a stopped task |
//! | POST | `/api/tasks/{id}/retry` | Stop, delete, and recreate a task |
//! | POST | `/api/tasks/clear-completed` | Drop all succeeded tasks |
//! | DELETE | `/api/tasks/{id}` | Stop, delete files, forget |
//! | GET/POST | `/api/settings` | Read / write settings |
//! | GET | `/api/folders?path=` | Enumerate subfolders |
//! | POST | `/api/folders/create` | Create a folder |

pub mod download;
pub mod folders;
pub mod settings;
pub mod tasks;

use axum::routing::{get, post};
use axum::Router;

use crate::api::server::AppState;

pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/download", post(download::create_download))
        .route("/tasks", get(tasks::list_tasks))
        .route("/tasks/clear-completed", post(tasks::clear_completed))
        .route(
            "/tasks/{id}",
            get(tasks::get_task).delete(tasks::delete_task),
        )
        .route("/tasks/{id}/resume", post(tasks::resume_task))
        .route("/tasks/{id}/retry", post(tasks::retry_task))
        .route(
            "/settings",
            get(settings::get_settings).post(settings::save_settings),
        )
        .route("/folders", get(folders::list_folders))
        .route("/folders/create", post(folders::create_folder));

    Router::new().nest("/api", api).with_state(state)
}
