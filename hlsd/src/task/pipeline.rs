//! Per-task segment pipeline.
//!
//! The driver pulls indices from the task's work queue and fans them out to
//! at most C concurrent fetch workers. When the queue drains it applies the
//! completion threshold, gives the admission slot back at the
//! Downloading → Converting transition, and assembles the staged segments
//! into the final artifact.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hlsfetch::DownloadError;

use crate::error::Error;
use crate::manager::TaskManager;
use crate::merger;
use crate::task::queue::Dispatch;
use crate::task::{fetch, Task, TaskStatus};

/// Backoff while workers still hold indices that may come back for retry.
const IDLE_POLL: Duration = Duration::from_millis(20);

/// Hard cap on waiting for workers to drain; past it the driver proceeds.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Progress heartbeat cadence, in dispatched indices.
const HEARTBEAT_EVERY: usize = 50;

/// Dispatch count past which a low completion rate gets flagged.
const DEGRADED_MIN_DISPATCHED: usize = 100;

/// Run the pipeline for one admitted task. The task must be in the
/// Downloading state and hold an admission slot when this is spawned.
pub(crate) async fn run(task: Arc<Task>, manager: Arc<TaskManager>) {
    let token = task.begin_run();

    if let Err(err) = drive(&task, &manager, &token).await {
        if err.is_cancellation() || task.is_stopped() {
            task.mark_interrupted();
        } else {
            error!(task = %task.id, error = %err, "download pipeline failed");
            task.set_failure(err.to_string());
        }
    }

    // Whatever the outcome, the task must not keep its admission slot.
    manager.reclaim_slot(&task);
}

async fn drive(
    task: &Arc<Task>,
    manager: &Arc<TaskManager>,
    token: &CancellationToken,
) -> Result<(), Error> {
    let seg_len = task.playlist.segments.len();
    let workers = task.options.workers.max(1) as usize;
    info!(
        task = %task.id,
        segments = seg_len,
        workers,
        rate_limited = manager.limiter().is_enabled(),
        "starting segment pipeline"
    );

    let limit = Arc::new(Semaphore::new(workers));
    let mut join_set = JoinSet::new();
    let mut dispatched = 0usize;

    loop {
        if task.is_stopped() {
            break;
        }
        match task.next_segment() {
            Dispatch::Drained => break,
            Dispatch::Idle => {
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
            Dispatch::Index(index) => {
                let permit = tokio::select! {
                    _ = token.cancelled() => {
                        task.segment_abandon(index);
                        break;
                    }
                    permit = Arc::clone(&limit).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            task.segment_abandon(index);
                            break;
                        }
                    },
                };

                dispatched += 1;
                let worker_task = Arc::clone(task);
                let client = manager.http_client().clone();
                let limiter = Arc::clone(manager.limiter());
                let worker_token = token.clone();
                join_set.spawn(async move {
                    let _permit = permit;
                    match fetch::fetch_segment(
                        &worker_task,
                        index,
                        &client,
                        &limiter,
                        &worker_token,
                    )
                    .await
                    {
                        Ok(()) => worker_task.segment_complete(index),
                        Err(err) if err.is_cancelled() => worker_task.segment_abandon(index),
                        Err(err) => {
                            warn!(
                                task = %worker_task.id,
                                segment = index,
                                error = %err,
                                "segment fetch failed"
                            );
                            worker_task.segment_retry(index);
                        }
                    }
                });

                if dispatched % HEARTBEAT_EVERY == 0 {
                    let finished = task.finished_count();
                    info!(
                        task = %task.id,
                        dispatched,
                        finished,
                        total = seg_len,
                        "segment progress"
                    );
                    if dispatched > DEGRADED_MIN_DISPATCHED && finished * 10 < dispatched * 3 {
                        warn!(
                            task = %task.id,
                            dispatched,
                            finished,
                            "completion rate below 30%, continuing"
                        );
                    }
                }
            }
        }
    }

    debug!(task = %task.id, "waiting for segment workers to drain");
    let drain = async {
        while join_set.join_next().await.is_some() {}
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!(task = %task.id, "timed out draining segment workers, continuing");
        join_set.detach_all();
    }

    if task.is_stopped() {
        info!(task = %task.id, "pipeline stopped, skipping assembly");
        return Err(Error::Download(DownloadError::Cancelled));
    }

    let finished = task.finished_count();
    if finished * 2 < seg_len {
        return Err(Error::task(format!(
            "too few segments ({finished}/{seg_len})"
        )));
    }

    // Frees the admission slot so the queue can admit the next task while
    // this one assembles.
    if !manager.release_download_slot(&task.id) {
        // Deletion raced the transition; nothing left to assemble for.
        return Err(Error::Download(DownloadError::Cancelled));
    }

    assemble(task, manager, token).await
}

/// Assemble the staged segments into the final artifact and finish the task.
async fn assemble(
    task: &Arc<Task>,
    manager: &Arc<TaskManager>,
    token: &CancellationToken,
) -> Result<(), Error> {
    let seg_len = task.playlist.segments.len();

    let mut files = Vec::with_capacity(seg_len);
    let mut missing = Vec::new();
    for index in 0..seg_len {
        if exists(&fetch::segment_path(task, index)).await {
            files.push(format!("{index}.ts"));
        } else {
            missing.push(index);
        }
    }
    if !missing.is_empty() {
        warn!(task = %task.id, count = missing.len(), segments = ?missing, "segments missing from staging, skipping them");
    }
    if files.is_empty() {
        return Err(Error::task("no staged segments to merge"));
    }

    let (file_name, output_path) = manager.finalize_output_name(task);
    info!(task = %task.id, output = %output_path.display(), "assembling output");

    if task.options.convert_to_mp4 {
        merger::remux_to_mp4(&task.staging_dir, &files, &output_path, token).await?;
    } else {
        merger::concat_ts(&task.staging_dir, &files, &output_path, token).await?;
    }

    let total_size = tokio::fs::metadata(&output_path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    task.set_success(total_size);
    info!(task = %task.id, file = %file_name, bytes = total_size, "download complete");

    if task.options.delete_ts {
        if let Err(error) = tokio::fs::remove_dir_all(&task.staging_dir).await {
            warn!(task = %task.id, %error, "failed to remove staging directory");
        }
    }

    debug_assert_eq!(task.status(), TaskStatus::Success);
    Ok(())
}

async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}
