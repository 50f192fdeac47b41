//! Download tasks and their per-task state.

pub mod pipeline;
pub mod queue;
pub mod speed;

mod fetch;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use hlsfetch::ResolvedPlaylist;

use self::queue::{Dispatch, SegmentQueue};
use self::speed::SpeedMeter;

/// Task lifecycle states. Success and Failed are terminal and sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Converting,
    Success,
    Failed,
    Stopped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Converting => "converting",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable per-task configuration fixed at submit time.
#[derive(Debug, Clone)]
pub struct TaskOptions {
    /// Concurrent segment workers for this task.
    pub workers: u32,
    /// Remove the staging directory after assembly.
    pub delete_ts: bool,
    /// Remux to MP4 instead of concatenating to TS.
    pub convert_to_mp4: bool,
}

/// Mutable runtime fields, guarded by one short-section lock.
#[derive(Debug)]
struct TaskState {
    status: TaskStatus,
    progress: u8,
    message: String,
    file_name: String,
    total_size: u64,
    work: SegmentQueue,
}

/// Snapshot of the mutable fields, for API views.
#[derive(Debug, Clone)]
pub struct TaskView {
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    pub file_name: String,
    pub total_size: u64,
    pub speed: f64,
}

/// One download task.
pub struct Task {
    pub id: String,
    pub url: String,
    /// Output directory exactly as the request named it (echoed by the API).
    pub output: String,
    pub output_dir: PathBuf,
    pub staging_dir: PathBuf,
    /// Creation time, epoch seconds.
    pub created: i64,
    pub playlist: ResolvedPlaylist,
    pub options: TaskOptions,

    pub(crate) speed: SpeedMeter,
    finished: AtomicUsize,
    stopped: AtomicBool,
    /// Whether this task currently owns an admission slot. Every release
    /// path goes through [`Task::yield_slot`], so a slot is returned at most
    /// once no matter how stop, delete, and failure paths interleave.
    holds_slot: AtomicBool,
    state: Mutex<TaskState>,
    run_token: Mutex<CancellationToken>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("status", &self.status())
            .finish()
    }
}

#[allow(clippy::too_many_arguments)]
impl Task {
    pub(crate) fn new(
        id: String,
        url: String,
        output: String,
        output_dir: PathBuf,
        staging_dir: PathBuf,
        file_name: String,
        playlist: ResolvedPlaylist,
        options: TaskOptions,
    ) -> Self {
        let segment_count = playlist.segments.len();
        Self {
            id,
            url,
            output,
            output_dir,
            staging_dir,
            created: chrono::Utc::now().timestamp(),
            playlist,
            options,
            speed: SpeedMeter::new(),
            finished: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            holds_slot: AtomicBool::new(false),
            state: Mutex::new(TaskState {
                status: TaskStatus::Pending,
                progress: 0,
                message: "waiting in download queue".to_string(),
                file_name,
                total_size: 0,
                work: SegmentQueue::new(segment_count),
            }),
            run_token: Mutex::new(CancellationToken::new()),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TaskState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> TaskStatus {
        self.lock_state().status
    }

    pub fn set_status(&self, status: TaskStatus, message: impl Into<String>) {
        let mut state = self.lock_state();
        state.status = status;
        state.message = message.into();
    }

    pub fn file_name(&self) -> String {
        self.lock_state().file_name.clone()
    }

    pub(crate) fn set_file_name(&self, file_name: String) {
        self.lock_state().file_name = file_name;
    }

    pub fn view(&self) -> TaskView {
        let state = self.lock_state();
        TaskView {
            status: state.status,
            progress: state.progress,
            message: state.message.clone(),
            file_name: state.file_name.clone(),
            total_size: state.total_size,
            speed: self.speed.current(),
        }
    }

    /// Number of segments finished in the current run.
    pub fn finished_count(&self) -> usize {
        self.finished.load(Ordering::Relaxed)
    }

    /// Whether the internal stop flag is set.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// The cancellation token of the current pipeline run.
    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.run_token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Prepare a fresh pipeline run: new stop token, cleared stop flag,
    /// full segment queue, zeroed counters.
    pub(crate) fn begin_run(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self
            .run_token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token.clone();
        self.stopped.store(false, Ordering::SeqCst);
        self.finished.store(0, Ordering::SeqCst);
        self.speed.reset();
        let mut state = self.lock_state();
        let segment_count = self.playlist.segments.len();
        state.work.reset(segment_count);
        state.progress = 0;
        state.total_size = 0;
        token
    }

    /// Request the pipeline to stop. Idempotent; a no-op on terminal tasks.
    /// The public status is left for the pipeline's own completion path.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        if state.status.is_terminal() {
            return;
        }
        state.work.mark_stopping();
        drop(state);

        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!(task = %self.id, "download interrupted by stop request");
        }
        self.stop_token().cancel();
    }

    /// Clear the stop flag; returns whether it was set. Used by resume to
    /// claim the task exactly once.
    pub(crate) fn take_stopped(&self) -> bool {
        self.stopped.swap(false, Ordering::SeqCst)
    }

    /// Record that this task now owns an admission slot.
    pub(crate) fn claim_slot(&self) {
        self.holds_slot.store(true, Ordering::SeqCst);
    }

    /// Give up slot ownership; returns whether a slot was actually held.
    pub(crate) fn yield_slot(&self) -> bool {
        self.holds_slot.swap(false, Ordering::SeqCst)
    }

    /// Stop the task and remove its on-disk artifacts: the staging
    /// directory and any final output under either extension.
    pub async fn delete_files(&self) -> std::io::Result<()> {
        self.stop();

        let mut first_err = None;

        // A worker that already passed its stop check may still drop a file
        // into the staging directory; one delayed second attempt covers that.
        for attempt in 0..2 {
            match tokio::fs::remove_dir_all(&self.staging_dir).await {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) if attempt == 0 => {
                    debug!(task = %self.id, error = %e, "staging removal raced a worker, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        let file_name = self.file_name();
        for candidate in output_candidates(&file_name) {
            let path = self.output_dir.join(candidate);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(task = %self.id, path = %path.display(), "removed output file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ---- pipeline-side state accessors ----

    pub(crate) fn next_segment(&self) -> Dispatch {
        self.lock_state().work.next()
    }

    pub(crate) fn segment_complete(&self, index: usize) {
        let finished = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.playlist.segments.len().max(1);
        let mut state = self.lock_state();
        state.work.complete(index);
        // Progress 100 is reserved for Success.
        state.progress = (((finished * 100) / total) as u8).min(99);
        state.message = format!("downloaded {}%", state.progress);
    }

    /// Re-queue a failed index; returns whether it will be retried.
    pub(crate) fn segment_retry(&self, index: usize) -> bool {
        self.lock_state().work.back(index)
    }

    /// Return a held index without completing it (stop raced the fetch).
    pub(crate) fn segment_abandon(&self, index: usize) {
        self.lock_state().work.complete(index);
    }

    pub(crate) fn set_failure(&self, message: impl Into<String>) {
        self.set_status(TaskStatus::Failed, message);
        self.speed.reset();
    }

    pub(crate) fn set_success(&self, total_size: u64) {
        let mut state = self.lock_state();
        state.status = TaskStatus::Success;
        state.progress = 100;
        state.total_size = total_size;
        state.message = format!("download complete: {}", state.file_name);
        drop(state);
        self.speed.reset();
    }

    /// Terminal path for an interrupted run.
    pub(crate) fn mark_interrupted(&self) {
        let mut state = self.lock_state();
        if !state.status.is_terminal() {
            state.status = TaskStatus::Stopped;
            state.message = "download interrupted".to_string();
        }
        drop(state);
        self.speed.reset();
    }
}

/// File names a finished task may have produced: the reserved name plus the
/// sibling `.ts`/`.mp4` variant.
fn output_candidates(file_name: &str) -> Vec<String> {
    let mut names = vec![file_name.to_string()];
    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name);
    for ext in ["ts", "mp4"] {
        let candidate = format!("{stem}.{ext}");
        if !names.contains(&candidate) {
            names.push(candidate);
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_playlist() -> ResolvedPlaylist {
        ResolvedPlaylist {
            url: "https://cdn.example.com/a/index.m3u8".to_string(),
            segments: vec![
                hlsfetch::playlist::SegmentDescriptor {
                    index: 0,
                    uri: "https://cdn.example.com/a/0.ts".to_string(),
                    key_slot: None,
                    media_sequence: 0,
                },
                hlsfetch::playlist::SegmentDescriptor {
                    index: 1,
                    uri: "https://cdn.example.com/a/1.ts".to_string(),
                    key_slot: None,
                    media_sequence: 1,
                },
            ],
            key_slots: Vec::new(),
        }
    }

    fn test_task() -> Task {
        Task::new(
            "t1".to_string(),
            "https://cdn.example.com/a/index.m3u8".to_string(),
            "/tmp/out".to_string(),
            PathBuf::from("/tmp/out"),
            PathBuf::from("/tmp/out/ts_t1"),
            "index.ts".to_string(),
            empty_playlist(),
            TaskOptions {
                workers: 4,
                delete_ts: false,
                convert_to_mp4: false,
            },
        )
    }

    #[test]
    fn new_task_is_pending() {
        let task = test_task();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert_eq!(task.view().progress, 0);
        assert!(!task.is_stopped());
    }

    #[test]
    fn stop_is_idempotent_and_sticky_on_terminal() {
        let task = test_task();
        task.stop();
        task.stop();
        assert!(task.is_stopped());

        let task = test_task();
        task.set_status(TaskStatus::Success, "done");
        task.stop();
        assert!(!task.is_stopped());
        assert_eq!(task.status(), TaskStatus::Success);
    }

    #[test]
    fn progress_caps_at_99_before_success() {
        let task = test_task();
        let _ = task.next_segment();
        let _ = task.next_segment();
        task.segment_complete(0);
        task.segment_complete(1);
        // All segments done, but assembly has not happened yet.
        assert_eq!(task.view().progress, 99);

        task.set_success(1024);
        let view = task.view();
        assert_eq!(view.progress, 100);
        assert_eq!(view.status, TaskStatus::Success);
        assert_eq!(view.total_size, 1024);
    }

    #[test]
    fn begin_run_resets_a_stopped_task() {
        let task = test_task();
        task.stop();
        assert!(task.stop_token().is_cancelled());

        let token = task.begin_run();
        assert!(!token.is_cancelled());
        assert!(!task.is_stopped());
        assert_eq!(task.finished_count(), 0);
        assert!(matches!(task.next_segment(), Dispatch::Index(0)));
    }

    #[test]
    fn output_candidates_cover_both_extensions() {
        let names = output_candidates("show.ts");
        assert!(names.contains(&"show.ts".to_string()));
        assert!(names.contains(&"show.mp4".to_string()));
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Downloading).unwrap(),
            "\"downloading\""
        );
        assert_eq!(TaskStatus::Converting.as_str(), "converting");
    }
}
