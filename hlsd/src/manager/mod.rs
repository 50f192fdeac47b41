//! Process-wide task manager and admission scheduler.
//!
//! One instance owns the task registry, the filename reservation set, the
//! admission slot pool, the FIFO pending queue, and the global rate-limiter
//! handle. Tasks move Pending → Downloading only by taking a slot, either
//! straight at enqueue time or later through the queue processor, and give
//! the slot back at the Downloading → Converting transition so assembly
//! never starves new admissions.

pub mod slots;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use reqwest::Client;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hlsfetch::{ResolvedPlaylist, SpeedLimiter};

use crate::error::{Error, Result};
use crate::settings::MAX_CONCURRENT_RANGE;
use crate::task::{pipeline, Task, TaskOptions, TaskStatus};
use crate::utils::name;

use self::slots::SlotPool;

/// Queue processor tick period; slot releases also wake it immediately.
const QUEUE_SWEEP_PERIOD: Duration = Duration::from_secs(10);

/// Process-local tie-breaker appended to creation-time IDs.
static TASK_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Default)]
struct Registry {
    tasks: HashMap<String, Arc<Task>>,
    /// Absolute (directory, filename) paths claimed by live tasks. A
    /// reservation is the intent to create, held before the file exists.
    reserved: HashSet<PathBuf>,
}

pub struct TaskManager {
    registry: Mutex<Registry>,
    /// Pending FIFO; guarded separately so queue sweeps never contend with
    /// task mutations.
    queue: Mutex<VecDeque<Arc<Task>>>,
    slots: SlotPool,
    queue_wake: Notify,
    limiter: Arc<SpeedLimiter>,
    http_client: Client,
    shutdown: CancellationToken,
    /// Back-reference for handing owned clones to spawned pipelines.
    self_ref: Weak<TaskManager>,
}

impl TaskManager {
    pub fn new(http_client: Client, limiter: Arc<SpeedLimiter>, max_concurrent: u32) -> Arc<Self> {
        let capacity = max_concurrent
            .clamp(*MAX_CONCURRENT_RANGE.start(), *MAX_CONCURRENT_RANGE.end());
        info!(max_concurrent = capacity, "task manager initialized");
        Arc::new_cyclic(|self_ref| Self {
            registry: Mutex::new(Registry::default()),
            queue: Mutex::new(VecDeque::new()),
            slots: SlotPool::new(capacity as usize),
            queue_wake: Notify::new(),
            limiter,
            http_client,
            shutdown: CancellationToken::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// An owned handle to this manager. Only callable while at least one
    /// `Arc` is alive, which is guaranteed by having `&self`.
    fn shared(&self) -> Arc<TaskManager> {
        self.self_ref
            .upgrade()
            .expect("manager used after its last Arc was dropped")
    }

    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    pub(crate) fn limiter(&self) -> &Arc<SpeedLimiter> {
        &self.limiter
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<Task>>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---- construction and registration ----

    /// Create and register a task for an already-resolved playlist.
    ///
    /// Creates the output and staging directories, derives the output name
    /// from the playlist URL, and reserves a unique variant of it.
    pub async fn create_task(
        &self,
        url: &str,
        output: &str,
        playlist: ResolvedPlaylist,
        options: TaskOptions,
    ) -> Result<Arc<Task>> {
        if output.trim().is_empty() {
            return Err(Error::validation("output directory must not be empty"));
        }

        let output_dir = PathBuf::from(output);
        tokio::fs::create_dir_all(&output_dir).await.map_err(|e| {
            Error::config(format!(
                "failed to create output directory {}: {e}",
                output_dir.display()
            ))
        })?;

        let id = next_task_id();
        let staging_dir = output_dir.join(format!("ts_{id}"));
        tokio::fs::create_dir_all(&staging_dir).await.map_err(|e| {
            Error::config(format!(
                "failed to create staging directory {}: {e}",
                staging_dir.display()
            ))
        })?;

        let base_name = name::file_name_from_url(url);
        let desired = if options.convert_to_mp4 {
            name::with_extension(&base_name, "mp4")
        } else {
            base_name
        };
        let file_name = self.reserve_unique_filename(&output_dir, &desired);

        let task = Arc::new(Task::new(
            id.clone(),
            url.to_string(),
            output.to_string(),
            output_dir,
            staging_dir,
            file_name,
            playlist,
            options,
        ));

        self.lock_registry().tasks.insert(id, Arc::clone(&task));
        Ok(task)
    }

    /// Reserve the first free name in `base, base_1.ext, base_2.ext, ...`,
    /// probing the reservation set and the filesystem together.
    pub fn reserve_unique_filename(&self, dir: &Path, base: &str) -> String {
        let mut registry = self.lock_registry();
        let (stem, ext) = name::split_extension(base);

        let mut candidate = base.to_string();
        let mut counter = 1;
        loop {
            let key = dir.join(&candidate);
            if !registry.reserved.contains(&key) && !key.exists() {
                registry.reserved.insert(key);
                return candidate;
            }
            candidate = match ext {
                Some(ext) => format!("{stem}_{counter}.{ext}"),
                None => format!("{stem}_{counter}"),
            };
            counter += 1;
        }
    }

    fn release_reservation(registry: &mut Registry, dir: &Path, file_name: &str) {
        registry.reserved.remove(&dir.join(file_name));
    }

    /// Release the task's current reservation and reserve a unique variant
    /// of `desired` instead. Returns the final name.
    pub(crate) fn rename_reservation(&self, task: &Arc<Task>, desired: &str) -> String {
        {
            let mut registry = self.lock_registry();
            let current = task.file_name();
            Self::release_reservation(&mut registry, &task.output_dir, &current);
        }
        let final_name = self.reserve_unique_filename(&task.output_dir, desired);
        task.set_file_name(final_name.clone());
        final_name
    }

    /// Swap the reserved name to the extension the assembly step is about to
    /// produce. Invoked once per task right before merging.
    pub(crate) fn finalize_output_name(&self, task: &Arc<Task>) -> (String, PathBuf) {
        let desired_ext = if task.options.convert_to_mp4 { "mp4" } else { "ts" };
        let current = task.file_name();
        let desired = name::with_extension(&current, desired_ext);
        let final_name = if desired != current {
            self.rename_reservation(task, &desired)
        } else {
            current
        };
        let path = task.output_dir.join(&final_name);
        (final_name, path)
    }

    // ---- admission ----

    /// Queue a registered task for download. If a slot is free the task
    /// starts immediately; otherwise it joins the FIFO.
    pub fn enqueue(&self, task: Arc<Task>) {
        task.set_status(TaskStatus::Pending, "waiting in download queue");

        if self.slots.try_acquire() {
            task.claim_slot();
            task.set_status(TaskStatus::Downloading, "downloading");
            info!(
                task = %task.id,
                available = self.slots.available(),
                "slot acquired at enqueue, starting download"
            );
            self.start_pipeline(task);
        } else {
            let mut queue = self.lock_queue();
            queue.push_back(task.clone());
            info!(
                task = %task.id,
                queued = queue.len(),
                "all slots busy, task queued"
            );
        }
    }

    /// Spawn and supervise the task's pipeline. A panicking pipeline must
    /// not leak its admission slot.
    fn start_pipeline(&self, task: Arc<Task>) {
        let manager = self.shared();
        let watched = Arc::clone(&task);
        let handle = tokio::spawn(pipeline::run(task, self.shared()));
        tokio::spawn(async move {
            if let Err(join_err) = handle.await {
                error!(task = %watched.id, error = %join_err, "download pipeline panicked");
                watched.set_failure("download pipeline panicked");
                manager.reclaim_slot(&watched);
            }
        });
    }

    /// Return the task's slot to the pool if it still owns one and wake the
    /// queue. Safe to call from every teardown path.
    pub(crate) fn reclaim_slot(&self, task: &Task) {
        if task.yield_slot() {
            self.slots.release();
            self.queue_wake.notify_one();
        }
    }

    /// The Downloading → Converting transition hook: verifies the caller is
    /// actually downloading, flips the status, returns the permit, and wakes
    /// the queue so assembly never blocks the next admission.
    pub fn release_download_slot(&self, id: &str) -> bool {
        let Some(task) = self.get(id) else {
            warn!(task = id, "slot release for unknown task, ignoring");
            return false;
        };
        if task.status() != TaskStatus::Downloading {
            warn!(
                task = id,
                status = %task.status(),
                "slot release outside the downloading state, ignoring"
            );
            return false;
        }
        task.set_status(TaskStatus::Converting, "merging segments");
        if task.yield_slot() {
            self.slots.release();
        } else {
            debug!(task = id, "converting task held no slot");
        }
        self.queue_wake.notify_one();
        true
    }

    /// Background admission loop: sweeps the FIFO every 10 s and on every
    /// slot release, moving Pending tasks into free slots in order.
    pub fn spawn_queue_processor(&self) {
        let manager = self.shared();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(QUEUE_SWEEP_PERIOD);
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => {
                        debug!("queue processor shutting down");
                        break;
                    }
                    _ = tick.tick() => {}
                    _ = manager.queue_wake.notified() => {}
                }
                manager.sweep_queue();
            }
        });
    }

    fn sweep_queue(&self) {
        let mut queue = self.lock_queue();
        if queue.is_empty() {
            return;
        }
        debug!(
            queued = queue.len(),
            available = self.slots.available(),
            "sweeping download queue"
        );

        let mut kept = VecDeque::with_capacity(queue.len());
        let mut started = 0;
        while let Some(task) = queue.pop_front() {
            if task.status() != TaskStatus::Pending || task.is_stopped() {
                // Cancellation raced with the sweep; drop silently.
                debug!(task = %task.id, status = %task.status(), "dropping non-pending task from queue");
                continue;
            }
            if self.slots.try_acquire() {
                task.claim_slot();
                task.set_status(TaskStatus::Downloading, "downloading");
                info!(task = %task.id, "queue sweep acquired slot, starting download");
                started += 1;
                self.start_pipeline(task);
            } else {
                kept.push_back(task);
            }
        }
        *queue = kept;
        if started > 0 {
            info!(started, remaining = queue.len(), "queue sweep complete");
        }
    }

    // ---- views ----

    pub fn get(&self, id: &str) -> Option<Arc<Task>> {
        self.lock_registry().tasks.get(id).cloned()
    }

    /// All registered tasks, newest first.
    pub fn list_all(&self) -> Vec<Arc<Task>> {
        let registry = self.lock_registry();
        let mut tasks: Vec<_> = registry.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created.cmp(&a.created).then(b.id.cmp(&a.id)));
        tasks
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots.in_use()
    }

    pub fn slot_capacity(&self) -> usize {
        self.slots.capacity()
    }

    // ---- lifecycle ----

    /// Stop a task, delete its on-disk artifacts, and drop it from the
    /// registry. Returns `Ok(false)` when the id is unknown.
    pub async fn stop_and_delete(&self, id: &str) -> Result<bool> {
        let Some(task) = self.remove_from_registry(id) else {
            return Ok(false);
        };

        info!(task = id, status = %task.status(), "stopping and deleting task");
        let delete_result = task.delete_files().await;

        self.reclaim_slot(&task);
        self.queue_wake.notify_one();

        delete_result.map_err(Error::from)?;
        Ok(true)
    }

    /// Drop a task from the registry without touching disk.
    pub fn delete(&self, id: &str) -> bool {
        let Some(task) = self.remove_from_registry(id) else {
            return false;
        };
        self.reclaim_slot(&task);
        self.queue_wake.notify_one();
        true
    }

    fn remove_from_registry(&self, id: &str) -> Option<Arc<Task>> {
        let task = {
            let mut registry = self.lock_registry();
            let task = registry.tasks.remove(id)?;
            let file_name = task.file_name();
            Self::release_reservation(&mut registry, &task.output_dir, &file_name);
            task
        };
        self.lock_queue().retain(|queued| queued.id != id);
        Some(task)
    }

    /// Remove every task in the Success state; returns how many.
    pub fn clear_completed(&self) -> usize {
        let mut registry = self.lock_registry();
        let completed: Vec<String> = registry
            .tasks
            .values()
            .filter(|t| t.status() == TaskStatus::Success)
            .map(|t| t.id.clone())
            .collect();
        for id in &completed {
            if let Some(task) = registry.tasks.remove(id) {
                let file_name = task.file_name();
                Self::release_reservation(&mut registry, &task.output_dir, &file_name);
                debug!(task = %id, "cleared completed task");
            }
        }
        completed.len()
    }

    /// Re-enqueue a stopped task. Returns `false` unless the task is in the
    /// Stopped state with its internal stop flag still set.
    pub fn resume(&self, id: &str) -> bool {
        let Some(task) = self.get(id) else {
            return false;
        };
        if task.status() != TaskStatus::Stopped || !task.take_stopped() {
            return false;
        }
        info!(task = id, "resuming stopped task");
        self.enqueue(task);
        true
    }

    // ---- global knobs ----

    /// Resize the admission pool, clamped into 1..=10. Held slots survive a
    /// shrink; the overflow drains as running downloads finish.
    pub fn set_max_concurrent(&self, max: u32) {
        let capacity = max.clamp(*MAX_CONCURRENT_RANGE.start(), *MAX_CONCURRENT_RANGE.end());
        let previous = self.slots.capacity();
        self.slots.resize(capacity as usize);
        if previous != capacity as usize {
            info!(from = previous, to = capacity, "max concurrent downloads updated");
        }
        self.queue_wake.notify_one();
    }

    /// Reconfigure the shared rate limiter; 0 disables.
    pub fn set_rate_limit(&self, kb_per_sec: u64) {
        if kb_per_sec > 0 {
            info!(kb_per_sec, "download speed limit updated");
        } else {
            info!("download speed limit disabled");
        }
        self.limiter.set(kb_per_sec);
    }

    /// Cancel the queue processor. Running pipelines are left to the process
    /// teardown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn next_task_id() -> String {
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    let seq = TASK_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{nanos}{seq:03}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager(max_concurrent: u32) -> Arc<TaskManager> {
        let client = hlsfetch::build_client(&hlsfetch::FetchConfig::default()).unwrap();
        TaskManager::new(client, Arc::new(SpeedLimiter::new()), max_concurrent)
    }

    fn fake_playlist(segments: usize) -> ResolvedPlaylist {
        ResolvedPlaylist {
            url: "http://127.0.0.1:1/nowhere/index.m3u8".to_string(),
            segments: (0..segments)
                .map(|index| hlsfetch::playlist::SegmentDescriptor {
                    index,
                    uri: format!("http://127.0.0.1:1/nowhere/{index}.ts"),
                    key_slot: None,
                    media_sequence: index as u64,
                })
                .collect(),
            key_slots: Vec::new(),
        }
    }

    fn options() -> TaskOptions {
        TaskOptions {
            workers: 2,
            delete_ts: false,
            convert_to_mp4: false,
        }
    }

    #[test]
    fn unique_filenames_follow_the_numbered_sequence() {
        let manager = test_manager(3);
        let dir = tempfile::tempdir().unwrap();

        assert_eq!(
            manager.reserve_unique_filename(dir.path(), "show.ts"),
            "show.ts"
        );
        assert_eq!(
            manager.reserve_unique_filename(dir.path(), "show.ts"),
            "show_1.ts"
        );
        assert_eq!(
            manager.reserve_unique_filename(dir.path(), "show.ts"),
            "show_2.ts"
        );
    }

    #[test]
    fn reservation_probes_the_filesystem_too() {
        let manager = test_manager(3);
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("show.ts"), b"present").unwrap();

        assert_eq!(
            manager.reserve_unique_filename(dir.path(), "show.ts"),
            "show_1.ts"
        );
    }

    #[test]
    fn concurrent_reservations_never_collide() {
        let manager = test_manager(3);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                manager.reserve_unique_filename(&path, "show.ts")
            }));
        }
        let mut names: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8, "duplicate reservation produced");
    }

    #[tokio::test]
    async fn list_all_returns_newest_first() {
        let manager = test_manager(3);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().to_str().unwrap();

        let first = manager
            .create_task("http://e/one.m3u8", out, fake_playlist(1), options())
            .await
            .unwrap();
        let second = manager
            .create_task("http://e/two.m3u8", out, fake_playlist(1), options())
            .await
            .unwrap();

        let listed = manager.list_all();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
    }

    #[tokio::test]
    async fn stop_and_delete_empties_registry_and_reservations() {
        let manager = test_manager(3);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().to_str().unwrap();

        let task = manager
            .create_task("http://e/show.m3u8", out, fake_playlist(2), options())
            .await
            .unwrap();
        let reserved_name = task.file_name();

        assert!(manager.stop_and_delete(&task.id).await.unwrap());
        assert!(manager.get(&task.id).is_none());
        assert!(manager.list_all().is_empty());

        // The old name is reservable again right away.
        assert_eq!(
            manager.reserve_unique_filename(dir.path(), &reserved_name),
            reserved_name
        );
    }

    #[tokio::test]
    async fn stop_and_delete_unknown_id_is_false() {
        let manager = test_manager(3);
        assert!(!manager.stop_and_delete("missing").await.unwrap());
    }

    #[tokio::test]
    async fn enqueue_beyond_capacity_parks_tasks_pending() {
        let manager = test_manager(2);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().to_str().unwrap();

        let mut tasks = Vec::new();
        for i in 0..3 {
            let task = manager
                .create_task(
                    &format!("http://e/{i}.m3u8"),
                    out,
                    fake_playlist(1),
                    options(),
                )
                .await
                .unwrap();
            tasks.push(task);
        }
        // Enqueue back-to-back with no await in between: the spawned
        // pipelines cannot run yet on the current-thread test runtime.
        for task in &tasks {
            manager.enqueue(Arc::clone(task));
        }

        // The first two take slots synchronously; the third waits its turn.
        assert_eq!(tasks[0].status(), TaskStatus::Downloading);
        assert_eq!(tasks[1].status(), TaskStatus::Downloading);
        assert_eq!(tasks[2].status(), TaskStatus::Pending);
        assert_eq!(manager.slots_in_use(), 2);
    }

    #[tokio::test]
    async fn release_download_slot_requires_downloading() {
        let manager = test_manager(2);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().to_str().unwrap();

        let task = manager
            .create_task("http://e/a.m3u8", out, fake_playlist(1), options())
            .await
            .unwrap();

        // Pending tasks hold no slot.
        assert!(!manager.release_download_slot(&task.id));
        assert!(!manager.release_download_slot("missing"));
    }

    #[test]
    fn task_ids_are_unique_under_bursts() {
        let mut ids: Vec<String> = (0..64).map(|_| next_task_id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 64);
    }
}
