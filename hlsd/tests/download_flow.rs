//! End-to-end download scenarios against a local HTTP origin.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;

use hlsd::manager::TaskManager;
use hlsd::task::{Task, TaskOptions, TaskStatus};
use hlsfetch::{decrypt, playlist, FetchConfig, SpeedLimiter};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

fn encrypt(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
}

/// A deterministic fake TS segment: sync byte first, then a patterned fill.
fn ts_segment(seed: u8, len: usize) -> Vec<u8> {
    let mut data = vec![0x47u8];
    data.extend((1..len).map(|i| (seed as usize).wrapping_add(i) as u8));
    data
}

fn media_playlist(segment_names: &[String], key_uri: Option<&str>) -> String {
    let mut text = String::from(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n",
    );
    if let Some(uri) = key_uri {
        text.push_str(&format!("#EXT-X-KEY:METHOD=AES-128,URI=\"{uri}\"\n"));
    }
    for name in segment_names {
        text.push_str("#EXTINF:4.0,\n");
        text.push_str(name);
        text.push('\n');
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn body_route(router: Router, path: &str, body: Vec<u8>) -> Router {
    router.route(
        path,
        get(move || {
            let body = body.clone();
            async move { body }
        }),
    )
}

fn new_manager(max_concurrent: u32) -> Arc<TaskManager> {
    let client = hlsfetch::build_client(&FetchConfig::default()).unwrap();
    let manager = TaskManager::new(client, Arc::new(SpeedLimiter::new()), max_concurrent);
    manager.spawn_queue_processor();
    manager
}

async fn resolve(manager: &TaskManager, url: &str) -> hlsfetch::ResolvedPlaylist {
    playlist::load(manager.http_client(), url, &CancellationToken::new())
        .await
        .unwrap()
}

async fn wait_for_status(task: &Arc<Task>, status: TaskStatus, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if task.status() == status {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {} never reached {status:?}; currently {:?} ({})",
            task.id,
            task.status(),
            task.view().message
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn options(workers: u32) -> TaskOptions {
    TaskOptions {
        workers,
        delete_ts: false,
        convert_to_mp4: false,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn downloads_and_concatenates_plain_playlist() {
    let segments: Vec<Vec<u8>> = (0..3).map(|i| ts_segment(i as u8, 64 * 1024)).collect();
    let names: Vec<String> = (0..3).map(|i| format!("seg{i}.ts")).collect();

    let mut router = Router::new();
    router = body_route(
        router,
        "/video/index.m3u8",
        media_playlist(&names, None).into_bytes(),
    );
    for (i, segment) in segments.iter().enumerate() {
        router = body_route(router, &format!("/video/seg{i}.ts"), segment.clone());
    }
    let addr = serve(router).await;

    let manager = new_manager(3);
    let url = format!("http://{addr}/video/index.m3u8");
    let resolved = resolve(&manager, &url).await;
    assert_eq!(resolved.segments.len(), 3);

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().to_str().unwrap();
    let task = manager
        .create_task(&url, out, resolved, options(3))
        .await
        .unwrap();
    manager.enqueue(Arc::clone(&task));

    wait_for_status(&task, TaskStatus::Success, Duration::from_secs(15)).await;

    let view = task.view();
    assert_eq!(view.progress, 100);
    assert_eq!(view.file_name, "index.ts");

    let merged = std::fs::read(dir.path().join(&view.file_name)).unwrap();
    let expected: Vec<u8> = segments.concat();
    assert_eq!(merged, expected);
    assert_eq!(view.total_size, expected.len() as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn decrypts_aes128_playlist_with_default_iv() {
    let key = [0x5au8; 16];
    let plain: Vec<Vec<u8>> = (0..10).map(|i| ts_segment(i as u8, 16 * 1024)).collect();
    let names: Vec<String> = (0..10).map(|i| format!("seg{i}.ts")).collect();

    let mut router = Router::new();
    router = body_route(
        router,
        "/enc/index.m3u8",
        media_playlist(&names, Some("key.bin")).into_bytes(),
    );
    router = body_route(router, "/enc/key.bin", key.to_vec());
    for (i, segment) in plain.iter().enumerate() {
        // No IV attribute in the playlist: the media-sequence default applies.
        let encrypted = encrypt(segment, &key, &decrypt::sequence_iv(i as u64));
        router = body_route(router, &format!("/enc/seg{i}.ts"), encrypted);
    }
    let addr = serve(router).await;

    let manager = new_manager(3);
    let url = format!("http://{addr}/enc/index.m3u8");
    let resolved = resolve(&manager, &url).await;
    assert_eq!(resolved.key_slots.len(), 1);
    assert_eq!(resolved.key_slots[0].key, key);

    let dir = tempfile::tempdir().unwrap();
    let task = manager
        .create_task(&url, dir.path().to_str().unwrap(), resolved, options(5))
        .await
        .unwrap();
    manager.enqueue(Arc::clone(&task));

    wait_for_status(&task, TaskStatus::Success, Duration::from_secs(15)).await;

    let merged = std::fs::read(dir.path().join(task.view().file_name)).unwrap();
    assert_eq!(merged[0], 0x47);
    assert_eq!(merged, plain.concat());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn permanently_failing_segment_is_skipped_after_three_attempts() {
    let segments: Vec<Vec<u8>> = (0..4).map(|i| ts_segment(i as u8, 8 * 1024)).collect();
    let names: Vec<String> = (0..4).map(|i| format!("seg{i}.ts")).collect();
    let broken_hits = Arc::new(AtomicUsize::new(0));

    let mut router = Router::new();
    router = body_route(
        router,
        "/flaky/index.m3u8",
        media_playlist(&names, None).into_bytes(),
    );
    for (i, segment) in segments.iter().enumerate() {
        if i == 2 {
            continue;
        }
        router = body_route(router, &format!("/flaky/seg{i}.ts"), segment.clone());
    }
    let hits = Arc::clone(&broken_hits);
    router = router.route(
        "/flaky/seg2.ts",
        get(move || {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }),
    );
    let addr = serve(router).await;

    let manager = new_manager(3);
    let url = format!("http://{addr}/flaky/index.m3u8");
    let resolved = resolve(&manager, &url).await;

    let dir = tempfile::tempdir().unwrap();
    let task = manager
        .create_task(&url, dir.path().to_str().unwrap(), resolved, options(2))
        .await
        .unwrap();
    manager.enqueue(Arc::clone(&task));

    // Three of four segments finish: above the N/2 threshold, so the task
    // still succeeds with the broken segment left out.
    wait_for_status(&task, TaskStatus::Success, Duration::from_secs(15)).await;

    assert_eq!(broken_hits.load(Ordering::SeqCst), 3);
    let merged = std::fs::read(dir.path().join(task.view().file_name)).unwrap();
    let expected: Vec<u8> = [&segments[0][..], &segments[1][..], &segments[3][..]].concat();
    assert_eq!(merged, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admission_is_fifo_under_the_concurrency_cap() {
    let names: Vec<String> = (0..2).map(|i| format!("seg{i}.ts")).collect();
    let mut router = Router::new();
    router = body_route(
        router,
        "/slow/index.m3u8",
        media_playlist(&names, None).into_bytes(),
    );
    for i in 0..2 {
        let body = ts_segment(i as u8, 4 * 1024);
        router = router.route(
            &format!("/slow/seg{i}.ts"),
            get(move || {
                let body = body.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    body
                }
            }),
        );
    }
    let addr = serve(router).await;

    let manager = new_manager(2);
    let url = format!("http://{addr}/slow/index.m3u8");

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().to_str().unwrap();
    let mut tasks = Vec::new();
    for _ in 0..3 {
        let resolved = resolve(&manager, &url).await;
        let task = manager
            .create_task(&url, out, resolved, options(2))
            .await
            .unwrap();
        manager.enqueue(Arc::clone(&task));
        tasks.push(task);
    }

    // Two slots: the first two tasks start immediately, the third waits.
    assert_eq!(tasks[0].status(), TaskStatus::Downloading);
    assert_eq!(tasks[1].status(), TaskStatus::Downloading);
    assert_eq!(tasks[2].status(), TaskStatus::Pending);

    // The cap holds the whole way through.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        assert!(manager.slots_in_use() <= 2, "admission cap exceeded");
        if tasks.iter().all(|t| t.status() == TaskStatus::Success) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "tasks did not all finish: {:?}",
            tasks.iter().map(|t| t.status()).collect::<Vec<_>>()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Three distinct reserved output names, all present on disk.
    let mut file_names: Vec<String> = tasks.iter().map(|t| t.view().file_name).collect();
    for name in &file_names {
        assert!(dir.path().join(name).exists());
    }
    file_names.sort();
    file_names.dedup();
    assert_eq!(file_names.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_and_delete_cleans_up_mid_flight() {
    let names: Vec<String> = (0..30).map(|i| format!("seg{i}.ts")).collect();
    let mut router = Router::new();
    router = body_route(
        router,
        "/big/index.m3u8",
        media_playlist(&names, None).into_bytes(),
    );
    for i in 0..30 {
        let body = ts_segment(i as u8, 4 * 1024);
        router = router.route(
            &format!("/big/seg{i}.ts"),
            get(move || {
                let body = body.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    body
                }
            }),
        );
    }
    let addr = serve(router).await;

    let manager = new_manager(2);
    let url = format!("http://{addr}/big/index.m3u8");
    let resolved = resolve(&manager, &url).await;

    let dir = tempfile::tempdir().unwrap();
    let task = manager
        .create_task(&url, dir.path().to_str().unwrap(), resolved, options(4))
        .await
        .unwrap();
    let staging = task.staging_dir.clone();
    manager.enqueue(Arc::clone(&task));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(manager.stop_and_delete(&task.id).await.unwrap());

    // Registry and reservation are gone immediately.
    assert!(manager.get(&task.id).is_none());
    assert!(manager.list_all().is_empty());
    assert!(!staging.exists(), "staging directory survived deletion");

    // The admission slot comes back once the pipeline notices the stop.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while manager.slots_in_use() != 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "admission slot was not returned"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
