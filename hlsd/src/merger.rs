//! Final assembly: in-process TS concatenation and ffmpeg MP4 remux.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hlsfetch::DownloadError;

/// Read buffer for segment files during concatenation.
const CONCAT_READ_BUF: usize = 8 * 1024 * 1024;

/// Write buffer for the merged output.
const CONCAT_WRITE_BUF: usize = 4 * 1024 * 1024;

/// Hard ceiling on one ffmpeg invocation.
const REMUX_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Segment lists longer than this are pre-concatenated into batch
/// intermediates so the ffmpeg concat demuxer works on a bounded input set.
const REMUX_BATCH_SIZE: usize = 100;

/// Concatenate staged segment files in the given order into `out`.
///
/// Pure buffered I/O. Files that disappeared are skipped with a warning.
/// Returns the number of bytes written.
pub async fn concat_ts(
    dir: &Path,
    files: &[String],
    out: &Path,
    token: &CancellationToken,
) -> Result<u64, DownloadError> {
    let out_file = tokio::fs::File::create(out).await?;
    let mut writer = BufWriter::with_capacity(CONCAT_WRITE_BUF, out_file);
    let mut written = 0u64;

    for file in files {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let path = dir.join(file);
        let segment = match tokio::fs::File::open(&path).await {
            Ok(segment) => segment,
            Err(error) => {
                warn!(path = %path.display(), %error, "cannot open segment, skipping");
                continue;
            }
        };
        let mut reader = BufReader::with_capacity(CONCAT_READ_BUF, segment);
        written += tokio::io::copy_buf(&mut reader, &mut writer).await?;
    }

    writer.flush().await?;
    debug!(out = %out.display(), bytes = written, "TS concatenation complete");
    Ok(written)
}

/// Remux staged TS segments into an MP4 container via ffmpeg.
///
/// Uses the concat demuxer with stream-copied video and AAC audio. The
/// subprocess is killed when the stop token fires or after the 30-minute
/// guard expires.
pub async fn remux_to_mp4(
    dir: &Path,
    files: &[String],
    out: &Path,
    token: &CancellationToken,
) -> Result<(), DownloadError> {
    if files.len() > REMUX_BATCH_SIZE {
        return remux_in_batches(dir, files, out, token).await;
    }
    remux_file_list(dir, files, out, token).await
}

async fn remux_file_list(
    dir: &Path,
    files: &[String],
    out: &Path,
    token: &CancellationToken,
) -> Result<(), DownloadError> {
    let list_path = dir.join("filelist.txt");
    write_concat_list(dir, files, &list_path).await?;

    let result = run_ffmpeg(&list_path, out, token).await;
    let _ = tokio::fs::remove_file(&list_path).await;
    result
}

/// Bound the ffmpeg working set for very long segment lists: byte-concat
/// each batch of segments into an intermediate TS, then remux the handful of
/// intermediates.
async fn remux_in_batches(
    dir: &Path,
    files: &[String],
    out: &Path,
    token: &CancellationToken,
) -> Result<(), DownloadError> {
    let batch_dir = dir.join("temp_batch_merge");
    tokio::fs::create_dir_all(&batch_dir).await?;

    let batch_count = files.len().div_ceil(REMUX_BATCH_SIZE);
    info!(
        segments = files.len(),
        batches = batch_count,
        "large segment list, batching before remux"
    );

    let result = async {
        let mut batch_names = Vec::with_capacity(batch_count);
        for (batch_index, batch) in files.chunks(REMUX_BATCH_SIZE).enumerate() {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let name = format!("batch_{batch_index}.ts");
            concat_ts(dir, batch, &batch_dir.join(&name), token).await?;
            batch_names.push(name);
        }
        remux_file_list(&batch_dir, &batch_names, out, token).await
    }
    .await;

    let _ = tokio::fs::remove_dir_all(&batch_dir).await;
    result
}

/// Write an ffmpeg concat-demuxer file list. Paths are absolute so the list
/// location does not constrain the working directory.
async fn write_concat_list(
    dir: &Path,
    files: &[String],
    list_path: &Path,
) -> Result<(), DownloadError> {
    let mut body = String::new();
    for file in files {
        let path = absolute(&dir.join(file));
        // The concat demuxer treats single quotes as delimiters.
        let escaped = path.to_string_lossy().replace('\'', "'\\''");
        body.push_str(&format!("file '{escaped}'\n"));
    }
    let mut list = tokio::fs::File::create(list_path).await?;
    list.write_all(body.as_bytes()).await?;
    list.flush().await?;
    Ok(())
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Arguments for one remux invocation, separated out for testability.
fn ffmpeg_args(list_path: &Path, out: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        list_path.to_string_lossy().into_owned(),
        "-c:v".to_string(),
        "copy".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-bsf:a".to_string(),
        "aac_adtstoasc".to_string(),
        "-movflags".to_string(),
        "faststart".to_string(),
        out.to_string_lossy().into_owned(),
    ]
}

async fn run_ffmpeg(
    list_path: &Path,
    out: &Path,
    token: &CancellationToken,
) -> Result<(), DownloadError> {
    let args = ffmpeg_args(list_path, out);
    debug!(?args, "invoking ffmpeg");

    let mut command = Command::new("ffmpeg");
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|e| DownloadError::Internal {
        reason: format!("failed to start ffmpeg: {e}"),
    })?;

    // Dropping the wait future kills the child via kill_on_drop.
    let output = tokio::select! {
        _ = token.cancelled() => {
            warn!("remux cancelled, killing ffmpeg");
            return Err(DownloadError::Cancelled);
        }
        _ = tokio::time::sleep(REMUX_TIMEOUT) => {
            return Err(DownloadError::Timeout {
                reason: format!("ffmpeg remux exceeded {}s", REMUX_TIMEOUT.as_secs()),
            });
        }
        output = child.wait_with_output() => output?,
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(8)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        return Err(DownloadError::Internal {
            reason: format!("ffmpeg exited with {}: {tail}", output.status),
        });
    }
    Ok(())
}
