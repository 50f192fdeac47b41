//! Single-segment fetch: rate-limited transfer, decryption, sync-byte
//! alignment, and atomic placement into the staging directory.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use hlsfetch::{client, decrypt, DownloadError, SpeedLimiter};

use super::Task;

/// First byte of every MPEG-TS packet.
const TS_SYNC_BYTE: u8 = 0x47;

/// User-space write buffer for staging segment files.
const SEGMENT_WRITE_BUF: usize = 256 * 1024;

/// Suffix for in-progress segment files; the rename to the final name is
/// atomic because both live in the staging directory.
const TMP_SUFFIX: &str = "_tmp";

pub(super) fn segment_path(task: &Task, index: usize) -> PathBuf {
    task.staging_dir.join(format!("{index}.ts"))
}

/// Fetch one segment to `<staging>/<index>.ts`.
///
/// The stop token is consulted at every suspension point: before the
/// request, around each body chunk, before decryption, and before the final
/// rename. A cancelled fetch returns [`DownloadError::Cancelled`], which the
/// worker does not route into the retry path.
pub(super) async fn fetch_segment(
    task: &Arc<Task>,
    index: usize,
    http_client: &Client,
    limiter: &SpeedLimiter,
    token: &CancellationToken,
) -> Result<(), DownloadError> {
    if token.is_cancelled() {
        return Err(DownloadError::Cancelled);
    }

    let segment = &task.playlist.segments[index];

    let mut response = tokio::select! {
        _ = token.cancelled() => return Err(DownloadError::Cancelled),
        response = client::get(http_client, &segment.uri, "segment fetch") => response?,
    };

    let mut body = BytesMut::with_capacity(response.content_length().unwrap_or(0) as usize);
    loop {
        let chunk = tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            chunk = response.chunk() => chunk?,
        };
        let Some(chunk) = chunk else { break };
        tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            _ = limiter.acquire(chunk.len()) => {}
        }
        task.speed.record(chunk.len() as u64);
        body.extend_from_slice(&chunk);
    }

    if token.is_cancelled() {
        return Err(DownloadError::Cancelled);
    }

    let mut data = body.freeze();
    if let Some(slot) = segment.key_slot {
        let key_slot = &task.playlist.key_slots[slot];
        let iv = key_slot
            .iv
            .unwrap_or_else(|| decrypt::sequence_iv(segment.media_sequence));
        data = decrypt::decrypt_aes128(&data, &key_slot.key, &iv)?;
    }

    let data = align_to_sync_byte(data);

    if token.is_cancelled() {
        return Err(DownloadError::Cancelled);
    }

    let final_path = segment_path(task, index);
    let tmp_path = task
        .staging_dir
        .join(format!("{index}.ts{TMP_SUFFIX}"));

    let file = tokio::fs::File::create(&tmp_path).await?;
    let mut writer = tokio::io::BufWriter::with_capacity(SEGMENT_WRITE_BUF, file);
    writer.write_all(&data).await?;
    writer.flush().await?;
    drop(writer);

    tokio::fs::rename(&tmp_path, &final_path).await?;
    trace!(task = %task.id, segment = index, bytes = data.len(), "segment staged");
    Ok(())
}

/// Discard bytes preceding the first MPEG-TS sync byte. A block without any
/// sync byte is kept as-is.
fn align_to_sync_byte(data: Bytes) -> Bytes {
    match data.iter().position(|&b| b == TS_SYNC_BYTE) {
        Some(pos) if pos > 0 => data.slice(pos..),
        _ => data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_data_passes_through() {
        let data = Bytes::from_static(&[0x47, 1, 2, 3]);
        assert_eq!(align_to_sync_byte(data.clone()), data);
    }

    #[test]
    fn leading_garbage_is_discarded() {
        let data = Bytes::from_static(&[0xde, 0xad, 0x47, 1, 2]);
        assert_eq!(align_to_sync_byte(data).as_ref(), &[0x47, 1, 2]);
    }

    #[test]
    fn missing_sync_byte_keeps_data_unchanged() {
        let data = Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(align_to_sync_byte(data.clone()), data);
    }

    #[test]
    fn empty_block_stays_empty() {
        assert!(align_to_sync_byte(Bytes::new()).is_empty());
    }
}
