//! M3U8 playlist resolution.
//!
//! Turns a playlist URL into a fully resolved download plan: a dense ordered
//! list of segment descriptors with absolute URIs, plus the key slots they
//! reference with the raw key material already fetched. Master playlists are
//! followed to the variant with the highest BANDWIDTH.

use std::time::Duration;

use bytes::Bytes;
use m3u8_rs::{MasterPlaylist, MediaPlaylist, Playlist, VariantStream};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::client;
use crate::decrypt::{self, AES_BLOCK_LEN};
use crate::error::DownloadError;

/// How many master-playlist hops are followed before giving up.
const MAX_MASTER_DEPTH: usize = 5;

/// Attempts per playlist or key fetch. These resources are single small
/// requests a whole task hangs on, so transient failures get a short
/// doubling backoff instead of failing the task outright.
const FETCH_ATTEMPTS: u32 = 3;
const FETCH_BACKOFF_START: Duration = Duration::from_millis(500);
const FETCH_BACKOFF_CAP: Duration = Duration::from_secs(8);

/// One media segment to download.
#[derive(Debug, Clone)]
pub struct SegmentDescriptor {
    /// Dense index, 0..N-1, in playlist order.
    pub index: usize,
    /// Absolute segment URI.
    pub uri: String,
    /// Index into [`ResolvedPlaylist::key_slots`], when encrypted.
    pub key_slot: Option<usize>,
    /// Media sequence number, used to derive the default IV.
    pub media_sequence: u64,
}

/// An AES-128 key slot with its key material resolved.
#[derive(Debug, Clone)]
pub struct KeySlot {
    /// Absolute key URI the material was fetched from.
    pub uri: String,
    /// Raw key bytes.
    pub key: [u8; AES_BLOCK_LEN],
    /// IV from the playlist; when absent the media-sequence default applies.
    pub iv: Option<[u8; AES_BLOCK_LEN]>,
}

/// A media playlist resolved into a download plan.
#[derive(Debug, Clone)]
pub struct ResolvedPlaylist {
    /// The media playlist URL the segments were resolved against.
    pub url: String,
    pub segments: Vec<SegmentDescriptor>,
    pub key_slots: Vec<KeySlot>,
}

/// Key slot before its material has been fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KeySlotSpec {
    uri: String,
    iv: Option<[u8; AES_BLOCK_LEN]>,
}

/// Fetch and resolve the playlist at `url` into a download plan.
pub async fn load(
    http_client: &Client,
    url: &str,
    token: &CancellationToken,
) -> Result<ResolvedPlaylist, DownloadError> {
    let mut current = Url::parse(url).map_err(|e| DownloadError::invalid_url(url, e.to_string()))?;

    for _ in 0..MAX_MASTER_DEPTH {
        let body = fetch_with_retry(http_client, current.as_str(), "playlist fetch", token).await?;
        match m3u8_rs::parse_playlist_res(&body) {
            Ok(Playlist::MasterPlaylist(master)) => {
                let variant = select_variant(&master)?;
                let next = current.join(&variant.uri).map_err(|e| {
                    DownloadError::playlist(format!(
                        "could not join master URL with variant URI {}: {e}",
                        variant.uri
                    ))
                })?;
                debug!(variant = %next, bandwidth = variant.bandwidth, "following master variant");
                current = next;
            }
            Ok(Playlist::MediaPlaylist(media)) => {
                let (segments, key_specs) = map_segments(&media, &current)?;
                let mut key_slots = Vec::with_capacity(key_specs.len());
                for spec in key_specs {
                    let key = fetch_key(http_client, &spec.uri, token).await?;
                    key_slots.push(KeySlot {
                        uri: spec.uri,
                        key,
                        iv: spec.iv,
                    });
                }
                info!(
                    url = %current,
                    segments = segments.len(),
                    key_slots = key_slots.len(),
                    "playlist resolved"
                );
                return Ok(ResolvedPlaylist {
                    url: current.to_string(),
                    segments,
                    key_slots,
                });
            }
            Err(e) => {
                return Err(DownloadError::playlist(format!(
                    "failed to parse playlist {current}: {e}"
                )));
            }
        }
    }

    Err(DownloadError::playlist(format!(
        "master playlist nesting exceeds {MAX_MASTER_DEPTH} levels for {url}"
    )))
}

/// Pick the variant with the highest BANDWIDTH.
fn select_variant(master: &MasterPlaylist) -> Result<&VariantStream, DownloadError> {
    master
        .variants
        .iter()
        .max_by_key(|v| v.bandwidth)
        .ok_or_else(|| DownloadError::playlist("master playlist has no variants"))
}

/// Resolve a playlist-relative URI against the playlist URL.
///
/// Absolute `http(s)` URIs pass through unchanged; URIs starting with `/`
/// resolve against the scheme+host; anything else resolves against the
/// directory portion of the playlist URL.
fn resolve_uri(base: &Url, uri: &str) -> Result<String, DownloadError> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(uri.to_string());
    }
    base.join(uri)
        .map(|u| u.to_string())
        .map_err(|e| DownloadError::playlist(format!("could not resolve URI `{uri}`: {e}")))
}

/// Map the media playlist into segment descriptors plus the key slots they
/// reference. Key tags apply to every following segment until replaced; a
/// tag identical to the active slot does not open a new one.
fn map_segments(
    media: &MediaPlaylist,
    base: &Url,
) -> Result<(Vec<SegmentDescriptor>, Vec<KeySlotSpec>), DownloadError> {
    if media.segments.is_empty() {
        return Err(DownloadError::playlist(
            "playlist does not reference any media segment",
        ));
    }

    let mut segments = Vec::with_capacity(media.segments.len());
    let mut slots: Vec<KeySlotSpec> = Vec::new();
    let mut current_slot: Option<usize> = None;

    for (index, segment) in media.segments.iter().enumerate() {
        if let Some(key) = segment.key.as_ref() {
            current_slot = match key.method {
                m3u8_rs::KeyMethod::None => None,
                m3u8_rs::KeyMethod::AES128 => {
                    let uri = key.uri.as_deref().ok_or_else(|| {
                        DownloadError::decryption("AES-128 key tag is missing its URI")
                    })?;
                    let spec = KeySlotSpec {
                        uri: resolve_uri(base, uri)?,
                        iv: key.iv.as_deref().map(decrypt::parse_iv).transpose()?,
                    };
                    match slots.iter().position(|s| *s == spec) {
                        Some(existing) => Some(existing),
                        None => {
                            slots.push(spec);
                            Some(slots.len() - 1)
                        }
                    }
                }
                ref other => {
                    return Err(DownloadError::playlist(format!(
                        "unsupported key method: {other:?}"
                    )));
                }
            };
        }

        segments.push(SegmentDescriptor {
            index,
            uri: resolve_uri(base, &segment.uri)?,
            key_slot: current_slot,
            media_sequence: media.media_sequence + index as u64,
        });
    }

    Ok((segments, slots))
}

/// Fetch AES key material, enforcing the 16-byte length.
async fn fetch_key(
    http_client: &Client,
    uri: &str,
    token: &CancellationToken,
) -> Result<[u8; AES_BLOCK_LEN], DownloadError> {
    let body = fetch_with_retry(http_client, uri, "key fetch", token).await?;
    let key: [u8; AES_BLOCK_LEN] = body.as_ref().try_into().map_err(|_| {
        DownloadError::decryption(format!(
            "key from {uri} has length {} (expected {AES_BLOCK_LEN})",
            body.len()
        ))
    })?;
    Ok(key)
}

/// GET a small resource, backing off on transient failures.
///
/// Retryability is decided by [`DownloadError::is_retryable`] (server
/// errors, network and body read failures); 4xx and parse-level errors
/// surface immediately. The task's stop token aborts both the wait and the
/// next attempt.
async fn fetch_with_retry(
    http_client: &Client,
    url: &str,
    operation: &'static str,
    token: &CancellationToken,
) -> Result<Bytes, DownloadError> {
    let mut delay = FETCH_BACKOFF_START;
    let mut attempt = 1;
    loop {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let err = match fetch_once(http_client, url, operation).await {
            Ok(body) => return Ok(body),
            Err(err) => err,
        };
        if attempt >= FETCH_ATTEMPTS || !err.is_retryable() {
            return Err(err);
        }

        warn!(
            url,
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient fetch failure, backing off"
        );
        tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(FETCH_BACKOFF_CAP);
        attempt += 1;
    }
}

async fn fetch_once(
    http_client: &Client,
    url: &str,
    operation: &'static str,
) -> Result<Bytes, DownloadError> {
    let response = client::get(http_client, url, operation).await?;
    Ok(response.bytes().await?)
}
