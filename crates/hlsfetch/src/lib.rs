//! HLS fetch engine.
//!
//! Everything a downloader needs between a playlist URL and decrypted
//! transport-stream bytes: the pooled HTTP client, M3U8 playlist resolution
//! (master variants, segment URIs, AES-128 key slots), segment decryption,
//! and the process-wide byte-rate limiter shared by all in-flight reads.

pub mod client;
pub mod config;
pub mod decrypt;
pub mod error;
pub mod playlist;
pub mod rate_limit;

pub use client::build_client;
pub use config::FetchConfig;
pub use error::DownloadError;
pub use playlist::ResolvedPlaylist;
pub use rate_limit::SpeedLimiter;
