use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Transport configuration for the process-wide HTTP client.
///
/// The defaults are tuned for fanning hundreds of short segment reads out to
/// CDN edges: generous idle pools, long idle lifetime, and TLS without
/// hostname verification because segment hosts are frequently IP-addressed.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Time to establish the initial connection.
    pub connect_timeout: Duration,

    /// Overall timeout for one request including the body.
    pub request_timeout: Duration,

    /// Maximum idle connections kept per host.
    pub pool_max_idle_per_host: usize,

    /// How long an idle connection is kept before being closed.
    pub pool_idle_timeout: Duration,

    /// User agent sent on every request.
    pub user_agent: String,

    /// Accept TLS certificates that fail verification.
    pub accept_invalid_certs: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            pool_max_idle_per_host: 50,
            pool_idle_timeout: Duration::from_secs(90),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            accept_invalid_certs: true,
        }
    }
}
