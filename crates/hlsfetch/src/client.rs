use reqwest::{Client, Response};

use crate::config::FetchConfig;
use crate::error::DownloadError;

/// Build the process-wide pooled client from a [`FetchConfig`].
pub fn build_client(config: &FetchConfig) -> Result<Client, DownloadError> {
    Client::builder()
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .user_agent(&config.user_agent)
        .build()
        .map_err(DownloadError::from)
}

/// GET `url` and hand back the streaming response.
///
/// Any non-2xx status is a fatal [`DownloadError::HttpStatus`]; callers that
/// want another attempt route it through their own retry path.
pub async fn get(
    client: &Client,
    url: &str,
    operation: &'static str,
) -> Result<Response, DownloadError> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(DownloadError::http_status(response.status(), url, operation));
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_default_config() {
        assert!(build_client(&FetchConfig::default()).is_ok());
    }
}
