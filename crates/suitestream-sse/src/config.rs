use std::time::Duration;

use suitestream_core::ConfigError;

use crate::decoder::DEFAULT_MAX_FRAME_BYTES;

/// Connection settings for [`crate::SseTransport`].
#[derive(Clone, Debug)]
pub struct SseClientConfig {
    /// Server origin, e.g. `http://localhost:8787`.
    pub base_url: String,
    /// Path of the run stream endpoint; the run id is passed as `runId`.
    pub stream_path: String,
    /// Timeout for establishing the TCP/TLS connection. The stream itself has no timeout.
    pub connect_timeout: Duration,
    /// Largest unterminated frame kept in memory before the stream is dropped.
    pub max_frame_bytes: usize,
}

impl SseClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            stream_path: "/api/stream".to_string(),
            connect_timeout: Duration::from_secs(10),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Builds a config from `SUITESTREAM_BASE_URL` (and optional `SUITESTREAM_STREAM_PATH`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("SUITESTREAM_BASE_URL").unwrap_or_default();
        if base_url.trim().is_empty() {
            return Err(ConfigError::new("missing SUITESTREAM_BASE_URL"));
        }
        let mut config = Self::new(base_url.trim());
        if let Ok(path) = std::env::var("SUITESTREAM_STREAM_PATH")
            && !path.trim().is_empty()
        {
            config = config.stream_path(path.trim());
        }
        Ok(config)
    }

    pub fn stream_path(mut self, stream_path: impl Into<String>) -> Self {
        self.stream_path = stream_path.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.base_url.trim();
        if base.is_empty() {
            return Err(ConfigError::new("base_url must not be empty"));
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::new(format!(
                "base_url must be an http(s) URL: {base}"
            )));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::new("max_frame_bytes must be positive"));
        }
        Ok(())
    }

    pub(crate) fn stream_url(&self) -> String {
        let path = self.stream_path.trim();
        format!(
            "{}/{}",
            self.base_url.trim().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_joins_without_duplicate_slashes() {
        let config = SseClientConfig::new("http://localhost:8787/");
        assert_eq!(config.stream_url(), "http://localhost:8787/api/stream");
        let config = config.stream_path("events");
        assert_eq!(config.stream_url(), "http://localhost:8787/events");
    }

    #[test]
    fn validation_requires_http_base() {
        assert!(SseClientConfig::new("").validate().is_err());
        assert!(SseClientConfig::new("localhost:8787").validate().is_err());
        assert!(SseClientConfig::new("https://ci.example").validate().is_ok());
        assert!(
            SseClientConfig::new("https://ci.example")
                .max_frame_bytes(0)
                .validate()
                .is_err()
        );
    }
}
