use std::time::Duration;

use crate::errors::StreamError;

/// Configuration for the HTTP message source.
#[derive(Clone, Debug)]
pub struct HttpSourceConfig {
    /// Base URL the task endpoints are resolved against.
    pub base_url: String,
    /// Optional bearer token.
    pub auth_token: Option<String>,
    /// Timeout for one-shot history fetches. Streams are not bounded by it.
    pub timeout: Duration,
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
}

impl HttpSourceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Builds a config from `TASK_STREAM_BASE_URL` and the optional
    /// `TASK_STREAM_AUTH_TOKEN`.
    pub fn from_env() -> Result<Self, StreamError> {
        let base_url = std::env::var("TASK_STREAM_BASE_URL").unwrap_or_default();
        if base_url.trim().is_empty() {
            return Err(StreamError::Config(
                "missing TASK_STREAM_BASE_URL for HTTP message source".into(),
            ));
        }
        let mut config = Self::new(base_url.trim());
        if let Ok(token) = std::env::var("TASK_STREAM_AUTH_TOKEN")
            && !token.trim().is_empty()
        {
            config.auth_token = Some(token.trim().to_owned());
        }
        Ok(config)
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub(crate) fn parsed_base_url(&self) -> Result<reqwest::Url, StreamError> {
        let url = reqwest::Url::parse(self.base_url.trim())
            .map_err(|e| StreamError::Config(format!("invalid base_url {:?}: {e}", self.base_url)))?;
        if url.cannot_be_a_base() {
            return Err(StreamError::Config(format!(
                "base_url {:?} cannot be used as a base",
                self.base_url
            )));
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unparseable_base_url() {
        let err = HttpSourceConfig::new("not a url")
            .parsed_base_url()
            .expect_err("invalid");
        assert!(matches!(err, StreamError::Config(msg) if msg.contains("base_url")));
        assert!(
            HttpSourceConfig::new("mailto:someone@example.com")
                .parsed_base_url()
                .is_err()
        );
    }

    #[test]
    fn builder_setters_apply() {
        let config = HttpSourceConfig::new("http://localhost:8080/api")
            .auth_token("secret")
            .timeout(Duration::from_secs(5));
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(config.parsed_base_url().is_ok());
    }
}
