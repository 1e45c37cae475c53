//! Fetchers the CLI can build from configuration.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use datagate_orchestrator::{FetchError, Fetcher, Payload};
use reqwest::{Client, StatusCode};
use tracing::debug;

/// Placeholder replaced by the (URL-encoded) request key.
pub const KEY_PLACEHOLDER: &str = "{key}";

/// GETs a JSON document from a URL template such as
/// `https://api.example.com/quote?symbol={key}`.
pub struct HttpJsonFetcher {
    provider: String,
    client: Client,
    url_template: String,
    headers: HashMap<String, String>,
}

impl HttpJsonFetcher {
    pub fn new(
        provider: impl Into<String>,
        client: Client,
        url_template: impl Into<String>,
        headers: HashMap<String, String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            client,
            url_template: url_template.into(),
            headers,
        }
    }

    fn url_for(&self, key: &str) -> String {
        self.url_template
            .replace(KEY_PLACEHOLDER, &urlencoding::encode(key))
    }

    fn transient(&self, message: impl Into<String>) -> FetchError {
        FetchError::transient(self.provider.clone(), message)
    }

    /// Only 429 means rate limited. 401/403 are credential problems.
    fn status_error(&self, status: StatusCode, body: &str) -> FetchError {
        if status == StatusCode::TOO_MANY_REQUESTS {
            FetchError::RateLimited {
                provider: self.provider.clone(),
            }
        } else {
            self.transient(format!("HTTP {} - {}", status, body))
        }
    }
}

#[async_trait]
impl Fetcher for HttpJsonFetcher {
    async fn fetch(&self, key: &str, timeout: Duration) -> Result<Payload, FetchError> {
        let url = self.url_for(key);
        let mut request = self.client.get(&url).timeout(timeout);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        debug!("{} request: {}", self.provider, url);

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    provider: self.provider.clone(),
                    after: timeout,
                }
            } else {
                self.transient(format!("Request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.status_error(status, &body));
        }

        let text = response
            .text()
            .await
            .map_err(|e| self.transient(format!("Failed to read response: {}", e)))?;
        serde_json::from_str(&text).map_err(|e| FetchError::InvalidPayload {
            provider: self.provider.clone(),
            message: format!("Response is not JSON: {}", e),
        })
    }
}

/// Reads `<dir>/<key>.json`. Useful for offline runs and fixtures.
pub struct FileFetcher {
    provider: String,
    dir: PathBuf,
}

impl FileFetcher {
    pub fn new(provider: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            provider: provider.into(),
            dir: dir.into(),
        }
    }

    /// Keys must name a file directly inside `dir`.
    fn path_for(&self, key: &str) -> Result<PathBuf, FetchError> {
        let file_name = format!("{}.json", key);
        let mut components = Path::new(&file_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.dir.join(file_name)),
            _ => Err(FetchError::InvalidPayload {
                provider: self.provider.clone(),
                message: format!("Key '{}' is not a plain file name", key),
            }),
        }
    }
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&self, key: &str, _timeout: Duration) -> Result<Payload, FetchError> {
        let path = self.path_for(key)?;
        debug!("{} reading {}", self.provider, path.display());

        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            FetchError::transient(
                self.provider.clone(),
                format!("Failed to read {}: {}", path.display(), e),
            )
        })?;
        serde_json::from_str(&text).map_err(|e| FetchError::InvalidPayload {
            provider: self.provider.clone(),
            message: format!("{} is not JSON: {}", path.display(), e),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_url_for_encodes_key() {
        let fetcher = HttpJsonFetcher::new(
            "example",
            Client::new(),
            "https://api.example.com/quote?symbol={key}",
            HashMap::new(),
        );
        assert_eq!(
            fetcher.url_for("BRK B"),
            "https://api.example.com/quote?symbol=BRK%20B"
        );
    }

    #[test]
    fn test_status_errors() {
        let fetcher = HttpJsonFetcher::new(
            "example",
            Client::new(),
            "https://api.example.com/{key}",
            HashMap::new(),
        );

        assert_eq!(
            fetcher.status_error(StatusCode::TOO_MANY_REQUESTS, ""),
            FetchError::RateLimited {
                provider: "example".to_string()
            }
        );
        match fetcher.status_error(StatusCode::FORBIDDEN, "bad api key") {
            FetchError::Transient { provider, message } => {
                assert_eq!(provider, "example");
                assert!(message.contains("403"));
                assert!(message.contains("bad api key"));
            }
            other => panic!("expected transient error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_file_fetcher_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AAPL.json"), r#"{"price": 190.5}"#).unwrap();
        std::fs::write(dir.path().join("BAD.json"), "not json").unwrap();
        let fetcher = FileFetcher::new("fixtures", dir.path());
        let timeout = Duration::from_secs(1);

        let payload = fetcher.fetch("AAPL", timeout).await.unwrap();
        assert_eq!(payload, json!({"price": 190.5}));

        let missing = fetcher.fetch("MSFT", timeout).await.unwrap_err();
        assert!(matches!(missing, FetchError::Transient { .. }));

        let bad = fetcher.fetch("BAD", timeout).await.unwrap_err();
        assert!(matches!(bad, FetchError::InvalidPayload { .. }));
    }

    #[tokio::test]
    async fn test_file_fetcher_rejects_paths() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FileFetcher::new("fixtures", dir.path());

        let err = fetcher
            .fetch("../secrets", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidPayload { .. }));
    }
}
