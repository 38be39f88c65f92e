//! HTTP byte transport for binary artifacts.

use anchorage_core::{ArtifactError, ArtifactTransport};
use std::time::Duration;

pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Create a transport with a project user agent and a conservative
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new() -> Result<Self, ArtifactError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(format!("anchorage/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| ArtifactError::Download {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

impl ArtifactTransport for HttpTransport {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, ArtifactError> {
        let error = |reason: String| ArtifactError::Download {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(error(format!("server returned {}", response.status())));
        }
        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| error(e.to_string()))
    }
}
