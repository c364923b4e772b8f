//! Blocking HTTP transport for tile servers.
//!
//! Tile fetches are plain GETs against template-derived URLs, but tile
//! servers fail in two distinct ways that the caller treats differently:
//! transient trouble (5xx, throttling, connection drops) is worth
//! retrying on the spot, while a definitive status (404 for an empty
//! tile, 403) is not. [`HttpError`] keeps that distinction;
//! [`WebLayerFactory`](super::WebLayerFactory) drives its retry loop off
//! [`HttpError::is_transient`].
//!
//! The transport is injected as a trait object so factory tests run
//! against scripted responses instead of live servers.

use std::time::Duration;

use bytes::Bytes;

use super::ProviderError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A failed tile fetch, split by retryability.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HttpError {
    /// The server answered with a non-success status.
    #[error("HTTP {code} from {url}")]
    Status {
        /// Response status code.
        code: u16,
        /// The URL that was requested.
        url: String,
    },

    /// The request never produced a usable response (DNS, connect,
    /// timeout, truncated body).
    #[error("transport error: {0}")]
    Transport(String),
}

impl HttpError {
    /// Whether retrying the same URL may plausibly succeed.
    ///
    /// Server-side errors and throttling are transient; any other
    /// status is the server's final word on this tile. Transport
    /// failures are treated as transient since tile fetches run for
    /// minutes against the same host.
    pub fn is_transient(&self) -> bool {
        match self {
            HttpError::Status { code, .. } => *code == 429 || (500..=599).contains(code),
            HttpError::Transport(_) => true,
        }
    }
}

impl From<HttpError> for ProviderError {
    fn from(err: HttpError) -> Self {
        ProviderError::Http(err.to_string())
    }
}

/// Blocking tile-server transport.
pub trait HttpClient: Send + Sync {
    /// GET `url` and return the full response body.
    fn fetch(&self, url: &str) -> Result<Bytes, HttpError>;
}

/// Production transport backed by a blocking `reqwest` client.
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

impl ReqwestClient {
    /// Client with the default 30 second timeout.
    pub fn new() -> Result<Self, ProviderError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Client with an explicit per-request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("terrastream/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Http(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    fn fetch(&self, url: &str) -> Result<Bytes, HttpError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| HttpError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::Status {
                code: status.as_u16(),
                url: url.to_string(),
            });
        }

        response
            .bytes()
            .map_err(|e| HttpError::Transport(e.to_string()))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Scripted transport: hands out queued responses in order and
    /// records every URL it was asked for.
    pub struct MockHttpClient {
        responses: Mutex<VecDeque<Result<Bytes, HttpError>>>,
        requested: Mutex<Vec<String>>,
    }

    impl MockHttpClient {
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                requested: Mutex::new(Vec::new()),
            }
        }

        /// A client that answers every fetch queued here, in order.
        pub fn scripted(
            responses: impl IntoIterator<Item = Result<Bytes, HttpError>>,
        ) -> Self {
            let client = Self::new();
            *client.responses.lock() = responses.into_iter().collect();
            client
        }

        /// A client that answers a single fetch.
        pub fn once(response: Result<Bytes, HttpError>) -> Self {
            Self::scripted([response])
        }

        /// Every URL fetched so far, in order.
        pub fn requested_urls(&self) -> Vec<String> {
            self.requested.lock().clone()
        }
    }

    impl HttpClient for MockHttpClient {
        fn fetch(&self, url: &str) -> Result<Bytes, HttpError> {
            self.requested.lock().push(url.to_string());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(HttpError::Transport("no scripted response".into())))
        }
    }

    #[test]
    fn test_scripted_responses_in_order() {
        let mock = MockHttpClient::scripted([
            Ok(Bytes::from_static(b"first")),
            Err(HttpError::Transport("reset".into())),
        ]);

        assert_eq!(mock.fetch("http://a").unwrap(), Bytes::from_static(b"first"));
        assert!(mock.fetch("http://b").is_err());
        assert_eq!(mock.requested_urls(), ["http://a", "http://b"]);
    }

    #[test]
    fn test_exhausted_script_is_transport_error() {
        let mock = MockHttpClient::new();
        assert!(matches!(
            mock.fetch("http://a"),
            Err(HttpError::Transport(_))
        ));
    }

    #[test]
    fn test_transient_classification() {
        let status = |code| HttpError::Status {
            code,
            url: "http://t/1/2/3".into(),
        };
        assert!(status(500).is_transient());
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(404).is_transient());
        assert!(!status(403).is_transient());
        assert!(HttpError::Transport("timed out".into()).is_transient());
    }

    #[test]
    fn test_status_error_names_url() {
        let err = HttpError::Status {
            code: 404,
            url: "http://t/1/2/3".into(),
        };
        assert_eq!(err.to_string(), "HTTP 404 from http://t/1/2/3");
    }
}
