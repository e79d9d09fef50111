//! HTTP Client Abstraction
//!
//! Provides ranged streaming downloads and the retry policy shared by every
//! transport in the workspace.

use async_trait::async_trait;
use core_async::io::BoxAsyncRead;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// HTTP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
}

/// HTTP request builder
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    /// Upper bound on waiting for the response headers.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Request the open-ended byte range starting at `start`.
    pub fn range_from(self, start: u64) -> Self {
        self.header("Range", format!("bytes={}-", start))
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }
}

fn find_header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Parsed `Content-Range: bytes <start>-<end>/<total>` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// `None` when the server answered with `*`.
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (range, total) = rest.split_once('/')?;
        let (start, end) = range.split_once('-')?;
        let start = start.trim().parse().ok()?;
        let end = end.trim().parse().ok()?;
        if end < start {
            return None;
        }
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse().ok()?),
        };
        Some(Self { start, end, total })
    }
}

/// Streaming HTTP response whose body is consumed incrementally.
pub struct HttpStreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: BoxAsyncRead,
}

impl HttpStreamResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length")?.trim().parse().ok()
    }

    pub fn content_range(&self) -> Option<ContentRange> {
        ContentRange::parse(self.header("Content-Range")?)
    }

    /// Whether the server advertised byte-range support.
    pub fn accepts_ranges(&self) -> bool {
        self.status == 206
            || self
                .header("Accept-Ranges")
                .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
                .unwrap_or(false)
    }
}

impl fmt::Debug for HttpStreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Whether to use exponential backoff
    pub use_exponential_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            use_exponential_backoff: true,
        }
    }
}

impl RetryPolicy {
    /// No retries at all: the first failure is final.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if !self.use_exponential_backoff {
            return self.base_delay.min(self.max_delay);
        }
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts_made` failures.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Async HTTP client trait
///
/// This trait abstracts HTTP operations to allow platform-specific implementations.
/// Implementations should handle TLS certificate validation and connection
/// pooling.
///
/// `open_stream` must *not* retry on its own: the caller owns the retry
/// budget so that reconnects resume at the right byte offset.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::http::{HttpClient, HttpRequest};
///
/// async fn open_at(client: &dyn HttpClient, url: &str, offset: u64) -> Result<HttpStreamResponse> {
///     client.open_stream(HttpRequest::get(url).range_from(offset)).await
/// }
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Send a request and return as soon as headers arrive, leaving the body
    /// to be read incrementally.
    ///
    /// Non-2xx responses other than `416 Range Not Satisfiable` are reported
    /// as [`BridgeError::Status`](crate::error::BridgeError::Status).
    async fn open_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_request_builder() {
        let request = HttpRequest::get("https://example.com/a.ogg")
            .header("User-Agent", "test")
            .range_from(1024)
            .timeout(Duration::from_secs(30));

        assert_eq!(request.url, "https://example.com/a.ogg");
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.headers.get("Range"), Some(&"bytes=1024-".to_string()));
        assert_eq!(request.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_stream_response_status_checks() {
        let response = HttpStreamResponse {
            status: 200,
            headers: HashMap::from([("content-type".to_string(), "audio/ogg".to_string())]),
            body: Box::new(std::io::Cursor::new(Vec::<u8>::new())),
        };

        assert!(!response.accepts_ranges());
        assert_eq!(response.content_range(), None);
        assert_eq!(response.header("Content-Type"), Some("audio/ogg"));
    }

    #[test]
    fn test_content_range_parse() {
        assert_eq!(
            ContentRange::parse("bytes 100-199/1000"),
            Some(ContentRange {
                start: 100,
                end: 199,
                total: Some(1000)
            })
        );
        assert_eq!(
            ContentRange::parse("bytes 0-9/*"),
            Some(ContentRange {
                start: 0,
                end: 9,
                total: None
            })
        );
        assert_eq!(ContentRange::parse("bytes 9-0/10"), None);
        assert_eq!(ContentRange::parse("items 0-9/10"), None);
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            use_exponential_backoff: true,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert!(policy.allows_retry(4));
        assert!(!policy.allows_retry(5));
    }

    #[test]
    fn test_retry_policy_constant() {
        let policy = RetryPolicy {
            use_exponential_backoff: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(3), policy.base_delay);
        assert!(!RetryPolicy::none().allows_retry(1));
    }

    #[test]
    fn test_stream_response_headers() {
        let response = HttpStreamResponse {
            status: 206,
            headers: HashMap::from([
                ("content-range".to_string(), "bytes 10-19/20".to_string()),
                ("content-length".to_string(), "10".to_string()),
            ]),
            body: Box::new(std::io::Cursor::new(Vec::<u8>::new())),
        };

        assert!(response.accepts_ranges());
        assert_eq!(response.content_length(), Some(10));
        assert_eq!(response.content_range().map(|r| r.total), Some(Some(20)));
    }
}
