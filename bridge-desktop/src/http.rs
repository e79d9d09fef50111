//! HTTP Client Implementation using Reqwest

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    http::{HttpClient, HttpMethod, HttpRequest, HttpStreamResponse},
};
use futures_util::TryStreamExt;
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("audio-playback-core/", env!("CARGO_PKG_VERSION"));

/// Reqwest-based HTTP client implementation
///
/// A request's timeout bounds the wait for response headers only. Body reads
/// are bounded per read by the caller, since an audio download legitimately
/// outlives any fixed request deadline.
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    /// Create a new HTTP client with default configuration
    pub fn new() -> Result<Self> {
        Self::with_connect_timeout(Duration::from_secs(10))
    }

    /// Create a new HTTP client with a custom connect timeout
    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(10)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| BridgeError::NotAvailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    fn convert_method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
        }
    }

    fn build_request(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let method = Self::convert_method(request.method);
        let mut req = self.client.request(method, &request.url);

        for (key, value) in &request.headers {
            req = req.header(key, value);
        }

        req
    }

    fn classify(error: reqwest::Error) -> BridgeError {
        if error.is_timeout() {
            BridgeError::Timeout(error.to_string())
        } else if error.is_connect() || error.is_request() {
            BridgeError::Connection(error.to_string())
        } else if let Some(status) = error.status() {
            BridgeError::Status {
                status: status.as_u16(),
                message: error.to_string(),
            }
        } else {
            BridgeError::OperationFailed(error.to_string())
        }
    }

    fn collect_headers(response: &reqwest::Response) -> HashMap<String, String> {
        response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn open_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse> {
        debug!(url = %request.url, range = ?request.headers.get("Range"), "Opening HTTP stream");

        let send = self.build_request(&request).send();
        let response = match request.timeout {
            Some(limit) => tokio::time::timeout(limit, send).await.map_err(|_| {
                BridgeError::Timeout(format!("no response headers within {:?}", limit))
            })?,
            None => send.await,
        }
        .map_err(Self::classify)?;

        let status = response.status().as_u16();
        if !response.status().is_success() && status != 416 {
            return Err(BridgeError::Status {
                status,
                message: format!("HTTP error: {}", response.status()),
            });
        }

        let headers = Self::collect_headers(&response);
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let reader = tokio_util::io::StreamReader::new(stream);

        Ok(HttpStreamResponse {
            status,
            headers,
            body: Box::new(reader),
        })
    }
}
