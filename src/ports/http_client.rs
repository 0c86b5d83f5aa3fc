use async_trait::async_trait;
use axum::body::Body as AxumBody;
use http_body_util::{BodyExt, Limited};
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to the upstream fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {0} ms")]
    Timeout(u64),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Error while reading the response body (I/O failure or size cap)
    #[error("Failed to read response body from {url}: {reason}")]
    Body { url: String, reason: String },

    /// Response body could not be decoded as text
    #[error("Response body from {url} is not valid UTF-8")]
    Decode { url: String },
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making outbound HTTP requests
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to an upstream server
    ///
    /// # Arguments
    /// * `req` - The HTTP request to send
    ///
    /// # Returns
    /// A future that resolves to the upstream's response or an error
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;

    /// Fetch `url` with a plain GET and return the whole body as text.
    ///
    /// The status code is not inspected; whatever body the upstream sends is
    /// returned. Bodies larger than `max_body_bytes` or not valid UTF-8 are
    /// errors.
    async fn get_text(&self, url: &str, max_body_bytes: usize) -> HttpClientResult<String> {
        let request = Request::builder()
            .method("GET")
            .uri(url)
            .body(AxumBody::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        let response = self.send_request(request).await?;
        let status = response.status();

        let bytes = Limited::new(response.into_body(), max_body_bytes)
            .collect()
            .await
            .map_err(|e| HttpClientError::Body {
                url: url.to_string(),
                reason: e.to_string(),
            })?
            .to_bytes();

        tracing::debug!(url, status = status.as_u16(), bytes = bytes.len(), "Fetched body");

        String::from_utf8(bytes.to_vec()).map_err(|_| HttpClientError::Decode {
            url: url.to_string(),
        })
    }
}
