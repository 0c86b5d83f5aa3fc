use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    Router,
    body::{Body as AxumBody, Bytes},
    extract::State,
    http::{HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::post,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::{
    config::ServerConfig,
    core::{FetchEngine, FetchError},
    ports::http_client::HttpClient,
    tracing_setup::create_request_span,
};

/// Inbound request body: `{"urls": [...]}`
///
/// A missing or `null` list is treated as empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchRequestPayload {
    #[serde(default)]
    pub urls: Option<Vec<String>>,
}

/// Outbound response body: `{"data": {url: body, ...}}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResponsePayload {
    pub data: HashMap<String, String>,
}

/// Error type for the fetch endpoint
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HandlerError {
    #[error("Invalid JSON payload: {0}")]
    MalformedRequest(String),
    #[error("Request limit exceeded: maximum {max} URLs allowed, got {count}")]
    PayloadTooLarge { count: usize, max: usize },
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            HandlerError::MalformedRequest(_) | HandlerError::PayloadTooLarge { .. } => {
                StatusCode::BAD_REQUEST
            }
            HandlerError::Timeout(_) | HandlerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

/// Handler for the fan-out endpoint
pub struct HttpHandler {
    engine: Arc<FetchEngine>,
    max_urls: usize,
    request_deadline: Duration,
}

impl HttpHandler {
    pub fn new(engine: Arc<FetchEngine>, max_urls: usize, request_deadline: Duration) -> Self {
        Self {
            engine,
            max_urls,
            request_deadline,
        }
    }

    /// Build the handler (and its engine) from configuration.
    pub fn from_config(config: &ServerConfig, http_client: Arc<dyn HttpClient>) -> eyre::Result<Self> {
        let limits = config.fetch.limits().map_err(|e| eyre::eyre!(e))?;
        let request_deadline = config.fetch.request_deadline().map_err(|e| eyre::eyre!(e))?;
        let engine = Arc::new(FetchEngine::new(http_client, limits));
        Ok(Self::new(engine, config.fetch.max_urls, request_deadline))
    }

    /// Router serving the endpoint on every path; any method but POST gets `405`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", post(fetch_route))
            .route("/{*path}", post(fetch_route))
            .with_state(self)
            .layer(TraceLayer::new_for_http())
    }

    /// Decode the payload, run the batch and encode the result.
    pub async fn handle_fetch(&self, body: &[u8]) -> Result<Response, HandlerError> {
        // A bare `null` body decodes to no payload at all.
        let payload: Option<FetchRequestPayload> = serde_json::from_slice(body)
            .map_err(|e| HandlerError::MalformedRequest(e.to_string()))?;
        let urls = payload.and_then(|p| p.urls).unwrap_or_default();

        if urls.len() > self.max_urls {
            return Err(HandlerError::PayloadTooLarge {
                count: urls.len(),
                max: self.max_urls,
            });
        }
        tracing::Span::current().record("urls", urls.len());

        let result = self
            .engine
            .run(&urls, self.request_deadline)
            .await
            .map_err(|e| match e {
                FetchError::BatchTimeout { .. } => HandlerError::Timeout(e.to_string()),
            })?;

        tracing::info!(
            requested = urls.len(),
            fetched = result.len(),
            outcome = ?result.outcome(),
            "Fetch batch completed"
        );

        let response = FetchResponsePayload {
            data: result.into_data(),
        };
        let json = serde_json::to_vec(&response)
            .map_err(|e| HandlerError::Internal(format!("Failed to generate JSON response: {e}")))?;

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(AxumBody::from(json))
            .map_err(|e| HandlerError::Internal(e.to_string()))
    }
}

async fn fetch_route(State(handler): State<Arc<HttpHandler>>, uri: Uri, body: Bytes) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let span = create_request_span("POST", uri.path(), &request_id);
    let started = Instant::now();

    let mut response = match handler.handle_fetch(&body).instrument(span.clone()).await {
        Ok(response) => response,
        Err(e) => {
            span.in_scope(|| tracing::warn!(error = %e, "Fetch request rejected"));
            e.into_response()
        }
    };

    span.record("http.status_code", response.status().as_u16());
    span.record("duration_ms", started.elapsed().as_millis() as u64);

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("X-Request-ID", value);
    }
    response
}
