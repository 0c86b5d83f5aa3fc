use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

const DEFAULT_USER_AGENT: &str = concat!("fetchgate/", env!("CARGO_PKG_VERSION"));

/// Outbound HTTP client adapter using Hyper with Rustls.
///
/// Plain `http://` and `https://` targets are both supported. Idle connections
/// are never kept around, so every fetch opens its own connection.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
    user_agent: HeaderValue,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new() -> Result<Self> {
        Self::with_user_agent(DEFAULT_USER_AGENT)
    }

    /// Create an adapter that sends `user_agent` on requests that carry none.
    pub fn with_user_agent(user_agent: &str) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let user_agent = HeaderValue::from_str(user_agent)
            .map_err(|e| eyre::eyre!("Invalid user agent '{user_agent}': {e}"))?;

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::debug!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build::<_, AxumBody>(https_connector);

        tracing::info!("Created outbound HTTP client (HTTP/1.1, no connection reuse)");
        Ok(Self { client, user_agent })
    }

    /// Fill in the headers every outbound request carries.
    fn add_common_headers(&self, req: &mut Request<AxumBody>) -> HttpClientResult<()> {
        let host_header = match req.uri().host() {
            Some(host) => {
                let value = match req.uri().port() {
                    Some(port) => format!("{host}:{}", port.as_u16()),
                    None => host.to_string(),
                };
                HeaderValue::from_str(&value)
                    .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?
            }
            None => {
                return Err(HttpClientError::InvalidRequest(format!(
                    "Outgoing URI has no host: {}",
                    req.uri()
                )));
            }
        };

        let headers = req.headers_mut();
        headers.insert(header::HOST, host_header);
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(header::USER_AGENT, self.user_agent.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        self.add_common_headers(&mut req)?;

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;

        tracing::debug!("Sending request: {} {}", parts.method, parts.uri);

        let method = parts.method.clone();
        let uri = parts.uri.clone();

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                tracing::Span::current().record("http.status_code", response.status().as_u16());

                let (mut parts, hyper_body) = response.into_parts();
                parts.headers.remove(header::TRANSFER_ENCODING);

                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(e) => {
                tracing::Span::current().record("http.status_code", 599u16);
                tracing::debug!("Request {} {} failed: {}", method, uri, e);

                Err(HttpClientError::ConnectionError(format!(
                    "Request to {method} {uri} failed: {e}"
                )))
            }
        }
    }
}
