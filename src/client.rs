//! HTTP client abstraction for talking to the horde
//!
//! This module provides a unified interface for making HTTP requests, allowing
//! different client implementations (hyper, mock clients for testing, etc.) to
//! be used interchangeably by the orchestrator, the model resolver and the
//! pass-through proxy.
use async_trait::async_trait;
use axum::response::IntoResponse;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use std::time::Duration;

pub type HyperClient = Client<hyper_tls::HttpsConnector<HttpConnector>, axum::body::Body>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait HttpClient: std::fmt::Debug {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, BoxError>;
}

#[async_trait]
impl HttpClient for HyperClient {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, BoxError> {
        self.request(req)
            .await
            .map(|res| res.into_response())
            .map_err(|e| Box::new(e) as BoxError)
    }
}

/// Connection settings for the pooled upstream client.
#[derive(Debug, Clone, Copy)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 100,
        }
    }
}

pub fn create_hyper_client(settings: ClientSettings) -> HyperClient {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(settings.connect_timeout));
    let https = hyper_tls::HttpsConnector::new_with_connector(http);

    tracing::debug!(
        "HTTP client config: connect_timeout={:?}, idle_timeout={:?}, max_idle_per_host={}",
        settings.connect_timeout,
        settings.pool_idle_timeout,
        settings.pool_max_idle_per_host
    );

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(settings.pool_idle_timeout)
        .pool_max_idle_per_host(settings.pool_max_idle_per_host)
        .pool_timer(hyper_util::rt::TokioTimer::new())
        .build(https)
}

/// Largest JSON body the gateway will buffer from the horde API.
pub const MAX_JSON_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Sends a request and buffers the whole (JSON) response body, all within `timeout`.
pub async fn send_for_bytes<T: HttpClient + ?Sized>(
    client: &T,
    req: axum::extract::Request,
    timeout: Duration,
) -> Result<(axum::http::StatusCode, axum::body::Bytes), BoxError> {
    let exchange = async {
        let response = client.request(req).await?;
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), MAX_JSON_BODY_BYTES)
            .await
            .map_err(|e| Box::new(e) as BoxError)?;
        Ok::<_, BoxError>((status, body))
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(format!("no response from upstream within {timeout:?}").into()),
    }
}

/// Sends a request, failing if the response head does not arrive within `timeout`.
///
/// The body is not covered: streamed pass-through responses may legitimately outlive it.
pub async fn send_with_timeout<T: HttpClient + ?Sized>(
    client: &T,
    req: axum::extract::Request,
    timeout: Duration,
) -> Result<axum::response::Response, BoxError> {
    match tokio::time::timeout(timeout, client.request(req)).await {
        Ok(result) => result,
        Err(_) => Err(format!("no response from upstream within {timeout:?}").into()),
    }
}
