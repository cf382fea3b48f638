//! Hordegate - an OpenAI-compatible gateway for the AI Horde
//!
//! This library translates OpenAI chat completion requests into asynchronous horde text
//! generation jobs, polls them to completion and answers in the OpenAI response shape. Every other
//! request is passed through to the horde API unchanged.

use axum::Router;
use axum::routing::{any, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, instrument};

pub mod auth;
pub mod client;
pub mod errors;
pub mod handlers;
pub mod horde;
pub mod models;
pub mod params;
pub mod prompt;
pub mod proxy;
pub mod resolver;
pub mod settings;
pub mod tunnel;

use client::{ClientSettings, HttpClient, HyperClient};
use handlers::chat_completions;
use proxy::passthrough_handler;
use settings::HordeSettings;

/// The main application state: the HTTP client and the immutable horde settings
#[derive(Clone, Debug)]
pub struct AppState<T: HttpClient> {
    pub http_client: T,
    pub settings: Arc<HordeSettings>,
}

impl AppState<HyperClient> {
    /// Create a new AppState with the default Hyper client
    pub fn new(settings: HordeSettings, client_settings: ClientSettings) -> Self {
        Self {
            http_client: client::create_hyper_client(client_settings),
            settings: Arc::new(settings),
        }
    }
}

impl<T: HttpClient> AppState<T> {
    /// Create a new AppState with a custom HTTP client (useful for testing)
    pub fn with_client(settings: HordeSettings, http_client: T) -> Self {
        Self {
            http_client,
            settings: Arc::new(settings),
        }
    }
}

/// Build the main router for the gateway
/// This creates routes for:
/// - `POST /v1/chat/completions` - Translated into a horde async job
/// - `/{*path}` and other methods on `/v1/chat/completions` - Passed through to the horde API
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .route(
            "/v1/chat/completions",
            post(chat_completions::<T>).fallback(passthrough_handler::<T>),
        )
        .route("/{*path}", any(passthrough_handler::<T>))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// # Parameters
/// - `prefix`: A string prefix for the metrics. The `'static` lifetime is required by the
///   Prometheus metrics layer.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}

/// Recording HTTP client doubles, shared by unit and integration tests.
#[doc(hidden)]
pub mod test_utils {
    use super::*;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use axum::response::Response;
    use crate::client::BoxError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Responder = dyn Fn(&MockRequest) -> Result<Response, String> + Send + Sync;

    pub struct MockHttpClient {
        pub requests: Arc<Mutex<Vec<MockRequest>>>,
        responder: Arc<Responder>,
    }

    #[derive(Debug, Clone)]
    pub struct MockRequest {
        pub method: String,
        pub uri: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl MockRequest {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        }
    }

    pub fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap()
    }

    impl MockHttpClient {
        pub fn new(status: StatusCode, body: &str) -> Self {
            let body = body.to_string();
            Self::with_responder(move |_| {
                Ok(Response::builder()
                    .status(status)
                    .body(axum::body::Body::from(body.clone()))
                    .unwrap())
            })
        }

        pub fn new_streaming(status: StatusCode, chunks: Vec<String>) -> Self {
            Self::with_responder(move |_| {
                use axum::body::Body;
                use futures_util::stream;

                let stream = stream::iter(
                    chunks
                        .clone()
                        .into_iter()
                        .map(|chunk| Ok::<_, std::io::Error>(chunk.into_bytes())),
                );

                Ok(Response::builder()
                    .status(status)
                    .header("content-type", "text/event-stream")
                    .header("content-length", "999")
                    .header("content-encoding", "identity")
                    .header("cache-control", "no-cache")
                    .body(Body::from_stream(stream))
                    .unwrap())
            })
        }

        /// Answers every request with whatever `responder` returns; `Err` simulates a transport
        /// failure.
        pub fn with_responder(
            responder: impl Fn(&MockRequest) -> Result<Response, String> + Send + Sync + 'static,
        ) -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                responder: Arc::new(responder),
            }
        }

        pub fn failing(message: &str) -> Self {
            let message = message.to_string();
            Self::with_responder(move |_| Err(message.clone()))
        }

        pub fn get_requests(&self) -> Vec<MockRequest> {
            self.requests.lock().unwrap().clone()
        }

        /// Recorded requests whose URI contains `fragment`.
        pub fn requests_to(&self, fragment: &str) -> Vec<MockRequest> {
            self.get_requests()
                .into_iter()
                .filter(|request| request.uri.contains(fragment))
                .collect()
        }
    }

    /// A fake horde: model stats, job submission returning `job_id`, and job status answers
    /// played back in order (the last one repeats).
    pub fn scripted_horde(
        stats: serde_json::Value,
        job_id: &str,
        statuses: Vec<serde_json::Value>,
    ) -> MockHttpClient {
        let job_id = job_id.to_string();
        let polls = AtomicUsize::new(0);
        MockHttpClient::with_responder(move |request| {
            if request.uri.ends_with("/stats/text/models") {
                Ok(json_response(StatusCode::OK, stats.clone()))
            } else if request.uri.ends_with("/generate/text/async") {
                Ok(json_response(
                    StatusCode::ACCEPTED,
                    serde_json::json!({"id": job_id, "kudos": 10.0}),
                ))
            } else if request.uri.contains("/generate/text/status/") {
                let poll = polls.fetch_add(1, Ordering::SeqCst);
                let status = statuses
                    .get(poll)
                    .or(statuses.last())
                    .cloned()
                    .unwrap_or_default();
                Ok(json_response(StatusCode::OK, status))
            } else {
                Ok(json_response(
                    StatusCode::NOT_FOUND,
                    serde_json::json!({"message": "not found"}),
                ))
            }
        })
    }

    impl std::fmt::Debug for MockHttpClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockHttpClient")
                .field("requests", &self.requests)
                .field("responder", &"<closure>")
                .finish()
        }
    }

    impl Clone for MockHttpClient {
        fn clone(&self) -> Self {
            Self {
                requests: Arc::clone(&self.requests),
                responder: Arc::clone(&self.responder),
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn request(&self, req: axum::extract::Request) -> Result<Response, BoxError> {
            // Extract request details
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let headers = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();

            // Read body
            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .map_err(|e| Box::new(e) as BoxError)?
                .to_vec();

            let mock_request = MockRequest {
                method,
                uri,
                headers,
                body,
            };
            let response = (self.responder)(&mock_request);
            self.requests.lock().unwrap().push(mock_request);

            response.map_err(BoxError::from)
        }
    }
}
