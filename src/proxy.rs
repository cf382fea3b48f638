//! Generic pass-through to the horde for every route the gateway doesn't translate.
//!
//! Requests are forwarded with their method, path and (for GET) query string; bodies are streamed
//! in both directions and never buffered in full.
use crate::AppState;
use crate::auth::extract_bearer_token;
use crate::client::{HttpClient, send_with_timeout};
use crate::errors::GatewayError;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, instrument};

/// A deny-list of header names, compared case-insensitively.
#[derive(Debug, Clone, Copy)]
pub struct HeaderRules {
    deny: &'static [&'static str],
}

impl HeaderRules {
    pub const fn deny(deny: &'static [&'static str]) -> Self {
        Self { deny }
    }

    pub fn allows(&self, name: &HeaderName) -> bool {
        !self
            .deny
            .iter()
            .any(|denied| name.as_str().eq_ignore_ascii_case(denied))
    }

    /// Copies every allowed header, keeping repeated values.
    pub fn filter(&self, headers: &HeaderMap) -> HeaderMap {
        let mut filtered = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            if self.allows(name) {
                filtered.append(name.clone(), value.clone());
            }
        }
        filtered
    }
}

/// Headers dropped from inbound requests before forwarding.
///
/// `accept-encoding` is dropped so the upstream replies uncompressed: the relayed response loses
/// its `content-encoding` header.
pub const FORWARDED_REQUEST_HEADERS: HeaderRules =
    HeaderRules::deny(&["host", "content-length", "accept-encoding"]);

/// Headers dropped from upstream responses; the serving layer recomputes framing.
pub const RELAYED_RESPONSE_HEADERS: HeaderRules =
    HeaderRules::deny(&["content-encoding", "content-length", "transfer-encoding"]);

/// What part of the inbound request travels upstream, by method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarding {
    Query,
    Body,
    Bare,
}

impl Forwarding {
    pub fn for_method(method: &Method) -> Option<Self> {
        match *method {
            Method::GET => Some(Forwarding::Query),
            Method::POST | Method::PUT => Some(Forwarding::Body),
            Method::DELETE => Some(Forwarding::Bare),
            _ => None,
        }
    }
}

/// An upstream response on its way back: status, filtered headers, and a lazy body stream.
///
/// The body can only be consumed once; replaying it means re-issuing the upstream request.
#[derive(Debug)]
pub struct RelayedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl RelayedResponse {
    pub fn from_upstream(response: Response) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            status: parts.status,
            headers: RELAYED_RESPONSE_HEADERS.filter(&parts.headers),
            body,
        }
    }
}

impl IntoResponse for RelayedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Forwards any request to `<upstream>/<path>` and streams the answer back.
#[instrument(skip(state, req), fields(method = %req.method(), path = %req.uri().path()))]
pub async fn passthrough_handler<T: HttpClient + Clone + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
    req: Request,
) -> Result<RelayedResponse, GatewayError> {
    let forwarding = Forwarding::for_method(req.method()).ok_or(GatewayError::MethodNotAllowed)?;
    let (parts, body) = req.into_parts();

    let mut headers = FORWARDED_REQUEST_HEADERS.filter(&parts.headers);
    if let Some(token) = extract_bearer_token(&parts.headers) {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| GatewayError::MalformedRequest(format!("Invalid bearer token: {e}")))?;
        headers.insert(AUTHORIZATION, value);
    }

    let query = match forwarding {
        Forwarding::Query => parts.uri.query(),
        Forwarding::Body | Forwarding::Bare => None,
    };
    let body = match forwarding {
        Forwarding::Body => body,
        Forwarding::Query | Forwarding::Bare => Body::empty(),
    };
    let url = state.settings.endpoint(parts.uri.path(), query);
    debug!("Forwarding request to {}", url);

    let mut outbound = axum::http::Request::builder()
        .method(parts.method)
        .uri(url.as_str())
        .body(body)
        .map_err(proxy_failure)?;
    *outbound.headers_mut() = headers;

    let response = send_with_timeout(&state.http_client, outbound, state.settings.request_timeout)
        .await
        .map_err(proxy_failure)?;

    debug!(status = %response.status(), "Relaying upstream response");
    Ok(RelayedResponse::from_upstream(response))
}

fn proxy_failure(e: impl ToString) -> GatewayError {
    GatewayError::UpstreamRequestFailed {
        context: "Generic proxy request failed",
        details: e.to_string(),
    }
}
