/// Bearer token handling. The gateway never validates tokens itself: the token is the caller's
/// horde API key and is passed through to the upstream.
use crate::errors::GatewayError;
use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

const BEARER_PREFIX: &str = "Bearer ";

/// Extracts the token from an `Authorization: Bearer <token>` header.
///
/// Only the first space-separated word after the prefix is taken, so trailing garbage is ignored.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix(BEARER_PREFIX)?
        .split(' ')
        .next()
        .filter(|token| !token.is_empty())
}

/// Extractor for a required bearer token. Rejects with 401 before the body is read.
#[derive(Clone, Debug)]
pub struct BearerToken(pub String);

impl<S> FromRequestParts<S> for BearerToken
where
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        extract_bearer_token(&parts.headers)
            .map(|token| BearerToken(token.to_owned()))
            .ok_or(GatewayError::AuthenticationRequired)
    }
}
