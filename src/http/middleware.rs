//! Rate limit middleware.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::debug;

use super::routes::AppState;
use crate::ratelimit::{ClientIdentity, Decision, Quota, Rejection, UserIdentity};

const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Check every request against the rate limiter before it reaches a handler.
///
/// The endpoint is the route template the request matched, not the raw URI.
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = ClientIdentity::from_headers(request.headers(), peer);
    let user = UserIdentity::from_headers(request.headers());
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let decision = state.limiter.check(
        client.as_str(),
        user.as_ref().map(UserIdentity::as_str),
        &endpoint,
    );

    match decision {
        Decision::Rejected(rejection) => {
            debug!(
                ip = %client,
                endpoint = %endpoint,
                reason = %rejection.reason,
                retry_after = rejection.retry_after_secs,
                "Request rate limited"
            );
            rejection.into_response()
        }
        Decision::Allowed { quota } => {
            let mut response = next.run(request).await;
            if let Some(quota) = quota {
                insert_quota_headers(response.headers_mut(), &quota);
            }
            response
        }
    }
}

fn insert_quota_headers(headers: &mut HeaderMap, quota: &Quota) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(quota.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(quota.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(quota.reset_after_secs));
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.reason.message(),
            "reason": self.reason,
            "retry_after": self.retry_after_secs,
        }));
        (
            StatusCode::TOO_MANY_REQUESTS,
            [(RETRY_AFTER, HeaderValue::from(self.retry_after_secs))],
            body,
        )
            .into_response()
    }
}
