//! HTTP API for the recent-tracks service
//!
//! Exposes `GET /recent-tracks?limit=N` on top of a [`SnapshotCache`] and logs
//! one line per request with its route, method, user agent, cache status,
//! duration and response status.

use std::time::Instant;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use thiserror::Error;
use tracing::{error, info};

use crate::cache::{CacheLookup, SnapshotCache};
use crate::data::{FetchError, FetchParams, TrackSource, DEFAULT_LIMIT, MAX_LIMIT};

/// Route serving the cached recent tracks
pub const RECENT_TRACKS_ROUTE: &str = "/recent-tracks";

/// Response header telling whether the body came from the cache
pub const CACHE_STATUS_HEADER: &str = "x-cache";

/// Rejections of the `limit` query parameter
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimitError {
    #[error("Invalid limit parameter")]
    NotANumber,

    #[error("Limit is too high (>50)")]
    TooHigh,

    #[error("Limit must be positive")]
    NotPositive,
}

/// Parses the optional `limit` parameter; absent or empty means [`DEFAULT_LIMIT`]
pub fn parse_limit(raw: Option<&str>) -> Result<u32, LimitError> {
    let raw = match raw {
        None | Some("") => return Ok(DEFAULT_LIMIT),
        Some(raw) => raw,
    };

    let limit: i64 = raw.parse().map_err(|_| LimitError::NotANumber)?;
    if limit < 1 {
        return Err(LimitError::NotPositive);
    }
    if limit > i64::from(MAX_LIMIT) {
        return Err(LimitError::TooHigh);
    }
    Ok(limit as u32)
}

/// First value of `key` in the query string; later repeats are ignored
fn first_param<'a>(query: &'a [(String, String)], key: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
}

// ============ Error handling ============

enum ApiError {
    InvalidLimit(LimitError),
    Upstream(FetchError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::InvalidLimit(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            ApiError::Upstream(err) => (StatusCode::BAD_GATEWAY, err.to_string()),
        };

        let body = Json(serde_json::json!({ "error": message }));
        (status, cors_headers(), body).into_response()
    }
}

fn cors_headers() -> [(header::HeaderName, HeaderValue); 1] {
    [(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    )]
}

/// Creates the router for the recent-tracks API
pub fn router<S: TrackSource>(cache: SnapshotCache<S>) -> Router {
    Router::new()
        .route(RECENT_TRACKS_ROUTE, get(recent_tracks::<S>))
        .with_state(cache)
}

/// GET /recent-tracks
/// Returns `{"tracks": [...], "total_tracks": n}`
async fn recent_tracks<S: TrackSource>(
    State(cache): State<SnapshotCache<S>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
) -> Response {
    let started = Instant::now();

    let (response, cached) = match parse_limit(first_param(&query, "limit")) {
        Err(err) => (ApiError::InvalidLimit(err).into_response(), false),
        Ok(limit) => match cache.get_or_refresh(&FetchParams { limit }).await {
            Ok(lookup) => {
                let cached = lookup.served_from_cache;
                (tracks_response(lookup), cached)
            }
            Err(err) => {
                error!(error = %err, "failed to get recent tracks");
                (ApiError::Upstream(err).into_response(), false)
            }
        },
    };

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    info!(
        route = uri.path(),
        method = %method,
        user_agent,
        cached,
        duration_ms = started.elapsed().as_millis() as u64,
        status = response.status().as_u16(),
        "request"
    );

    response
}

fn tracks_response(lookup: CacheLookup) -> Response {
    let cache_status = if lookup.served_from_cache { "HIT" } else { "MISS" };
    (
        StatusCode::OK,
        cors_headers(),
        [(CACHE_STATUS_HEADER, cache_status)],
        Json(lookup.tracks.as_ref().clone()),
    )
        .into_response()
}
