//! CORS for the browser-facing endpoints.
//!
//! The JS SDK runs in arbitrary origins, so the layer echoes the request
//! origin (no wildcard, so the SDK's custom headers survive) with
//! credentials disabled.

use axum::http::{header, HeaderName, Method};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};

pub fn js_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(false)
        .allow_methods(vec![
            Method::GET,
            Method::POST,
            Method::OPTIONS,
            Method::from_bytes(b"REPORT").expect("REPORT is a valid method"),
        ])
        .allow_headers(vec![
            header::CACHE_CONTROL,
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            header::ACCEPT_ENCODING,
            HeaderName::from_static("x-launchdarkly-user-agent"),
            HeaderName::from_static("x-launchdarkly-payload-id"),
            HeaderName::from_static("x-launchdarkly-wrapper"),
            HeaderName::from_static("x-launchdarkly-event-schema"),
        ])
        .expose_headers(vec![header::DATE])
        .max_age(Duration::from_secs(300))
}
