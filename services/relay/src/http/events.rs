//! Event intake handlers.
//!
//! Analytics POSTs answer 202 as soon as the body is read; routing and
//! delivery happen on a spawned task so a slow flag lookup never holds the
//! SDK's connection.  Empty bodies are 400; malformed JSON is 202 and
//! silently discarded (legacy SDK behavior).  Diagnostic payloads forward
//! verbatim with the caller's own Authorization and User-Agent.

use super::{auth, response};
use crate::envs::EnvironmentContext;
use crate::events::SdkKind;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use flagstream_protocol::{EVENT_SCHEMA_HEADER, TAGS_HEADER};
use std::collections::HashMap;
use std::sync::Arc;

/// A 1x1 transparent GIF, served by the image-beacon endpoint.
const TRANSPARENT_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

// ---------------------------------------------------------------------------
// Header parsing
// ---------------------------------------------------------------------------

/// The payload schema version; absent means 1.
fn schema_version(headers: &HeaderMap) -> u32 {
    headers
        .get(EVENT_SCHEMA_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(1)
}

fn tags_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(TAGS_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

// ---------------------------------------------------------------------------
// Shared intake
// ---------------------------------------------------------------------------

fn accept_analytics(
    env: &Arc<EnvironmentContext>,
    kind: SdkKind,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let Some(events) = env.events.as_ref() else {
        return response::events_disabled();
    };
    if body.is_empty() {
        return response::empty_body();
    }
    let schema = schema_version(headers);
    let tags = tags_header(headers);
    let dispatcher = Arc::clone(events);
    tokio::spawn(async move {
        dispatcher
            .submit_analytics(kind, schema, tags.as_deref(), &body)
            .await;
    });
    StatusCode::ACCEPTED.into_response()
}

fn accept_diagnostic(
    env: &Arc<EnvironmentContext>,
    kind: SdkKind,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let Some(events) = env.events.as_ref() else {
        return response::events_disabled();
    };
    if body.is_empty() {
        return response::empty_body();
    }
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    events.forward_diagnostic(kind, body.to_vec(), authorization, user_agent);
    StatusCode::ACCEPTED.into_response()
}

// ---------------------------------------------------------------------------
// Server endpoints
// ---------------------------------------------------------------------------

pub async fn server_bulk(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match auth::server_env(&state, &headers).await {
        Ok((env, _)) => accept_analytics(&env, SdkKind::Server, &headers, body),
        Err(error) => error,
    }
}

pub async fn server_diagnostic(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match auth::server_env(&state, &headers).await {
        Ok((env, _)) => accept_diagnostic(&env, SdkKind::Server, &headers, body),
        Err(error) => error,
    }
}

// ---------------------------------------------------------------------------
// Mobile endpoints
// ---------------------------------------------------------------------------

pub async fn mobile_bulk(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match auth::mobile_env(&state, &headers).await {
        Ok((env, _)) => accept_analytics(&env, SdkKind::Mobile, &headers, body),
        Err(error) => error,
    }
}

pub async fn mobile_diagnostic(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match auth::mobile_env(&state, &headers).await {
        Ok((env, _)) => accept_diagnostic(&env, SdkKind::Mobile, &headers, body),
        Err(error) => error,
    }
}

// ---------------------------------------------------------------------------
// Browser endpoints
// ---------------------------------------------------------------------------

pub async fn js_bulk(
    State(state): State<AppState>,
    Path(env_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match auth::env_by_id(&state, &env_id).await {
        Ok(env) => accept_analytics(&env, SdkKind::Browser, &headers, body),
        Err(error) => error,
    }
}

pub async fn js_diagnostic(
    State(state): State<AppState>,
    Path(env_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match auth::env_by_id(&state, &env_id).await {
        Ok(env) => accept_diagnostic(&env, SdkKind::Browser, &headers, body),
        Err(error) => error,
    }
}

/// Image-beacon intake: `GET /a/{envId}.gif?d={base64-events}`.  Always
/// answers with the pixel so old browsers don't retry; the payload rides
/// the modern schema (the JS SDK encodes current-schema events).
pub async fn js_pixel(
    State(state): State<AppState>,
    Path(gif_name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(env_id) = gif_name.strip_suffix(".gif") else {
        return response::not_found("unknown resource");
    };
    let env = match auth::env_by_id(&state, env_id).await {
        Ok(env) => env,
        Err(error) => return error,
    };

    if let (Some(events), Some(data)) = (env.events.as_ref(), params.get("d")) {
        let decoded = base64::engine::general_purpose::URL_SAFE
            .decode(data)
            .or_else(|_| base64::engine::general_purpose::STANDARD.decode(data));
        if let Ok(body) = decoded {
            let dispatcher = Arc::clone(events);
            tokio::spawn(async move {
                dispatcher
                    .submit_analytics(
                        SdkKind::Browser,
                        flagstream_protocol::SUMMARY_EVENTS_SCHEMA_VERSION,
                        None,
                        &body,
                    )
                    .await;
            });
        }
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "image/gif")],
        TRANSPARENT_GIF,
    )
        .into_response()
}
