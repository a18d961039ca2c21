//! SSE stream handlers for all three SDK families.
//!
//! Every stream response carries `Cache-Control: no-store, no-transform`
//! and a comment-line heartbeat at the configured interval.  Eval streams
//! take the user either base64-encoded in the path (GET) or as the body of
//! a REPORT request.

use super::{auth, response};
use crate::envs::EnvironmentContext;
use crate::fanout::{OutEvent, ServerStreamKind};
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Method};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use flagstream_core::user::User;
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;

// ---------------------------------------------------------------------------
// SSE framing
// ---------------------------------------------------------------------------

fn sse_response(
    stream: impl Stream<Item = OutEvent> + Send + 'static,
    env: &EnvironmentContext,
) -> Response {
    let events = stream.map(|e| Ok::<_, Infallible>(Event::default().event(e.name).data(e.data)));
    let mut response = Sse::new(events)
        .keep_alive(
            KeepAlive::new()
                .interval(env.streams.heartbeat_interval)
                .text(""),
        )
        .into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-transform"),
    );
    response
}

// ---------------------------------------------------------------------------
// Server streams
// ---------------------------------------------------------------------------

pub async fn server_all(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match auth::server_env(&state, &headers).await {
        Ok((env, key)) => sse_response(env.dispatcher.server_stream(ServerStreamKind::All, key), &env),
        Err(error) => error,
    }
}

pub async fn server_flags(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match auth::server_env(&state, &headers).await {
        Ok((env, key)) => sse_response(
            env.dispatcher.server_stream(ServerStreamKind::FlagsOnly, key),
            &env,
        ),
        Err(error) => error,
    }
}

// ---------------------------------------------------------------------------
// Mobile streams
// ---------------------------------------------------------------------------

pub async fn mobile_ping(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match auth::mobile_env(&state, &headers).await {
        Ok((env, _)) => sse_response(env.dispatcher.ping_stream(), &env),
        Err(error) => error,
    }
}

pub async fn mobile_eval_get(
    State(state): State<AppState>,
    Path(user_b64): Path<String>,
    headers: HeaderMap,
) -> Response {
    let env = match auth::mobile_env(&state, &headers).await {
        Ok((env, _)) => env,
        Err(error) => return error,
    };
    match decode_user_base64(&user_b64) {
        Ok(user) => sse_response(env.dispatcher.eval_stream(user), &env),
        Err(error) => error,
    }
}

pub async fn mobile_eval_report(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method.as_str() != "REPORT" {
        return response::method_not_allowed();
    }
    let env = match auth::mobile_env(&state, &headers).await {
        Ok((env, _)) => env,
        Err(error) => return error,
    };
    match parse_user(&body) {
        Ok(user) => sse_response(env.dispatcher.eval_stream(user), &env),
        Err(error) => error,
    }
}

// ---------------------------------------------------------------------------
// Browser streams
// ---------------------------------------------------------------------------

pub async fn js_ping(State(state): State<AppState>, Path(env_id): Path<String>) -> Response {
    match auth::env_by_id(&state, &env_id).await {
        Ok(env) => sse_response(env.dispatcher.ping_stream(), &env),
        Err(error) => error,
    }
}

pub async fn js_eval_get(
    State(state): State<AppState>,
    Path((env_id, user_b64)): Path<(String, String)>,
) -> Response {
    let env = match auth::env_by_id(&state, &env_id).await {
        Ok(env) => env,
        Err(error) => return error,
    };
    match decode_user_base64(&user_b64) {
        Ok(user) => sse_response(env.dispatcher.eval_stream(user), &env),
        Err(error) => error,
    }
}

pub async fn js_eval_report(
    State(state): State<AppState>,
    Path(env_id): Path<String>,
    method: Method,
    body: Bytes,
) -> Response {
    if method.as_str() != "REPORT" {
        return response::method_not_allowed();
    }
    let env = match auth::env_by_id(&state, &env_id).await {
        Ok(env) => env,
        Err(error) => return error,
    };
    match parse_user(&body) {
        Ok(user) => sse_response(env.dispatcher.eval_stream(user), &env),
        Err(error) => error,
    }
}

// ---------------------------------------------------------------------------
// User decoding
// ---------------------------------------------------------------------------

/// SDKs disagree on the base64 alphabet and padding; accept all four.
pub(crate) fn decode_user_base64(encoded: &str) -> Result<User, Response> {
    let engines: [&base64::engine::GeneralPurpose; 4] = [
        &base64::engine::general_purpose::STANDARD,
        &base64::engine::general_purpose::URL_SAFE,
        &base64::engine::general_purpose::STANDARD_NO_PAD,
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
    ];
    let bytes = engines
        .iter()
        .find_map(|engine| engine.decode(encoded).ok())
        .ok_or_else(|| response::bad_request("invalid base64 user data"))?;
    parse_user(&bytes)
}

fn parse_user(bytes: &[u8]) -> Result<User, Response> {
    let user: User = serde_json::from_slice(bytes)
        .map_err(|_| response::bad_request("invalid user data"))?;
    if user.key.is_empty() {
        return Err(response::bad_request("user key is required"));
    }
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_user_accepts_standard_and_url_safe() {
        let json = r#"{"key":"u?~"}"#;
        let standard = base64::engine::general_purpose::STANDARD.encode(json);
        let url_safe = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json);
        assert_eq!(decode_user_base64(&standard).unwrap().key, "u?~");
        assert_eq!(decode_user_base64(&url_safe).unwrap().key, "u?~");
    }

    #[test]
    fn bad_base64_and_bad_json_are_rejected() {
        assert!(decode_user_base64("!!!not-base64!!!").is_err());
        let garbage = base64::engine::general_purpose::STANDARD.encode("not json");
        assert!(decode_user_base64(&garbage).is_err());
    }

    #[test]
    fn empty_user_key_is_rejected() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(r#"{"key":""}"#);
        assert!(decode_user_base64(&encoded).is_err());
    }
}
