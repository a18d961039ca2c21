//! Server-side polling endpoints (PHP-style SDKs without streaming).

use super::{auth, response};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use flagstream_core::model::DataKind;

pub async fn all_flags(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let env = match auth::server_env(&state, &headers).await {
        Ok((env, _)) => env,
        Err(error) => return error,
    };
    let flags = env.store.get_all(DataKind::Flags).await;
    Json(flags).into_response()
}

pub async fn flag_by_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Response {
    item_by_key(state, headers, DataKind::Flags, &key).await
}

pub async fn segment_by_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Response {
    item_by_key(state, headers, DataKind::Segments, &key).await
}

async fn item_by_key(
    state: AppState,
    headers: HeaderMap,
    kind: DataKind,
    key: &str,
) -> Response {
    let env = match auth::server_env(&state, &headers).await {
        Ok((env, _)) => env,
        Err(error) => return error,
    };
    match env.store.get(kind, key).await {
        Some(item) => Json(item).into_response(),
        None => response::not_found(format!("{} not found", kind.path_component())),
    }
}
