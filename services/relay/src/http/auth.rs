//! Credential selection for handlers.
//!
//! Server and mobile endpoints read `Authorization` (bare credential, with
//! the legacy `api_key ` prefix tolerated); browser endpoints bind the
//! environment id in the URL path.  An unknown credential maps to 401 for
//! header auth and 404 for path-bound ids.

use super::response;
use crate::credentials::{strip_auth_scheme, Credential};
use crate::envs::EnvironmentContext;
use crate::state::AppState;
use axum::http::HeaderMap;
use axum::response::Response;
use std::sync::Arc;

/// The credential string from `Authorization`, both legacy and bare forms.
pub fn authorization_value(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(strip_auth_scheme)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Resolve the environment for a server SDK key.  The key is returned too,
/// since server streams are closed per-key on rotation.
pub async fn server_env(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(Arc<EnvironmentContext>, String), Response> {
    let key = authorization_value(headers).ok_or_else(response::unauthorized)?;
    let env = state
        .registry
        .find(&Credential::SdkKey(key.clone()))
        .await
        .ok_or_else(response::unauthorized)?;
    Ok((env, key))
}

/// Resolve the environment for a mobile key.
pub async fn mobile_env(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(Arc<EnvironmentContext>, String), Response> {
    let key = authorization_value(headers).ok_or_else(response::unauthorized)?;
    let env = state
        .registry
        .find(&Credential::MobileKey(key.clone()))
        .await
        .ok_or_else(response::unauthorized)?;
    Ok((env, key))
}

/// Resolve the environment for a path-bound environment id.
pub async fn env_by_id(
    state: &AppState,
    env_id: &str,
) -> Result<Arc<EnvironmentContext>, Response> {
    state
        .registry
        .find(&Credential::EnvironmentId(env_id.to_owned()))
        .await
        .ok_or_else(|| response::not_found("unknown environment id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    #[test]
    fn authorization_value_accepts_both_forms() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "sdk-key-1".parse().unwrap());
        assert_eq!(authorization_value(&headers).as_deref(), Some("sdk-key-1"));

        headers.insert(AUTHORIZATION, "api_key sdk-key-1".parse().unwrap());
        assert_eq!(authorization_value(&headers).as_deref(), Some("sdk-key-1"));
    }

    #[test]
    fn missing_or_empty_authorization_is_none() {
        let headers = HeaderMap::new();
        assert_eq!(authorization_value(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "".parse().unwrap());
        assert_eq!(authorization_value(&headers), None);
    }
}
