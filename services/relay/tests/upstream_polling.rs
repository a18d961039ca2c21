//! Polling data source: initializes the store from `/sdk/latest-all` and
//! suppresses redundant `init`s when the response is unchanged.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use relay::config::load_config_from_str;
use relay::envs::EnvironmentContext;
use relay::store::{DataStore, StoreUpdate};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct MockPollServer {
    requests: AtomicUsize,
}

async fn latest_all(State(server): State<Arc<MockPollServer>>) -> impl IntoResponse {
    server.requests.fetch_add(1, Ordering::SeqCst);
    Json(serde_json::json!({
        "flags": {"f": {"key": "f", "version": 1, "variations": ["a"]}},
        "segments": {}
    }))
}

#[tokio::test]
async fn polling_initializes_once_for_unchanged_responses() {
    let server = Arc::new(MockPollServer {
        requests: AtomicUsize::new(0),
    });
    let app = Router::new()
        .route("/sdk/latest-all", get(latest_all))
        .with_state(Arc::clone(&server));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = load_config_from_str(&format!(
        r#"
        schema_version = 1
        [upstream]
        polling = true
        poll_interval_secs = 1
        base_uri = "http://{addr}"
        stream_uri = "http://{addr}"
        events_uri = "http://127.0.0.1:1"
        [[environments]]
        name = "test"
        sdk_key = "sdk-1"
        "#
    ))
    .unwrap();
    let env = EnvironmentContext::with_memory_store(
        &config.environments[0],
        &config.upstream,
        &config.streams,
        None,
    );
    let mut updates = env.store.subscribe();
    env.start_data_source().await;

    // Wait until at least two polls have happened.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while server.requests.load(Ordering::SeqCst) < 2 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "mock upstream was not polled twice"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(env.store.initialized());
    assert!(env
        .store
        .get(flagstream_core::model::DataKind::Flags, "f")
        .await
        .is_some());

    // Exactly one Init notification: the identical second response was
    // suppressed by the body-hash check.
    match updates.recv().await {
        Ok(StoreUpdate::Init) => {}
        other => panic!("expected init notification, got {:?}", other),
    }
    match updates.try_recv() {
        Err(broadcast::error::TryRecvError::Empty) => {}
        other => panic!("unexpected second store update: {:?}", other),
    }

    env.close().await;
}

#[tokio::test]
async fn polling_upstream_401_marks_environment_failed() {
    async fn reject() -> StatusCode {
        StatusCode::UNAUTHORIZED
    }
    let app = Router::new().route("/sdk/latest-all", get(reject));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = load_config_from_str(&format!(
        r#"
        schema_version = 1
        [upstream]
        polling = true
        poll_interval_secs = 1
        base_uri = "http://{addr}"
        stream_uri = "http://{addr}"
        events_uri = "http://127.0.0.1:1"
        [[environments]]
        name = "test"
        sdk_key = "bad-key"
        "#
    ))
    .unwrap();
    let env = EnvironmentContext::with_memory_store(
        &config.environments[0],
        &config.upstream,
        &config.streams,
        None,
    );
    env.start_data_source().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        if env.connection_state() == relay::datasource::ConnectionState::Failed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "environment never failed on 401"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    env.close().await;
}
