//! Event intake contracts and end-to-end delivery through a mock upstream.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::routing::post;
use axum::Router;
use relay::config::load_config_from_str;
use relay::envs::{EnvironmentContext, EnvironmentRegistry};
use relay::state::AppState;
use relay::store::DataStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt;

/// A captured upstream request: interesting headers plus the parsed body.
#[derive(Debug, Clone)]
struct Captured {
    path: String,
    authorization: Option<String>,
    schema: Option<String>,
    tags: Option<String>,
    events: Vec<serde_json::Value>,
}

/// Start a mock events service on an ephemeral port; every POST is captured.
async fn mock_events_server() -> (String, mpsc::UnboundedReceiver<Captured>) {
    let (tx, rx) = mpsc::unbounded_channel();

    async fn capture(
        State(tx): State<mpsc::UnboundedSender<Captured>>,
        headers: HeaderMap,
        uri: axum::http::Uri,
        body: Bytes,
    ) -> StatusCode {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        let _ = tx.send(Captured {
            path: uri.path().to_owned(),
            authorization: header("authorization"),
            schema: header("x-launchdarkly-event-schema"),
            tags: header("x-launchdarkly-tags"),
            events: serde_json::from_slice(&body).unwrap_or_default(),
        });
        StatusCode::ACCEPTED
    }

    let app = Router::new()
        .route("/bulk", post(capture))
        .route("/diagnostic", post(capture))
        .route("/mobile", post(capture))
        .route("/mobile/events/diagnostic", post(capture))
        .with_state(tx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), rx)
}

fn config_with_events_uri(events_uri: &str) -> relay::config::RelayConfig {
    load_config_from_str(&format!(
        r#"
        schema_version = 1

        [upstream]
        stream_uri = "http://127.0.0.1:1"
        base_uri = "http://127.0.0.1:1"
        events_uri = "{events_uri}"

        [events]
        flush_interval_secs = 1

        [[environments]]
        name = "test"
        sdk_key = "sdk-1"
        mobile_key = "mob-1"
        env_id = "env-1"
        "#
    ))
    .unwrap()
}

async fn app_with_events(events_uri: &str) -> (AppState, Arc<EnvironmentContext>) {
    let config = config_with_events_uri(events_uri);
    let env = EnvironmentContext::with_memory_store(
        &config.environments[0],
        &config.upstream,
        &config.streams,
        Some(&config.events),
    );

    // Flag `f` tracks events; used by the summarizing scenario.
    let flag: flagstream_core::model::FeatureFlag = serde_json::from_str(
        r#"{"key":"f","version":11,"on":true,"salt":"s",
            "fallthrough":{"variation":0},"variations":["a","b"],
            "trackEvents":true}"#,
    )
    .unwrap();
    let mut data = flagstream_core::model::AllData::default();
    data.flags.insert("f".to_owned(), flag);
    env.store.init(data).await.unwrap();

    let registry = Arc::new(EnvironmentRegistry::new());
    registry.insert(Arc::clone(&env)).await;
    (AppState::new(registry), env)
}

async fn recv_captured(rx: &mut mpsc::UnboundedReceiver<Captured>) -> Captured {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for upstream delivery")
        .expect("capture channel closed")
}

#[tokio::test]
async fn empty_body_is_400_with_contract_message() {
    let (state, _env) = app_with_events("http://127.0.0.1:1").await;
    let response = relay::build_router(state)
        .oneshot(
            Request::post("/bulk")
                .header(header::AUTHORIZATION, "sdk-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["message"], "body may not be empty");
}

#[tokio::test]
async fn malformed_json_is_accepted_and_discarded() {
    let (state, _env) = app_with_events("http://127.0.0.1:1").await;
    let response = relay::build_router(state)
        .oneshot(
            Request::post("/bulk")
                .header(header::AUTHORIZATION, "sdk-1")
                .body(Body::from("{this is not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn unknown_credentials_are_rejected_per_endpoint() {
    let (state, _env) = app_with_events("http://127.0.0.1:1").await;
    let router = relay::build_router(state);

    let response = router
        .clone()
        .oneshot(
            Request::post("/bulk")
                .header(header::AUTHORIZATION, "nope")
                .body(Body::from("[]"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = router
        .oneshot(
            Request::post("/events/bulk/wrong-env")
                .body(Body::from("[]"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn events_disabled_returns_503() {
    let config = config_with_events_uri("http://127.0.0.1:1");
    let env = EnvironmentContext::with_memory_store(
        &config.environments[0],
        &config.upstream,
        &config.streams,
        None, // events disabled
    );
    let registry = Arc::new(EnvironmentRegistry::new());
    registry.insert(env).await;

    let response = relay::build_router(AppState::new(registry))
        .oneshot(
            Request::post("/bulk")
                .header(header::AUTHORIZATION, "sdk-1")
                .body(Body::from("[]"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn legacy_feature_event_is_summarized_upstream() {
    let (uri, mut captured) = mock_events_server().await;
    let (state, _env) = app_with_events(&uri).await;

    let response = relay::build_router(state)
        .oneshot(
            Request::post("/bulk")
                .header(header::AUTHORIZATION, "sdk-1")
                .header("X-LaunchDarkly-Event-Schema", "1")
                .body(Body::from(
                    r#"[{"kind":"feature","creationDate":1000,"key":"f","version":11,"user":{"key":"u"},"value":"a"}]"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let delivery = recv_captured(&mut captured).await;
    assert_eq!(delivery.path, "/bulk");
    assert_eq!(delivery.authorization.as_deref(), Some("sdk-1"));
    assert_eq!(delivery.schema.as_deref(), Some("3"));

    let kinds: Vec<&str> = delivery
        .events
        .iter()
        .filter_map(|e| e["kind"].as_str())
        .collect();
    assert!(kinds.contains(&"index"), "kinds: {:?}", kinds);
    assert!(kinds.contains(&"feature"), "kinds: {:?}", kinds);
    assert!(kinds.contains(&"summary"), "kinds: {:?}", kinds);

    let feature = delivery
        .events
        .iter()
        .find(|e| e["kind"] == "feature")
        .unwrap();
    assert_eq!(feature["trackEvents"], true);
    assert_eq!(feature["variation"], 0);
}

#[tokio::test]
async fn tagged_payloads_flush_in_separate_requests() {
    let (uri, mut captured) = mock_events_server().await;
    let (state, _env) = app_with_events(&uri).await;
    let router = relay::build_router(state);

    for tag in ["A", "B"] {
        let response = router
            .clone()
            .oneshot(
                Request::post("/bulk")
                    .header(header::AUTHORIZATION, "sdk-1")
                    .header("X-LaunchDarkly-Event-Schema", "1")
                    .header("X-LaunchDarkly-Tags", tag)
                    .body(Body::from(
                        r#"[{"kind":"identify","creationDate":1,"user":{"key":"u"}}]"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    let first = recv_captured(&mut captured).await;
    let second = recv_captured(&mut captured).await;
    let mut tags = vec![first.tags.clone(), second.tags.clone()];
    tags.sort();
    assert_eq!(
        tags,
        vec![Some("A".to_owned()), Some("B".to_owned())],
        "payloads must not merge across tag partitions"
    );
}

#[tokio::test]
async fn current_schema_payloads_forward_verbatim() {
    let (uri, mut captured) = mock_events_server().await;
    let (state, _env) = app_with_events(&uri).await;

    let payload =
        r#"[{"kind":"summary","startDate":1,"endDate":2,"features":{"f":{"default":"d","counters":[{"value":"a","count":3}]}}}]"#;
    let response = relay::build_router(state)
        .oneshot(
            Request::post("/bulk")
                .header(header::AUTHORIZATION, "sdk-1")
                .header("X-LaunchDarkly-Event-Schema", "4")
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let delivery = recv_captured(&mut captured).await;
    assert_eq!(delivery.schema.as_deref(), Some("4"));
    let expected: Vec<serde_json::Value> = serde_json::from_str(payload).unwrap();
    assert_eq!(delivery.events, expected);
}

#[tokio::test]
async fn diagnostic_events_pass_through_with_caller_headers() {
    let (uri, mut captured) = mock_events_server().await;
    let (state, _env) = app_with_events(&uri).await;

    let response = relay::build_router(state)
        .oneshot(
            Request::post("/diagnostic")
                .header(header::AUTHORIZATION, "sdk-1")
                .header(header::USER_AGENT, "TestSDK/1.2.3")
                .body(Body::from(r#"{"kind":"diagnostic","creationDate":1}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let delivery = recv_captured(&mut captured).await;
    assert_eq!(delivery.path, "/diagnostic");
    assert_eq!(delivery.authorization.as_deref(), Some("sdk-1"));
}

#[tokio::test]
async fn pixel_endpoint_returns_a_gif_and_ingests_the_payload() {
    // The mock only routes the server paths; this test checks the GIF
    // contract and the 404 for an unknown environment id.
    let (uri, _captured) = mock_events_server().await;
    let (state, _env) = app_with_events(&uri).await;

    let events = base64::Engine::encode(
        &base64::engine::general_purpose::URL_SAFE,
        r#"[{"kind":"identify","creationDate":1,"user":{"key":"u"}}]"#,
    );
    let router = relay::build_router(state);
    let response = router
        .clone()
        .oneshot(
            Request::get(format!("/a/env-1.gif?d={}", events))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/gif");
    let body = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    assert_eq!(&body[..6], b"GIF89a");

    let response = router
        .oneshot(
            Request::get("/a/unknown.gif")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
