//! End-to-end upstream synchronization: a mock upstream SSE endpoint feeds
//! the data source, and subscribers observe the resulting store updates.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use relay::config::load_config_from_str;
use relay::datasource::ConnectionState;
use relay::envs::EnvironmentContext;
use relay::fanout::{OutEvent, ServerStreamKind};
use relay::store::DataStore;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

struct MockUpstream {
    events_tx: broadcast::Sender<(String, String)>,
    connected_tx: mpsc::UnboundedSender<()>,
    status: StatusCode,
}

async fn sse_all(State(upstream): State<Arc<MockUpstream>>) -> Response {
    if upstream.status != StatusCode::OK {
        return upstream.status.into_response();
    }
    let mut rx = upstream.events_tx.subscribe();
    let _ = upstream.connected_tx.send(());
    let stream = async_stream::stream! {
        while let Ok((name, data)) = rx.recv().await {
            yield Ok::<_, Infallible>(Event::default().event(name).data(data));
        }
    };
    Sse::new(stream).into_response()
}

/// Start the mock upstream; returns its base URL, the event feed, and a
/// connect-notification channel.
async fn mock_upstream(
    status: StatusCode,
) -> (
    String,
    broadcast::Sender<(String, String)>,
    mpsc::UnboundedReceiver<()>,
) {
    let (events_tx, _) = broadcast::channel(64);
    let (connected_tx, connected_rx) = mpsc::unbounded_channel();
    let upstream = Arc::new(MockUpstream {
        events_tx: events_tx.clone(),
        connected_tx,
        status,
    });
    let app = Router::new().route("/all", get(sse_all)).with_state(upstream);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), events_tx, connected_rx)
}

fn env_against(stream_uri: &str) -> Arc<EnvironmentContext> {
    let config = load_config_from_str(&format!(
        r#"
        schema_version = 1
        [upstream]
        stream_uri = "{stream_uri}"
        base_uri = "http://127.0.0.1:1"
        events_uri = "http://127.0.0.1:1"
        [[environments]]
        name = "test"
        sdk_key = "sdk-1"
        "#
    ))
    .unwrap();
    EnvironmentContext::with_memory_store(
        &config.environments[0],
        &config.upstream,
        &config.streams,
        None,
    )
}

async fn next_event(
    stream: &mut (impl futures_util::Stream<Item = OutEvent> + Unpin),
) -> OutEvent {
    tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("timed out waiting for fan-out event")
        .expect("fan-out stream ended")
}

const PUT: &str = r#"{
    "path": "/",
    "data": {
        "flags": {
            "f": {
                "key": "f", "version": 1, "on": true, "salt": "s",
                "fallthrough": {"variation": 0},
                "variations": ["a", "b"],
                "targets": [{"values": ["user1"], "variation": 0}]
            }
        },
        "segments": {}
    }
}"#;

#[tokio::test]
async fn put_patch_delete_flow_reaches_subscribers() {
    let (uri, events_tx, mut connected) = mock_upstream(StatusCode::OK).await;
    let env = env_against(&uri);
    env.start_data_source().await;

    tokio::time::timeout(Duration::from_secs(10), connected.recv())
        .await
        .expect("data source never connected")
        .unwrap();

    // Subscribe before any data arrives: no initial event yet.
    let mut subscriber = Box::pin(
        env.dispatcher
            .server_stream(ServerStreamKind::All, "sdk-1".to_owned()),
    );

    events_tx
        .send(("put".to_owned(), PUT.to_owned()))
        .unwrap();

    // The pre-init subscriber sees the put when the dataset lands.
    let put = next_event(&mut subscriber).await;
    assert_eq!(put.name, "put");
    let data: serde_json::Value = serde_json::from_str(&put.data).unwrap();
    assert_eq!(data["data"]["flags"]["f"]["version"], 1);
    assert!(env.store.initialized());

    // Scenario 2: patch to version 2, then delete at version 3.
    events_tx
        .send((
            "patch".to_owned(),
            r#"{"path":"/flags/f","data":{"key":"f","version":2,"variations":["x","y"]}}"#
                .to_owned(),
        ))
        .unwrap();
    let patch = next_event(&mut subscriber).await;
    assert_eq!(patch.name, "patch");
    let data: serde_json::Value = serde_json::from_str(&patch.data).unwrap();
    assert_eq!(data["path"], "/flags/f");
    assert_eq!(data["data"]["version"], 2);

    events_tx
        .send((
            "delete".to_owned(),
            r#"{"path":"/flags/f","version":3}"#.to_owned(),
        ))
        .unwrap();
    let delete = next_event(&mut subscriber).await;
    assert_eq!(delete.name, "delete");
    let data: serde_json::Value = serde_json::from_str(&delete.data).unwrap();
    assert_eq!(data, serde_json::json!({"path": "/flags/f", "version": 3}));

    // A fresh connect now replays a put with no flags.
    let mut fresh = Box::pin(
        env.dispatcher
            .server_stream(ServerStreamKind::All, "sdk-1".to_owned()),
    );
    let replay = next_event(&mut fresh).await;
    assert_eq!(replay.name, "put");
    let data: serde_json::Value = serde_json::from_str(&replay.data).unwrap();
    assert!(data["data"]["flags"].as_object().unwrap().is_empty());

    env.close().await;
}

#[tokio::test]
async fn upstream_401_marks_the_environment_failed() {
    let (uri, _events_tx, _connected) = mock_upstream(StatusCode::UNAUTHORIZED).await;
    let env = env_against(&uri);
    env.start_data_source().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if env.connection_state() == ConnectionState::Failed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "environment never transitioned to failed"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!env.store.initialized());
    env.close().await;
}
