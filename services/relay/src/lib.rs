pub mod config;
pub mod credentials;
pub mod datasource;
pub mod envs;
pub mod events;
pub mod fanout;
pub mod http;
pub mod metrics;
pub mod state;
pub mod store;

pub use state::AppState;

use axum::{
    routing::{any, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    // Browser endpoints get the CORS layer; header-authenticated endpoints
    // don't need it.
    let js_routes = Router::new()
        .route("/ping/:env_id", get(http::stream::js_ping))
        .route("/eval/:env_id", any(http::stream::js_eval_report))
        .route("/eval/:env_id/:user", get(http::stream::js_eval_get))
        .route("/events/bulk/:env_id", post(http::events::js_bulk))
        .route("/events/diagnostic/:env_id", post(http::events::js_diagnostic))
        .route("/a/:gif_name", get(http::events::js_pixel))
        .layer(http::cors::js_cors_layer());

    Router::new()
        .route("/all", get(http::stream::server_all))
        .route("/flags", get(http::stream::server_flags))
        .route("/sdk/flags", get(http::poll::all_flags))
        .route("/sdk/flags/:key", get(http::poll::flag_by_key))
        .route("/sdk/segments/:key", get(http::poll::segment_by_key))
        .route("/mping", get(http::stream::mobile_ping))
        .route("/meval", any(http::stream::mobile_eval_report))
        .route("/meval/:user", get(http::stream::mobile_eval_get))
        .route("/bulk", post(http::events::server_bulk))
        .route("/diagnostic", post(http::events::server_diagnostic))
        .route("/mobile", post(http::events::mobile_bulk))
        .route("/mobile/events", post(http::events::mobile_bulk))
        .route("/mobile/events/bulk", post(http::events::mobile_bulk))
        .route(
            "/mobile/events/diagnostic",
            post(http::events::mobile_diagnostic),
        )
        .route("/status", get(http::status::status))
        .merge(js_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
