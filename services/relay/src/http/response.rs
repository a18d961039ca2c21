use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use flagstream_protocol::ErrorEnvelope;

pub type HttpResponse = Response;

pub(crate) fn json_error(status: StatusCode, message: impl Into<String>) -> HttpResponse {
    (status, Json(ErrorEnvelope::new(message))).into_response()
}

pub fn unauthorized() -> HttpResponse {
    json_error(StatusCode::UNAUTHORIZED, "invalid authorization key")
}

pub fn not_found(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::NOT_FOUND, message)
}

pub fn bad_request(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::BAD_REQUEST, message)
}

pub fn empty_body() -> HttpResponse {
    json_error(StatusCode::BAD_REQUEST, "body may not be empty")
}

pub fn events_disabled() -> HttpResponse {
    json_error(StatusCode::SERVICE_UNAVAILABLE, "event proxying is disabled")
}

pub fn method_not_allowed() -> HttpResponse {
    StatusCode::METHOD_NOT_ALLOWED.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_message(response: Response) -> (StatusCode, String) {
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        let envelope: ErrorEnvelope =
            serde_json::from_slice(&bytes).expect("body should be the error envelope");
        (status, envelope.message)
    }

    #[tokio::test]
    async fn empty_body_uses_the_contract_message() {
        let (status, message) = body_message(empty_body()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(message, "body may not be empty");
    }

    #[tokio::test]
    async fn unauthorized_is_401_with_envelope() {
        let (status, message) = body_message(unauthorized()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(message, "invalid authorization key");
    }
}
