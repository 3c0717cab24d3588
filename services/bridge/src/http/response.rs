use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use es_protocol::HttpErrorEnvelope;
use std::fmt::Display;

pub type HttpResponse = Response;
pub type HttpResult<T = ()> = Result<T, HttpResponse>;

pub(crate) fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> HttpResponse {
    (
        status,
        Json(HttpErrorEnvelope { code: code.into(), message: message.into(), details: None }),
    )
        .into_response()
}

pub fn unauthorized(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
}

pub fn forbidden(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::FORBIDDEN, "FORBIDDEN", message)
}

pub fn not_found(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::NOT_FOUND, "NOT_FOUND", message)
}

pub fn conflict(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::CONFLICT, "CONFLICT", message)
}

pub fn unprocessable(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_FAILED", message)
}

pub fn bad_gateway(message: impl Into<String>) -> HttpResponse {
    json_error(StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", message)
}

pub fn internal_error(err: impl Display) -> HttpResponse {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn assert_error_response(
        response: Response,
        expected_status: StatusCode,
        expected_code: &str,
        expected_message: &str,
    ) {
        assert_eq!(response.status(), expected_status);

        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        let parsed: HttpErrorEnvelope =
            serde_json::from_slice(&body).expect("response body should be valid error json");

        assert_eq!(parsed.code, expected_code);
        assert_eq!(parsed.message, expected_message);
        assert_eq!(parsed.details, None);
    }

    #[tokio::test]
    async fn unauthorized_sets_401_contract() {
        assert_error_response(
            unauthorized("bad credentials"),
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "bad credentials",
        )
        .await;
    }

    #[tokio::test]
    async fn forbidden_sets_403_contract() {
        assert_error_response(
            forbidden("bot not accessible"),
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "bot not accessible",
        )
        .await;
    }

    #[tokio::test]
    async fn not_found_sets_404_contract() {
        assert_error_response(
            not_found("interest missing"),
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "interest missing",
        )
        .await;
    }

    #[tokio::test]
    async fn conflict_sets_409_contract() {
        assert_error_response(
            conflict("bot is disabled"),
            StatusCode::CONFLICT,
            "CONFLICT",
            "bot is disabled",
        )
        .await;
    }

    #[tokio::test]
    async fn unprocessable_sets_422_contract() {
        assert_error_response(
            unprocessable("webhook_url is required"),
            StatusCode::UNPROCESSABLE_ENTITY,
            "VALIDATION_FAILED",
            "webhook_url is required",
        )
        .await;
    }

    #[tokio::test]
    async fn bad_gateway_sets_502_contract() {
        assert_error_response(
            bad_gateway("upstream rejected the subscription"),
            StatusCode::BAD_GATEWAY,
            "UPSTREAM_ERROR",
            "upstream rejected the subscription",
        )
        .await;
    }
}
