//! API error envelope
//!
//! Every failing handler returns the same JSON shape: `success: false`, a
//! human-readable message, and a machine-readable `code`. Rate-limit and
//! quota denials carry their extra fields.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fleet_core::Error;
use serde_json::json;

/// Wrapper that turns a [`fleet_core::Error`] into an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

/// Result type for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.to_http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = match &self.0 {
            Error::RateLimited { code } => json!({
                "success": false,
                "error": self.0.to_string(),
                "code": code,
            }),
            Error::QuotaExceeded { current, required } => json!({
                "success": false,
                "error": self.0.to_string(),
                "current_tokens": current,
                "required_tokens": required,
            }),
            _ => json!({
                "success": false,
                "error": self.0.to_string(),
                "code": self.0.category(),
            }),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_rate_limit_response() {
        let response = ApiError(Error::RateLimited {
            code: "USER_RATE_LIMIT_EXCEEDED",
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "USER_RATE_LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn test_quota_response_carries_balance() {
        let response = ApiError(Error::QuotaExceeded {
            current: 5,
            required: 70,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

        let body = body_json(response).await;
        assert_eq!(body["current_tokens"], 5);
        assert_eq!(body["required_tokens"], 70);
    }

    #[tokio::test]
    async fn test_not_found_response() {
        let response = ApiError(Error::not_found("model m1 not found")).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert_eq!(body["code"], "not_found");
    }
}
