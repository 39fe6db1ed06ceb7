use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use time::OffsetDateTime;

use crate::core::time::{days_until, format_utc, now_utc};
use crate::services::evaluation::EvaluationError;
use crate::services::ports::UpstreamError;
use crate::services::submission_saga::{SagaFailure, SubmissionError};

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: u16,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_available_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    days_remaining: Option<i64>,
}

impl ErrorResponse {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status: status.as_u16(),
            detail: detail.into(),
            code: None,
            warnings: Vec::new(),
            next_available_at: None,
            days_remaining: None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ApiError {
    BadRequest(String),
    TooManyRequests(&'static str),
    NotEligible { detail: String, next_available_at: OffsetDateTime },
    ServiceUnavailable(String),
    Submission(SagaFailure),
    Internal(String),
}

impl ApiError {
    /// Log the underlying error with context and return an `Internal` variant.
    pub(crate) fn internal(err: impl std::fmt::Display, context: &str) -> Self {
        tracing::error!(error = %err, "{context}");
        Self::Internal(context.to_string())
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        tracing::warn!(error = %err, "Text generation unavailable");
        Self::ServiceUnavailable(
            "Task generation is temporarily unavailable, please try again shortly".to_string(),
        )
    }
}

impl From<EvaluationError> for ApiError {
    fn from(err: EvaluationError) -> Self {
        match err {
            EvaluationError::Invalid(message) => Self::BadRequest(message),
            EvaluationError::NotEligible { next_available_at } => Self::NotEligible {
                detail: "A written response for this category was submitted recently".to_string(),
                next_available_at,
            },
            EvaluationError::Upstream(err) => {
                tracing::warn!(error = %err, "Evaluation service unavailable");
                Self::ServiceUnavailable(
                    "Evaluation is temporarily unavailable, please try again shortly".to_string(),
                )
            }
            EvaluationError::Persist(message) => {
                Self::internal(message, "Failed to save evaluation")
            }
        }
    }
}

impl From<SagaFailure> for ApiError {
    fn from(failure: SagaFailure) -> Self {
        match failure.error {
            SubmissionError::NotEligible { next_available_at } => Self::NotEligible {
                detail: "A presentation for this category was submitted recently".to_string(),
                next_available_at,
            },
            _ => Self::Submission(failure),
        }
    }
}

fn submission_response(failure: SagaFailure) -> (StatusCode, ErrorResponse) {
    let (status, detail) = match &failure.error {
        SubmissionError::AlreadySubmitted => {
            (StatusCode::CONFLICT, "A presentation has already been submitted".to_string())
        }
        SubmissionError::VideoUploadFailed(_) => {
            (StatusCode::BAD_GATEWAY, "The video could not be stored, please try again".to_string())
        }
        SubmissionError::DocumentUploadFailed(_) => (
            StatusCode::BAD_GATEWAY,
            "The document could not be stored, please try again".to_string(),
        ),
        SubmissionError::NotEligible { .. } => {
            (StatusCode::TOO_MANY_REQUESTS, failure.error.to_string())
        }
        SubmissionError::PersistFailed(_) | SubmissionError::Aborted(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "The submission could not be saved".to_string())
        }
    };

    if status.is_server_error() {
        tracing::error!(
            error = %failure.error,
            code = failure.error.code(),
            warnings = ?failure.warnings,
            "Presentation submission failed"
        );
    }

    let mut body = ErrorResponse::new(status, detail);
    body.code = Some(failure.error.code());
    body.warnings = failure.warnings;
    (status, body)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(message) => {
                let status = StatusCode::BAD_REQUEST;
                (status, ErrorResponse::new(status, message))
            }
            ApiError::TooManyRequests(message) => {
                let status = StatusCode::TOO_MANY_REQUESTS;
                (status, ErrorResponse::new(status, message))
            }
            ApiError::NotEligible { detail, next_available_at } => {
                let status = StatusCode::TOO_MANY_REQUESTS;
                let mut body = ErrorResponse::new(status, detail);
                body.code = Some("not_eligible");
                body.next_available_at = Some(format_utc(next_available_at));
                body.days_remaining = Some(days_until(now_utc(), next_available_at));
                (status, body)
            }
            ApiError::ServiceUnavailable(message) => {
                let status = StatusCode::SERVICE_UNAVAILABLE;
                (status, ErrorResponse::new(status, message))
            }
            ApiError::Submission(failure) => submission_response(failure),
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Internal server error");
                let status = StatusCode::INTERNAL_SERVER_ERROR;
                (status, ErrorResponse::new(status, message))
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn render(error: ApiError) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&body).expect("json"))
    }

    #[tokio::test]
    async fn saga_failures_map_to_step_statuses() {
        let cases = [
            (SubmissionError::AlreadySubmitted, StatusCode::CONFLICT),
            (SubmissionError::VideoUploadFailed("s3".into()), StatusCode::BAD_GATEWAY),
            (SubmissionError::DocumentUploadFailed("docs".into()), StatusCode::BAD_GATEWAY),
            (SubmissionError::PersistFailed("db".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, expected) in cases {
            let code = error.code();
            let failure = SagaFailure { error, warnings: vec!["video v-1 left behind".into()] };
            let (status, body) = render(ApiError::from(failure)).await;
            assert_eq!(status, expected);
            assert_eq!(body["code"], code);
            assert_eq!(body["warnings"][0], "video v-1 left behind");
        }
    }

    #[tokio::test]
    async fn not_eligible_reports_remaining_days() {
        let next_available_at = now_utc() + time::Duration::hours(36);
        let error = ApiError::from(EvaluationError::NotEligible { next_available_at });

        let (status, body) = render(error).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["days_remaining"], 2);
        assert_eq!(body["next_available_at"], format_utc(next_available_at));
    }

    #[tokio::test]
    async fn upstream_exhaustion_asks_to_retry() {
        let (status, body) = render(ApiError::from(UpstreamError::RateLimited)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["detail"].as_str().expect("detail").contains("try again"));
        assert!(body.get("code").is_none());
    }
}
