use axum::{
    extract::{multipart::Field, DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::core::time::{format_offset, now_utc};
use crate::db::types::Category;
use crate::schemas::assessment::{
    CompletionRecordResponse, EligibilityQuery, EligibilityResponse, HistoryQuery,
    PresentationResponse, SubmitResponseRequest,
};
use crate::services::scratch::{ScratchFile, ScratchWriter};
use crate::services::submission_saga::PresentationSubmission;

const MAX_SUBJECT_ID_LEN: usize = 64;
/// Room for the text fields and multipart framing on top of the two files.
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

pub(crate) fn router(max_upload_bytes: u64) -> Router<AppState> {
    let body_limit = usize::try_from(max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    Router::new()
        .route("/:subject_id/eligibility", get(eligibility))
        .route(
            "/:subject_id/presentations",
            post(submit_presentation).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/:subject_id/responses", post(submit_response))
        .route("/:subject_id/history", get(history))
}

fn validate_subject_id(subject_id: &str) -> Result<(), ApiError> {
    let valid = !subject_id.is_empty()
        && subject_id.len() <= MAX_SUBJECT_ID_LEN
        && subject_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest("Invalid subject id".to_string()))
    }
}

async fn enforce_rate_limit(state: &AppState, subject_id: &str) -> Result<(), ApiError> {
    let per_minute = state.settings().assessment().submissions_per_minute;
    if state.redis().allow_submission(subject_id, per_minute).await {
        Ok(())
    } else {
        metrics::counter!("rate_limited_requests_total").increment(1);
        Err(ApiError::TooManyRequests("Too many submissions, please slow down"))
    }
}

async fn eligibility(
    Path(subject_id): Path<String>,
    Query(query): Query<EligibilityQuery>,
    State(state): State<AppState>,
) -> Result<Json<EligibilityResponse>, ApiError> {
    validate_subject_id(&subject_id)?;
    let category = Category::parse(&query.level, &query.language).map_err(ApiError::BadRequest)?;

    let now = now_utc();
    let eligibility =
        state.eligibility().check_at(&subject_id, query.workflow, &category, now).await;

    Ok(Json(EligibilityResponse {
        subject_id,
        workflow: query.workflow,
        available: eligibility.available,
        next_available_at: eligibility.next_available_at.map(format_offset),
        days_remaining: eligibility.days_remaining(now),
        last_completed_at: eligibility.last_record.map(|record| format_offset(record.completed_at)),
    }))
}

async fn stage_file(mut field: Field<'_>, max_bytes: u64) -> Result<ScratchFile, ApiError> {
    let name = field.name().unwrap_or("file").to_string();
    let filename = field.file_name().unwrap_or(&name).to_string();
    let content_type = field
        .content_type()
        .unwrap_or("application/octet-stream")
        .to_string();

    let mut writer = ScratchWriter::create(&filename, &content_type, max_bytes)
        .map_err(|e| ApiError::internal(e, "Failed to stage upload"))?;

    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|_| ApiError::BadRequest(format!("Failed to read {name}")))?
    {
        writer
            .write_chunk(&chunk)
            .await
            .map_err(|e| ApiError::BadRequest(format!("Invalid {name}: {e}")))?;
    }

    writer
        .finish()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid {name}: {e}")))
}

async fn submit_presentation(
    Path(subject_id): Path<String>,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<PresentationResponse>), ApiError> {
    validate_subject_id(&subject_id)?;
    enforce_rate_limit(&state, &subject_id).await?;

    let limits = state.settings().assessment();
    let mut level: Option<String> = None;
    let mut language: Option<String> = None;
    let mut metadata = serde_json::Value::Object(Default::default());
    let mut video: Option<ScratchFile> = None;
    let mut document: Option<ScratchFile> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::BadRequest("Invalid multipart data".to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "level" => {
                level = Some(field.text().await.map_err(|_| {
                    ApiError::BadRequest("Invalid level".to_string())
                })?);
            }
            "language" => {
                language = Some(field.text().await.map_err(|_| {
                    ApiError::BadRequest("Invalid language".to_string())
                })?);
            }
            "metadata" => {
                let text = field
                    .text()
                    .await
                    .map_err(|_| ApiError::BadRequest("Invalid metadata".to_string()))?;
                if !text.trim().is_empty() {
                    metadata = serde_json::from_str(&text).map_err(|_| {
                        ApiError::BadRequest("metadata must be valid JSON".to_string())
                    })?;
                }
            }
            "video" => video = Some(stage_file(field, limits.max_video_bytes()).await?),
            "document" => document = Some(stage_file(field, limits.max_document_bytes()).await?),
            _ => {}
        }
    }

    let level = level.ok_or_else(|| ApiError::BadRequest("level is required".to_string()))?;
    let language =
        language.ok_or_else(|| ApiError::BadRequest("language is required".to_string()))?;
    let category = Category::parse(&level, &language).map_err(ApiError::BadRequest)?;
    let video = video.ok_or_else(|| ApiError::BadRequest("video is required".to_string()))?;
    let document =
        document.ok_or_else(|| ApiError::BadRequest("document is required".to_string()))?;

    let committed = state
        .submissions()
        .submit(PresentationSubmission { subject_id, category, video, document, metadata })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(PresentationResponse {
            record: CompletionRecordResponse::from(committed.record),
            warnings: committed.warnings,
        }),
    ))
}

async fn submit_response(
    Path(subject_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<SubmitResponseRequest>,
) -> Result<(StatusCode, Json<CompletionRecordResponse>), ApiError> {
    validate_subject_id(&subject_id)?;
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let category =
        Category::parse(&payload.level, &payload.language).map_err(ApiError::BadRequest)?;
    enforce_rate_limit(&state, &subject_id).await?;

    let record = state
        .evaluation()
        .submit_response(&subject_id, &category, &payload.response)
        .await?;

    Ok((StatusCode::CREATED, Json(CompletionRecordResponse::from(record))))
}

async fn history(
    Path(subject_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<CompletionRecordResponse>>, ApiError> {
    validate_subject_id(&subject_id)?;
    query.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let records = state.evaluation().history(&subject_id, query.limit).await?;
    Ok(Json(records.into_iter().map(CompletionRecordResponse::from).collect()))
}
