use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::db::types::Category;
use crate::schemas::assessment::GenerationResponse;

pub(crate) fn router() -> Router<AppState> {
    Router::new().route("/:level/:language/generate", get(generate))
}

async fn generate(
    Path((level, language)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let category = Category::parse(&level, &language).map_err(ApiError::BadRequest)?;
    let generated = state.generation().generate(&category).await?;

    Ok(Json(GenerationResponse {
        level: category.level,
        language: category.language,
        served_from: generated.served_from,
        result: generated.result,
    }))
}
