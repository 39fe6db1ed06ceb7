pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod repositories;
pub(crate) mod schemas;
pub(crate) mod services;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use crate::core::state::{AppState, Collaborators};
use crate::core::{config::Settings, redis::RedisHandle, telemetry};
use crate::repositories::completions::PgCompletionStore;
use crate::services::document_storage::HttpDocumentStore;
use crate::services::ports::{DocumentStore, VideoStore};
use crate::services::storage::{S3VideoStore, UnconfiguredStore};
use crate::services::text_generation::OpenAiTextGenerator;

const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

async fn collaborators(settings: &Settings, db: &sqlx::PgPool) -> anyhow::Result<Collaborators> {
    let videos: Arc<dyn VideoStore> = match S3VideoStore::from_settings(settings).await? {
        Some(store) => Arc::new(store),
        None => {
            tracing::warn!("S3 credentials are not set; presentation uploads will fail");
            Arc::new(UnconfiguredStore { name: "video storage" })
        }
    };

    let documents: Arc<dyn DocumentStore> = match HttpDocumentStore::from_settings(settings)? {
        Some(store) => Arc::new(store),
        None => {
            tracing::warn!("DOCUMENT_STORE_URL is not set; presentation uploads will fail");
            Arc::new(UnconfiguredStore { name: "document storage" })
        }
    };

    if settings.ai().openai_api_key.is_empty() {
        tracing::warn!(
            "OPENAI_API_KEY is not set; the generation service will reject requests and \
             generate or evaluate calls will answer 503"
        );
    }

    Ok(Collaborators {
        generator: Arc::new(OpenAiTextGenerator::from_settings(settings)?),
        videos,
        documents,
        completions: Arc::new(PgCompletionStore::new(db.clone())),
    })
}

fn spawn_cache_purge(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CACHE_PURGE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let purged = state.generation().purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "Expired generations purged");
            }
        }
    })
}

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let db_pool = db::init_pool(&settings).await?;
    db::run_migrations(&db_pool).await?;

    let redis = RedisHandle::new(settings.redis().redis_url());
    if let Err(err) = redis.connect().await {
        tracing::error!(error = %err, "Failed to connect to Redis; continuing without rate limits");
    } else {
        tracing::info!("Redis connected successfully");
    }

    let collaborators = collaborators(&settings, &db_pool).await?;
    let state = AppState::new(settings, db_pool, redis.clone(), collaborators);
    let purge = spawn_cache_purge(state.clone());

    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        "Linguacheck API listening"
    );

    let result =
        axum::serve(listener, app).with_graceful_shutdown(core::shutdown::shutdown_signal()).await;

    purge.abort();
    redis.disconnect().await;
    tracing::info!("Redis disconnected");

    result?;

    Ok(())
}
