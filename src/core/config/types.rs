use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(super) server: ServerSettings,
    pub(super) runtime: RuntimeSettings,
    pub(super) api: ApiSettings,
    pub(super) cors: CorsSettings,
    pub(super) database: DatabaseSettings,
    pub(super) redis: RedisSettings,
    pub(super) ai: AiSettings,
    pub(super) s3: S3Settings,
    pub(super) documents: DocumentStoreSettings,
    pub(super) assessment: AssessmentSettings,
    pub(super) telemetry: TelemetrySettings,
}

#[derive(Debug, Clone)]
pub(crate) struct ServerSettings {
    pub(super) host: ServerHost,
    pub(super) port: ServerPort,
}

#[derive(Debug, Clone)]
pub(crate) struct ApiSettings {
    pub(crate) project_name: String,
    pub(crate) version: String,
    pub(crate) api_v1_str: String,
}

#[derive(Debug, Clone)]
pub(crate) struct CorsSettings {
    pub(crate) origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct DatabaseSettings {
    pub(crate) postgres_server: String,
    pub(crate) postgres_port: u16,
    pub(crate) postgres_user: String,
    pub(crate) postgres_password: String,
    pub(crate) postgres_db: String,
    pub(crate) database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct RedisSettings {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) db: u16,
    pub(crate) password: String,
}

#[derive(Debug, Clone)]
pub(crate) struct AiSettings {
    pub(crate) openai_api_key: String,
    pub(crate) openai_base_url: String,
    pub(crate) ai_model: String,
    pub(crate) ai_max_tokens: u32,
    pub(crate) ai_temperature: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct S3Settings {
    pub(crate) endpoint: String,
    pub(crate) access_key: String,
    pub(crate) secret_key: String,
    pub(crate) bucket: String,
    pub(crate) region: String,
}

/// Remote document service that keeps the slide decks of presentation submissions.
#[derive(Debug, Clone)]
pub(crate) struct DocumentStoreSettings {
    pub(crate) base_url: String,
    pub(crate) api_token: String,
    pub(crate) root_folder: String,
}

#[derive(Debug, Clone)]
pub(crate) struct AssessmentSettings {
    pub(crate) writing_cooldown_hours: u64,
    pub(crate) presentation_cooldown_hours: u64,
    pub(crate) generation_cache_ttl_seconds: u64,
    pub(crate) generation_timeout_seconds: u64,
    pub(crate) generation_max_attempts: u32,
    pub(crate) generation_backoff_ms: u64,
    pub(crate) upload_timeout_seconds: u64,
    pub(crate) persist_timeout_seconds: u64,
    pub(crate) max_video_size_mb: u64,
    pub(crate) max_document_size_mb: u64,
    pub(crate) max_response_chars: usize,
    pub(crate) submissions_per_minute: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct TelemetrySettings {
    pub(crate) log_level: String,
    pub(crate) json: bool,
    pub(crate) prometheus_enabled: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeSettings {
    pub(crate) environment: Environment,
    pub(crate) strict_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Environment {
    Development,
    Production,
    Staging,
    Test,
}

impl Environment {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Test => "test",
        }
    }

    pub(super) fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ServerHost(pub(super) String);

#[derive(Debug, Clone, Copy)]
pub(crate) struct ServerPort(pub(super) u16);

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("invalid server host: {0}")]
    InvalidHost(String),
    #[error("invalid server port: {0}")]
    InvalidPort(String),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("invalid cors origins: {0}")]
    InvalidCors(String),
    #[error("missing required secret for {0}")]
    MissingSecret(&'static str),
}

impl DatabaseSettings {
    pub(crate) fn database_url(&self) -> String {
        if let Some(url) = &self.database_url {
            return url.clone();
        }

        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.postgres_user,
            self.postgres_password,
            self.postgres_server,
            self.postgres_port,
            self.postgres_db
        )
    }
}

impl RedisSettings {
    pub(crate) fn redis_url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!("redis://:{}@{}:{}/{}", self.password, self.host, self.port, self.db)
        }
    }
}

/// Ten years. Longer cooldowns would overflow date arithmetic on stored timestamps.
pub(crate) const MAX_COOLDOWN_HOURS: u64 = 24 * 366 * 10;

impl AssessmentSettings {
    pub(crate) fn writing_cooldown(&self) -> time::Duration {
        time::Duration::hours(self.writing_cooldown_hours as i64)
    }

    pub(crate) fn presentation_cooldown(&self) -> time::Duration {
        time::Duration::hours(self.presentation_cooldown_hours as i64)
    }

    pub(crate) fn generation_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.generation_cache_ttl_seconds)
    }

    pub(crate) fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_seconds)
    }

    pub(crate) fn generation_backoff(&self) -> Duration {
        Duration::from_millis(self.generation_backoff_ms)
    }

    pub(crate) fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_seconds)
    }

    pub(crate) fn persist_timeout(&self) -> Duration {
        Duration::from_secs(self.persist_timeout_seconds)
    }

    pub(crate) fn max_video_bytes(&self) -> u64 {
        self.max_video_size_mb * 1024 * 1024
    }

    pub(crate) fn max_document_bytes(&self) -> u64 {
        self.max_document_size_mb * 1024 * 1024
    }
}

impl ServerHost {
    pub(super) fn parse(value: String) -> Result<Self, ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::InvalidHost(value));
        }

        Ok(Self(value))
    }
}

impl ServerPort {
    pub(super) fn parse(value: String) -> Result<Self, ConfigError> {
        let parsed: u16 = value.parse().map_err(|_| ConfigError::InvalidPort(value.clone()))?;
        if parsed == 0 {
            return Err(ConfigError::InvalidPort(value));
        }

        Ok(Self(parsed))
    }
}
