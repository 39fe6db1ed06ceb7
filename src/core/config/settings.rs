use super::parsing::{
    env_optional, env_or_default, parse_bool, parse_cors_origins, parse_environment, parse_f64,
    parse_u16, parse_u32, parse_u64,
};
use super::types::{
    AiSettings, ApiSettings, AssessmentSettings, ConfigError, CorsSettings, DatabaseSettings,
    DocumentStoreSettings, RedisSettings, RuntimeSettings, S3Settings, ServerHost, ServerPort,
    ServerSettings, Settings, TelemetrySettings, MAX_COOLDOWN_HOURS,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("LINGUACHECK_HOST", "0.0.0.0");
        let port = env_or_default("LINGUACHECK_PORT", "8000");

        let environment = parse_environment(
            env_optional("LINGUACHECK_ENV").or_else(|| env_optional("ENVIRONMENT")),
        );
        let strict_config = env_optional("LINGUACHECK_STRICT_CONFIG")
            .map(|value| parse_bool(&value))
            .unwrap_or(false)
            || environment.is_production();

        let project_name = env_or_default("PROJECT_NAME", "Linguacheck API");
        let version = env_or_default("VERSION", env!("CARGO_PKG_VERSION"));
        let api_v1_str = env_or_default("API_V1_STR", "/api/v1");

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "linguacheck");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "linguacheck_db");
        let database_url = env_optional("DATABASE_URL");

        let redis_host = env_or_default("REDIS_HOST", "localhost");
        let redis_port = parse_u16("REDIS_PORT", env_or_default("REDIS_PORT", "6379"))?;
        let redis_db = parse_u16("REDIS_DB", env_or_default("REDIS_DB", "0"))?;
        let redis_password = env_or_default("REDIS_PASSWORD", "");

        let openai_api_key = env_or_default("OPENAI_API_KEY", "");
        let openai_base_url = env_or_default("OPENAI_BASE_URL", "https://api.openai.com/v1");
        let ai_model = env_or_default("AI_MODEL", "gpt-4o-mini");
        let ai_max_tokens = parse_u32("AI_MAX_TOKENS", env_or_default("AI_MAX_TOKENS", "1500"))?;
        let ai_temperature =
            parse_f64("AI_TEMPERATURE", env_or_default("AI_TEMPERATURE", "0.4"))?;

        let s3_endpoint = env_or_default("S3_ENDPOINT", "https://storage.yandexcloud.net");
        let s3_access_key = env_or_default("S3_ACCESS_KEY", "");
        let s3_secret_key = env_or_default("S3_SECRET_KEY", "");
        let s3_bucket = env_or_default("S3_BUCKET", "linguacheck-presentations");
        let s3_region = env_or_default("S3_REGION", "ru-central1");

        let documents_base_url = env_or_default("DOCUMENT_STORE_URL", "");
        let documents_api_token = env_or_default("DOCUMENT_STORE_TOKEN", "");
        let documents_root_folder = env_or_default("DOCUMENT_STORE_FOLDER", "presentations");

        let writing_cooldown_hours = parse_u64(
            "WRITING_COOLDOWN_HOURS",
            env_or_default("WRITING_COOLDOWN_HOURS", "168"),
        )?;
        let presentation_cooldown_hours = parse_u64(
            "PRESENTATION_COOLDOWN_HOURS",
            env_or_default("PRESENTATION_COOLDOWN_HOURS", "24"),
        )?;
        let generation_cache_ttl_seconds = parse_u64(
            "GENERATION_CACHE_TTL_SECONDS",
            env_or_default("GENERATION_CACHE_TTL_SECONDS", "300"),
        )?;
        let generation_timeout_seconds = parse_u64(
            "GENERATION_TIMEOUT_SECONDS",
            env_or_default("GENERATION_TIMEOUT_SECONDS", "20"),
        )?;
        let generation_max_attempts = parse_u32(
            "GENERATION_MAX_ATTEMPTS",
            env_or_default("GENERATION_MAX_ATTEMPTS", "2"),
        )?;
        let generation_backoff_ms = parse_u64(
            "GENERATION_BACKOFF_MS",
            env_or_default("GENERATION_BACKOFF_MS", "2000"),
        )?;
        let upload_timeout_seconds = parse_u64(
            "UPLOAD_TIMEOUT_SECONDS",
            env_or_default("UPLOAD_TIMEOUT_SECONDS", "120"),
        )?;
        let persist_timeout_seconds = parse_u64(
            "PERSIST_TIMEOUT_SECONDS",
            env_or_default("PERSIST_TIMEOUT_SECONDS", "10"),
        )?;
        let max_video_size_mb =
            parse_u64("MAX_VIDEO_SIZE_MB", env_or_default("MAX_VIDEO_SIZE_MB", "200"))?;
        let max_document_size_mb =
            parse_u64("MAX_DOCUMENT_SIZE_MB", env_or_default("MAX_DOCUMENT_SIZE_MB", "20"))?;
        let max_response_chars =
            parse_u64("MAX_RESPONSE_CHARS", env_or_default("MAX_RESPONSE_CHARS", "8000"))?
                as usize;
        let submissions_per_minute = parse_u64(
            "SUBMISSIONS_PER_MINUTE",
            env_or_default("SUBMISSIONS_PER_MINUTE", "5"),
        )?;

        let log_level = env_or_default("LINGUACHECK_LOG_LEVEL", "info");
        let json =
            env_optional("LINGUACHECK_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings { project_name, version, api_v1_str },
            cors: CorsSettings { origins: cors_origins },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
            },
            redis: RedisSettings {
                host: redis_host,
                port: redis_port,
                db: redis_db,
                password: redis_password,
            },
            ai: AiSettings {
                openai_api_key,
                openai_base_url,
                ai_model,
                ai_max_tokens,
                ai_temperature,
            },
            s3: S3Settings {
                endpoint: s3_endpoint,
                access_key: s3_access_key,
                secret_key: s3_secret_key,
                bucket: s3_bucket,
                region: s3_region,
            },
            documents: DocumentStoreSettings {
                base_url: documents_base_url,
                api_token: documents_api_token,
                root_folder: documents_root_folder,
            },
            assessment: AssessmentSettings {
                writing_cooldown_hours,
                presentation_cooldown_hours,
                generation_cache_ttl_seconds,
                generation_timeout_seconds,
                generation_max_attempts,
                generation_backoff_ms,
                upload_timeout_seconds,
                persist_timeout_seconds,
                max_video_size_mb,
                max_document_size_mb,
                max_response_chars,
                submissions_per_minute,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn redis(&self) -> &RedisSettings {
        &self.redis
    }

    pub(crate) fn ai(&self) -> &AiSettings {
        &self.ai
    }

    pub(crate) fn s3(&self) -> &S3Settings {
        &self.s3
    }

    pub(crate) fn documents(&self) -> &DocumentStoreSettings {
        &self.documents
    }

    pub(crate) fn assessment(&self) -> &AssessmentSettings {
        &self.assessment
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, hours) in [
            ("WRITING_COOLDOWN_HOURS", self.assessment.writing_cooldown_hours),
            ("PRESENTATION_COOLDOWN_HOURS", self.assessment.presentation_cooldown_hours),
        ] {
            if hours > MAX_COOLDOWN_HOURS {
                return Err(ConfigError::InvalidValue { field, value: hours.to_string() });
            }
        }

        if self.assessment.generation_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "GENERATION_MAX_ATTEMPTS",
                value: "0".to_string(),
            });
        }

        if self.assessment.generation_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "GENERATION_TIMEOUT_SECONDS",
                value: "0".to_string(),
            });
        }

        if self.assessment.upload_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "UPLOAD_TIMEOUT_SECONDS",
                value: "0".to_string(),
            });
        }

        if self.assessment.persist_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "PERSIST_TIMEOUT_SECONDS",
                value: "0".to_string(),
            });
        }

        if self.assessment.max_response_chars == 0 {
            return Err(ConfigError::InvalidValue {
                field: "MAX_RESPONSE_CHARS",
                value: "0".to_string(),
            });
        }

        if !(0.0..=2.0).contains(&self.ai.ai_temperature) {
            return Err(ConfigError::InvalidValue {
                field: "AI_TEMPERATURE",
                value: self.ai.ai_temperature.to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }
        if self.ai.openai_api_key.is_empty() {
            return Err(ConfigError::MissingSecret("OPENAI_API_KEY"));
        }
        if self.s3.access_key.is_empty() || self.s3.secret_key.is_empty() {
            return Err(ConfigError::MissingSecret("S3_ACCESS_KEY/S3_SECRET_KEY"));
        }
        if self.documents.base_url.is_empty() || self.documents.api_token.is_empty() {
            return Err(ConfigError::MissingSecret("DOCUMENT_STORE_URL/DOCUMENT_STORE_TOKEN"));
        }

        Ok(())
    }
}
