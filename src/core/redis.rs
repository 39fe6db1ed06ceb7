use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{cmd, Client, RedisError, Script};
use tokio::sync::RwLock;

const FIXED_WINDOW_SCRIPT: &str = r#"
    local current = redis.call("INCR", KEYS[1])
    if current == 1 then
        redis.call("EXPIRE", KEYS[1], ARGV[1])
    end
    return current
"#;

const SUBMISSION_WINDOW_SECONDS: u64 = 60;

#[derive(Clone)]
pub(crate) struct RedisHandle {
    url: String,
    manager: Arc<RwLock<Option<ConnectionManager>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RedisHealth {
    Healthy,
    Disconnected,
    Unhealthy(String),
}

impl RedisHandle {
    pub(crate) fn new(url: String) -> Self {
        Self { url, manager: Arc::new(RwLock::new(None)) }
    }

    pub(crate) async fn connect(&self) -> Result<(), RedisError> {
        let client = Client::open(self.url.clone())?;
        let manager = ConnectionManager::new(client).await?;
        *self.manager.write().await = Some(manager);
        Ok(())
    }

    pub(crate) async fn disconnect(&self) {
        *self.manager.write().await = None;
    }

    pub(crate) async fn health(&self) -> RedisHealth {
        let manager = { self.manager.read().await.clone() };
        let Some(mut manager) = manager else {
            return RedisHealth::Disconnected;
        };

        match cmd("PING").query_async::<_, String>(&mut manager).await {
            Ok(_) => RedisHealth::Healthy,
            Err(err) => RedisHealth::Unhealthy(err.to_string()),
        }
    }

    /// Fixed-window counter. Allows everything while Redis is not connected.
    pub(crate) async fn rate_limit(
        &self,
        key: &str,
        limit: u64,
        window_seconds: u64,
    ) -> Result<bool, RedisError> {
        let manager = { self.manager.read().await.clone() };
        let Some(mut manager) = manager else {
            return Ok(true);
        };

        let current: i64 = Script::new(FIXED_WINDOW_SCRIPT)
            .key(key)
            .arg(window_seconds as i64)
            .invoke_async(&mut manager)
            .await?;

        Ok(current <= limit as i64)
    }

    /// Per-subject submission budget; Redis errors let the request through.
    pub(crate) async fn allow_submission(&self, subject_id: &str, per_minute: u64) -> bool {
        let key = submission_key(subject_id);
        match self.rate_limit(&key, per_minute, SUBMISSION_WINDOW_SECONDS).await {
            Ok(allowed) => allowed,
            Err(err) => {
                tracing::warn!(subject_id, error = %err, "Submission rate limit check failed");
                true
            }
        }
    }
}

fn submission_key(subject_id: &str) -> String {
    format!("linguacheck:rate:submissions:{subject_id}")
}
