use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use crate::core::config::Settings;
use crate::services::ports::{CompletionParams, Prompt, TextGenerator, UpstreamError};

/// Chat-completions client for OpenAI-compatible endpoints.
#[derive(Debug, Clone)]
pub(crate) struct OpenAiTextGenerator {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

impl OpenAiTextGenerator {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        // Each attempt is also bounded by the caller's generation timeout.
        let timeout = settings.assessment().generation_timeout() + Duration::from_secs(5);
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key: settings.ai().openai_api_key.clone(),
            base_url: settings.ai().openai_base_url.trim_end_matches('/').to_string(),
            model: settings.ai().ai_model.clone(),
            max_tokens: settings.ai().ai_max_tokens,
            temperature: settings.ai().ai_temperature,
        })
    }

    fn payload(&self, prompt: &Prompt, params: CompletionParams) -> Value {
        json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user}
            ],
            "max_completion_tokens": params.max_tokens.unwrap_or(self.max_tokens),
            "temperature": params.temperature.unwrap_or(self.temperature),
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAiTextGenerator {
    async fn complete(
        &self,
        prompt: &Prompt,
        params: CompletionParams,
    ) -> Result<String, UpstreamError> {
        let timer = Instant::now();
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.payload(prompt, params))
            .send()
            .await
            .map_err(|err| UpstreamError::Failed(format!("request failed: {err}")))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(UpstreamError::RateLimited);
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(UpstreamError::Failed(format!("status {status}: {body}")));
        }

        // The call succeeded; absent output is left to the normalizer's fallback.
        let content = extract_content(&body);
        if content.is_empty() {
            tracing::warn!(model = %self.model, "Completion returned no content");
        }

        let tokens_used =
            body.get("usage").and_then(|usage| usage.get("total_tokens")).and_then(Value::as_u64);
        metrics::histogram!("generation_upstream_duration_seconds")
            .record(timer.elapsed().as_secs_f64());
        tracing::debug!(
            model = %self.model,
            elapsed_ms = timer.elapsed().as_millis() as u64,
            tokens_used,
            "Text generation completed"
        );

        Ok(content)
    }
}

fn extract_content(body: &Value) -> String {
    body.get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn extracts_first_choice_content() {
        let body = json!({
            "choices": [{"message": {"role": "assistant", "content": "Grammar: 8/10"}}],
            "usage": {"total_tokens": 12}
        });
        assert_eq!(extract_content(&body), "Grammar: 8/10");
    }

    #[test]
    fn absent_content_is_empty_output() {
        assert_eq!(extract_content(&json!({"choices": []})), "");
        assert_eq!(extract_content(&json!({"choices": [{"message": {"content": null}}]})), "");
        assert_eq!(extract_content(&Value::Null), "");
    }

    #[tokio::test]
    async fn payload_uses_settings_unless_overridden() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        let settings = Settings::load().expect("settings");
        let generator = OpenAiTextGenerator::from_settings(&settings).expect("generator");
        let prompt = Prompt { system: "sys".to_string(), user: "usr".to_string() };

        let payload = generator.payload(&prompt, CompletionParams::default());
        assert_eq!(payload["model"], "gpt-4o-mini");
        assert_eq!(payload["max_completion_tokens"], 1500);
        assert_eq!(payload["messages"][1]["content"], "usr");

        let payload = generator.payload(
            &prompt,
            CompletionParams { max_tokens: Some(200), temperature: Some(0.0) },
        );
        assert_eq!(payload["max_completion_tokens"], 200);
        assert_eq!(payload["temperature"], 0.0);
    }
}
