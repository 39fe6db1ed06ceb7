use std::sync::OnceLock;

use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROM_HANDLE.set(handle);
    describe();
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}

fn describe() {
    describe_counter!("http_requests_total", "HTTP requests by method, path and status");
    describe_histogram!("http_request_duration_seconds", Unit::Seconds, "HTTP request latency");
    describe_counter!("generation_upstream_calls_total", "Calls made to the text generator");
    describe_counter!("generation_retries_total", "Rate-limited generation attempts retried");
    describe_counter!("generation_cache_hits_total", "Generations served from the cache");
    describe_counter!("generation_joined_total", "Callers attached to an in-flight generation");
    describe_counter!("generation_failures_total", "Generations that settled with an error");
    describe_histogram!(
        "generation_upstream_duration_seconds",
        Unit::Seconds,
        "Latency of successful text generator calls"
    );
    describe_counter!("eligibility_lookup_failures_total", "Eligibility lookups that failed open");
    describe_counter!("submission_sagas_total", "Presentation submissions by outcome");
    describe_counter!("submission_compensations_total", "Compensating deletes by target and outcome");
    describe_counter!("writing_evaluations_total", "Written responses evaluated by provenance");
    describe_histogram!("db_ping_duration_seconds", Unit::Seconds, "Health check database round trip");
    describe_counter!("rate_limited_requests_total", "Submissions rejected by the rate limiter");
}
