//! Prometheus metrics recorder and pipeline instrumentation

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Turn stage duration seconds (histogram, label: stage).
pub const TURN_STAGE_DURATION_SECONDS: &str = "turn_stage_duration_seconds";
/// Completed turns total (counter).
pub const TURNS_TOTAL: &str = "turns_total";
/// Turn errors total (counter, label: stage).
pub const TURN_ERRORS_TOTAL: &str = "turn_errors_total";
/// Active conversations (gauge).
pub const CONVERSATIONS_ACTIVE: &str = "conversations_active";
/// Actions executed total (counter, label: status).
pub const ACTIONS_EXECUTED_TOTAL: &str = "actions_executed_total";

/// Pipeline stage label values
#[derive(Debug, Clone, Copy)]
pub enum Stage {
    Stt,
    Nlu,
    Action,
    Tts,
    Playback,
}

impl Stage {
    /// Label value for this stage
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stt => "stt",
            Self::Nlu => "nlu",
            Self::Action => "action",
            Self::Tts => "tts",
            Self::Playback => "playback",
        }
    }
}

/// Install the global Prometheus recorder
///
/// Must be called once at startup before any metrics are recorded. Returns
/// the handle used to render the `/metrics` endpoint.
///
/// # Errors
///
/// Returns error if a recorder is already installed
pub fn install_recorder() -> crate::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| crate::Error::Api(format!("failed to install metrics recorder: {e}")))?;
    tracing::info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Record one stage's latency
pub fn record_stage(stage: Stage, seconds: f64) {
    metrics::histogram!(TURN_STAGE_DURATION_SECONDS, "stage" => stage.as_str())
        .record(seconds);
}

/// Record a stage failure
pub fn record_stage_error(stage: Stage) {
    metrics::counter!(TURN_ERRORS_TOTAL, "stage" => stage.as_str()).increment(1);
}

/// Record a completed turn
pub fn record_turn() {
    metrics::counter!(TURNS_TOTAL).increment(1);
}

/// Set the active-conversation gauge
pub fn set_conversations_active(count: f64) {
    metrics::gauge!(CONVERSATIONS_ACTIVE).set(count);
}

/// Record an action dispatch outcome
pub fn record_action(success: bool) {
    let status = if success { "ok" } else { "failed" };
    metrics::counter!(ACTIONS_EXECUTED_TOTAL, "status" => status).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_without_global_install() {
        // Build a recorder + handle without installing globally to avoid
        // cross-test conflicts.
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn test_metric_names_are_snake_case() {
        for name in [
            TURN_STAGE_DURATION_SECONDS,
            TURNS_TOTAL,
            TURN_ERRORS_TOTAL,
            CONVERSATIONS_ACTIVE,
            ACTIONS_EXECUTED_TOTAL,
        ] {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }

    #[test]
    fn test_stage_labels() {
        assert_eq!(Stage::Stt.as_str(), "stt");
        assert_eq!(Stage::Playback.as_str(), "playback");
    }
}
