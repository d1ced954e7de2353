use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================
// Core Domain Models (matching frontend TypeScript interfaces)
// ============================================================

/// Error string recorded when a probe is short-circuited by a stop request.
pub const STOP_ERROR_MSG: &str = "Detection stopped by user";

/// Error string recorded when a 2xx body is missing the expected content field.
pub const EMPTY_RESPONSE_MSG: &str = "empty/invalid response";

/// Bytes of response body captured on success paths.
pub const RESPONSE_CAPTURE_BYTES: usize = 2048;

/// Bytes of upstream error body captured on non-2xx responses.
pub const ERROR_CAPTURE_BYTES: usize = 512;

/// Which upstream API family a probe speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Chat,
    Claude,
    Gemini,
    Codex,
    Image,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Codex => "codex",
            Self::Image => "image",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(Self::Chat),
            "claude" => Some(Self::Claude),
            "gemini" => Some(Self::Gemini),
            "codex" => Some(Self::Codex),
            "image" => Some(Self::Image),
            _ => None,
        }
    }
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single probe against one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Success,
    Fail,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

/// Aggregate health derived from a model's endpoint rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Partial,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Partial => "partial",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(Self::Healthy),
            "partial" => Some(Self::Partial),
            "unhealthy" => Some(Self::Unhealthy),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Derive a model's aggregate health from the statuses of its endpoint rows.
///
/// No rows → unknown. All success → healthy. All fail → unhealthy.
/// Mixed → partial, which still counts as a live model (`last_status = true`).
pub fn derive_health(statuses: &[ProbeStatus]) -> (HealthStatus, Option<bool>) {
    if statuses.is_empty() {
        return (HealthStatus::Unknown, None);
    }
    let successes = statuses.iter().filter(|s| **s == ProbeStatus::Success).count();
    if successes == statuses.len() {
        (HealthStatus::Healthy, Some(true))
    } else if successes == 0 {
        (HealthStatus::Unhealthy, Some(false))
    } else {
        (HealthStatus::Partial, Some(true))
    }
}

/// How a channel selects the API key used for probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    Single,
    Multi,
}

impl KeyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Multi => "multi",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "single" => Some(Self::Single),
            "multi" => Some(Self::Multi),
            _ => None,
        }
    }
}

/// An additional API key attached to a multi-key channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelKey {
    pub id: String,
    pub channel_id: String,
    pub api_key: String,
    /// None = never checked, Some(true/false) = outcome of the last probe using it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A configured upstream: base URL + primary key + optional extras.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub name: String,
    /// Normalized: no trailing slash.
    pub base_url: String,
    pub api_key: String,
    pub key_mode: KeyMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    pub enabled: bool,
    pub sort_order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<ChannelKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<Model>,
}

/// A model name offered by a channel, with derived aggregate health.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: String,
    pub channel_id: String,
    pub model_name: String,
    pub health_status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_latency_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Pin probes for this model to a specific additional key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_key_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<ModelEndpoint>,
}

/// Latest probe outcome for one `(model, endpoint kind)` slot.
/// At most one row exists per slot; later probes overwrite it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEndpoint {
    pub model_id: String,
    pub endpoint_kind: EndpointKind,
    pub status: ProbeStatus,
    pub latency_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_content: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Append-only probe history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckLog {
    pub id: String,
    pub model_id: String,
    pub endpoint_kind: EndpointKind,
    pub status: ProbeStatus,
    pub latency_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_content: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================
// Scheduler configuration (singleton row, id = "default")
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cron_expression")]
    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_channel_concurrency")]
    pub channel_concurrency: u32,
    #[serde(default = "default_max_global_concurrency")]
    pub max_global_concurrency: u32,
    #[serde(default = "default_min_jitter_ms")]
    pub min_jitter_ms: u64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
    #[serde(default)]
    pub log_retention_days: Option<u32>,
    /// Also probe the plain chat completion endpoint for non-chat models.
    #[serde(default)]
    pub probe_chat_fallback: bool,
    #[serde(default = "default_true")]
    pub detect_all_channels: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_channel_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_model_ids: Option<HashMap<String, Vec<String>>>,
}

fn default_true() -> bool { true }
fn default_cron_expression() -> String { "0 */6 * * *".to_string() }
fn default_timezone() -> String { "UTC".to_string() }
fn default_channel_concurrency() -> u32 { 5 }
fn default_max_global_concurrency() -> u32 { 30 }
fn default_min_jitter_ms() -> u64 { 3000 }
fn default_max_jitter_ms() -> u64 { 5000 }

pub const DEFAULT_LOG_RETENTION_DAYS: u32 = 7;

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cron_expression: default_cron_expression(),
            timezone: default_timezone(),
            channel_concurrency: default_channel_concurrency(),
            max_global_concurrency: default_max_global_concurrency(),
            min_jitter_ms: default_min_jitter_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            log_retention_days: None,
            probe_chat_fallback: false,
            detect_all_channels: true,
            selected_channel_ids: None,
            selected_model_ids: None,
        }
    }
}

impl SchedulerConfig {
    /// Clamp the tunables into their invariant ranges rather than rejecting.
    pub fn normalized(mut self) -> Self {
        if self.channel_concurrency < 1 {
            self.channel_concurrency = 1;
        }
        if self.max_global_concurrency < self.channel_concurrency {
            self.max_global_concurrency = self.channel_concurrency;
        }
        if self.max_jitter_ms < self.min_jitter_ms {
            self.max_jitter_ms = self.min_jitter_ms;
        }
        self
    }

    pub fn retention_days(&self) -> u32 {
        self.log_retention_days.unwrap_or(DEFAULT_LOG_RETENTION_DAYS)
    }
}

// ============================================================
// Jobs, outcomes and progress events
// ============================================================

/// One unit of probe work: everything a worker needs to hit the upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeJob {
    pub id: String,
    pub channel_id: String,
    pub model_id: String,
    pub model_name: String,
    pub endpoint_kind: EndpointKind,
    pub base_url: String,
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    /// Set when the model pins its probes to an additional key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_key_id: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

impl ProbeJob {
    /// Informational job id: `{channel}-{model}-{kind}-{epochMs}[-{index}]`.
    pub fn make_id(
        channel_id: &str,
        model_id: &str,
        kind: EndpointKind,
        index: Option<usize>,
    ) -> String {
        let epoch_ms = Utc::now().timestamp_millis();
        match index {
            Some(i) => format!("{}-{}-{}-{}-{}", channel_id, model_id, kind, epoch_ms, i),
            None => format!("{}-{}-{}-{}", channel_id, model_id, kind, epoch_ms),
        }
    }
}

/// What a single probe produced, ready to persist and publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeOutcome {
    pub kind: EndpointKind,
    pub status: ProbeStatus,
    pub latency_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_content: Option<String>,
}

impl ProbeOutcome {
    pub fn success(kind: EndpointKind, latency_ms: i64, content: Option<String>) -> Self {
        Self {
            kind,
            status: ProbeStatus::Success,
            latency_ms,
            http_status: Some(200),
            error_msg: None,
            response_content: content,
        }
    }

    pub fn failure(kind: EndpointKind, latency_ms: i64, error_msg: impl Into<String>) -> Self {
        Self {
            kind,
            status: ProbeStatus::Fail,
            latency_ms,
            http_status: None,
            error_msg: Some(error_msg.into()),
            response_content: None,
        }
    }

    pub fn canceled(kind: EndpointKind) -> Self {
        Self::failure(kind, 0, STOP_ERROR_MSG)
    }
}

/// Event published after each probe completes; consumed by the SSE feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub channel_id: String,
    pub model_id: String,
    pub model_name: String,
    pub endpoint_kind: EndpointKind,
    pub status: ProbeStatus,
    pub latency_ms: i64,
    pub timestamp: DateTime<Utc>,
    /// No further jobs pending for this model; UI can retire "testing" state.
    pub is_model_complete: bool,
}

/// Queue counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub total: u64,
}

/// Detection progress as reported to the dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    #[serde(flatten)]
    pub stats: QueueStats,
    pub is_running: bool,
    pub progress_percent: f64,
    pub testing_model_ids: Vec<String>,
    pub testing_channel_ids: Vec<String>,
}

/// Per-channel result of a catalog sync pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSyncResult {
    pub channel_id: String,
    pub channel_name: String,
    pub added: usize,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a trigger call produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionReport {
    pub channels: usize,
    pub model_count: usize,
    pub job_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_results: Option<Vec<ChannelSyncResult>>,
}

// ============================================================
// Scheduler status views
// ============================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionTaskStatus {
    pub enabled: bool,
    pub running: bool,
    pub schedule: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupTaskStatus {
    pub running: bool,
    pub schedule: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyView {
    pub channel_concurrency: u32,
    pub max_global_concurrency: u32,
    pub min_jitter_ms: u64,
    pub max_jitter_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub detection: DetectionTaskStatus,
    pub cleanup: CleanupTaskStatus,
    pub config: ConcurrencyView,
}

// ============================================================
// API request types
// ============================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerFullRequest {
    #[serde(default)]
    pub sync_first: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerChannelRequest {
    #[serde(default)]
    pub model_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSelectiveRequest {
    #[serde(default)]
    pub channel_ids: Option<Vec<String>>,
    #[serde(default)]
    pub model_ids_by_channel: Option<HashMap<String, Vec<String>>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelRequest {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub additional_keys: Vec<String>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateChannelRequest {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub proxy_url: Option<String>,
    pub enabled: Option<bool>,
    pub sort_order: Option<i64>,
}

/// Base URL must be `http(s)://`, contain no whitespace and not end in `/`.
pub fn is_valid_base_url(url: &str) -> bool {
    let re = regex::Regex::new(r"^https?://[^\s]+[^/]$").unwrap();
    re.is_match(url)
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod health_derivation_tests {
        use super::*;

        #[test]
        fn no_endpoints_is_unknown() {
            let (health, last) = derive_health(&[]);
            assert_eq!(health, HealthStatus::Unknown);
            assert_eq!(last, None);
        }

        #[test]
        fn all_success_is_healthy() {
            let (health, last) = derive_health(&[ProbeStatus::Success, ProbeStatus::Success]);
            assert_eq!(health, HealthStatus::Healthy);
            assert_eq!(last, Some(true));
        }

        #[test]
        fn all_fail_is_unhealthy() {
            let (health, last) = derive_health(&[ProbeStatus::Fail]);
            assert_eq!(health, HealthStatus::Unhealthy);
            assert_eq!(last, Some(false));
        }

        #[test]
        fn mixed_is_partial_and_counts_as_live() {
            let (health, last) = derive_health(&[ProbeStatus::Success, ProbeStatus::Fail]);
            assert_eq!(health, HealthStatus::Partial);
            assert_eq!(last, Some(true));
        }

        #[test]
        fn derivation_depends_only_on_status_multiset() {
            for n_success in 0..4usize {
                for n_fail in 0..4usize {
                    let mut statuses = vec![ProbeStatus::Success; n_success];
                    statuses.extend(vec![ProbeStatus::Fail; n_fail]);
                    let (health, last) = derive_health(&statuses);
                    let expected = match (n_success, n_fail) {
                        (0, 0) => (HealthStatus::Unknown, None),
                        (_, 0) => (HealthStatus::Healthy, Some(true)),
                        (0, _) => (HealthStatus::Unhealthy, Some(false)),
                        _ => (HealthStatus::Partial, Some(true)),
                    };
                    assert_eq!((health, last), expected, "s={} f={}", n_success, n_fail);
                }
            }
        }
    }

    mod endpoint_kind_tests {
        use super::*;

        #[test]
        fn kind_serializes_lowercase() {
            let json = serde_json::to_string(&EndpointKind::Claude).unwrap();
            assert_eq!(json, "\"claude\"");
        }

        #[test]
        fn kind_roundtrips_through_strings() {
            for kind in [
                EndpointKind::Chat,
                EndpointKind::Claude,
                EndpointKind::Gemini,
                EndpointKind::Codex,
                EndpointKind::Image,
            ] {
                assert_eq!(EndpointKind::from_str(kind.as_str()), Some(kind));
            }
        }

        #[test]
        fn unknown_kind_string_is_none() {
            assert_eq!(EndpointKind::from_str("grpc"), None);
        }
    }

    mod scheduler_config_tests {
        use super::*;

        #[test]
        fn default_config_matches_documented_defaults() {
            let config = SchedulerConfig::default();
            assert!(!config.enabled);
            assert_eq!(config.cron_expression, "0 */6 * * *");
            assert_eq!(config.timezone, "UTC");
            assert_eq!(config.channel_concurrency, 5);
            assert_eq!(config.max_global_concurrency, 30);
            assert_eq!(config.min_jitter_ms, 3000);
            assert_eq!(config.max_jitter_ms, 5000);
            assert!(config.detect_all_channels);
            assert_eq!(config.retention_days(), 7);
        }

        #[test]
        fn normalized_enforces_invariants() {
            let config = SchedulerConfig {
                channel_concurrency: 0,
                max_global_concurrency: 0,
                min_jitter_ms: 9000,
                max_jitter_ms: 100,
                ..Default::default()
            }
            .normalized();
            assert_eq!(config.channel_concurrency, 1);
            assert!(config.max_global_concurrency >= config.channel_concurrency);
            assert!(config.max_jitter_ms >= config.min_jitter_ms);
        }

        #[test]
        fn config_deserializes_with_defaults() {
            let config: SchedulerConfig = serde_json::from_str("{}").unwrap();
            assert_eq!(config.channel_concurrency, 5);
            assert_eq!(config.max_global_concurrency, 30);
            assert!(config.selected_channel_ids.is_none());
        }
    }

    mod probe_job_tests {
        use super::*;

        #[test]
        fn job_id_contains_all_parts() {
            let id = ProbeJob::make_id("ch_1", "mdl_2", EndpointKind::Gemini, None);
            assert!(id.starts_with("ch_1-mdl_2-gemini-"));
        }

        #[test]
        fn job_id_index_suffix() {
            let id = ProbeJob::make_id("ch_1", "mdl_2", EndpointKind::Chat, Some(3));
            assert!(id.ends_with("-3"));
        }

        #[test]
        fn job_roundtrips_through_json() {
            let job = ProbeJob {
                id: "ch-mdl-chat-0".to_string(),
                channel_id: "ch_1".to_string(),
                model_id: "mdl_1".to_string(),
                model_name: "gpt-4".to_string(),
                endpoint_kind: EndpointKind::Chat,
                base_url: "https://api.example.test".to_string(),
                api_key: "sk-ok".to_string(),
                proxy_url: None,
                channel_key_id: None,
                attempts: 0,
            };
            let json = serde_json::to_string(&job).unwrap();
            let parsed: ProbeJob = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed.model_name, "gpt-4");
            assert_eq!(parsed.endpoint_kind, EndpointKind::Chat);
        }

        #[test]
        fn job_without_attempts_field_defaults_to_zero() {
            // Payloads written before the retry counter existed still parse
            let json = r#"{
                "id": "ch-mdl-chat-0",
                "channelId": "ch_1",
                "modelId": "mdl_1",
                "modelName": "gpt-4",
                "endpointKind": "chat",
                "baseUrl": "https://api.example.test",
                "apiKey": "sk-ok"
            }"#;
            let job: ProbeJob = serde_json::from_str(json).unwrap();
            assert_eq!(job.attempts, 0);
            assert!(job.proxy_url.is_none());
        }
    }

    mod probe_outcome_tests {
        use super::*;

        #[test]
        fn canceled_outcome_carries_stop_message() {
            let outcome = ProbeOutcome::canceled(EndpointKind::Chat);
            assert_eq!(outcome.status, ProbeStatus::Fail);
            assert_eq!(outcome.error_msg.as_deref(), Some(STOP_ERROR_MSG));
        }

        #[test]
        fn failure_outcome_has_no_content() {
            let outcome = ProbeOutcome::failure(EndpointKind::Image, 42, "timeout");
            assert_eq!(outcome.latency_ms, 42);
            assert!(outcome.response_content.is_none());
        }
    }

    mod progress_event_tests {
        use super::*;

        #[test]
        fn event_serializes_camel_case() {
            let event = ProgressEvent {
                channel_id: "ch_1".to_string(),
                model_id: "mdl_1".to_string(),
                model_name: "claude-3".to_string(),
                endpoint_kind: EndpointKind::Claude,
                status: ProbeStatus::Success,
                latency_ms: 120,
                timestamp: Utc::now(),
                is_model_complete: true,
            };
            let json = serde_json::to_string(&event).unwrap();
            assert!(json.contains("\"channelId\":\"ch_1\""));
            assert!(json.contains("\"isModelComplete\":true"));
            assert!(json.contains("\"endpointKind\":\"claude\""));
        }

        #[test]
        fn snapshot_flattens_queue_stats() {
            let snapshot = ProgressSnapshot {
                stats: QueueStats {
                    waiting: 2,
                    active: 1,
                    completed: 3,
                    failed: 0,
                    delayed: 0,
                    total: 6,
                },
                is_running: true,
                progress_percent: 50.0,
                testing_model_ids: vec!["mdl_1".to_string()],
                testing_channel_ids: vec!["ch_1".to_string()],
            };
            let json = serde_json::to_string(&snapshot).unwrap();
            assert!(json.contains("\"waiting\":2"));
            assert!(json.contains("\"isRunning\":true"));
            assert!(json.contains("\"progressPercent\":50.0"));
        }
    }

    mod base_url_tests {
        use super::*;

        #[test]
        fn accepts_plain_http_and_https_urls() {
            assert!(is_valid_base_url("https://api.example.test"));
            assert!(is_valid_base_url("http://10.0.0.1:8080/v1x"));
        }

        #[test]
        fn rejects_trailing_slash() {
            assert!(!is_valid_base_url("https://api.example.test/"));
        }

        #[test]
        fn rejects_other_schemes_and_whitespace() {
            assert!(!is_valid_base_url("ftp://api.example.test"));
            assert!(!is_valid_base_url("https://api example.test"));
        }
    }
}
