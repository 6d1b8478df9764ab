//! Structured agent execution log (schema v1).
//!
//! A run of the agent produces a [`LogBatchResult`]: an ordered list of [`LogStep`]s rendered as a
//! collapsible outline, plus an optional [`FinalResultEvent`] shown in its own panel. Every payload
//! that crosses a process or storage boundary goes through [`classify_batch`] before it is trusted.

pub mod builder;
pub mod store;
pub mod summary;

use std::collections::HashSet;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use builder::{BatchBuilder, StepDraft};
pub use store::{ExecutionLogStore, LogSnapshot, Subscription};

pub const SCHEMA_VERSION: u32 = 1;

/// Drops sub-millisecond precision, which the `ts` wire field cannot carry.
pub fn wire_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(ts)
}

/// Current time at the precision a serialized log keeps.
pub fn wire_now() -> DateTime<Utc> {
    wire_precision(Utc::now())
}

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("payload is not a schema v{} log batch", SCHEMA_VERSION)]
    Mismatch,
    #[error("log batch could not be decoded: {0}")]
    Invalid(String),
    #[error("step index {0} appears more than once")]
    DuplicateIndex(u64),
    #[error("step {index} references unknown tool call '{tool_call_id}'")]
    DanglingToolCall { index: u64, tool_call_id: String },
    #[error("final result is older than step {0}")]
    FinalBeforeStep(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRole {
    System,
    User,
    Assistant,
    Tool,
    ToolResult,
    Other,
}

impl LogRole {
    /// Maps a provider or framework role name onto the schema roles.
    pub fn normalize(role: &str) -> Self {
        match role {
            "system" => LogRole::System,
            "user" | "human" => LogRole::User,
            "assistant" | "ai" => LogRole::Assistant,
            "tool" => LogRole::Tool,
            "tool_result" => LogRole::ToolResult,
            _ => LogRole::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogRole::System => "system",
            LogRole::User => "user",
            LogRole::Assistant => "assistant",
            LogRole::Tool => "tool",
            LogRole::ToolResult => "tool_result",
            LogRole::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One unit of agent activity. `index` is the only ordering key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStep {
    pub id: String,
    pub index: u64,
    pub role: LogRole,
    pub summary: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(rename = "ts", with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultFormat {
    #[default]
    Markdown,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalResultTag {
    #[default]
    FinalResult,
}

/// The agent's terminal answer for a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResultEvent {
    #[serde(rename = "type", default)]
    pub kind: FinalResultTag,
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub format: ResultFormat,
    #[serde(rename = "ts", with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl FinalResultEvent {
    pub fn new(content: impl Into<String>, format: ResultFormat) -> Self {
        Self {
            kind: FinalResultTag::FinalResult,
            id: "final".to_string(),
            content: content.into(),
            format,
            timestamp: wire_now(),
        }
    }
}

/// Fine-grained timeline entries, reserved for streamed runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    Step {
        step: LogStep,
    },
    FinalResult {
        id: String,
        content: String,
        #[serde(default)]
        format: ResultFormat,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        ts: DateTime<Utc>,
    },
    SystemPromptExcerpt {
        text: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        ts: DateTime<Utc>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        ts: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogBatchResult {
    pub schema_version: u32,
    #[serde(default)]
    pub steps: Vec<LogStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_result: Option<FinalResultEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_excerpt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<LogEvent>>,
}

impl Default for LogBatchResult {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            steps: Vec::new(),
            final_result: None,
            system_prompt_excerpt: None,
            events: None,
        }
    }
}

/// True iff `x` carries the current schema version and a `steps` array.
pub fn classify_batch(x: &Value) -> bool {
    let Some(obj) = x.as_object() else {
        return false;
    };
    let version_matches = obj
        .get("schemaVersion")
        .and_then(Value::as_u64)
        .is_some_and(|v| v == u64::from(SCHEMA_VERSION));
    version_matches && obj.get("steps").is_some_and(Value::is_array)
}

/// Decodes a serialized batch, refusing anything that fails [`classify_batch`].
pub fn parse_batch(raw: &str) -> Result<LogBatchResult, SchemaError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| SchemaError::Invalid(e.to_string()))?;
    LogBatchResult::from_value(value)
}

impl LogBatchResult {
    pub fn from_value(value: Value) -> Result<Self, SchemaError> {
        if !classify_batch(&value) {
            return Err(SchemaError::Mismatch);
        }
        serde_json::from_value(value).map_err(|e| SchemaError::Invalid(e.to_string()))
    }

    /// Checks the ordering and correlation invariants the producer is responsible for.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut ordered: Vec<&LogStep> = self.steps.iter().collect();
        ordered.sort_by_key(|s| s.index);

        let mut seen_indices = HashSet::new();
        let mut known_calls: HashSet<String> = HashSet::new();
        for step in ordered {
            if !seen_indices.insert(step.index) {
                return Err(SchemaError::DuplicateIndex(step.index));
            }
            if step.role == LogRole::ToolResult
                && let Some(id) = step.tool_call_id.as_deref()
                && !known_calls.contains(id)
            {
                return Err(SchemaError::DanglingToolCall {
                    index: step.index,
                    tool_call_id: id.to_string(),
                });
            }
            known_calls.extend(tool_call_ids(step));
        }

        if let Some(final_result) = &self.final_result
            && let Some(late) = self
                .steps
                .iter()
                .find(|s| s.timestamp > final_result.timestamp)
        {
            return Err(SchemaError::FinalBeforeStep(late.index));
        }
        Ok(())
    }
}

// Ids a step makes available to later tool_result steps.
fn tool_call_ids(step: &LogStep) -> Vec<String> {
    let mut ids = Vec::new();
    match &step.tool_calls {
        Some(Value::Array(calls)) => ids.extend(
            calls
                .iter()
                .filter_map(|c| c.get("id").and_then(Value::as_str))
                .map(str::to_string),
        ),
        Some(call @ Value::Object(_)) => {
            if let Some(id) = call.get("id").and_then(Value::as_str) {
                ids.push(id.to_string());
            }
        }
        _ => {}
    }
    if step.role != LogRole::ToolResult
        && let Some(id) = &step.tool_call_id
    {
        ids.push(id.clone());
    }
    ids
}

/// Stable, process-independent step id.
pub fn create_step_id(index: u64, role: LogRole) -> String {
    format!("step-{}-{}-{}", index, role.as_str(), uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn step(index: u64, role: LogRole, ms: i64) -> LogStep {
        LogStep {
            id: create_step_id(index, role),
            index,
            role,
            summary: format!("step#{}", index),
            content: String::new(),
            tool_calls: None,
            tool_call_id: None,
            timestamp: Utc.timestamp_millis_opt(ms).unwrap(),
            level: None,
            error: None,
            raw: None,
        }
    }

    #[test]
    fn classify_accepts_current_version_with_steps() {
        assert!(classify_batch(&json!({ "schemaVersion": 1, "steps": [] })));
    }

    #[test]
    fn classify_rejects_wrong_version_missing_steps_and_non_objects() {
        assert!(!classify_batch(&json!({ "schemaVersion": 2, "steps": [] })));
        assert!(!classify_batch(&json!({ "schemaVersion": "1", "steps": [] })));
        assert!(!classify_batch(&json!({ "schemaVersion": 1 })));
        assert!(!classify_batch(&json!({ "schemaVersion": 1, "steps": {} })));
        assert!(!classify_batch(&json!([1, 2, 3])));
        assert!(!classify_batch(&Value::Null));
    }

    #[test]
    fn parse_reads_wire_format() {
        let raw = r##"{
            "schemaVersion": 1,
            "steps": [{
                "id": "step-1-user-x", "index": 1, "role": "user", "summary": "step#1 • hi",
                "content": "hi", "ts": 1700000000000
            }, {
                "id": "step-2-tool_result-x", "index": 2, "role": "tool_result", "summary": "s",
                "content": "42", "toolCallId": "call_1", "ts": 1700000000001, "level": "warn"
            }],
            "finalResult": { "type": "final_result", "id": "final", "content": "# done", "format": "markdown", "ts": 1700000000002 },
            "systemPromptExcerpt": "You are"
        }"##;
        let batch = parse_batch(raw).unwrap();
        assert_eq!(batch.steps.len(), 2);
        assert_eq!(batch.steps[1].role, LogRole::ToolResult);
        assert_eq!(batch.steps[1].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(batch.steps[1].level, Some(LogLevel::Warn));
        assert_eq!(batch.steps[0].timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(batch.final_result.unwrap().content, "# done");
        assert_eq!(batch.system_prompt_excerpt.as_deref(), Some("You are"));
    }

    #[test]
    fn parse_refuses_version_mismatch_instead_of_coercing() {
        let err = parse_batch(r#"{"schemaVersion": 0, "steps": []}"#).unwrap_err();
        assert_eq!(err, SchemaError::Mismatch);
        assert!(matches!(parse_batch("not json"), Err(SchemaError::Invalid(_))));
    }

    #[test]
    fn serialized_batch_round_trips_through_classifier() {
        let batch = LogBatchResult {
            steps: vec![step(1, LogRole::User, 10)],
            final_result: Some(FinalResultEvent::new("ok", ResultFormat::Text)),
            ..Default::default()
        };
        let value = serde_json::to_value(&batch).unwrap();
        assert!(classify_batch(&value));
        assert_eq!(value["finalResult"]["type"], "final_result");
        assert_eq!(value["steps"][0]["ts"], 10);
        assert_eq!(LogBatchResult::from_value(value).unwrap(), batch);
    }

    #[test]
    fn built_batches_survive_a_wire_round_trip_unchanged() {
        let mut builder = BatchBuilder::new();
        builder.push(LogRole::User, "hi");
        builder.push(LogRole::Assistant, "hello");
        let batch = builder.finish("hello", ResultFormat::Markdown);

        let raw = serde_json::to_string(&batch).unwrap();
        assert_eq!(parse_batch(&raw).unwrap(), batch);
        assert_eq!(wire_now().timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn event_union_uses_type_tag() {
        let event: LogEvent =
            serde_json::from_value(json!({ "type": "error", "message": "boom", "ts": 5 })).unwrap();
        assert!(matches!(event, LogEvent::Error { ref message, .. } if message == "boom"));
    }

    #[test]
    fn validate_rejects_duplicate_indices() {
        let batch = LogBatchResult {
            steps: vec![step(1, LogRole::User, 1), step(1, LogRole::Assistant, 2)],
            ..Default::default()
        };
        assert_eq!(batch.validate(), Err(SchemaError::DuplicateIndex(1)));
    }

    #[test]
    fn validate_requires_tool_results_to_follow_their_call() {
        let mut call = step(2, LogRole::Assistant, 2);
        call.tool_calls = Some(json!([{ "id": "call_1", "name": "search" }]));
        let mut result = step(3, LogRole::ToolResult, 3);
        result.tool_call_id = Some("call_1".into());

        let ok = LogBatchResult {
            steps: vec![step(1, LogRole::User, 1), call.clone(), result.clone()],
            ..Default::default()
        };
        assert_eq!(ok.validate(), Ok(()));

        result.index = 1;
        call.index = 2;
        let dangling = LogBatchResult {
            steps: vec![result, call],
            ..Default::default()
        };
        assert!(matches!(
            dangling.validate(),
            Err(SchemaError::DanglingToolCall { index: 1, .. })
        ));
    }

    #[test]
    fn validate_orders_by_index_not_arrival() {
        let mut call = step(1, LogRole::Tool, 1);
        call.tool_call_id = Some("c9".into());
        let mut result = step(2, LogRole::ToolResult, 2);
        result.tool_call_id = Some("c9".into());
        let batch = LogBatchResult {
            steps: vec![result, call],
            ..Default::default()
        };
        assert_eq!(batch.validate(), Ok(()));
    }

    #[test]
    fn validate_checks_final_result_is_last() {
        let mut final_result = FinalResultEvent::new("x", ResultFormat::Markdown);
        final_result.timestamp = Utc.timestamp_millis_opt(5).unwrap();
        let batch = LogBatchResult {
            steps: vec![step(1, LogRole::User, 1), step(2, LogRole::Assistant, 9)],
            final_result: Some(final_result),
            ..Default::default()
        };
        assert_eq!(batch.validate(), Err(SchemaError::FinalBeforeStep(2)));
    }

    #[test]
    fn roles_normalize_framework_aliases() {
        assert_eq!(LogRole::normalize("human"), LogRole::User);
        assert_eq!(LogRole::normalize("ai"), LogRole::Assistant);
        assert_eq!(LogRole::normalize("tool_result"), LogRole::ToolResult);
        assert_eq!(LogRole::normalize("function"), LogRole::Other);
    }

    #[test]
    fn step_ids_encode_index_and_role() {
        let id = create_step_id(3, LogRole::ToolResult);
        assert!(id.starts_with("step-3-tool_result-"));
        assert_ne!(id, create_step_id(3, LogRole::ToolResult));
    }
}
