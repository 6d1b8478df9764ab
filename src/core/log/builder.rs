use chrono::{DateTime, Utc};
use serde_json::Value;

use super::summary::{DEFAULT_SUMMARY_LEN, build_step_summary};
use super::{
    FinalResultEvent, LogBatchResult, LogLevel, LogRole, LogStep, ResultFormat, SCHEMA_VERSION,
    create_step_id, wire_now,
};

/// Longest system prompt excerpt kept in a batch, in chars.
const SYSTEM_PROMPT_EXCERPT_CHARS: usize = 200;

/// Producer-side input for one step; the builder fills in index, id, summary and timestamp.
#[derive(Debug, Clone)]
pub struct StepDraft {
    pub role: LogRole,
    pub content: String,
    pub tool_calls: Option<Value>,
    pub tool_call_id: Option<String>,
    pub level: Option<LogLevel>,
    pub error: Option<String>,
    pub raw: Option<String>,
}

impl StepDraft {
    pub fn new(role: LogRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            level: None,
            error: None,
            raw: None,
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Value) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    pub fn with_tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.level = Some(LogLevel::Error);
        self.error = Some(error.into());
        self
    }
}

/// Assembles a [`LogBatchResult`] in the order the agent loop observes activity.
#[derive(Debug, Default)]
pub struct BatchBuilder {
    steps: Vec<LogStep>,
    system_prompt_excerpt: Option<String>,
}

impl BatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, role: LogRole, content: impl Into<String>) -> &LogStep {
        self.push_step(StepDraft::new(role, content))
    }

    pub fn push_step(&mut self, draft: StepDraft) -> &LogStep {
        let index = self.steps.len() as u64 + 1;
        let summary = build_step_summary(
            index,
            draft.role,
            &draft.content,
            draft.tool_calls.as_ref(),
            draft.tool_call_id.as_deref(),
            DEFAULT_SUMMARY_LEN,
        );
        // Wall clocks can step backwards; keep timestamps monotone within a batch.
        let timestamp = self.not_before_last(wire_now());
        self.steps.push(LogStep {
            id: create_step_id(index, draft.role),
            index,
            role: draft.role,
            summary,
            content: draft.content,
            tool_calls: draft.tool_calls,
            tool_call_id: draft.tool_call_id,
            timestamp,
            level: draft.level,
            error: draft.error,
            raw: draft.raw,
        });
        &self.steps[self.steps.len() - 1]
    }

    pub fn system_prompt(&mut self, prompt: &str) -> &mut Self {
        self.system_prompt_excerpt = Some(excerpt(prompt, SYSTEM_PROMPT_EXCERPT_CHARS));
        self
    }

    pub fn steps(&self) -> &[LogStep] {
        &self.steps
    }

    pub fn finish(self, content: impl Into<String>, format: ResultFormat) -> LogBatchResult {
        let mut final_result = FinalResultEvent::new(content, format);
        final_result.timestamp = self.not_before_last(final_result.timestamp);
        self.into_batch(Some(final_result))
    }

    /// Final result for a run that was stopped early; keeps whatever output arrived.
    pub fn finish_cancelled(self, reason: &str, partial_output: &str) -> LogBatchResult {
        let mut explain = format!("Task stopped ({}). Output received before the stop is kept below.", reason);
        if !partial_output.is_empty() {
            explain.push_str("\n\nLast context:\n");
            explain.push_str(partial_output);
        }
        self.finish(explain, ResultFormat::Markdown)
    }

    pub fn finish_without_result(self) -> LogBatchResult {
        self.into_batch(None)
    }

    fn into_batch(self, final_result: Option<FinalResultEvent>) -> LogBatchResult {
        LogBatchResult {
            schema_version: SCHEMA_VERSION,
            steps: self.steps,
            final_result,
            system_prompt_excerpt: self.system_prompt_excerpt,
            events: None,
        }
    }

    fn not_before_last(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self.steps.last() {
            Some(last) if last.timestamp > ts => last.timestamp,
            _ => ts,
        }
    }
}

fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{}…", head)
}
