// Copyright 2025 Spanscore Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Execution records and their finite state machine.
//!
//! Lifecycle: `pending → running → {completed, failed, cancelled}`.
//! Terminal executions are immutable (append-only audit semantics); every
//! transition method here rejects anything else. The single-owner claim for
//! `pending → running` under concurrent workers lives in the store layer,
//! which serializes calls to [`Execution::begin`].

use crate::evaluator::EvaluatorSnapshot;
use crate::resolve::ResolvedVariable;
use crate::scorer::ScoreResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// How the execution was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTrigger {
    Automatic,
    Manual,
}

/// Rejected state-machine transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid execution transition: {from} -> {to}")]
    Invalid {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
}

/// One run of an evaluator against a candidate set of spans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub evaluator_id: Uuid,
    pub project_id: Uuid,
    pub status: ExecutionStatus,
    pub trigger_type: ExecutionTrigger,
    /// Spans that passed the filter and the name restriction.
    pub spans_matched: u64,
    /// Spans scored successfully; at most `spans_matched`.
    pub spans_scored: u64,
    /// Span-level scoring failures. Nonzero does not imply a failed
    /// execution.
    pub errors_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    /// Wall clock from `started_at` to the terminal transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub created_at: u64,
}

impl Execution {
    pub fn new(evaluator_id: Uuid, project_id: Uuid, trigger_type: ExecutionTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            evaluator_id,
            project_id,
            status: ExecutionStatus::Pending,
            trigger_type,
            spans_matched: 0,
            spans_scored: 0,
            errors_count: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            created_at: now_micros(),
        }
    }

    /// `pending → running`. The store wraps this in its claim primitive so
    /// only one worker can succeed.
    pub fn begin(&mut self) -> Result<(), TransitionError> {
        self.transition(ExecutionStatus::Running)?;
        self.started_at = Some(now_micros());
        Ok(())
    }

    /// `running → completed`. Valid even with `errors_count > 0`: span-level
    /// failures are partial failures, not execution failures.
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.transition(ExecutionStatus::Completed)?;
        self.finish();
        Ok(())
    }

    /// `running → failed`, for execution-wide faults only.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(ExecutionStatus::Failed)?;
        self.error_message = Some(message.into());
        self.finish();
        Ok(())
    }

    /// Externally requested abort. Allowed from `pending` (never claimed) or
    /// `running`; never inferred from errors.
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(ExecutionStatus::Cancelled)?;
        self.finish();
        Ok(())
    }

    fn transition(&mut self, to: ExecutionStatus) -> Result<(), TransitionError> {
        let allowed = match (self.status, to) {
            (ExecutionStatus::Pending, ExecutionStatus::Running) => true,
            (ExecutionStatus::Pending, ExecutionStatus::Cancelled) => true,
            (ExecutionStatus::Running, t) if t.is_terminal() => true,
            _ => false,
        };
        if !allowed {
            return Err(TransitionError::Invalid {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    fn finish(&mut self) {
        let now = now_micros();
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = Some(now.saturating_sub(started) / 1_000);
        }
    }
}

/// Candidate selection for a trigger. All fields optional; an empty scope
/// means "all spans since the evaluator's last automatic run" for automatic
/// triggers and a service-defined recent window for manual ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub span_ids: Vec<String>,
    /// Microseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    /// Maximum candidate spans to consider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_limit: Option<usize>,
}

impl ExecutionScope {
    pub fn is_empty(&self) -> bool {
        self.trace_id.is_none()
            && self.span_id.is_none()
            && self.span_ids.is_empty()
            && self.start_time.is_none()
            && self.end_time.is_none()
            && self.sample_limit.is_none()
    }
}

/// Per-span outcome within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanOutcome {
    Success,
    Failed,
    /// Excluded by sampling or scope limits; never used for scoring
    /// failures.
    Skipped,
}

/// Audit record for one span considered by an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanExecutionDetail {
    pub span_id: String,
    pub trace_id: String,
    pub span_name: String,
    pub status: SpanOutcome,
    #[serde(default)]
    pub score_results: Vec<ScoreResult>,
    #[serde(default)]
    pub variables_resolved: Vec<ResolvedVariable>,
    /// Rendered judge prompt, kept for audit regardless of outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_sent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_response_raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_response_parsed: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl SpanExecutionDetail {
    pub fn skipped(span: &crate::span::SpanRecord) -> Self {
        Self {
            span_id: span.span_id.clone(),
            trace_id: span.trace_id.clone(),
            span_name: span.span_name.clone(),
            status: SpanOutcome::Skipped,
            score_results: Vec::new(),
            variables_resolved: Vec::new(),
            prompt_sent: None,
            llm_response_raw: None,
            llm_response_parsed: None,
            error_message: None,
            latency_ms: None,
        }
    }
}

/// An execution plus its per-span audit trail and the frozen evaluator
/// configuration it ran with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: Execution,
    pub spans: Vec<SpanExecutionDetail>,
    pub evaluator_snapshot: EvaluatorSnapshot,
}
