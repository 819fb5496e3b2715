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

//! Storage boundaries for evaluators, executions, and candidate spans.
//!
//! Persistence is an external collaborator; this module defines the traits
//! the engine consumes plus in-memory implementations backed by `dashmap`.
//! The one correctness-critical primitive is [`ExecutionStore::claim`]: an
//! atomic `pending -> running` compare-and-set so exactly one worker owns an
//! execution. All counter updates happen under the same entry lock, so
//! concurrent span outcomes never lose updates.

use async_trait::async_trait;
use dashmap::DashMap;
use spanscore_core::{
    Evaluator, EvaluatorSnapshot, EvaluatorStatus, Execution, ExecutionDetail, ExecutionScope,
    ExecutionStatus, SpanExecutionDetail, SpanOutcome, SpanRecord, TraceRecord, TransitionError,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("evaluator not found: {0}")]
    EvaluatorNotFound(Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// The execution was already claimed by another worker.
    #[error("execution already claimed: {0}")]
    AlreadyClaimed(Uuid),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Candidate span lookup. Backed by the trace store in production; the
/// in-memory implementation here exists for tests and the dry-run pipeline.
#[async_trait]
pub trait SpanProvider: Send + Sync {
    /// Spans matching the scope, most recent first, truncated to
    /// `scope.sample_limit` when set.
    async fn spans_in_scope(&self, project_id: Uuid, scope: &ExecutionScope) -> Vec<SpanRecord>;

    /// Trace-level payloads for `trace_input` variable mappings.
    async fn trace(&self, trace_id: &str) -> Option<TraceRecord>;
}

/// Evaluator persistence plus the automatic-trigger watermark.
pub trait EvaluatorStore: Send + Sync {
    fn insert(&self, evaluator: Evaluator);
    fn get(&self, id: Uuid) -> Result<Evaluator, StoreError>;
    fn list(&self, project_id: Uuid) -> Vec<Evaluator>;
    fn set_status(&self, id: Uuid, status: EvaluatorStatus) -> Result<Evaluator, StoreError>;

    /// End of the last automatic run, used as the implicit start time for
    /// scope-less automatic triggers.
    fn last_automatic_run(&self, id: Uuid) -> Option<u64>;
    fn set_last_automatic_run(&self, id: Uuid, timestamp: u64);
}

/// Execution persistence. Mutating methods apply state-machine transitions
/// atomically per execution.
pub trait ExecutionStore: Send + Sync {
    fn insert(&self, execution: Execution, snapshot: EvaluatorSnapshot);
    fn get(&self, id: Uuid) -> Result<Execution, StoreError>;
    fn get_detail(&self, id: Uuid) -> Result<ExecutionDetail, StoreError>;
    fn get_many(&self, ids: &[Uuid]) -> Vec<Execution>;
    fn list_by_evaluator(&self, evaluator_id: Uuid) -> Vec<Execution>;
    fn list_details_by_evaluator(&self, evaluator_id: Uuid) -> Vec<ExecutionDetail>;

    /// Atomic `pending -> running`. Exactly one caller succeeds; everyone
    /// else gets [`StoreError::AlreadyClaimed`].
    fn claim(&self, id: Uuid) -> Result<Execution, StoreError>;

    fn add_matched(&self, id: Uuid, count: u64) -> Result<(), StoreError>;

    /// Append a span detail and bump the aggregate counters in one step.
    fn record_span(&self, id: Uuid, detail: SpanExecutionDetail) -> Result<(), StoreError>;

    fn complete(&self, id: Uuid) -> Result<Execution, StoreError>;
    fn fail(&self, id: Uuid, message: &str) -> Result<Execution, StoreError>;
    fn cancel(&self, id: Uuid) -> Result<Execution, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryEvaluatorStore {
    evaluators: DashMap<Uuid, Evaluator>,
    watermarks: DashMap<Uuid, u64>,
}

impl MemoryEvaluatorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvaluatorStore for MemoryEvaluatorStore {
    fn insert(&self, evaluator: Evaluator) {
        self.evaluators.insert(evaluator.id, evaluator);
    }

    fn get(&self, id: Uuid) -> Result<Evaluator, StoreError> {
        self.evaluators
            .get(&id)
            .map(|e| e.clone())
            .ok_or(StoreError::EvaluatorNotFound(id))
    }

    fn list(&self, project_id: Uuid) -> Vec<Evaluator> {
        let mut evaluators: Vec<Evaluator> = self
            .evaluators
            .iter()
            .filter(|e| e.project_id == project_id)
            .map(|e| e.clone())
            .collect();
        evaluators.sort_by_key(|e| e.created_at);
        evaluators
    }

    fn set_status(&self, id: Uuid, status: EvaluatorStatus) -> Result<Evaluator, StoreError> {
        let mut entry = self
            .evaluators
            .get_mut(&id)
            .ok_or(StoreError::EvaluatorNotFound(id))?;
        entry.status = status;
        entry.updated_at = spanscore_core::now_micros();
        Ok(entry.clone())
    }

    fn last_automatic_run(&self, id: Uuid) -> Option<u64> {
        self.watermarks.get(&id).map(|w| *w)
    }

    fn set_last_automatic_run(&self, id: Uuid, timestamp: u64) {
        self.watermarks.insert(id, timestamp);
    }
}

struct StoredExecution {
    execution: Execution,
    spans: Vec<SpanExecutionDetail>,
    snapshot: EvaluatorSnapshot,
}

impl StoredExecution {
    fn detail(&self) -> ExecutionDetail {
        ExecutionDetail {
            execution: self.execution.clone(),
            spans: self.spans.clone(),
            evaluator_snapshot: self.snapshot.clone(),
        }
    }
}

#[derive(Default)]
pub struct MemoryExecutionStore {
    executions: DashMap<Uuid, StoredExecution>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut StoredExecution) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut entry = self
            .executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;
        f(&mut entry)
    }
}

impl ExecutionStore for MemoryExecutionStore {
    fn insert(&self, execution: Execution, snapshot: EvaluatorSnapshot) {
        self.executions.insert(
            execution.id,
            StoredExecution {
                execution,
                spans: Vec::new(),
                snapshot,
            },
        );
    }

    fn get(&self, id: Uuid) -> Result<Execution, StoreError> {
        self.executions
            .get(&id)
            .map(|e| e.execution.clone())
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    fn get_detail(&self, id: Uuid) -> Result<ExecutionDetail, StoreError> {
        self.executions
            .get(&id)
            .map(|e| e.detail())
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    fn get_many(&self, ids: &[Uuid]) -> Vec<Execution> {
        ids.iter()
            .filter_map(|id| self.executions.get(id).map(|e| e.execution.clone()))
            .collect()
    }

    fn list_by_evaluator(&self, evaluator_id: Uuid) -> Vec<Execution> {
        let mut executions: Vec<Execution> = self
            .executions
            .iter()
            .filter(|e| e.execution.evaluator_id == evaluator_id)
            .map(|e| e.execution.clone())
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        executions
    }

    fn list_details_by_evaluator(&self, evaluator_id: Uuid) -> Vec<ExecutionDetail> {
        let mut details: Vec<ExecutionDetail> = self
            .executions
            .iter()
            .filter(|e| e.execution.evaluator_id == evaluator_id)
            .map(|e| e.detail())
            .collect();
        details.sort_by(|a, b| b.execution.created_at.cmp(&a.execution.created_at));
        details
    }

    fn claim(&self, id: Uuid) -> Result<Execution, StoreError> {
        self.with_entry(id, |stored| {
            if stored.execution.status != ExecutionStatus::Pending {
                return Err(StoreError::AlreadyClaimed(id));
            }
            stored.execution.begin()?;
            Ok(stored.execution.clone())
        })
    }

    fn add_matched(&self, id: Uuid, count: u64) -> Result<(), StoreError> {
        self.with_entry(id, |stored| {
            stored.execution.spans_matched += count;
            Ok(())
        })
    }

    fn record_span(&self, id: Uuid, detail: SpanExecutionDetail) -> Result<(), StoreError> {
        self.with_entry(id, |stored| {
            match detail.status {
                SpanOutcome::Success => stored.execution.spans_scored += 1,
                SpanOutcome::Failed => stored.execution.errors_count += 1,
                SpanOutcome::Skipped => {}
            }
            stored.spans.push(detail);
            Ok(())
        })
    }

    fn complete(&self, id: Uuid) -> Result<Execution, StoreError> {
        self.with_entry(id, |stored| {
            stored.execution.complete()?;
            Ok(stored.execution.clone())
        })
    }

    fn fail(&self, id: Uuid, message: &str) -> Result<Execution, StoreError> {
        self.with_entry(id, |stored| {
            stored.execution.fail(message)?;
            Ok(stored.execution.clone())
        })
    }

    fn cancel(&self, id: Uuid) -> Result<Execution, StoreError> {
        self.with_entry(id, |stored| {
            stored.execution.cancel()?;
            Ok(stored.execution.clone())
        })
    }
}

/// In-memory span source for tests and dry runs.
#[derive(Default)]
pub struct MemorySpanProvider {
    spans: DashMap<String, SpanRecord>,
    traces: DashMap<String, TraceRecord>,
}

impl MemorySpanProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_span(&self, span: SpanRecord) {
        self.spans.insert(span.span_id.clone(), span);
    }

    pub fn add_trace(&self, trace: TraceRecord) {
        self.traces.insert(trace.trace_id.clone(), trace);
    }
}

fn in_scope(span: &SpanRecord, scope: &ExecutionScope) -> bool {
    if let Some(span_id) = &scope.span_id {
        if &span.span_id != span_id {
            return false;
        }
    }
    if !scope.span_ids.is_empty() && !scope.span_ids.contains(&span.span_id) {
        return false;
    }
    if let Some(trace_id) = &scope.trace_id {
        if &span.trace_id != trace_id {
            return false;
        }
    }
    if let Some(start) = scope.start_time {
        if span.started_at < start {
            return false;
        }
    }
    if let Some(end) = scope.end_time {
        if span.started_at > end {
            return false;
        }
    }
    true
}

#[async_trait]
impl SpanProvider for MemorySpanProvider {
    async fn spans_in_scope(&self, _project_id: Uuid, scope: &ExecutionScope) -> Vec<SpanRecord> {
        let mut spans: Vec<SpanRecord> = self
            .spans
            .iter()
            .filter(|s| in_scope(s.value(), scope))
            .map(|s| s.clone())
            .collect();
        spans.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = scope.sample_limit {
            spans.truncate(limit);
        }
        spans
    }

    async fn trace(&self, trace_id: &str) -> Option<TraceRecord> {
        self.traces.get(trace_id).map(|t| t.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanscore_core::ExecutionTrigger;
    use std::sync::Arc;

    fn snapshot() -> EvaluatorSnapshot {
        use spanscore_core::{
            EvaluatorDraft, FilterExpression, RegexScorerConfig, ScorerConfig, ScorerType,
            TargetScope, TriggerType,
        };
        let draft = EvaluatorDraft {
            name: "t".to_string(),
            trigger_type: TriggerType::OnSpanComplete,
            target_scope: TargetScope::Span,
            filter: FilterExpression::default(),
            span_names: Default::default(),
            sampling_rate: 1.0,
            scorer_type: ScorerType::Regex,
            scorer_config: ScorerConfig::Regex(RegexScorerConfig::new("^OK$", "ok")),
            variable_mapping: vec![],
        };
        Evaluator::from_draft(Uuid::new_v4(), draft).unwrap().snapshot()
    }

    fn pending_execution(store: &MemoryExecutionStore) -> Uuid {
        let execution = Execution::new(Uuid::new_v4(), Uuid::new_v4(), ExecutionTrigger::Manual);
        let id = execution.id;
        store.insert(execution, snapshot());
        id
    }

    #[test]
    fn claim_is_single_owner() {
        let store = MemoryExecutionStore::new();
        let id = pending_execution(&store);

        assert!(store.claim(id).is_ok());
        assert!(matches!(store.claim(id), Err(StoreError::AlreadyClaimed(_))));
    }

    #[test]
    fn racing_claims_have_exactly_one_winner() {
        let store = Arc::new(MemoryExecutionStore::new());
        let id = pending_execution(&store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.claim(id).is_ok())
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(store.get(id).unwrap().status, ExecutionStatus::Running);
    }

    #[test]
    fn record_span_updates_counters_atomically_with_the_detail() {
        let store = MemoryExecutionStore::new();
        let id = pending_execution(&store);
        store.claim(id).unwrap();
        store.add_matched(id, 3).unwrap();

        let span = SpanRecord::new("a", "t", "n");
        let mut ok = SpanExecutionDetail::skipped(&span);
        ok.status = SpanOutcome::Success;
        let mut failed = SpanExecutionDetail::skipped(&span);
        failed.status = SpanOutcome::Failed;
        failed.error_message = Some("boom".to_string());

        store.record_span(id, ok).unwrap();
        store.record_span(id, failed).unwrap();
        store.record_span(id, SpanExecutionDetail::skipped(&span)).unwrap();

        let execution = store.get(id).unwrap();
        assert_eq!(execution.spans_matched, 3);
        assert_eq!(execution.spans_scored, 1);
        assert_eq!(execution.errors_count, 1);
        assert_eq!(store.get_detail(id).unwrap().spans.len(), 3);
    }

    #[test]
    fn terminal_transitions_go_through_the_state_machine() {
        let store = MemoryExecutionStore::new();
        let id = pending_execution(&store);

        // Completing a pending execution is an invalid transition.
        assert!(matches!(
            store.complete(id),
            Err(StoreError::Transition(_))
        ));

        store.claim(id).unwrap();
        let done = store.complete(id).unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(matches!(store.fail(id, "late"), Err(StoreError::Transition(_))));
    }

    #[tokio::test]
    async fn span_provider_scopes_and_limits() {
        let provider = MemorySpanProvider::new();
        for i in 0..10 {
            let mut span = SpanRecord::new(format!("s{i}"), "t1", "step");
            span.started_at = 1_000 + i;
            provider.add_span(span);
        }
        let mut other = SpanRecord::new("other", "t2", "step");
        other.started_at = 5_000;
        provider.add_span(other);

        let scope = ExecutionScope {
            trace_id: Some("t1".to_string()),
            sample_limit: Some(3),
            ..Default::default()
        };
        let spans = provider.spans_in_scope(Uuid::new_v4(), &scope).await;
        assert_eq!(spans.len(), 3);
        // Most recent first.
        assert_eq!(spans[0].span_id, "s9");
        assert!(spans.iter().all(|s| s.trace_id == "t1"));

        let window = ExecutionScope {
            start_time: Some(1_005),
            end_time: Some(1_007),
            ..Default::default()
        };
        let spans = provider.spans_in_scope(Uuid::new_v4(), &window).await;
        assert_eq!(spans.len(), 3);
    }
}
