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

//! Execution lifecycle manager.
//!
//! `trigger()` is a synchronous acknowledgement: it validates the request,
//! persists a `pending` execution with a frozen evaluator snapshot, spawns a
//! worker, and returns the execution id immediately. The worker claims the
//! execution (single-owner compare-and-set), then drives
//! matching -> sampling -> resolution -> scoring dispatch with partial-failure
//! semantics: a span-level scoring failure increments `errors_count` and the
//! execution keeps going; only execution-wide faults (provider unreachable,
//! unusable configuration) fail the whole run. Span dispatches run
//! concurrently under a semaphore; once an execution-wide fault is observed,
//! spans that have not started yet are not processed.

use crate::scorers::ScorerDispatch;
use crate::store::{EvaluatorStore, ExecutionStore, SpanProvider, StoreError};
use parking_lot::Mutex;
use spanscore_core::{
    now_micros, Evaluator, EvaluatorStatus, Execution, ExecutionScope, ExecutionTrigger,
    SpanExecutionDetail, SpanOutcome, SpanRecord, TraceRecord,
};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default lookback for manual triggers with no scope.
pub const DEFAULT_MANUAL_WINDOW_MICROS: u64 = 24 * 3600 * 1_000_000;

const DEFAULT_MAX_CONCURRENT_SPANS: usize = 8;

/// Synchronous acknowledgement of an accepted trigger. Scoring has not
/// necessarily happened when the caller sees this.
#[derive(Debug, Clone)]
pub struct TriggerAccepted {
    pub execution_id: Uuid,
    pub message: String,
}

/// Trigger-request failures, surfaced synchronously. No execution is
/// created for any of these.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("evaluator not found: {0}")]
    NotFound(Uuid),

    #[error("evaluator '{name}' is {status:?} and does not accept {trigger:?} triggers")]
    NotTriggerable {
        name: String,
        status: EvaluatorStatus,
        trigger: ExecutionTrigger,
    },

    #[error("invalid scope: {0}")]
    InvalidScope(String),
}

/// Drives executions end to end. Cheap to clone; all fields are shared.
#[derive(Clone)]
pub struct ExecutionManager {
    evaluators: Arc<dyn EvaluatorStore>,
    executions: Arc<dyn ExecutionStore>,
    spans: Arc<dyn SpanProvider>,
    scorer: Arc<dyn ScorerDispatch>,
    max_concurrent_spans: usize,
}

impl ExecutionManager {
    pub fn new(
        evaluators: Arc<dyn EvaluatorStore>,
        executions: Arc<dyn ExecutionStore>,
        spans: Arc<dyn SpanProvider>,
        scorer: Arc<dyn ScorerDispatch>,
    ) -> Self {
        Self {
            evaluators,
            executions,
            spans,
            scorer,
            max_concurrent_spans: DEFAULT_MAX_CONCURRENT_SPANS,
        }
    }

    pub fn with_max_concurrent_spans(mut self, max: usize) -> Self {
        self.max_concurrent_spans = max.max(1);
        self
    }

    /// Accept a trigger and return immediately. At-least-once enqueue
    /// semantics: the returned execution id can be polled for the outcome.
    pub async fn trigger(
        &self,
        evaluator_id: Uuid,
        trigger: ExecutionTrigger,
        scope: Option<ExecutionScope>,
    ) -> Result<TriggerAccepted, TriggerError> {
        let evaluator = self
            .evaluators
            .get(evaluator_id)
            .map_err(|_| TriggerError::NotFound(evaluator_id))?;

        let allowed = match (evaluator.status, trigger) {
            (EvaluatorStatus::Active, _) => true,
            // Paused evaluators still accept explicit manual runs.
            (EvaluatorStatus::Paused, ExecutionTrigger::Manual) => true,
            _ => false,
        };
        if !allowed {
            return Err(TriggerError::NotTriggerable {
                name: evaluator.name.clone(),
                status: evaluator.status,
                trigger,
            });
        }

        if let Some(scope) = &scope {
            if let (Some(start), Some(end)) = (scope.start_time, scope.end_time) {
                if start > end {
                    return Err(TriggerError::InvalidScope(format!(
                        "start_time {start} is after end_time {end}"
                    )));
                }
            }
        }

        let snapshot = evaluator.snapshot();
        let execution = Execution::new(evaluator.id, evaluator.project_id, trigger);
        let execution_id = execution.id;
        self.executions.insert(execution, snapshot);

        info!(
            execution_id = %execution_id,
            evaluator = %evaluator.name,
            trigger = ?trigger,
            "execution accepted"
        );

        let manager = self.clone();
        tokio::spawn(async move {
            manager
                .run_execution(execution_id, Arc::new(evaluator), trigger, scope)
                .await;
        });

        Ok(TriggerAccepted {
            execution_id,
            message: format!("execution {execution_id} accepted"),
        })
    }

    /// Externally requested abort of a pending or running execution.
    pub fn cancel(&self, execution_id: Uuid) -> Result<Execution, StoreError> {
        let execution = self.executions.cancel(execution_id)?;
        info!(execution_id = %execution_id, "execution cancelled");
        Ok(execution)
    }

    fn effective_scope(
        &self,
        evaluator: &Evaluator,
        trigger: ExecutionTrigger,
        scope: Option<ExecutionScope>,
        now: u64,
    ) -> ExecutionScope {
        let mut scope = scope.unwrap_or_default();
        if scope.is_empty() {
            scope.start_time = match trigger {
                // All spans since the last automatic run; everything if the
                // evaluator has never run automatically.
                ExecutionTrigger::Automatic => self.evaluators.last_automatic_run(evaluator.id),
                ExecutionTrigger::Manual => {
                    Some(now.saturating_sub(DEFAULT_MANUAL_WINDOW_MICROS))
                }
            };
        }
        scope
    }

    async fn run_execution(
        &self,
        execution_id: Uuid,
        evaluator: Arc<Evaluator>,
        trigger: ExecutionTrigger,
        scope: Option<ExecutionScope>,
    ) {
        if let Err(e) = self.drive(execution_id, evaluator, trigger, scope).await {
            error!(execution_id = %execution_id, error = %e, "execution worker error");
        }
    }

    async fn drive(
        &self,
        execution_id: Uuid,
        evaluator: Arc<Evaluator>,
        trigger: ExecutionTrigger,
        scope: Option<ExecutionScope>,
    ) -> anyhow::Result<()> {
        match self.executions.claim(execution_id) {
            Ok(_) => {}
            Err(StoreError::AlreadyClaimed(_)) => {
                debug!(execution_id = %execution_id, "lost claim race, skipping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let fetch_end = now_micros();
        let scope = self.effective_scope(&evaluator, trigger, scope, fetch_end);
        let mut candidates = self.spans.spans_in_scope(evaluator.project_id, &scope).await;
        if evaluator.target_scope == spanscore_core::TargetScope::Trace {
            candidates = one_span_per_trace(candidates);
        }
        debug!(
            execution_id = %execution_id,
            candidates = candidates.len(),
            "candidates fetched"
        );

        let mut selected = Vec::new();
        let mut matched = 0u64;
        for span in candidates {
            if !evaluator.matches_span(&span) {
                continue;
            }
            matched += 1;
            if sample(evaluator.sampling_rate) {
                selected.push(span);
            } else if let Err(e) = self
                .executions
                .record_span(execution_id, SpanExecutionDetail::skipped(&span))
            {
                warn!(execution_id = %execution_id, error = %e, "recording skipped span failed");
            }
        }
        self.executions.add_matched(execution_id, matched)?;

        // First execution-wide fault wins; spans not yet started check this
        // and bail out before dispatch.
        let fatal: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_spans));

        let mut tasks = Vec::new();
        for span in selected {
            let manager = self.clone();
            let evaluator = Arc::clone(&evaluator);
            let fatal = Arc::clone(&fatal);
            let semaphore = Arc::clone(&semaphore);
            tasks.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                if fatal.lock().is_some() {
                    return;
                }
                let (detail, fatal_message) = manager.score_span(&evaluator, &span).await;
                if let Some(message) = fatal_message {
                    let mut fatal = fatal.lock();
                    if fatal.is_none() {
                        *fatal = Some(message);
                    }
                }
                if let Err(e) = manager.executions.record_span(execution_id, detail) {
                    warn!(execution_id = %execution_id, error = %e, "recording span outcome failed");
                }
            }));
        }
        futures::future::join_all(tasks).await;

        let fatal_message = fatal.lock().take();
        let outcome = match fatal_message {
            Some(message) => self.executions.fail(execution_id, &message),
            None => self.executions.complete(execution_id),
        };
        match outcome {
            Ok(execution) => {
                info!(
                    execution_id = %execution_id,
                    status = %execution.status,
                    matched = execution.spans_matched,
                    scored = execution.spans_scored,
                    errors = execution.errors_count,
                    "execution finished"
                );
                if trigger == ExecutionTrigger::Automatic
                    && execution.status == spanscore_core::ExecutionStatus::Completed
                {
                    self.evaluators
                        .set_last_automatic_run(evaluator.id, fetch_end);
                }
            }
            // Typically an external cancellation that won the race to a
            // terminal state.
            Err(e) => debug!(execution_id = %execution_id, error = %e, "terminal transition refused"),
        }
        Ok(())
    }

    /// Resolve variables and dispatch one span to the scorer. Returns the
    /// audit detail plus an execution-fatal message when the failure poisons
    /// the whole run.
    async fn score_span(
        &self,
        evaluator: &Evaluator,
        span: &SpanRecord,
    ) -> (SpanExecutionDetail, Option<String>) {
        let start = Instant::now();
        let trace = self
            .spans
            .trace(&span.trace_id)
            .await
            .unwrap_or_else(|| TraceRecord::new(span.trace_id.clone()));
        let variables = spanscore_core::resolve(&evaluator.variable_mapping, span, &trace);

        let mut detail = SpanExecutionDetail::skipped(span);
        detail.variables_resolved = variables.clone();

        let fatal = match self
            .scorer
            .score(evaluator.scorer_type(), &evaluator.scorer_config, &variables)
            .await
        {
            Ok(output) => {
                detail.status = SpanOutcome::Success;
                detail.score_results = output.score_results;
                detail.prompt_sent = output.prompt_sent;
                detail.llm_response_raw = output.raw_response;
                detail.llm_response_parsed = output.parsed_response;
                None
            }
            Err(failure) => {
                detail.status = SpanOutcome::Failed;
                detail.error_message = Some(failure.error.to_string());
                detail.prompt_sent = failure.prompt_sent;
                detail.llm_response_raw = failure.raw_response;
                failure
                    .error
                    .is_execution_fatal()
                    .then(|| failure.error.to_string())
            }
        };

        detail.latency_ms = Some(start.elapsed().as_millis() as u64);
        (detail, fatal)
    }
}

/// Per-span independent sampling draw; applied only after the filter.
fn sample(rate: f64) -> bool {
    if rate <= 0.0 {
        return false;
    }
    if rate >= 1.0 {
        return true;
    }
    rand::thread_rng().gen::<f64>() < rate
}

/// For trace-scoped evaluators, keep one representative span per trace (the
/// earliest-started one).
fn one_span_per_trace(candidates: Vec<SpanRecord>) -> Vec<SpanRecord> {
    let mut by_trace: HashMap<String, SpanRecord> = HashMap::new();
    for span in candidates {
        match by_trace.get(&span.trace_id) {
            Some(existing) if existing.started_at <= span.started_at => {}
            _ => {
                by_trace.insert(span.trace_id.clone(), span);
            }
        }
    }
    let mut representatives: Vec<SpanRecord> = by_trace.into_values().collect();
    representatives.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    representatives
}
