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

//! Side-effect-free test pipeline.
//!
//! Runs the same filter -> sample -> resolve -> dispatch path as the
//! lifecycle manager against a small sample of spans, but persists nothing:
//! no execution records, no counters, no watermark updates. Safe to call
//! against an unsaved draft or an evaluator in any status.

use crate::scorers::ScorerDispatch;
use crate::store::SpanProvider;
use serde::{Deserialize, Serialize};
use spanscore_core::{
    now_micros, Evaluator, ExecutionScope, ResolvedVariable, ScoreResult, ScorerConfig,
    ScorerType, SpanRecord, TraceRecord,
};
use rand::Rng;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const DEFAULT_SAMPLE_LIMIT: usize = 5;
const DEFAULT_WINDOW_HOURS: u64 = 24;

/// Selects which spans a test run samples. All fields optional; the default
/// is the most recent spans in a 24 hour window, at most five of them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestSampleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub span_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range_hours: Option<u64>,
}

impl TestSampleSpec {
    /// Id selectors are alternatives to the `(limit, time_range)` pair: an
    /// explicitly named span or trace is sampled no matter how old it is.
    fn to_scope(&self, now: u64) -> ExecutionScope {
        let has_id_selector =
            self.trace_id.is_some() || self.span_id.is_some() || !self.span_ids.is_empty();
        if has_id_selector {
            return ExecutionScope {
                trace_id: self.trace_id.clone(),
                span_id: self.span_id.clone(),
                span_ids: self.span_ids.clone(),
                ..Default::default()
            };
        }
        let window = self.time_range_hours.unwrap_or(DEFAULT_WINDOW_HOURS);
        ExecutionScope {
            start_time: Some(now.saturating_sub(window * 3600 * 1_000_000)),
            sample_limit: Some(self.limit.unwrap_or(DEFAULT_SAMPLE_LIMIT)),
            ..Default::default()
        }
    }
}

/// Outcome of one sampled span. `filtered` means the span never passed the
/// filter and was not resolved or scored; `skipped` means it matched but was
/// excluded by the sampling draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestSpanStatus {
    Success,
    Failed,
    Skipped,
    Filtered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestExecution {
    pub span_id: String,
    pub trace_id: String,
    pub span_name: String,
    pub matched_filter: bool,
    pub status: TestSpanStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables_resolved: Vec<ResolvedVariable>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub score_results: Vec<ScoreResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_sent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestSummary {
    pub total_spans: u64,
    pub matched_spans: u64,
    pub evaluated_spans: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub skipped_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_latency_ms: Option<f64>,
}

/// Human-readable summary of what the evaluator would do if activated.
/// Everything except `matching_count` is derived from the configuration
/// alone, so a preview exists even when no spans were available to sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorPreview {
    pub name: String,
    pub scorer_type: ScorerType,
    pub filter_description: String,
    pub variable_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matching_count: Option<u64>,
}

impl EvaluatorPreview {
    pub fn from_evaluator(evaluator: &Evaluator) -> Self {
        let prompt_preview = match &evaluator.scorer_config {
            // Placeholders are left visible on purpose.
            ScorerConfig::Llm(c) => Some(
                c.messages
                    .iter()
                    .map(|m| format!("[{}] {}", m.role, m.content))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        };
        Self {
            name: evaluator.name.clone(),
            scorer_type: evaluator.scorer_type(),
            filter_description: evaluator.filter.describe(),
            variable_names: evaluator
                .variable_mapping
                .iter()
                .map(|m| m.variable_name.clone())
                .collect(),
            prompt_preview,
            matching_count: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestEvaluatorResponse {
    pub summary: TestSummary,
    pub executions: Vec<TestExecution>,
    pub preview: EvaluatorPreview,
}

#[derive(Clone)]
pub struct TestPipeline {
    spans: Arc<dyn SpanProvider>,
    scorer: Arc<dyn ScorerDispatch>,
}

impl TestPipeline {
    pub fn new(spans: Arc<dyn SpanProvider>, scorer: Arc<dyn ScorerDispatch>) -> Self {
        Self { spans, scorer }
    }

    pub async fn test(
        &self,
        evaluator: &Evaluator,
        sample_spec: Option<TestSampleSpec>,
    ) -> TestEvaluatorResponse {
        let scope = sample_spec.unwrap_or_default().to_scope(now_micros());
        let candidates = self
            .spans
            .spans_in_scope(evaluator.project_id, &scope)
            .await;
        debug!(
            evaluator = %evaluator.name,
            candidates = candidates.len(),
            "test run sampling"
        );

        let mut executions = Vec::with_capacity(candidates.len());
        let mut summary = TestSummary {
            total_spans: candidates.len() as u64,
            ..Default::default()
        };
        let mut score_sum = 0.0;
        let mut score_count = 0u64;
        let mut latency_sum = 0u64;

        for span in &candidates {
            let matched = evaluator.matches_span(span);
            if !matched {
                executions.push(result_stub(span, false, TestSpanStatus::Filtered));
                continue;
            }
            summary.matched_spans += 1;

            if !sample(evaluator.sampling_rate) {
                summary.skipped_count += 1;
                executions.push(result_stub(span, true, TestSpanStatus::Skipped));
                continue;
            }

            let result = self.evaluate_span(evaluator, span).await;
            summary.evaluated_spans += 1;
            match result.status {
                TestSpanStatus::Success => summary.success_count += 1,
                TestSpanStatus::Failed => summary.failure_count += 1,
                _ => {}
            }
            for score in &result.score_results {
                if let Some(n) = score.value.as_f64() {
                    score_sum += n;
                    score_count += 1;
                }
            }
            latency_sum += result.latency_ms.unwrap_or(0);
            executions.push(result);
        }

        if score_count > 0 {
            summary.average_score = Some(score_sum / score_count as f64);
        }
        if summary.evaluated_spans > 0 {
            summary.average_latency_ms =
                Some(latency_sum as f64 / summary.evaluated_spans as f64);
        }

        let mut preview = EvaluatorPreview::from_evaluator(evaluator);
        preview.matching_count = Some(summary.matched_spans);

        TestEvaluatorResponse {
            summary,
            executions,
            preview,
        }
    }

    async fn evaluate_span(&self, evaluator: &Evaluator, span: &SpanRecord) -> TestExecution {
        let start = Instant::now();
        let trace = self
            .spans
            .trace(&span.trace_id)
            .await
            .unwrap_or_else(|| TraceRecord::new(span.trace_id.clone()));
        let variables = spanscore_core::resolve(&evaluator.variable_mapping, span, &trace);

        let mut result = result_stub(span, true, TestSpanStatus::Success);
        result.variables_resolved = variables.clone();

        match self
            .scorer
            .score(evaluator.scorer_type(), &evaluator.scorer_config, &variables)
            .await
        {
            Ok(output) => {
                result.score_results = output.score_results;
                result.prompt_sent = output.prompt_sent;
            }
            Err(failure) => {
                result.status = TestSpanStatus::Failed;
                result.error_message = Some(failure.error.to_string());
                result.prompt_sent = failure.prompt_sent;
            }
        }
        result.latency_ms = Some(start.elapsed().as_millis() as u64);
        result
    }
}

fn result_stub(span: &SpanRecord, matched_filter: bool, status: TestSpanStatus) -> TestExecution {
    TestExecution {
        span_id: span.span_id.clone(),
        trace_id: span.trace_id.clone(),
        span_name: span.span_name.clone(),
        matched_filter,
        status,
        variables_resolved: Vec::new(),
        score_results: Vec::new(),
        prompt_sent: None,
        error_message: None,
        latency_ms: None,
    }
}

fn sample(rate: f64) -> bool {
    if rate <= 0.0 {
        return false;
    }
    if rate >= 1.0 {
        return true;
    }
    rand::thread_rng().gen::<f64>() < rate
}
