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

//! Read-side aggregation over stored executions and their span details.
//! Pure computation; callers fetch the details and hand them in.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use spanscore_core::{ExecutionDetail, ExecutionStatus, SpanOutcome};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

const SCORE_BUCKETS: [(f64, f64); 5] = [
    (0.0, 0.2),
    (0.2, 0.4),
    (0.4, 0.6),
    (0.6, 0.8),
    (0.8, 1.0),
];

const TOP_ERRORS_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreBucket {
    pub label: String,
    pub count: u64,
}

/// Executions created per calendar day (UTC), ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendPoint {
    pub day: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCount {
    pub message: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorAnalytics {
    pub evaluator_id: Uuid,
    /// Aggregation window in days; `None` means full history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_days: Option<u32>,
    pub total_executions: u64,
    pub completed_executions: u64,
    pub failed_executions: u64,
    pub cancelled_executions: u64,
    /// Completed share of terminal executions.
    pub success_rate: f64,
    pub total_spans_scored: u64,
    pub total_errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_score: Option<f64>,
    pub score_distribution: Vec<ScoreBucket>,
    pub execution_trend: Vec<TrendPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyPercentiles>,
    pub top_errors: Vec<ErrorCount>,
}

impl EvaluatorAnalytics {
    /// Full-history aggregation.
    pub fn from_details(evaluator_id: Uuid, details: &[ExecutionDetail]) -> Self {
        Self::for_period(evaluator_id, details, None, spanscore_core::now_micros())
    }

    /// Aggregation restricted to executions created within the trailing
    /// `period_days` window ending at `now`.
    pub fn for_period(
        evaluator_id: Uuid,
        details: &[ExecutionDetail],
        period_days: Option<u32>,
        now: u64,
    ) -> Self {
        let cutoff = period_days.map(|days| now.saturating_sub(days as u64 * 86_400_000_000));
        let details: Vec<&ExecutionDetail> = details
            .iter()
            .filter(|d| cutoff.map_or(true, |c| d.execution.created_at >= c))
            .collect();

        let mut completed = 0u64;
        let mut failed = 0u64;
        let mut cancelled = 0u64;
        let mut spans_scored = 0u64;
        let mut errors = 0u64;

        let mut scores: Vec<f64> = Vec::new();
        let mut latencies: Vec<u64> = Vec::new();
        let mut daily: BTreeMap<String, u64> = BTreeMap::new();
        let mut error_counts: HashMap<String, u64> = HashMap::new();

        for detail in &details {
            let execution = &detail.execution;
            match execution.status {
                ExecutionStatus::Completed => completed += 1,
                ExecutionStatus::Failed => failed += 1,
                ExecutionStatus::Cancelled => cancelled += 1,
                _ => {}
            }
            spans_scored += execution.spans_scored;
            errors += execution.errors_count;
            *daily.entry(day_of(execution.created_at)).or_default() += 1;

            for span in &detail.spans {
                if let Some(latency) = span.latency_ms {
                    latencies.push(latency);
                }
                match span.status {
                    SpanOutcome::Success => {
                        for score in &span.score_results {
                            if let Some(n) = score.value.as_f64() {
                                scores.push(n);
                            }
                        }
                    }
                    SpanOutcome::Failed => {
                        if let Some(message) = &span.error_message {
                            *error_counts.entry(message.clone()).or_default() += 1;
                        }
                    }
                    SpanOutcome::Skipped => {}
                }
            }
        }

        let terminal = completed + failed + cancelled;
        let success_rate = if terminal > 0 {
            completed as f64 / terminal as f64
        } else {
            0.0
        };

        let average_score = if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        };

        latencies.sort_unstable();
        let latency = if latencies.is_empty() {
            None
        } else {
            Some(LatencyPercentiles {
                p50_ms: percentile(&latencies, 50.0),
                p90_ms: percentile(&latencies, 90.0),
                p99_ms: percentile(&latencies, 99.0),
            })
        };

        let mut top_errors: Vec<ErrorCount> = error_counts
            .into_iter()
            .map(|(message, count)| ErrorCount { message, count })
            .collect();
        top_errors.sort_by(|a, b| b.count.cmp(&a.count).then(a.message.cmp(&b.message)));
        top_errors.truncate(TOP_ERRORS_LIMIT);

        Self {
            evaluator_id,
            period_days,
            total_executions: details.len() as u64,
            completed_executions: completed,
            failed_executions: failed,
            cancelled_executions: cancelled,
            success_rate,
            total_spans_scored: spans_scored,
            total_errors: errors,
            average_score,
            score_distribution: distribution(&scores),
            execution_trend: daily
                .into_iter()
                .map(|(day, count)| TrendPoint { day, count })
                .collect(),
            latency,
            top_errors,
        }
    }
}

fn day_of(micros: u64) -> String {
    DateTime::from_timestamp_micros(micros as i64)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Fixed buckets over [0, 1]; out-of-range scores land in the end buckets.
fn distribution(scores: &[f64]) -> Vec<ScoreBucket> {
    let mut buckets: Vec<ScoreBucket> = SCORE_BUCKETS
        .iter()
        .map(|(lo, hi)| ScoreBucket {
            label: format!("{lo:.1}-{hi:.1}"),
            count: 0,
        })
        .collect();
    for &score in scores {
        let clamped = score.clamp(0.0, 1.0);
        let idx = if clamped >= 1.0 {
            SCORE_BUCKETS.len() - 1
        } else {
            (clamped / 0.2) as usize
        };
        buckets[idx].count += 1;
    }
    buckets
}

/// Nearest-rank percentile over a pre-sorted slice.
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pct = pct.clamp(0.0, 100.0);
    let idx = ((pct / 100.0) * ((sorted.len() - 1) as f64)).round() as usize;
    sorted[idx] as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanscore_core::{
        Evaluator, EvaluatorDraft, Execution, ExecutionTrigger, FilterExpression,
        RegexScorerConfig, ScoreResult, ScorerConfig, ScorerType, SpanExecutionDetail, SpanRecord,
        TargetScope, TriggerType,
    };

    fn evaluator() -> Evaluator {
        Evaluator::from_draft(
            Uuid::new_v4(),
            EvaluatorDraft {
                name: "stats".to_string(),
                trigger_type: TriggerType::OnSpanComplete,
                target_scope: TargetScope::Span,
                filter: FilterExpression::default(),
                span_names: Default::default(),
                sampling_rate: 1.0,
                scorer_type: ScorerType::Regex,
                scorer_config: ScorerConfig::Regex(RegexScorerConfig::new("^OK$", "ok")),
                variable_mapping: vec![],
            },
        )
        .unwrap()
    }

    fn span_detail(score: f64, latency_ms: u64) -> SpanExecutionDetail {
        let span = SpanRecord::new(Uuid::new_v4().to_string(), "t", "s");
        let mut detail = SpanExecutionDetail::skipped(&span);
        detail.status = SpanOutcome::Success;
        detail.score_results = vec![ScoreResult::numeric("ok", score)];
        detail.latency_ms = Some(latency_ms);
        detail
    }

    fn failed_detail(message: &str) -> SpanExecutionDetail {
        let span = SpanRecord::new(Uuid::new_v4().to_string(), "t", "s");
        let mut detail = SpanExecutionDetail::skipped(&span);
        detail.status = SpanOutcome::Failed;
        detail.error_message = Some(message.to_string());
        detail
    }

    fn completed_execution(evaluator: &Evaluator, spans: Vec<SpanExecutionDetail>) -> ExecutionDetail {
        let mut execution = Execution::new(
            evaluator.id,
            evaluator.project_id,
            ExecutionTrigger::Manual,
        );
        execution.begin().unwrap();
        for span in &spans {
            match span.status {
                SpanOutcome::Success => execution.spans_scored += 1,
                SpanOutcome::Failed => execution.errors_count += 1,
                SpanOutcome::Skipped => {}
            }
        }
        execution.complete().unwrap();
        ExecutionDetail {
            execution,
            spans,
            evaluator_snapshot: evaluator.snapshot(),
        }
    }

    #[test]
    fn empty_history_yields_zeroed_analytics() {
        let id = Uuid::new_v4();
        let analytics = EvaluatorAnalytics::from_details(id, &[]);
        assert_eq!(analytics.total_executions, 0);
        assert_eq!(analytics.success_rate, 0.0);
        assert!(analytics.average_score.is_none());
        assert!(analytics.latency.is_none());
        assert!(analytics.execution_trend.is_empty());
        assert!(analytics.top_errors.is_empty());
    }

    #[test]
    fn aggregates_scores_latencies_and_errors() {
        let evaluator = evaluator();
        let details = vec![
            completed_execution(
                &evaluator,
                vec![
                    span_detail(1.0, 10),
                    span_detail(0.5, 30),
                    failed_detail("judge returned garbage"),
                ],
            ),
            completed_execution(
                &evaluator,
                vec![span_detail(0.0, 20), failed_detail("judge returned garbage")],
            ),
        ];

        let analytics = EvaluatorAnalytics::from_details(evaluator.id, &details);
        assert_eq!(analytics.total_executions, 2);
        assert_eq!(analytics.completed_executions, 2);
        assert_eq!(analytics.success_rate, 1.0);
        assert_eq!(analytics.total_spans_scored, 3);
        assert_eq!(analytics.total_errors, 2);
        assert_eq!(analytics.average_score, Some(0.5));

        let latency = analytics.latency.unwrap();
        assert_eq!(latency.p50_ms, 20.0);
        assert_eq!(latency.p99_ms, 30.0);

        assert_eq!(analytics.top_errors.len(), 1);
        assert_eq!(analytics.top_errors[0].count, 2);

        // 1.0 and 0.0 land in the end buckets, 0.5 in the middle one.
        let counts: Vec<u64> = analytics.score_distribution.iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![1, 0, 1, 0, 1]);

        // All created today, so one trend point.
        assert_eq!(analytics.execution_trend.len(), 1);
        assert_eq!(analytics.execution_trend[0].count, 2);
    }

    #[test]
    fn period_excludes_executions_older_than_the_window() {
        let evaluator = evaluator();
        let recent = completed_execution(&evaluator, vec![span_detail(1.0, 10)]);
        let mut old = completed_execution(&evaluator, vec![span_detail(0.0, 10)]);
        let now = spanscore_core::now_micros();
        old.execution.created_at = now.saturating_sub(10 * 86_400_000_000);
        let details = vec![recent, old];

        let windowed = EvaluatorAnalytics::for_period(evaluator.id, &details, Some(7), now);
        assert_eq!(windowed.period_days, Some(7));
        assert_eq!(windowed.total_executions, 1);
        assert_eq!(windowed.average_score, Some(1.0));

        let full = EvaluatorAnalytics::from_details(evaluator.id, &details);
        assert_eq!(full.period_days, None);
        assert_eq!(full.total_executions, 2);
    }

    #[test]
    fn top_errors_are_capped_and_ordered() {
        let evaluator = evaluator();
        let mut spans = Vec::new();
        for i in 0..7 {
            for _ in 0..=i {
                spans.push(failed_detail(&format!("error-{i}")));
            }
        }
        let details = vec![completed_execution(&evaluator, spans)];

        let analytics = EvaluatorAnalytics::from_details(evaluator.id, &details);
        assert_eq!(analytics.top_errors.len(), TOP_ERRORS_LIMIT);
        assert_eq!(analytics.top_errors[0].message, "error-6");
        assert_eq!(analytics.top_errors[0].count, 7);
    }

    #[test]
    fn out_of_range_scores_clamp_into_end_buckets() {
        let buckets = distribution(&[-0.5, 1.5]);
        assert_eq!(buckets[0].count, 1);
        assert_eq!(buckets[4].count, 1);
    }
}
