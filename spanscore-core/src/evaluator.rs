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

//! The evaluator aggregate: one addressable targeting-and-scoring policy.
//!
//! An evaluator combines a filter expression, a target scope, a sampling
//! policy, a scorer configuration, and a variable mapping list. Drafts are
//! validated before an evaluator exists; a stored evaluator is structurally
//! valid by construction.

use crate::error::ValidationError;
use crate::execution::now_micros;
use crate::filter::FilterExpression;
use crate::resolve::VariableMapping;
use crate::scorer::{ScorerConfig, ScorerType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use uuid::Uuid;

/// Whether the evaluator participates in triggers.
///
/// `Paused` evaluators are skipped by automatic triggers but still accept
/// manual ones; `Inactive` evaluators reject both. Dry-run testing is
/// allowed in any status since it has no side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorStatus {
    Active,
    Inactive,
    Paused,
}

/// What event starts an automatic execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    OnSpanComplete,
}

/// Whether the evaluator scores individual spans or whole traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetScope {
    Span,
    Trace,
}

/// Create/update request shape. Carries an explicit `scorer_type` so the
/// variant/tag agreement can be checked as a configuration error rather
/// than assumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorDraft {
    pub name: String,
    #[serde(default = "default_trigger_type")]
    pub trigger_type: TriggerType,
    pub target_scope: TargetScope,
    #[serde(default)]
    pub filter: FilterExpression,
    /// Empty set means no span-name restriction.
    #[serde(default)]
    pub span_names: BTreeSet<String>,
    pub sampling_rate: f64,
    pub scorer_type: ScorerType,
    pub scorer_config: ScorerConfig,
    #[serde(default)]
    pub variable_mapping: Vec<VariableMapping>,
}

fn default_trigger_type() -> TriggerType {
    TriggerType::OnSpanComplete
}

impl EvaluatorDraft {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.scorer_config.scorer_type() != self.scorer_type {
            return Err(ValidationError::ScorerVariantMismatch {
                expected: self.scorer_type,
                found: self.scorer_config.scorer_type(),
            });
        }
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(ValidationError::InvalidSamplingRate(self.sampling_rate));
        }
        self.filter.validate()?;
        self.scorer_config.validate()?;

        let mut seen = HashSet::new();
        for mapping in &self.variable_mapping {
            if mapping.variable_name.trim().is_empty() {
                return Err(ValidationError::EmptyVariableName(mapping.json_path.clone()));
            }
            if !seen.insert(mapping.variable_name.as_str()) {
                return Err(ValidationError::DuplicateVariable(
                    mapping.variable_name.clone(),
                ));
            }
        }
        Ok(())
    }
}

/// A stored targeting-and-scoring policy, owned by a project and referenced
/// by executions via id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluator {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub status: EvaluatorStatus,
    pub trigger_type: TriggerType,
    pub target_scope: TargetScope,
    pub filter: FilterExpression,
    pub span_names: BTreeSet<String>,
    pub sampling_rate: f64,
    pub scorer_config: ScorerConfig,
    pub variable_mapping: Vec<VariableMapping>,
    /// Microseconds since the Unix epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl Evaluator {
    /// Validate a draft and mint a new evaluator from it.
    ///
    /// New evaluators start `inactive`; activation is an explicit step so a
    /// freshly created policy cannot fire before it has been previewed.
    pub fn from_draft(project_id: Uuid, draft: EvaluatorDraft) -> Result<Self, ValidationError> {
        draft.validate()?;
        let now = now_micros();
        Ok(Self {
            id: Uuid::new_v4(),
            project_id,
            name: draft.name,
            status: EvaluatorStatus::Inactive,
            trigger_type: draft.trigger_type,
            target_scope: draft.target_scope,
            filter: draft.filter,
            span_names: draft.span_names,
            sampling_rate: draft.sampling_rate,
            scorer_config: draft.scorer_config,
            variable_mapping: draft.variable_mapping,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn scorer_type(&self) -> ScorerType {
        self.scorer_config.scorer_type()
    }

    /// Targeting check: span-name restriction first, then the filter.
    /// Sampling is applied separately, only to spans that pass this.
    pub fn matches_span(&self, span: &crate::span::SpanRecord) -> bool {
        if !self.span_names.is_empty() && !self.span_names.contains(&span.span_name) {
            return false;
        }
        self.filter.matches(span)
    }

    /// Freeze the targeting and scoring configuration for an execution, so
    /// results stay reproducible even if the evaluator is edited later.
    pub fn snapshot(&self) -> EvaluatorSnapshot {
        EvaluatorSnapshot {
            evaluator_id: self.id,
            name: self.name.clone(),
            target_scope: self.target_scope,
            filter: self.filter.clone(),
            span_names: self.span_names.clone(),
            sampling_rate: self.sampling_rate,
            scorer_config: self.scorer_config.clone(),
            variable_mapping: self.variable_mapping.clone(),
            taken_at: now_micros(),
        }
    }
}

/// The evaluator's configuration as of trigger time, embedded in execution
/// detail records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorSnapshot {
    pub evaluator_id: Uuid,
    pub name: String,
    pub target_scope: TargetScope,
    pub filter: FilterExpression,
    pub span_names: BTreeSet<String>,
    pub sampling_rate: f64,
    pub scorer_config: ScorerConfig,
    pub variable_mapping: Vec<VariableMapping>,
    pub taken_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterClause, FilterOperator};
    use crate::resolve::VariableSource;
    use crate::scorer::RegexScorerConfig;
    use crate::span::SpanRecord;
    use serde_json::json;

    fn draft() -> EvaluatorDraft {
        EvaluatorDraft {
            name: "response-ok".to_string(),
            trigger_type: TriggerType::OnSpanComplete,
            target_scope: TargetScope::Span,
            filter: FilterExpression::new(vec![FilterClause::new(
                "span_kind",
                FilterOperator::Equals,
                Some(json!("llm")),
            )]),
            span_names: BTreeSet::new(),
            sampling_rate: 1.0,
            scorer_type: ScorerType::Regex,
            scorer_config: ScorerConfig::Regex(RegexScorerConfig::new("^OK$", "ok")),
            variable_mapping: vec![VariableMapping::new(
                "answer",
                VariableSource::SpanOutput,
                "text",
            )],
        }
    }

    #[test]
    fn from_draft_validates_and_starts_inactive() {
        let evaluator = Evaluator::from_draft(Uuid::new_v4(), draft()).unwrap();
        assert_eq!(evaluator.status, EvaluatorStatus::Inactive);
        assert_eq!(evaluator.scorer_type(), ScorerType::Regex);
        assert_eq!(evaluator.created_at, evaluator.updated_at);
    }

    #[test]
    fn variant_mismatch_is_a_configuration_error() {
        let mut bad = draft();
        bad.scorer_type = ScorerType::Llm;
        assert!(matches!(
            bad.validate(),
            Err(ValidationError::ScorerVariantMismatch { .. })
        ));
    }

    #[test]
    fn duplicate_variable_names_are_rejected() {
        let mut bad = draft();
        bad.variable_mapping.push(VariableMapping::new(
            "answer",
            VariableSource::SpanInput,
            "prompt",
        ));
        assert_eq!(
            bad.validate(),
            Err(ValidationError::DuplicateVariable("answer".to_string()))
        );
    }

    #[test]
    fn sampling_rate_must_be_a_probability() {
        for rate in [-0.1, 1.5, f64::NAN] {
            let mut bad = draft();
            bad.sampling_rate = rate;
            assert!(matches!(
                bad.validate(),
                Err(ValidationError::InvalidSamplingRate(_))
            ));
        }
    }

    #[test]
    fn span_name_restriction_applies_before_the_filter() {
        let mut d = draft();
        d.span_names.insert("completion".to_string());
        let evaluator = Evaluator::from_draft(Uuid::new_v4(), d).unwrap();

        let matching = SpanRecord::new("a", "t", "completion").with_kind("llm");
        let wrong_name = SpanRecord::new("b", "t", "embedding").with_kind("llm");
        let wrong_kind = SpanRecord::new("c", "t", "completion").with_kind("tool");

        assert!(evaluator.matches_span(&matching));
        assert!(!evaluator.matches_span(&wrong_name));
        assert!(!evaluator.matches_span(&wrong_kind));
    }

    #[test]
    fn snapshot_is_frozen_against_later_edits() {
        let mut evaluator = Evaluator::from_draft(Uuid::new_v4(), draft()).unwrap();
        let snapshot = evaluator.snapshot();

        evaluator.sampling_rate = 0.1;
        evaluator.filter.clauses.clear();

        assert_eq!(snapshot.sampling_rate, 1.0);
        assert_eq!(snapshot.filter.clauses.len(), 1);
    }
}
