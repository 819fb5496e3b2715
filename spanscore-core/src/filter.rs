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

//! Declarative span filter language.
//!
//! A [`FilterExpression`] is an ordered list of clauses combined with AND
//! semantics. Clause order is preserved for display but does not affect the
//! result. Matching is total: malformed data fails a clause, it never
//! panics.
//!
//! Semantics:
//! - A clause whose field is absent matches only under `is_empty`.
//! - `equals`/`not_equals` are type-aware; mismatched types are unequal.
//! - `contains` requires both sides to be strings.
//! - Ordering operators require both sides to be numeric.
//! - `is_empty` matches null, missing, empty string, or empty collection.

use crate::error::ValidationError;
use crate::span::SpanRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Comparison operator for a single filter clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Contains,
    Gt,
    Lt,
    Gte,
    Lte,
    IsEmpty,
    IsNotEmpty,
}

impl FilterOperator {
    /// Whether this operator needs a comparison value.
    pub fn requires_value(&self) -> bool {
        !matches!(self, FilterOperator::IsEmpty | FilterOperator::IsNotEmpty)
    }

    fn symbol(&self) -> &'static str {
        match self {
            FilterOperator::Equals => "equals",
            FilterOperator::NotEquals => "not equals",
            FilterOperator::Contains => "contains",
            FilterOperator::Gt => ">",
            FilterOperator::Lt => "<",
            FilterOperator::Gte => ">=",
            FilterOperator::Lte => "<=",
            FilterOperator::IsEmpty => "is empty",
            FilterOperator::IsNotEmpty => "is not empty",
        }
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// One field comparison. `value` is required for every operator except
/// `is_empty` / `is_not_empty`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl FilterClause {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Option<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.operator.requires_value() && self.value.is_none() {
            return Err(ValidationError::MissingClauseValue {
                field: self.field.clone(),
                operator: self.operator,
            });
        }
        Ok(())
    }

    /// Evaluate this clause against one span record.
    pub fn matches(&self, record: &SpanRecord) -> bool {
        let field = record.field(&self.field);

        match self.operator {
            FilterOperator::IsEmpty => is_empty(field.as_ref()),
            FilterOperator::IsNotEmpty => !is_empty(field.as_ref()),
            FilterOperator::Equals => match (&field, &self.value) {
                (Some(f), Some(v)) => values_equal(f, v),
                _ => false,
            },
            FilterOperator::NotEquals => match (&field, &self.value) {
                (Some(f), Some(v)) => !values_equal(f, v),
                _ => false,
            },
            FilterOperator::Contains => match (&field, &self.value) {
                (Some(Value::String(haystack)), Some(Value::String(needle))) => {
                    haystack.contains(needle.as_str())
                }
                _ => false,
            },
            FilterOperator::Gt | FilterOperator::Lt | FilterOperator::Gte | FilterOperator::Lte => {
                let (lhs, rhs) = match (field.as_ref().and_then(as_number), numeric_value(&self.value))
                {
                    (Some(l), Some(r)) => (l, r),
                    _ => return false,
                };
                match self.operator {
                    FilterOperator::Gt => lhs > rhs,
                    FilterOperator::Lt => lhs < rhs,
                    FilterOperator::Gte => lhs >= rhs,
                    FilterOperator::Lte => lhs <= rhs,
                    _ => unreachable!(),
                }
            }
        }
    }

    fn describe(&self) -> String {
        match &self.value {
            Some(v) => format!("{} {} {}", self.field, self.operator, v),
            None => format!("{} {}", self.field, self.operator),
        }
    }
}

/// Type-aware equality: numbers compare numerically, strings and booleans
/// compare directly, everything else (including type mismatches) is unequal.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Null, Value::Null) => true,
        _ => false,
    }
}

fn as_number(v: &Value) -> Option<f64> {
    v.as_f64()
}

fn numeric_value(v: &Option<Value>) -> Option<f64> {
    v.as_ref().and_then(as_number)
}

fn is_empty(field: Option<&Value>) -> bool {
    match field {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        Some(_) => false,
    }
}

/// An AND-combination of clauses. The empty expression matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterExpression {
    pub clauses: Vec<FilterClause>,
}

impl FilterExpression {
    pub fn new(clauses: Vec<FilterClause>) -> Self {
        Self { clauses }
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// True iff every clause matches. Short-circuits on the first failure;
    /// clauses are side-effect free so evaluation order is unobservable.
    pub fn matches(&self, record: &SpanRecord) -> bool {
        self.clauses.iter().all(|clause| clause.matches(record))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for clause in &self.clauses {
            clause.validate()?;
        }
        Ok(())
    }

    /// Human-readable rendering for previews, in insertion order.
    pub fn describe(&self) -> String {
        if self.clauses.is_empty() {
            return "all spans".to_string();
        }
        self.clauses
            .iter()
            .map(|c| c.describe())
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clause(field: &str, op: FilterOperator, value: Option<Value>) -> FilterClause {
        FilterClause::new(field, op, value)
    }

    fn llm_span() -> SpanRecord {
        SpanRecord::new("s1", "t1", "completion")
            .with_kind("llm")
            .with_attribute("tokens", json!(420))
            .with_attribute("tags", json!([]))
            .with_attribute("error", json!(""))
    }

    #[test]
    fn empty_expression_matches_everything() {
        let expr = FilterExpression::default();
        assert!(expr.matches(&llm_span()));
        assert!(expr.matches(&SpanRecord::new("x", "y", "z")));
    }

    #[test]
    fn equals_is_type_aware() {
        let span = llm_span();
        assert!(clause("span_kind", FilterOperator::Equals, Some(json!("llm"))).matches(&span));
        assert!(!clause("span_kind", FilterOperator::Equals, Some(json!(1))).matches(&span));
        assert!(clause("tokens", FilterOperator::Equals, Some(json!(420))).matches(&span));
        assert!(clause("tokens", FilterOperator::Equals, Some(json!(420.0))).matches(&span));
        // Mismatched types are unequal, so not_equals matches.
        assert!(clause("tokens", FilterOperator::NotEquals, Some(json!("420"))).matches(&span));
    }

    #[test]
    fn absent_field_matches_only_is_empty() {
        let span = SpanRecord::new("s1", "t1", "completion");
        assert!(!clause("missing", FilterOperator::Equals, Some(json!("x"))).matches(&span));
        assert!(!clause("missing", FilterOperator::NotEquals, Some(json!("x"))).matches(&span));
        assert!(!clause("missing", FilterOperator::Gt, Some(json!(0))).matches(&span));
        assert!(clause("missing", FilterOperator::IsEmpty, None).matches(&span));
        assert!(!clause("missing", FilterOperator::IsNotEmpty, None).matches(&span));
    }

    #[test]
    fn is_empty_covers_null_empty_string_and_empty_collections() {
        let span = llm_span();
        assert!(clause("error", FilterOperator::IsEmpty, None).matches(&span));
        assert!(clause("tags", FilterOperator::IsEmpty, None).matches(&span));
        assert!(clause("input", FilterOperator::IsEmpty, None).matches(&span));
        assert!(!clause("span_kind", FilterOperator::IsEmpty, None).matches(&span));
        assert!(clause("span_kind", FilterOperator::IsNotEmpty, None).matches(&span));
    }

    #[test]
    fn contains_requires_strings() {
        let span = llm_span();
        assert!(clause("span_name", FilterOperator::Contains, Some(json!("comp"))).matches(&span));
        assert!(!clause("tokens", FilterOperator::Contains, Some(json!("4"))).matches(&span));
        assert!(!clause("span_name", FilterOperator::Contains, Some(json!(7))).matches(&span));
    }

    #[test]
    fn ordering_requires_numbers() {
        let span = llm_span();
        assert!(clause("tokens", FilterOperator::Gt, Some(json!(100))).matches(&span));
        assert!(clause("tokens", FilterOperator::Lte, Some(json!(420))).matches(&span));
        assert!(!clause("tokens", FilterOperator::Lt, Some(json!(100))).matches(&span));
        assert!(!clause("span_name", FilterOperator::Gt, Some(json!(0))).matches(&span));
        assert!(!clause("tokens", FilterOperator::Gt, Some(json!("100"))).matches(&span));
    }

    #[test]
    fn and_monotonicity() {
        let span = llm_span();
        let base = FilterExpression::new(vec![clause(
            "span_kind",
            FilterOperator::Equals,
            Some(json!("llm")),
        )]);
        assert!(base.matches(&span));

        let extra = clause("tokens", FilterOperator::Gt, Some(json!(500)));
        let mut extended = base.clone();
        extended.clauses.push(extra.clone());
        assert_eq!(extended.matches(&span), extra.matches(&span));
    }

    #[test]
    fn clause_order_does_not_change_the_result() {
        let span = llm_span();
        let a = clause("span_kind", FilterOperator::Equals, Some(json!("llm")));
        let b = clause("tokens", FilterOperator::Gt, Some(json!(100)));
        let forward = FilterExpression::new(vec![a.clone(), b.clone()]);
        let backward = FilterExpression::new(vec![b, a]);
        assert_eq!(forward.matches(&span), backward.matches(&span));
    }

    #[test]
    fn validation_rejects_missing_values() {
        let expr = FilterExpression::new(vec![clause("f", FilterOperator::Gt, None)]);
        assert!(matches!(
            expr.validate(),
            Err(ValidationError::MissingClauseValue { .. })
        ));
        let ok = FilterExpression::new(vec![clause("f", FilterOperator::IsEmpty, None)]);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn describe_renders_in_insertion_order() {
        let expr = FilterExpression::new(vec![
            clause("span_kind", FilterOperator::Equals, Some(json!("llm"))),
            clause("error", FilterOperator::IsEmpty, None),
        ]);
        assert_eq!(expr.describe(), "span_kind equals \"llm\" AND error is empty");
        assert_eq!(FilterExpression::default().describe(), "all spans");
    }
}
