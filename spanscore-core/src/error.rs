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

//! Configuration-time validation errors.
//!
//! These are rejected synchronously when an evaluator is created or updated
//! and never reach execution.

use crate::filter::FilterOperator;
use crate::scorer::ScorerType;
use thiserror::Error;

/// Errors produced while validating an evaluator draft or scorer
/// configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("scorer config variant is {found} but scorer_type is {expected}")]
    ScorerVariantMismatch {
        expected: ScorerType,
        found: ScorerType,
    },

    #[error("duplicate variable name: {0}")]
    DuplicateVariable(String),

    #[error("sampling_rate must be within [0, 1], got {0}")]
    InvalidSamplingRate(f64),

    #[error("evaluator name must not be empty")]
    EmptyName,

    #[error("filter clause on field '{field}' requires a value for operator {operator}")]
    MissingClauseValue {
        field: String,
        operator: FilterOperator,
    },

    #[error("invalid regex pattern: {0}")]
    InvalidPattern(String),

    #[error("regex capture group '{0}' does not exist in the pattern")]
    UnknownCaptureGroup(String),

    #[error("llm scorer requires at least one message")]
    EmptyMessages,

    #[error("temperature must be within [0, 2], got {0}")]
    InvalidTemperature(f64),

    #[error("categorical output field '{0}' must list at least one category")]
    EmptyCategories(String),

    #[error("output field '{field}' has min_value {min} greater than max_value {max}")]
    InvalidRange { field: String, min: f64, max: f64 },

    #[error("builtin scorer '{scorer}' requires config key '{key}'")]
    MissingBuiltinOption { scorer: String, key: String },

    #[error("variable mapping for path '{0}' has an empty variable name")]
    EmptyVariableName(String),
}
