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

//! Spanscore Core
//!
//! Data model and pure algorithms for evaluator targeting and scoring:
//! span/trace records, the declarative filter language, variable resolution
//! over untyped payloads, the tagged scorer configuration, and the execution
//! record types with their state-machine guards.
//!
//! Everything in this crate is synchronous, side-effect free, and safe to
//! call concurrently. The async engine lives in `spanscore-evals`.

pub mod error;
pub mod evaluator;
pub mod execution;
pub mod filter;
pub mod resolve;
pub mod scorer;
pub mod span;

pub use error::ValidationError;
pub use evaluator::{
    Evaluator, EvaluatorDraft, EvaluatorSnapshot, EvaluatorStatus, TargetScope, TriggerType,
};
pub use execution::{
    now_micros, Execution, ExecutionDetail, ExecutionScope, ExecutionStatus, ExecutionTrigger,
    SpanExecutionDetail, SpanOutcome, TransitionError,
};
pub use filter::{FilterClause, FilterExpression, FilterOperator};
pub use resolve::{resolve, resolve_path, ResolvedVariable, VariableMapping, VariableSource};
pub use scorer::{
    BuiltinScorerConfig, BuiltinScorerName, ChatMessage, LlmScorerConfig, OutputField,
    OutputFieldType, RegexScorerConfig, ResponseFormat, ScoreResult, ScoreValue, ScorerConfig,
    ScorerType,
};
pub use span::{SpanRecord, TraceRecord};
