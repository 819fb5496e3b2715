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

//! # Spanscore Evaluation Engine
//!
//! The async half of spanscore: scorer dispatch (regex, builtin heuristics,
//! LLM-as-judge), storage traits with in-memory implementations, the
//! execution lifecycle manager, the side-effect-free test pipeline, adaptive
//! polling for consumers, and the transport-agnostic service facade.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spanscore_evals::scorers::StrategyScorer;
//! use spanscore_evals::service::{EvaluatorService, ListExecutionsQuery};
//! use spanscore_evals::store::{
//!     MemoryEvaluatorStore, MemoryExecutionStore, MemorySpanProvider,
//! };
//! use spanscore_core::ExecutionTrigger;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = EvaluatorService::new(
//!         Arc::new(MemoryEvaluatorStore::new()),
//!         Arc::new(MemoryExecutionStore::new()),
//!         Arc::new(MemorySpanProvider::new()),
//!         Arc::new(StrategyScorer::new()),
//!     );
//!
//!     let evaluator = service.create_evaluator(project_id, draft).unwrap();
//!     service.activate(evaluator.id).unwrap();
//!     let accepted = service
//!         .trigger_evaluator(evaluator.id, ExecutionTrigger::Manual, None)
//!         .await
//!         .unwrap();
//!     // Poll accepted.execution_id for the outcome.
//! }
//! ```

pub mod analytics;
pub mod dryrun;
pub mod lifecycle;
pub mod llm;
pub mod polling;
pub mod scorers;
pub mod service;
pub mod store;

pub use analytics::EvaluatorAnalytics;
pub use dryrun::{
    EvaluatorPreview, TestEvaluatorResponse, TestExecution, TestPipeline, TestSampleSpec,
    TestSpanStatus, TestSummary,
};
pub use lifecycle::{ExecutionManager, TriggerAccepted, TriggerError};
pub use llm::{CompletionParams, LlmClient, LlmError, LlmResponse, OpenAiClient, TokenUsage};
pub use polling::{poll_interval, ExecutionPoller, POLL_INTERVAL};
pub use scorers::{ScoreFailure, ScorerDispatch, ScorerError, ScorerOutput, StrategyScorer};
pub use service::{EvaluatorService, ExecutionPage, ListExecutionsQuery, ServiceError};
pub use store::{
    EvaluatorStore, ExecutionStore, MemoryEvaluatorStore, MemoryExecutionStore,
    MemorySpanProvider, SpanProvider, StoreError,
};
