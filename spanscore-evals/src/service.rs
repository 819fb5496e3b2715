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

//! Transport-agnostic facade over evaluator management, triggering, testing
//! and read paths. An HTTP or RPC layer maps these calls one to one.

use crate::analytics::EvaluatorAnalytics;
use crate::dryrun::{TestEvaluatorResponse, TestPipeline, TestSampleSpec};
use crate::lifecycle::{ExecutionManager, TriggerAccepted, TriggerError};
use crate::scorers::ScorerDispatch;
use crate::store::{EvaluatorStore, ExecutionStore, SpanProvider, StoreError};
use serde::{Deserialize, Serialize};
use spanscore_core::{
    Evaluator, EvaluatorDraft, EvaluatorStatus, Execution, ExecutionDetail, ExecutionScope,
    ExecutionStatus, ExecutionTrigger, ValidationError,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("not found: {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    /// Cancelling an already-terminal or already-claimed execution.
    #[error("execution state conflict: {0}")]
    Conflict(String),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::EvaluatorNotFound(id) | StoreError::ExecutionNotFound(id) => {
                ServiceError::NotFound(id)
            }
            other => ServiceError::Conflict(other.to_string()),
        }
    }
}

/// List-query shape for execution history.
#[derive(Debug, Clone, Deserialize)]
pub struct ListExecutionsQuery {
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    #[serde(default)]
    pub trigger: Option<ExecutionTrigger>,
    /// 1-based page number.
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    20
}

impl Default for ListExecutionsQuery {
    fn default() -> Self {
        Self {
            status: None,
            trigger: None,
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPage {
    pub executions: Vec<Execution>,
    pub total: u64,
    pub page: usize,
    pub page_size: usize,
}

pub struct EvaluatorService {
    evaluators: Arc<dyn EvaluatorStore>,
    executions: Arc<dyn ExecutionStore>,
    manager: ExecutionManager,
    pipeline: TestPipeline,
}

impl EvaluatorService {
    pub fn new(
        evaluators: Arc<dyn EvaluatorStore>,
        executions: Arc<dyn ExecutionStore>,
        spans: Arc<dyn SpanProvider>,
        scorer: Arc<dyn ScorerDispatch>,
    ) -> Self {
        let manager = ExecutionManager::new(
            evaluators.clone(),
            executions.clone(),
            spans.clone(),
            scorer.clone(),
        );
        let pipeline = TestPipeline::new(spans, scorer);
        Self {
            evaluators,
            executions,
            manager,
            pipeline,
        }
    }

    /// Validate and persist a new evaluator. New evaluators start inactive;
    /// activation is an explicit second step.
    pub fn create_evaluator(
        &self,
        project_id: Uuid,
        draft: EvaluatorDraft,
    ) -> Result<Evaluator, ServiceError> {
        let evaluator = Evaluator::from_draft(project_id, draft)?;
        info!(evaluator_id = %evaluator.id, name = %evaluator.name, "evaluator created");
        self.evaluators.insert(evaluator.clone());
        Ok(evaluator)
    }

    pub fn get_evaluator(&self, id: Uuid) -> Result<Evaluator, ServiceError> {
        Ok(self.evaluators.get(id)?)
    }

    pub fn list_evaluators(&self, project_id: Uuid) -> Vec<Evaluator> {
        self.evaluators.list(project_id)
    }

    pub fn activate(&self, id: Uuid) -> Result<Evaluator, ServiceError> {
        self.set_status(id, EvaluatorStatus::Active)
    }

    pub fn deactivate(&self, id: Uuid) -> Result<Evaluator, ServiceError> {
        self.set_status(id, EvaluatorStatus::Inactive)
    }

    pub fn pause(&self, id: Uuid) -> Result<Evaluator, ServiceError> {
        self.set_status(id, EvaluatorStatus::Paused)
    }

    fn set_status(&self, id: Uuid, status: EvaluatorStatus) -> Result<Evaluator, ServiceError> {
        let evaluator = self.evaluators.set_status(id, status)?;
        info!(evaluator_id = %id, status = ?status, "evaluator status changed");
        Ok(evaluator)
    }

    /// Asynchronous accept; the returned execution id is the handle for
    /// polling the outcome.
    pub async fn trigger_evaluator(
        &self,
        id: Uuid,
        trigger: ExecutionTrigger,
        scope: Option<ExecutionScope>,
    ) -> Result<TriggerAccepted, ServiceError> {
        Ok(self.manager.trigger(id, trigger, scope).await?)
    }

    pub fn cancel_execution(&self, execution_id: Uuid) -> Result<Execution, ServiceError> {
        Ok(self.manager.cancel(execution_id)?)
    }

    /// Side-effect-free preview; allowed for evaluators in any status.
    pub async fn test_evaluator(
        &self,
        id: Uuid,
        sample_spec: Option<TestSampleSpec>,
    ) -> Result<TestEvaluatorResponse, ServiceError> {
        let evaluator = self.evaluators.get(id)?;
        Ok(self.pipeline.test(&evaluator, sample_spec).await)
    }

    pub fn get_execution(&self, execution_id: Uuid) -> Result<Execution, ServiceError> {
        Ok(self.executions.get(execution_id)?)
    }

    pub fn get_execution_detail(
        &self,
        execution_id: Uuid,
    ) -> Result<ExecutionDetail, ServiceError> {
        Ok(self.executions.get_detail(execution_id)?)
    }

    /// Execution history, newest first, with optional status/trigger filters.
    pub fn list_executions(
        &self,
        evaluator_id: Uuid,
        query: ListExecutionsQuery,
    ) -> Result<ExecutionPage, ServiceError> {
        // Listing for an unknown evaluator is a not-found, not an empty page.
        self.evaluators.get(evaluator_id)?;

        let filtered: Vec<Execution> = self
            .executions
            .list_by_evaluator(evaluator_id)
            .into_iter()
            .filter(|e| query.status.map_or(true, |s| e.status == s))
            .filter(|e| query.trigger.map_or(true, |t| e.trigger_type == t))
            .collect();

        let total = filtered.len() as u64;
        let page = query.page.max(1);
        let page_size = query.page_size.clamp(1, MAX_PAGE_SIZE);
        let executions = filtered
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();

        Ok(ExecutionPage {
            executions,
            total,
            page,
            page_size,
        })
    }

    /// `period_days = None` aggregates the full history.
    pub fn evaluator_analytics(
        &self,
        evaluator_id: Uuid,
        period_days: Option<u32>,
    ) -> Result<EvaluatorAnalytics, ServiceError> {
        self.evaluators.get(evaluator_id)?;
        let details = self.executions.list_details_by_evaluator(evaluator_id);
        Ok(EvaluatorAnalytics::for_period(
            evaluator_id,
            &details,
            period_days,
            spanscore_core::now_micros(),
        ))
    }
}
