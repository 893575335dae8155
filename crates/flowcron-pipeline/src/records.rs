//! Execution record manager.

use std::sync::Arc;

use serde_json::Value;

use flowcron_core::error::Result;
use flowcron_core::traits::Repository;
use flowcron_core::types::{ExecutionFilter, ExecutionRecord, ExecutionStatus};

/// Creates records in `running` and moves each to exactly one terminal state.
#[derive(Clone)]
pub struct ExecutionRecords {
    repo: Arc<dyn Repository<ExecutionRecord>>,
}

impl ExecutionRecords {
    pub fn new(repo: Arc<dyn Repository<ExecutionRecord>>) -> Self {
        Self { repo }
    }

    pub async fn start(&self, id: &str, workflow_id: &str, input: &Value) -> Result<ExecutionRecord> {
        let record = ExecutionRecord::start(id, workflow_id, input.clone());
        self.repo.save(&record).await?;
        tracing::debug!("📝 Execution {} started for workflow {}", id, workflow_id);
        Ok(record)
    }

    pub async fn complete(&self, record: &mut ExecutionRecord, output: Value) -> Result<()> {
        record.finish(ExecutionStatus::Completed, Some(output), None)?;
        self.repo.update(record).await
    }

    /// Fail the record, keeping whatever the scope held when the run stopped.
    pub async fn fail(
        &self,
        record: &mut ExecutionRecord,
        message: &str,
        partial_output: Option<Value>,
    ) -> Result<()> {
        record.finish(ExecutionStatus::Failed, partial_output, Some(message.to_string()))?;
        self.repo.update(record).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        self.repo.get(id).await
    }

    pub async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        self.repo.list(filter).await
    }
}
