//! Per-invocation execution record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FlowError, Result};
use crate::traits::repository::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Created `running` at pipeline start; makes exactly one terminal transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn start(id: &str, workflow_id: &str, input: Value) -> Self {
        Self {
            id: id.to_string(),
            workflow_id: workflow_id.to_string(),
            status: ExecutionStatus::Running,
            input,
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Move to a terminal status. A second call is rejected.
    pub fn finish(
        &mut self,
        status: ExecutionStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<()> {
        if self.status.is_terminal() {
            return Err(FlowError::InvalidTransition(format!(
                "execution {} already {}",
                self.id, self.status
            )));
        }
        if !status.is_terminal() {
            return Err(FlowError::InvalidTransition(format!(
                "execution {} cannot move to {}",
                self.id, status
            )));
        }
        self.status = status;
        self.output = output;
        self.error = error;
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
}

impl Entity for ExecutionRecord {
    type Filter = ExecutionFilter;
    const KIND: &'static str = "execution";

    fn id(&self) -> &str {
        &self.id
    }

    fn matches(&self, filter: &ExecutionFilter) -> bool {
        filter.workflow_id.as_ref().is_none_or(|w| *w == self.workflow_id)
            && filter.status.is_none_or(|s| s == self.status)
    }
}
