//! Schedule log — one audit entry per trigger attempt.
//!
//! Entries are created `running` and closed exactly once. They are never
//! deleted, even when their schedule is.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowcron_core::error::{FlowError, Result};
use flowcron_core::traits::{Entity, Repository};
use flowcron_core::types::new_id;

use crate::schedule::ScheduleDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Scheduled,
    Manual,
    Retry,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Scheduled => "scheduled",
            TriggerType::Manual => "manual",
            TriggerType::Retry => "retry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(TriggerType::Scheduled),
            "manual" => Some(TriggerType::Manual),
            "retry" => Some(TriggerType::Retry),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl LogStatus {
    pub fn is_terminal(&self) -> bool {
        *self != LogStatus::Running
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Running => "running",
            LogStatus::Completed => "completed",
            LogStatus::Failed => "failed",
            LogStatus::Timeout => "timeout",
            LogStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(LogStatus::Running),
            "completed" => Some(LogStatus::Completed),
            "failed" => Some(LogStatus::Failed),
            "timeout" => Some(LogStatus::Timeout),
            "cancelled" => Some(LogStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleLogEntry {
    pub id: String,
    pub schedule_id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub execution_id: Option<String>,
    pub trigger_type: TriggerType,
    /// Occurrence this entry fires for (trigger time for manual runs).
    pub scheduled_time: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub status: LogStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retry_count: u32,
    /// Scheduler instance that owns the run.
    pub instance_id: String,
    #[serde(default)]
    pub input: Value,
}

impl ScheduleLogEntry {
    pub fn open(
        schedule: &ScheduleDefinition,
        trigger_type: TriggerType,
        scheduled_time: DateTime<Utc>,
        instance_id: &str,
        input: Value,
    ) -> Self {
        Self {
            id: new_id(),
            schedule_id: schedule.id.clone(),
            workflow_id: schedule.workflow_id.clone(),
            execution_id: None,
            trigger_type,
            scheduled_time,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            status: LogStatus::Running,
            message: String::new(),
            output: None,
            retry_count: schedule.retry_count,
            max_retry_count: schedule.max_retry_count,
            instance_id: instance_id.to_string(),
            input,
        }
    }

    /// Move to a terminal state. Fails if already closed.
    pub fn close(&mut self, status: LogStatus, message: &str, output: Option<Value>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(FlowError::InvalidTransition(format!(
                "log {} already {}",
                self.id, self.status
            )));
        }
        if !status.is_terminal() {
            return Err(FlowError::InvalidTransition(format!(
                "log {} cannot move to {}",
                self.id, status
            )));
        }
        let now = Utc::now();
        self.status = status;
        self.message = message.to_string();
        self.output = output;
        self.finished_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub schedule_id: Option<String>,
    pub workflow_id: Option<String>,
    pub status: Option<LogStatus>,
    pub trigger_type: Option<TriggerType>,
    pub instance_id: Option<String>,
}

impl Entity for ScheduleLogEntry {
    type Filter = LogFilter;
    const KIND: &'static str = "schedule_log";

    fn id(&self) -> &str {
        &self.id
    }

    fn matches(&self, filter: &LogFilter) -> bool {
        filter.schedule_id.as_deref().is_none_or(|s| s == self.schedule_id)
            && filter.workflow_id.as_deref().is_none_or(|w| w == self.workflow_id)
            && filter.status.is_none_or(|s| s == self.status)
            && filter.trigger_type.is_none_or(|t| t == self.trigger_type)
            && filter.instance_id.as_deref().is_none_or(|i| i == self.instance_id)
    }

    /// One scheduled firing per occurrence, across all instances.
    fn dedup_key(&self) -> Option<String> {
        (self.trigger_type == TriggerType::Scheduled)
            .then(|| format!("{}@{}", self.schedule_id, self.scheduled_time.to_rfc3339()))
    }
}

/// Opens and closes log entries for one scheduler instance.
#[derive(Clone)]
pub struct ScheduleLogRecorder {
    repo: Arc<dyn Repository<ScheduleLogEntry>>,
    instance_id: String,
}

impl ScheduleLogRecorder {
    pub fn new(repo: Arc<dyn Repository<ScheduleLogEntry>>, instance_id: &str) -> Self {
        Self { repo, instance_id: instance_id.to_string() }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Persist a `running` entry. A scheduled firing already claimed by
    /// another instance fails with `Duplicate`.
    pub async fn open(
        &self,
        schedule: &ScheduleDefinition,
        trigger_type: TriggerType,
        scheduled_time: DateTime<Utc>,
        input: Value,
    ) -> Result<ScheduleLogEntry> {
        let entry = ScheduleLogEntry::open(schedule, trigger_type, scheduled_time, &self.instance_id, input);
        self.repo.save(&entry).await?;
        Ok(entry)
    }

    pub async fn attach_execution(&self, entry: &mut ScheduleLogEntry, execution_id: &str) -> Result<()> {
        if entry.status.is_terminal() {
            return Err(FlowError::InvalidTransition(format!("log {} is closed", entry.id)));
        }
        entry.execution_id = Some(execution_id.to_string());
        self.repo.update(entry).await
    }

    pub async fn close(
        &self,
        entry: &mut ScheduleLogEntry,
        status: LogStatus,
        message: &str,
        output: Option<Value>,
    ) -> Result<()> {
        entry.close(status, message, output)?;
        self.repo.update(entry).await
    }

    /// Running entries of a schedule, from any instance.
    pub async fn running_for(&self, schedule_id: &str) -> Result<Vec<ScheduleLogEntry>> {
        self.repo
            .list(&LogFilter {
                schedule_id: Some(schedule_id.to_string()),
                status: Some(LogStatus::Running),
                ..Default::default()
            })
            .await
    }

    /// Fail entries this instance left `running` before a restart.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let stale = self
            .repo
            .list(&LogFilter {
                status: Some(LogStatus::Running),
                instance_id: Some(self.instance_id.clone()),
                ..Default::default()
            })
            .await?;
        let count = stale.len();
        for mut entry in stale {
            self.close(&mut entry, LogStatus::Failed, "interrupted by restart", None).await?;
        }
        Ok(count)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ScheduleLogEntry>> {
        self.repo.get(id).await
    }

    /// Entries matching `filter`, newest first.
    pub async fn list(&self, filter: &LogFilter) -> Result<Vec<ScheduleLogEntry>> {
        let mut entries = self.repo.list(filter).await?;
        entries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(entries)
    }
}
