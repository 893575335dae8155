//! Schedule definitions — the persistent data model for triggered workflows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowcron_core::traits::Entity;
use flowcron_core::types::new_id;

/// A workflow bound to a trigger expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub id: String,
    pub name: String,
    pub workflow_id: String,
    /// Cron expression.
    pub trigger_expression: String,
    pub enabled: bool,
    pub status: ScheduleStatus,
    /// JSON template rendered into the run input at dispatch.
    #[serde(default)]
    pub input_template: Option<Value>,
    /// Seconds before a run is cancelled. 0 = scheduler default.
    #[serde(default)]
    pub execution_timeout_secs: u64,
    /// Consecutive failed attempts of the current firing.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retry_count: u32,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_execution_count: u32,
    #[serde(default)]
    pub execution_count: u32,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub misfire_policy: MisfirePolicy,
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,
    /// Higher fires first within one tick.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub last_fired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Soft-deleted schedules keep their logs but never fire.
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Active => "active",
            ScheduleStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ScheduleStatus::Active),
            "paused" => Some(ScheduleStatus::Paused),
            _ => None,
        }
    }
}

/// What to do with a firing that could not run on time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Run as soon as possible.
    FireImmediately,
    /// Run once for all missed occurrences.
    #[default]
    FireOnce,
    /// Drop it and wait for the next occurrence.
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    AllowOverlap,
    #[default]
    ForbidOverlap,
}

impl ScheduleDefinition {
    /// Create an active cron schedule. `next_fire_at` is computed on register.
    pub fn cron(name: &str, workflow_id: &str, expression: &str) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            workflow_id: workflow_id.to_string(),
            trigger_expression: expression.to_string(),
            enabled: true,
            status: ScheduleStatus::Active,
            input_template: None,
            execution_timeout_secs: 0,
            retry_count: 0,
            max_retry_count: 0,
            max_execution_count: 0,
            execution_count: 0,
            valid_from: None,
            valid_until: None,
            misfire_policy: MisfirePolicy::default(),
            concurrency_policy: ConcurrencyPolicy::default(),
            priority: 0,
            last_fired_at: None,
            next_fire_at: None,
            deleted: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_input(mut self, template: Value) -> Self {
        self.input_template = Some(template);
        self
    }

    pub fn with_window(mut self, from: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.valid_from = from;
        self.valid_until = until;
        self
    }

    pub fn with_retries(mut self, max_retry_count: u32) -> Self {
        self.max_retry_count = max_retry_count;
        self
    }

    pub fn with_max_executions(mut self, max: u32) -> Self {
        self.max_execution_count = max;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.execution_timeout_secs = secs;
        self
    }

    pub fn with_policies(mut self, misfire: MisfirePolicy, concurrency: ConcurrencyPolicy) -> Self {
        self.misfire_policy = misfire;
        self.concurrency_policy = concurrency;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Eligible for scheduled and manual triggers.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.deleted && self.status == ScheduleStatus::Active
    }

    pub fn is_within_window(&self, at: DateTime<Utc>) -> bool {
        self.valid_from.is_none_or(|from| at >= from)
            && self.valid_until.is_none_or(|until| at <= until)
    }

    /// The window has closed for good.
    pub fn window_passed(&self, at: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|until| at > until)
    }

    pub fn execution_limit_reached(&self) -> bool {
        self.max_execution_count > 0 && self.execution_count >= self.max_execution_count
    }

    pub fn forbids_overlap(&self) -> bool {
        self.concurrency_policy == ConcurrencyPolicy::ForbidOverlap
    }

    /// Due at `now` if active and its next fire time has arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.next_fire_at.is_some_and(|next| next <= now)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleFilter {
    pub enabled: Option<bool>,
    pub status: Option<ScheduleStatus>,
    pub workflow_id: Option<String>,
    pub include_deleted: bool,
}

impl Entity for ScheduleDefinition {
    type Filter = ScheduleFilter;
    const KIND: &'static str = "schedule";

    fn id(&self) -> &str {
        &self.id
    }

    fn matches(&self, filter: &ScheduleFilter) -> bool {
        (filter.include_deleted || !self.deleted)
            && filter.enabled.is_none_or(|e| e == self.enabled)
            && filter.status.is_none_or(|s| s == self.status)
            && filter
                .workflow_id
                .as_deref()
                .is_none_or(|w| w == self.workflow_id)
    }
}
