//! Outbound notification seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Raised when a triggered run ends in failure or timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub schedule_id: String,
    pub workflow_id: String,
    /// Log entry that produced the event.
    #[serde(default)]
    pub log_id: String,
    /// Terminal log status (`failed`, `timeout`, ...).
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(schedule_id: &str, workflow_id: &str, log_id: &str, status: &str, message: &str) -> Self {
        Self {
            schedule_id: schedule_id.to_string(),
            workflow_id: workflow_id.to_string(),
            log_id: log_id.to_string(),
            status: status.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Delivers notification events somewhere outside the process.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, event: &NotificationEvent) -> Result<()>;
}
