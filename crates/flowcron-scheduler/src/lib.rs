//! # FlowCron Scheduler
//!
//! Fires workflows on cron schedules and keeps an audit trail of every
//! attempt.
//!
//! ## Design Principles
//! - Tick detection never waits on a run; runs go to per-trigger worker lanes
//! - SQLite persistence — schedules and logs survive restarts
//! - One log entry per attempt, closed exactly once
//! - Several instances can share one database; a firing is claimed once
//!
//! ## Architecture
//! ```text
//! ScheduleRuntime (tokio interval)
//!   ├── tick(now): due schedules, priority first
//!   │     ├── window / execution limit / misfire policy
//!   │     └── forbid-overlap check ──► ScheduleLogRecorder (running)
//!   ├── WorkerPool
//!   │     ├── scheduled lane
//!   │     ├── manual lane
//!   │     └── retry lane
//!   │            └── PipelineExecutor ──► log: completed | failed | timeout | cancelled
//!   └── on failure → NotifyRouter
//!                      ├── LogSink (tracing)
//!                      └── WebhookSink (HTTP POST)
//! ```

pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod logbook;
pub mod notify;
pub mod persistence;
pub mod pool;
pub mod schedule;

pub use cron::{CronEvaluator, CronSchedule};
pub use dispatch::WebhookSink;
pub use engine::{RuntimeDeps, ScheduleRuntime};
pub use logbook::{LogFilter, LogStatus, ScheduleLogEntry, ScheduleLogRecorder, TriggerType};
pub use notify::{LogSink, NotifyRouter};
pub use persistence::SqliteStore;
pub use pool::{Lane, LaneStats, WorkerPool};
pub use schedule::{ConcurrencyPolicy, MisfirePolicy, ScheduleDefinition, ScheduleFilter, ScheduleStatus};
