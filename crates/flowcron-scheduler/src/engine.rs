//! Schedule runtime — detects due schedules and hands runs to the worker pool.
//!
//! ```text
//! tick(now)
//!   for schedule in active (priority desc)
//!     window closed?        → pause, no log
//!     before window?        → advance, no log
//!     limit reached?        → pause, no log
//!     stale + discard?      → advance, no log
//!     busy + forbid overlap → defer / wait / drop (misfire policy)
//!     else dispatch         → log: running ─► pool ─► log: terminal
//!                                                     └► notify + retry
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use flowcron_core::config::SchedulerConfig;
use flowcron_core::error::{FlowError, Result};
use flowcron_core::traits::{NotificationEvent, Repository, TriggerEvaluator};
use flowcron_core::types::new_id;
use flowcron_pipeline::{ExecutionRequest, FailureKind, PipelineExecutor, template};

use crate::logbook::{LogFilter, LogStatus, ScheduleLogEntry, ScheduleLogRecorder, TriggerType};
use crate::notify::NotifyRouter;
use crate::pool::{Lane, LaneStats, WorkerPool};
use crate::schedule::{MisfirePolicy, ScheduleDefinition, ScheduleFilter, ScheduleStatus};

/// Everything the runtime needs from the outside.
pub struct RuntimeDeps {
    pub schedules: Arc<dyn Repository<ScheduleDefinition>>,
    pub logs: Arc<dyn Repository<ScheduleLogEntry>>,
    pub executor: Arc<PipelineExecutor>,
    pub evaluator: Arc<dyn TriggerEvaluator>,
    pub notifier: Arc<NotifyRouter>,
    pub config: SchedulerConfig,
}

/// In-flight runs per schedule, plus fire-once runs and retries waiting
/// for them.
#[derive(Default)]
struct RunRegistry {
    runs: HashMap<String, Vec<(String, CancellationToken)>>,
    deferred: HashMap<String, DateTime<Utc>>,
    deferred_retries: HashMap<String, String>,
}

/// Work parked behind a schedule's last run.
#[derive(Default)]
struct Released {
    deferred: Option<DateTime<Utc>>,
    retry: Option<String>,
}

struct Inner {
    schedules: Arc<dyn Repository<ScheduleDefinition>>,
    recorder: ScheduleLogRecorder,
    executor: Arc<PipelineExecutor>,
    evaluator: Arc<dyn TriggerEvaluator>,
    notifier: Arc<NotifyRouter>,
    pool: WorkerPool,
    config: SchedulerConfig,
    /// Serializes every read-modify-write of schedule rows.
    schedule_lock: tokio::sync::Mutex<()>,
    registry: Mutex<RunRegistry>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight count when a run (or pending retry) ends.
struct InFlight(Arc<Inner>);

impl InFlight {
    fn enter(inner: &Arc<Inner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(inner.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// How a worker run ended.
enum Ending {
    Finished(Result<flowcron_pipeline::PipelineOutcome>),
    TimedOut(u64),
    Cancelled,
}

/// The scheduler. Cheap to clone.
#[derive(Clone)]
pub struct ScheduleRuntime {
    inner: Arc<Inner>,
}

impl ScheduleRuntime {
    pub fn new(deps: RuntimeDeps) -> Self {
        let instance_id = deps.config.resolved_instance_id();
        Self {
            inner: Arc::new(Inner {
                schedules: deps.schedules,
                recorder: ScheduleLogRecorder::new(deps.logs, &instance_id),
                executor: deps.executor,
                evaluator: deps.evaluator,
                notifier: deps.notifier,
                pool: WorkerPool::new(deps.config.max_workers),
                config: deps.config,
                schedule_lock: tokio::sync::Mutex::new(()),
                registry: Mutex::new(RunRegistry::default()),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn instance_id(&self) -> &str {
        self.inner.recorder.instance_id()
    }

    pub fn notifier(&self) -> &NotifyRouter {
        &self.inner.notifier
    }

    pub fn pool_stats(&self) -> Vec<LaneStats> {
        self.inner.pool.stats()
    }

    /// Validate the trigger, compute the first fire time and persist.
    pub async fn register(&self, mut schedule: ScheduleDefinition) -> Result<ScheduleDefinition> {
        self.inner.evaluator.validate(&schedule.trigger_expression)?;
        if schedule.next_fire_at.is_none() {
            schedule.next_fire_at = self.next_fire(&schedule, Utc::now())?;
        }
        self.inner.schedules.save(&schedule).await?;
        tracing::info!(
            "📅 Schedule '{}' registered: '{}' → workflow {} (next: {})",
            schedule.name,
            schedule.trigger_expression,
            schedule.workflow_id,
            fmt_time(schedule.next_fire_at)
        );
        Ok(schedule)
    }

    /// Fire every due schedule. Returns how many runs were dispatched.
    /// Never waits for a run to finish.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.inner.schedule_lock.lock().await;
        let mut schedules = self
            .inner
            .schedules
            .list(&ScheduleFilter {
                enabled: Some(true),
                status: Some(ScheduleStatus::Active),
                ..Default::default()
            })
            .await?;
        schedules.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.next_fire_at.cmp(&b.next_fire_at))
        });

        let mut dispatched = 0;
        for schedule in schedules {
            match self.tick_one(&schedule.id, now).await {
                Ok(true) => dispatched += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("⚠️ Schedule '{}' tick failed: {}", schedule.name, e),
            }
        }
        Ok(dispatched)
    }

    async fn tick_one(&self, schedule_id: &str, now: DateTime<Utc>) -> Result<bool> {
        // another instance may have fired or paused it since the listing
        let mut schedule = match self.inner.schedules.get(schedule_id).await? {
            Some(schedule) if schedule.is_active() => schedule,
            _ => return Ok(false),
        };
        if schedule.window_passed(now) {
            schedule.next_fire_at = None;
            schedule.status = ScheduleStatus::Paused;
            self.inner.schedules.update(&schedule).await?;
            tracing::info!("⌛ Schedule '{}' validity window ended, paused", schedule.name);
            return Ok(false);
        }

        let Some(next) = schedule.next_fire_at else {
            schedule.next_fire_at = self.next_fire(&schedule, now)?;
            self.inner.schedules.update(&schedule).await?;
            return Ok(false);
        };
        if next > now {
            return Ok(false);
        }

        if !schedule.is_within_window(now) {
            schedule.next_fire_at = self.next_fire(&schedule, now)?;
            self.inner.schedules.update(&schedule).await?;
            tracing::debug!(
                "⏭️ Schedule '{}' outside its window, next: {}",
                schedule.name,
                fmt_time(schedule.next_fire_at)
            );
            return Ok(false);
        }

        if schedule.execution_limit_reached() {
            schedule.status = ScheduleStatus::Paused;
            schedule.next_fire_at = None;
            self.inner.schedules.update(&schedule).await?;
            tracing::info!("🏁 Schedule '{}' reached its execution limit, paused", schedule.name);
            return Ok(false);
        }

        let stale = (now - next).num_seconds() > self.inner.config.misfire_threshold_secs as i64;
        if stale && schedule.misfire_policy == MisfirePolicy::Discard {
            schedule.next_fire_at = self.next_fire(&schedule, now)?;
            self.inner.schedules.update(&schedule).await?;
            tracing::warn!("⏭️ Schedule '{}' misfired at {}, discarded", schedule.name, next);
            return Ok(false);
        }

        if schedule.forbids_overlap() && self.is_busy(&schedule.id).await? {
            match schedule.misfire_policy {
                MisfirePolicy::FireOnce => {
                    self.registry().deferred.entry(schedule.id.clone()).or_insert(next);
                    schedule.next_fire_at = self.next_fire(&schedule, now)?;
                    self.inner.schedules.update(&schedule).await?;
                    tracing::info!("⏳ Schedule '{}' still running, firing once when it ends", schedule.name);
                }
                MisfirePolicy::FireImmediately => {
                    tracing::debug!("⏳ Schedule '{}' still running, stays due", schedule.name);
                }
                MisfirePolicy::Discard => {
                    schedule.next_fire_at = self.next_fire(&schedule, now)?;
                    self.inner.schedules.update(&schedule).await?;
                    tracing::info!("⏭️ Schedule '{}' still running, firing dropped", schedule.name);
                }
            }
            return Ok(false);
        }

        tracing::info!("🔔 Schedule '{}' triggered (due {})", schedule.name, next);
        let input = self.render_input(&schedule, TriggerType::Scheduled, next, now, None);
        let fired = self.dispatch(schedule, TriggerType::Scheduled, next, input, now).await?;
        Ok(fired.is_some())
    }

    /// Run a schedule now, outside its cadence. `overrides` is merged over
    /// the rendered input template.
    pub async fn trigger_manually(&self, schedule_id: &str, overrides: Option<Value>) -> Result<String> {
        let _guard = self.inner.schedule_lock.lock().await;
        let schedule = self.load(schedule_id).await?;
        if !schedule.is_active() {
            return Err(FlowError::ScheduleInactive(schedule_id.to_string()));
        }
        let now = Utc::now();
        let input = self.render_input(&schedule, TriggerType::Manual, now, now, overrides);
        tracing::info!("👆 Schedule '{}' triggered manually", schedule.name);
        self.dispatch(schedule, TriggerType::Manual, now, input, now)
            .await?
            .ok_or_else(|| already_running(schedule_id))
    }

    /// Re-run the firing recorded in `previous_log_id` with its original input.
    pub async fn trigger_retry(&self, schedule_id: &str, previous_log_id: &str) -> Result<String> {
        let _guard = self.inner.schedule_lock.lock().await;
        let mut schedule = self.load(schedule_id).await?;
        if schedule.deleted || !schedule.enabled {
            return Err(FlowError::ScheduleInactive(schedule_id.to_string()));
        }
        let previous = self
            .inner
            .recorder
            .get(previous_log_id)
            .await?
            .filter(|entry| entry.schedule_id == schedule.id)
            .ok_or_else(|| FlowError::Config(format!("unknown log entry '{previous_log_id}'")))?;

        let attempt = previous.retry_count + 1;
        if attempt > schedule.max_retry_count {
            return Err(FlowError::RetryLimitExceeded { attempt, max: schedule.max_retry_count });
        }
        schedule.retry_count = attempt;
        tracing::info!(
            "🔁 Schedule '{}' retry {}/{}",
            schedule.name,
            attempt,
            schedule.max_retry_count
        );
        self.dispatch(
            schedule,
            TriggerType::Retry,
            previous.scheduled_time,
            previous.input,
            Utc::now(),
        )
        .await?
        .ok_or_else(|| already_running(schedule_id))
    }

    pub async fn pause(&self, schedule_id: &str) -> Result<ScheduleDefinition> {
        let _guard = self.inner.schedule_lock.lock().await;
        let mut schedule = self.load_live(schedule_id).await?;
        schedule.status = ScheduleStatus::Paused;
        self.inner.schedules.update(&schedule).await?;
        tracing::info!("⏸️ Schedule '{}' paused", schedule.name);
        Ok(schedule)
    }

    /// Reactivate and recompute the next fire time from now.
    pub async fn resume(&self, schedule_id: &str) -> Result<ScheduleDefinition> {
        let _guard = self.inner.schedule_lock.lock().await;
        let mut schedule = self.load_live(schedule_id).await?;
        schedule.status = ScheduleStatus::Active;
        schedule.next_fire_at = self.next_fire(&schedule, Utc::now())?;
        self.inner.schedules.update(&schedule).await?;
        tracing::info!(
            "▶️ Schedule '{}' resumed (next: {})",
            schedule.name,
            fmt_time(schedule.next_fire_at)
        );
        Ok(schedule)
    }

    /// Soft delete. Logs stay; in-flight runs are cancelled.
    pub async fn delete(&self, schedule_id: &str) -> Result<()> {
        let _guard = self.inner.schedule_lock.lock().await;
        let mut schedule = self.load_live(schedule_id).await?;
        schedule.deleted = true;
        schedule.next_fire_at = None;
        self.inner.schedules.update(&schedule).await?;

        let cancelled = {
            let mut registry = self.registry();
            registry.deferred.remove(schedule_id);
            registry.deferred_retries.remove(schedule_id);
            registry
                .runs
                .get(schedule_id)
                .map(|runs| {
                    runs.iter().for_each(|(_, token)| token.cancel());
                    runs.len()
                })
                .unwrap_or(0)
        };
        tracing::info!("🗑️ Schedule '{}' deleted ({} run(s) cancelled)", schedule.name, cancelled);
        Ok(())
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> Result<Option<ScheduleDefinition>> {
        self.inner.schedules.get(schedule_id).await
    }

    /// Matching schedules, highest priority first.
    pub async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<ScheduleDefinition>> {
        let mut schedules = self.inner.schedules.list(filter).await?;
        schedules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(schedules)
    }

    /// Matching log entries, newest first.
    pub async fn list_logs(&self, filter: &LogFilter) -> Result<Vec<ScheduleLogEntry>> {
        self.inner.recorder.list(filter).await
    }

    /// Close entries this instance left running before a restart.
    pub async fn recover(&self) -> Result<usize> {
        let count = self.inner.recorder.recover_interrupted().await?;
        if count > 0 {
            tracing::warn!("🩹 Recovered {} interrupted run(s)", count);
        }
        Ok(count)
    }

    /// Wait until no run or pending retry is left.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Tick every `interval` until `shutdown` fires.
    pub fn spawn(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            tracing::info!(
                "⏰ Scheduler started (tick every {}s, instance {})",
                interval.as_secs(),
                runtime.instance_id()
            );
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = runtime.tick(Utc::now()).await {
                            tracing::error!("❌ Scheduler tick failed: {}", e);
                        }
                    }
                }
            }
            tracing::info!("🛑 Scheduler stopped");
        })
    }

    // ── dispatch ──────────────────────────────────────────────

    /// Open the log entry, update counters and hand the run to the pool.
    /// `None` means the firing was not taken (busy, or claimed elsewhere).
    /// Caller holds `schedule_lock`.
    async fn dispatch(
        &self,
        mut schedule: ScheduleDefinition,
        trigger: TriggerType,
        scheduled_time: DateTime<Utc>,
        input: Value,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let Some((run_id, cancel)) = self.claim(&schedule.id, schedule.forbids_overlap()) else {
            return Ok(None);
        };

        let mut entry = match self
            .inner
            .recorder
            .open(&schedule, trigger, scheduled_time, input.clone())
            .await
        {
            Ok(entry) => entry,
            Err(FlowError::Duplicate(_)) => {
                self.release_early(&schedule.id, &run_id);
                tracing::debug!("👥 Schedule '{}' at {} claimed by another instance", schedule.name, scheduled_time);
                if trigger == TriggerType::Scheduled {
                    self.skip_claimed(&schedule.id, scheduled_time, now).await?;
                }
                return Ok(None);
            }
            Err(e) => {
                self.release_early(&schedule.id, &run_id);
                return Err(e);
            }
        };

        match trigger {
            TriggerType::Scheduled => {
                schedule.execution_count += 1;
                schedule.retry_count = 0;
                schedule.last_fired_at = Some(now);
                schedule.next_fire_at = self.next_fire(&schedule, now.max(scheduled_time))?;
            }
            TriggerType::Manual => {
                schedule.execution_count += 1;
                schedule.retry_count = 0;
            }
            TriggerType::Retry => {}
        }
        if schedule.execution_limit_reached() {
            schedule.status = ScheduleStatus::Paused;
            schedule.next_fire_at = None;
            tracing::info!(
                "🏁 Schedule '{}' fired {}/{} times, paused",
                schedule.name,
                schedule.execution_count,
                schedule.max_execution_count
            );
        }
        self.inner.schedules.update(&schedule).await?;

        if let Err(e) = self.inner.executor.validate(&schedule.workflow_id).await {
            tracing::error!("❌ Schedule '{}' cannot run: {}", schedule.name, e);
            let message = e.to_string();
            self.inner
                .recorder
                .close(&mut entry, LogStatus::Failed, &message, None)
                .await?;
            self.release_early(&schedule.id, &run_id);
            self.notify_failure(&entry).await;
            return Ok(Some(entry.id));
        }

        let log_id = entry.id.clone();
        let runtime = self.clone();
        let in_flight = InFlight::enter(&self.inner);
        self.inner.pool.spawn(Lane::from(trigger), async move {
            let _in_flight = in_flight;
            runtime.run(schedule, entry, input, run_id, cancel).await;
        });
        Ok(Some(log_id))
    }

    /// Worker body: execute, close the log, notify, then retry or fire a
    /// deferred run.
    async fn run(
        &self,
        schedule: ScheduleDefinition,
        mut entry: ScheduleLogEntry,
        input: Value,
        run_id: String,
        cancel: CancellationToken,
    ) {
        let execution_id = new_id();
        if let Err(e) = self.inner.recorder.attach_execution(&mut entry, &execution_id).await {
            tracing::warn!("⚠️ Failed to attach execution to log {}: {}", entry.id, e);
        }

        let timeout_secs = if schedule.execution_timeout_secs > 0 {
            schedule.execution_timeout_secs
        } else {
            self.inner.config.default_timeout_secs
        };
        let run_cancel = cancel.child_token();
        let request = ExecutionRequest::new(&schedule.workflow_id, input).with_execution_id(&execution_id);
        let execution = self.inner.executor.execute(request, run_cancel.clone());
        tokio::pin!(execution);

        let ending = tokio::select! {
            biased;
            result = &mut execution => Ending::Finished(result),
            _ = cancel.cancelled() => Ending::Cancelled,
            _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => Ending::TimedOut(timeout_secs),
        };
        if !matches!(ending, Ending::Finished(_)) {
            // let the executor write its terminal record
            run_cancel.cancel();
            if let Err(e) = execution.await {
                tracing::debug!("Cancelled execution {} ended with: {}", execution_id, e);
            }
        }

        let (status, message, output, retryable) = match ending {
            Ending::Finished(Ok(outcome)) if outcome.is_success() => {
                (LogStatus::Completed, "completed".to_string(), Some(outcome.output), false)
            }
            Ending::Finished(Ok(outcome)) => {
                let message = outcome.error.unwrap_or_else(|| "failed".into());
                match outcome.failure {
                    Some(FailureKind::Cancelled) => (LogStatus::Cancelled, message, Some(outcome.output), false),
                    kind => (
                        LogStatus::Failed,
                        message,
                        Some(outcome.output),
                        kind.is_some_and(|k| k.is_retryable()),
                    ),
                }
            }
            Ending::Finished(Err(e)) => (LogStatus::Failed, e.to_string(), None, !e.is_configuration()),
            Ending::TimedOut(secs) => (LogStatus::Timeout, format!("Timed out after {secs}s"), None, true),
            Ending::Cancelled => (LogStatus::Cancelled, "cancelled".to_string(), None, false),
        };

        if let Err(e) = self.inner.recorder.close(&mut entry, status, &message, output).await {
            tracing::error!("❌ Failed to close log {}: {}", entry.id, e);
        }
        match status {
            LogStatus::Completed => {
                tracing::info!("✅ Schedule '{}' run completed ({}ms)", schedule.name, entry.duration_ms.unwrap_or(0));
                if schedule.retry_count > 0 {
                    self.reset_retries(&schedule.id).await;
                }
            }
            LogStatus::Failed | LogStatus::Timeout => {
                tracing::warn!("⚠️ Schedule '{}' run {}: {}", schedule.name, status, message);
                self.notify_failure(&entry).await;
            }
            _ => tracing::info!("🚫 Schedule '{}' run cancelled", schedule.name),
        }

        let released = self.release(&schedule.id, &run_id);

        if retryable && entry.retry_count < schedule.max_retry_count {
            let delay = Duration::from_secs(self.inner.config.retry_delay_secs);
            self.schedule_retry(&schedule.id, &entry.id, delay);
        }
        if let Some(log_id) = released.retry {
            tracing::info!("🔁 Schedule '{}' starting parked retry of {}", schedule.name, log_id);
            self.schedule_retry(&schedule.id, &log_id, Duration::ZERO);
        }
        if let Some(scheduled_time) = released.deferred {
            self.fire_deferred(schedule.id.clone(), scheduled_time).await;
        }
    }

    /// Retry `log_id` after `delay`. A retry that finds this instance still
    /// running the schedule is parked until that run ends.
    fn schedule_retry(&self, schedule_id: &str, log_id: &str, delay: Duration) {
        let runtime = self.clone();
        let in_flight = InFlight::enter(&self.inner);
        let (schedule_id, log_id) = (schedule_id.to_string(), log_id.to_string());
        tokio::spawn(async move {
            let _in_flight = in_flight;
            tokio::time::sleep(delay).await;
            // a second attempt covers the run ending between the refusal and parking
            for _ in 0..2 {
                match runtime.trigger_retry(&schedule_id, &log_id).await {
                    Ok(_) => return,
                    Err(FlowError::InvalidTransition(_)) => {
                        if runtime.park_retry(&schedule_id, &log_id) {
                            tracing::info!("⏳ Retry of schedule {} parked until the current run ends", schedule_id);
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("⚠️ Retry of schedule {} not started: {}", schedule_id, e);
                        return;
                    }
                }
            }
            tracing::warn!("⚠️ Retry of schedule {} not started: still contended", schedule_id);
        });
    }

    /// Boxed: dispatch and the worker body reach each other through here.
    fn fire_deferred(
        &self,
        schedule_id: String,
        scheduled_time: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let _guard = self.inner.schedule_lock.lock().await;
            let schedule = match self.load(&schedule_id).await {
                Ok(schedule) if schedule.is_active() && !schedule.execution_limit_reached() => schedule,
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!("⚠️ Deferred run of schedule {} dropped: {}", schedule_id, e);
                    return;
                }
            };
            let now = Utc::now();
            tracing::info!("🔔 Schedule '{}' deferred run triggered (due {})", schedule.name, scheduled_time);
            let input = self.render_input(&schedule, TriggerType::Scheduled, scheduled_time, now, None);
            if let Err(e) = self
                .dispatch(schedule, TriggerType::Scheduled, scheduled_time, input, now)
                .await
            {
                tracing::warn!("⚠️ Deferred run of schedule {} failed to start: {}", schedule_id, e);
            }
        })
    }

    /// Another instance owns this occurrence. Its row is authoritative; only
    /// move `next_fire_at` if the owner has not already done so.
    async fn skip_claimed(
        &self,
        schedule_id: &str,
        scheduled_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut current = self.load(schedule_id).await?;
        if !current.is_active() || current.next_fire_at.is_none_or(|next| next > scheduled_time) {
            return Ok(());
        }
        current.next_fire_at = self.next_fire(&current, now.max(scheduled_time))?;
        self.inner.schedules.update(&current).await
    }

    async fn reset_retries(&self, schedule_id: &str) {
        let _guard = self.inner.schedule_lock.lock().await;
        let result = async {
            let mut schedule = self.load(schedule_id).await?;
            schedule.retry_count = 0;
            self.inner.schedules.update(&schedule).await
        };
        if let Err(e) = result.await {
            tracing::warn!("⚠️ Failed to reset retries of schedule {}: {}", schedule_id, e);
        }
    }

    async fn notify_failure(&self, entry: &ScheduleLogEntry) {
        let event = NotificationEvent::new(
            &entry.schedule_id,
            &entry.workflow_id,
            &entry.id,
            entry.status.as_str(),
            &entry.message,
        );
        self.inner.notifier.publish(event).await;
    }

    // ── helpers ───────────────────────────────────────────────

    /// Next occurrence strictly after `after`, never before `valid_from`.
    fn next_fire(&self, schedule: &ScheduleDefinition, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let after = match schedule.valid_from {
            Some(from) if from > after => from - chrono::Duration::seconds(1),
            _ => after,
        };
        self.inner.evaluator.next_fire_time(&schedule.trigger_expression, after)
    }

    /// Render the input template against the firing context, then merge
    /// caller overrides on top.
    fn render_input(
        &self,
        schedule: &ScheduleDefinition,
        trigger: TriggerType,
        scheduled_time: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        overrides: Option<Value>,
    ) -> Value {
        let mut vars = template::system_variables();
        vars.insert("schedule_id".into(), Value::String(schedule.id.clone()));
        vars.insert("schedule_name".into(), Value::String(schedule.name.clone()));
        vars.insert("workflow_id".into(), Value::String(schedule.workflow_id.clone()));
        vars.insert("trigger_type".into(), Value::String(trigger.as_str().into()));
        vars.insert("scheduled_time".into(), Value::String(scheduled_time.to_rfc3339()));
        vars.insert("fired_at".into(), Value::String(fired_at.to_rfc3339()));
        vars.insert("retry_count".into(), Value::from(schedule.retry_count));

        let base = schedule
            .input_template
            .as_ref()
            .map(|t| template::render_value(t, &vars))
            .unwrap_or_else(|| Value::Object(Map::new()));
        match (base, overrides) {
            (Value::Object(mut base), Some(Value::Object(overrides))) => {
                base.extend(overrides);
                Value::Object(base)
            }
            (_, Some(overrides)) => overrides,
            (base, None) => base,
        }
    }

    async fn load(&self, schedule_id: &str) -> Result<ScheduleDefinition> {
        self.inner
            .schedules
            .get(schedule_id)
            .await?
            .ok_or_else(|| FlowError::ScheduleNotFound(schedule_id.to_string()))
    }

    async fn load_live(&self, schedule_id: &str) -> Result<ScheduleDefinition> {
        let schedule = self.load(schedule_id).await?;
        if schedule.deleted {
            return Err(FlowError::ScheduleNotFound(schedule_id.to_string()));
        }
        Ok(schedule)
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, RunRegistry> {
        self.inner.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Running here, or running on another instance per the log.
    async fn is_busy(&self, schedule_id: &str) -> Result<bool> {
        let local = self.registry().runs.get(schedule_id).is_some_and(|runs| !runs.is_empty());
        if local {
            return Ok(true);
        }
        Ok(!self.inner.recorder.running_for(schedule_id).await?.is_empty())
    }

    /// Atomically check for overlap and reserve a run slot.
    fn claim(&self, schedule_id: &str, exclusive: bool) -> Option<(String, CancellationToken)> {
        let mut registry = self.registry();
        let runs = registry.runs.entry(schedule_id.to_string()).or_default();
        if exclusive && !runs.is_empty() {
            return None;
        }
        let claim = (new_id(), CancellationToken::new());
        runs.push(claim.clone());
        Some(claim)
    }

    /// Free a run slot. Once the schedule is idle, hands back the work
    /// parked behind it.
    fn release(&self, schedule_id: &str, run_id: &str) -> Released {
        let mut registry = self.registry();
        let idle = match registry.runs.get_mut(schedule_id) {
            Some(runs) => {
                runs.retain(|(id, _)| id != run_id);
                runs.is_empty()
            }
            None => true,
        };
        if !idle {
            return Released::default();
        }
        registry.runs.remove(schedule_id);
        Released {
            deferred: registry.deferred.remove(schedule_id),
            retry: registry.deferred_retries.remove(schedule_id),
        }
    }

    /// Release a slot whose run never started, keeping any parked retry.
    fn release_early(&self, schedule_id: &str, run_id: &str) {
        if let Some(log_id) = self.release(schedule_id, run_id).retry {
            self.schedule_retry(schedule_id, &log_id, Duration::ZERO);
        }
    }

    /// Park a retry behind the schedule's running work. `false` if nothing
    /// is running here any more.
    fn park_retry(&self, schedule_id: &str, log_id: &str) -> bool {
        let mut registry = self.registry();
        let busy = registry.runs.get(schedule_id).is_some_and(|runs| !runs.is_empty());
        if busy {
            registry.deferred_retries.insert(schedule_id.to_string(), log_id.to_string());
        }
        busy
    }
}

fn already_running(schedule_id: &str) -> FlowError {
    FlowError::InvalidTransition(format!("schedule {schedule_id} is already running"))
}

fn fmt_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::CronEvaluator;
    use crate::persistence::SqliteStore;
    use crate::schedule::ConcurrencyPolicy;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use flowcron_core::store::MemoryRepository;
    use flowcron_core::traits::Tool;
    use flowcron_core::types::{
        ExecutionRecord, StepDefinition, ToolDefinition, ToolExecutionResult, WorkflowDefinition,
    };
    use flowcron_providers::ClientRegistry;
    use flowcron_tools::ToolRegistry;
    use serde_json::json;
    use tokio::sync::Semaphore;

    /// Blocks until the test hands out a permit.
    struct GateTool(Arc<Semaphore>);

    #[async_trait]
    impl Tool for GateTool {
        fn name(&self) -> &str {
            "gate"
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "gate".into(),
                description: "Wait for the gate".into(),
                parameters: json!({"type": "object"}),
            }
        }

        async fn execute(&self, params: &Map<String, Value>) -> Result<ToolExecutionResult> {
            if let Ok(permit) = self.0.acquire().await {
                permit.forget();
            }
            Ok(ToolExecutionResult::operation_success(Value::Object(params.clone()), "passed"))
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "echo".into(),
                description: "Return the parameters".into(),
                parameters: json!({"type": "object"}),
            }
        }

        async fn execute(&self, params: &Map<String, Value>) -> Result<ToolExecutionResult> {
            Ok(ToolExecutionResult::operation_success(Value::Object(params.clone()), "ok"))
        }
    }

    struct FlakyTool;

    #[async_trait]
    impl Tool for FlakyTool {
        fn name(&self) -> &str {
            "flaky"
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "flaky".into(),
                description: "Always errors".into(),
                parameters: json!({"type": "object"}),
            }
        }

        async fn execute(&self, _params: &Map<String, Value>) -> Result<ToolExecutionResult> {
            Err(FlowError::Tool("connection reset".into()))
        }
    }

    struct MissingTool;

    #[async_trait]
    impl Tool for MissingTool {
        fn name(&self) -> &str {
            "lookup"
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "lookup".into(),
                description: "Never finds anything".into(),
                parameters: json!({"type": "object"}),
            }
        }

        async fn execute(&self, _params: &Map<String, Value>) -> Result<ToolExecutionResult> {
            Ok(ToolExecutionResult::empty(Some("not found")))
        }
    }

    /// Errors on its first call, then waits for the gate like `gate`.
    struct StutterTool {
        gate: Arc<Semaphore>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Tool for StutterTool {
        fn name(&self) -> &str {
            "stutter"
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "stutter".into(),
                description: "Fails once, then waits for the gate".into(),
                parameters: json!({"type": "object"}),
            }
        }

        async fn execute(&self, params: &Map<String, Value>) -> Result<ToolExecutionResult> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(FlowError::Tool("connection reset".into()));
            }
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            Ok(ToolExecutionResult::operation_success(Value::Object(params.clone()), "passed"))
        }
    }

    /// Hands out the listing only after other tasks had a turn, so callers
    /// act on rows another instance may already have changed.
    struct StaleListing(MemoryRepository<ScheduleDefinition>);

    #[async_trait]
    impl Repository<ScheduleDefinition> for StaleListing {
        async fn get(&self, id: &str) -> Result<Option<ScheduleDefinition>> {
            self.0.get(id).await
        }

        async fn list(&self, filter: &ScheduleFilter) -> Result<Vec<ScheduleDefinition>> {
            let listed = self.0.list(filter).await;
            tokio::task::yield_now().await;
            listed
        }

        async fn save(&self, entity: &ScheduleDefinition) -> Result<()> {
            self.0.save(entity).await
        }

        async fn update(&self, entity: &ScheduleDefinition) -> Result<()> {
            self.0.update(entity).await
        }
    }

    struct Harness {
        runtime: ScheduleRuntime,
        workflows: Arc<dyn Repository<WorkflowDefinition>>,
        gate: Arc<Semaphore>,
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            retry_delay_secs: 0,
            instance_id: "test-node".into(),
            ..Default::default()
        }
    }

    fn build(
        schedules: Arc<dyn Repository<ScheduleDefinition>>,
        logs: Arc<dyn Repository<ScheduleLogEntry>>,
        workflows: Arc<dyn Repository<WorkflowDefinition>>,
        executions: Arc<dyn Repository<ExecutionRecord>>,
    ) -> Harness {
        build_with(config(), schedules, logs, workflows, executions)
    }

    fn build_with(
        config: SchedulerConfig,
        schedules: Arc<dyn Repository<ScheduleDefinition>>,
        logs: Arc<dyn Repository<ScheduleLogEntry>>,
        workflows: Arc<dyn Repository<WorkflowDefinition>>,
        executions: Arc<dyn Repository<ExecutionRecord>>,
    ) -> Harness {
        let gate = Arc::new(Semaphore::new(0));
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(GateTool(gate.clone())));
        tools.register(Arc::new(EchoTool));
        tools.register(Arc::new(FlakyTool));
        tools.register(Arc::new(MissingTool));
        tools.register(Arc::new(StutterTool { gate: gate.clone(), calls: AtomicUsize::new(0) }));
        let executor = PipelineExecutor::new(
            workflows.clone(),
            executions,
            Arc::new(tools),
            Arc::new(ClientRegistry::new()),
        );
        let runtime = ScheduleRuntime::new(RuntimeDeps {
            schedules,
            logs,
            executor: Arc::new(executor),
            evaluator: Arc::new(CronEvaluator::new()),
            notifier: Arc::new(NotifyRouter::new(50)),
            config,
        });
        Harness { runtime, workflows, gate }
    }

    fn harness() -> Harness {
        build(
            Arc::new(MemoryRepository::<ScheduleDefinition>::new()),
            Arc::new(MemoryRepository::<ScheduleLogEntry>::new()),
            Arc::new(MemoryRepository::<WorkflowDefinition>::new()),
            Arc::new(MemoryRepository::<ExecutionRecord>::new()),
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    fn minutes(n: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::minutes(n)
    }

    impl Harness {
        async fn workflow(&self, tool: &str) -> WorkflowDefinition {
            let wf = WorkflowDefinition::new(tool)
                .with_step(StepDefinition::tool(1, "only", tool, json!({"value": "{{input}}"})).writes("result"));
            self.workflows.save(&wf).await.unwrap();
            wf
        }

        /// Every-minute schedule first due at `t0`.
        async fn every_minute(&self, wf: &WorkflowDefinition, tweak: impl FnOnce(ScheduleDefinition) -> ScheduleDefinition) -> ScheduleDefinition {
            let mut schedule = tweak(ScheduleDefinition::cron("job", &wf.id, "* * * * *"));
            schedule.next_fire_at = Some(t0());
            self.runtime.register(schedule).await.unwrap()
        }

        async fn schedule(&self, id: &str) -> ScheduleDefinition {
            self.runtime.get_schedule(id).await.unwrap().unwrap()
        }

        async fn logs(&self, schedule_id: &str) -> Vec<ScheduleLogEntry> {
            self.runtime
                .list_logs(&LogFilter { schedule_id: Some(schedule_id.into()), ..Default::default() })
                .await
                .unwrap()
        }

        async fn running(&self, schedule_id: &str) -> usize {
            self.runtime
                .list_logs(&LogFilter {
                    schedule_id: Some(schedule_id.into()),
                    status: Some(LogStatus::Running),
                    ..Default::default()
                })
                .await
                .unwrap()
                .len()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_register_rejects_bad_trigger() {
        let h = harness();
        let wf = h.workflow("echo").await;
        let bad = ScheduleDefinition::cron("bad", &wf.id, "every tuesday");
        assert!(matches!(h.runtime.register(bad).await, Err(FlowError::InvalidTrigger(_))));

        let ok = h.runtime.register(ScheduleDefinition::cron("ok", &wf.id, "0 8 * * *")).await.unwrap();
        assert!(ok.next_fire_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_execution_limit_pauses_after_three_fires() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let h = build(store.clone(), store.clone(), store.clone(), store);
        let wf = h.workflow("echo").await;
        let s = h.every_minute(&wf, |s| s.with_max_executions(3)).await;

        for n in 0..3 {
            assert_eq!(h.runtime.tick(minutes(n)).await.unwrap(), 1);
            h.runtime.wait_idle().await;
        }
        let paused = h.schedule(&s.id).await;
        assert_eq!(paused.status, ScheduleStatus::Paused);
        assert_eq!(paused.execution_count, 3);

        assert_eq!(h.runtime.tick(minutes(3)).await.unwrap(), 0);
        let logs = h.logs(&s.id).await;
        assert_eq!(logs.len(), 3);
        assert!(logs.iter().all(|l| l.status == LogStatus::Completed));
        assert!(logs.iter().all(|l| l.execution_id.is_some()));
    }

    #[tokio::test]
    async fn test_next_fire_advances_past_last_fired() {
        let h = harness();
        let wf = h.workflow("echo").await;
        let s = h.every_minute(&wf, |s| s).await;

        h.runtime.tick(t0()).await.unwrap();
        h.runtime.wait_idle().await;
        let fired = h.schedule(&s.id).await;
        assert_eq!(fired.last_fired_at, Some(t0()));
        assert_eq!(fired.next_fire_at, Some(minutes(1)));

        // not due yet
        assert_eq!(h.runtime.tick(t0() + chrono::Duration::seconds(30)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_schedule_outside_window_is_skipped_without_log() {
        let h = harness();
        let wf = h.workflow("echo").await;
        let from = minutes(60);
        let mut s = h.every_minute(&wf, |s| s).await;
        s.valid_from = Some(from);
        h.runtime.inner.schedules.update(&s).await.unwrap();

        assert_eq!(h.runtime.tick(t0()).await.unwrap(), 0);
        assert!(h.logs(&s.id).await.is_empty());
        assert_eq!(h.schedule(&s.id).await.next_fire_at, Some(from));
    }

    #[tokio::test]
    async fn test_closed_window_pauses_schedule() {
        let h = harness();
        let wf = h.workflow("echo").await;
        let s = h.every_minute(&wf, |s| s.with_window(None, Some(minutes(5)))).await;

        h.runtime.tick(minutes(6)).await.unwrap();
        let after = h.schedule(&s.id).await;
        assert_eq!(after.status, ScheduleStatus::Paused);
        assert_eq!(after.next_fire_at, None);
        assert!(h.logs(&s.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_forbid_overlap_keeps_one_running_and_fires_once_later() {
        let h = harness();
        let wf = h.workflow("gate").await;
        let s = h.every_minute(&wf, |s| s).await;

        assert_eq!(h.runtime.tick(t0()).await.unwrap(), 1);
        settle().await;
        for n in 1..4 {
            assert_eq!(h.runtime.tick(minutes(n)).await.unwrap(), 0);
            assert_eq!(h.running(&s.id).await, 1);
        }
        assert_eq!(h.schedule(&s.id).await.next_fire_at, Some(minutes(4)));

        h.gate.add_permits(2);
        h.runtime.wait_idle().await;
        let logs = h.logs(&s.id).await;
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.status == LogStatus::Completed));
        // the deferred run fires for the first missed occurrence
        assert!(logs.iter().any(|l| l.scheduled_time == minutes(1)));
    }

    #[tokio::test]
    async fn test_busy_discard_drops_the_firing() {
        let h = harness();
        let wf = h.workflow("gate").await;
        let s = h
            .every_minute(&wf, |s| s.with_policies(MisfirePolicy::Discard, ConcurrencyPolicy::ForbidOverlap))
            .await;

        h.runtime.tick(t0()).await.unwrap();
        settle().await;
        h.runtime.tick(minutes(1)).await.unwrap();
        h.gate.add_permits(1);
        h.runtime.wait_idle().await;
        assert_eq!(h.logs(&s.id).await.len(), 1);
        assert_eq!(h.schedule(&s.id).await.next_fire_at, Some(minutes(2)));
    }

    #[tokio::test]
    async fn test_allow_overlap_runs_concurrently() {
        let h = harness();
        let wf = h.workflow("gate").await;
        let s = h
            .every_minute(&wf, |s| s.with_policies(MisfirePolicy::FireOnce, ConcurrencyPolicy::AllowOverlap))
            .await;

        h.runtime.tick(t0()).await.unwrap();
        h.runtime.tick(minutes(1)).await.unwrap();
        settle().await;
        assert_eq!(h.running(&s.id).await, 2);
        h.gate.add_permits(2);
        h.runtime.wait_idle().await;
        assert_eq!(h.running(&s.id).await, 0);
    }

    #[tokio::test]
    async fn test_stale_firing_policies() {
        let h = harness();
        let wf = h.workflow("echo").await;
        let discard = h
            .every_minute(&wf, |s| s.with_policies(MisfirePolicy::Discard, ConcurrencyPolicy::ForbidOverlap))
            .await;
        let once = h.every_minute(&wf, |s| s).await;

        let late = minutes(10);
        assert_eq!(h.runtime.tick(late).await.unwrap(), 1);
        h.runtime.wait_idle().await;

        assert!(h.logs(&discard.id).await.is_empty());
        assert_eq!(h.schedule(&discard.id).await.next_fire_at, Some(minutes(11)));

        let logs = h.logs(&once.id).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].scheduled_time, t0());
        assert_eq!(h.schedule(&once.id).await.next_fire_at, Some(minutes(11)));
    }

    #[tokio::test]
    async fn test_busy_fire_immediately_stays_due_until_run_ends() {
        let h = harness();
        let wf = h.workflow("gate").await;
        let s = h
            .every_minute(&wf, |s| s.with_policies(MisfirePolicy::FireImmediately, ConcurrencyPolicy::ForbidOverlap))
            .await;

        assert_eq!(h.runtime.tick(t0()).await.unwrap(), 1);
        settle().await;
        assert_eq!(h.runtime.tick(minutes(1)).await.unwrap(), 0);
        assert_eq!(h.schedule(&s.id).await.next_fire_at, Some(minutes(1)));
        assert_eq!(h.logs(&s.id).await.len(), 1);

        h.gate.add_permits(1);
        h.runtime.wait_idle().await;
        let later = minutes(1) + chrono::Duration::seconds(30);
        assert_eq!(h.runtime.tick(later).await.unwrap(), 1);
        assert_eq!(h.schedule(&s.id).await.next_fire_at, Some(minutes(2)));

        h.gate.add_permits(1);
        h.runtime.wait_idle().await;
        let logs = h.logs(&s.id).await;
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().any(|l| l.scheduled_time == minutes(1) && l.status == LogStatus::Completed));
    }

    #[tokio::test]
    async fn test_stale_firing_catches_up_exactly_once() {
        let h = harness();
        let wf = h.workflow("echo").await;
        let s = h
            .every_minute(&wf, |s| s.with_policies(MisfirePolicy::FireImmediately, ConcurrencyPolicy::ForbidOverlap))
            .await;

        let now = minutes(10) + chrono::Duration::seconds(15);
        assert_eq!(h.runtime.tick(now).await.unwrap(), 1);
        h.runtime.wait_idle().await;
        let after = h.schedule(&s.id).await;
        assert_eq!(after.next_fire_at, Some(minutes(11)));
        assert!(after.next_fire_at.is_some_and(|next| next > now));

        assert_eq!(h.runtime.tick(now + chrono::Duration::seconds(30)).await.unwrap(), 0);
        let logs = h.logs(&s.id).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].scheduled_time, t0());
    }

    #[tokio::test]
    async fn test_instances_sharing_a_store_fire_an_occurrence_once() {
        let schedules: Arc<dyn Repository<ScheduleDefinition>> = Arc::new(StaleListing(MemoryRepository::new()));
        let logs: Arc<dyn Repository<ScheduleLogEntry>> = Arc::new(MemoryRepository::<ScheduleLogEntry>::new());
        let workflows: Arc<dyn Repository<WorkflowDefinition>> = Arc::new(MemoryRepository::<WorkflowDefinition>::new());
        let executions: Arc<dyn Repository<ExecutionRecord>> = Arc::new(MemoryRepository::<ExecutionRecord>::new());
        let a = build(schedules.clone(), logs.clone(), workflows.clone(), executions.clone());
        let b = build_with(
            SchedulerConfig { instance_id: "node-b".into(), ..config() },
            schedules,
            logs,
            workflows,
            executions,
        );
        let wf = a.workflow("echo").await;
        let s = a
            .every_minute(&wf, |s| {
                s.with_max_executions(1)
                    .with_policies(MisfirePolicy::FireOnce, ConcurrencyPolicy::AllowOverlap)
            })
            .await;

        let (fired_a, fired_b) = tokio::join!(a.runtime.tick(t0()), b.runtime.tick(t0()));
        assert_eq!(fired_a.unwrap() + fired_b.unwrap(), 1);
        a.runtime.wait_idle().await;
        b.runtime.wait_idle().await;

        let after = b.schedule(&s.id).await;
        assert_eq!(after.execution_count, 1);
        assert_eq!(after.status, ScheduleStatus::Paused);
        assert_eq!(after.next_fire_at, None);

        assert_eq!(a.runtime.tick(minutes(1)).await.unwrap(), 0);
        assert_eq!(b.runtime.tick(minutes(1)).await.unwrap(), 0);
        assert_eq!(a.logs(&s.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_waits_for_newer_run_to_end() {
        let h = build_with(
            SchedulerConfig { retry_delay_secs: 1, ..config() },
            Arc::new(MemoryRepository::<ScheduleDefinition>::new()),
            Arc::new(MemoryRepository::<ScheduleLogEntry>::new()),
            Arc::new(MemoryRepository::<WorkflowDefinition>::new()),
            Arc::new(MemoryRepository::<ExecutionRecord>::new()),
        );
        let wf = h.workflow("stutter").await;
        let s = h.every_minute(&wf, |s| s.with_retries(2)).await;

        h.runtime.tick(t0()).await.unwrap();
        settle().await;
        assert_eq!(h.runtime.tick(minutes(1)).await.unwrap(), 1);

        // the retry comes due while the minute-1 run holds the schedule
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let logs = h.logs(&s.id).await;
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.trigger_type == TriggerType::Scheduled));

        h.gate.add_permits(2);
        h.runtime.wait_idle().await;
        let logs = h.logs(&s.id).await;
        assert_eq!(logs.len(), 3);
        let retry = logs.iter().find(|l| l.trigger_type == TriggerType::Retry).unwrap();
        assert_eq!(retry.status, LogStatus::Completed);
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.scheduled_time, t0());
        assert_eq!(h.running(&s.id).await, 0);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_until_limit() {
        let h = harness();
        let wf = h.workflow("flaky").await;
        let s = h.every_minute(&wf, |s| s.with_retries(2)).await;

        h.runtime.tick(t0()).await.unwrap();
        h.runtime.wait_idle().await;

        let mut logs = h.logs(&s.id).await;
        logs.sort_by_key(|l| l.retry_count);
        assert_eq!(logs.len(), 3);
        assert_eq!(logs.iter().map(|l| l.retry_count).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(logs[0].trigger_type, TriggerType::Scheduled);
        assert!(logs[1..].iter().all(|l| l.trigger_type == TriggerType::Retry));
        assert!(logs.iter().all(|l| l.status == LogStatus::Failed && l.max_retry_count == 2));
        // retries keep the firing's input and do not count as executions
        assert_eq!(logs[2].input, logs[0].input);
        assert_eq!(h.schedule(&s.id).await.execution_count, 1);

        assert!(matches!(
            h.runtime.trigger_retry(&s.id, &logs[2].id).await,
            Err(FlowError::RetryLimitExceeded { attempt: 3, max: 2 })
        ));
        assert_eq!(h.runtime.notifier().history().await.len(), 3);
    }

    #[tokio::test]
    async fn test_halting_failure_is_not_retried() {
        let h = harness();
        let wf = h.workflow("lookup").await;
        let s = h.every_minute(&wf, |s| s.with_retries(3)).await;

        h.runtime.tick(t0()).await.unwrap();
        h.runtime.wait_idle().await;
        let logs = h.logs(&s.id).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Failed);
        assert_eq!(logs[0].message, "not found");
    }

    #[tokio::test]
    async fn test_missing_workflow_fails_at_dispatch() {
        let h = harness();
        let mut schedule = ScheduleDefinition::cron("orphan", "no-such-workflow", "* * * * *").with_retries(2);
        schedule.next_fire_at = Some(t0());
        let s = h.runtime.register(schedule).await.unwrap();

        assert_eq!(h.runtime.tick(t0()).await.unwrap(), 1);
        h.runtime.wait_idle().await;
        let logs = h.logs(&s.id).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Failed);
        assert!(logs[0].message.contains("no-such-workflow"));

        let events = h.runtime.notifier().history().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, "failed");
        assert_eq!(events[0].log_id, logs[0].id);
    }

    #[tokio::test]
    async fn test_timeout_cancels_run_and_notifies() {
        let h = harness();
        let wf = h.workflow("gate").await;
        let s = h.every_minute(&wf, |s| s.with_timeout(1)).await;

        h.runtime.tick(t0()).await.unwrap();
        h.runtime.wait_idle().await;
        let logs = h.logs(&s.id).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Timeout);
        assert_eq!(logs[0].message, "Timed out after 1s");

        let events = h.runtime.notifier().history().await;
        assert_eq!(events[0].status, "timeout");
    }

    #[tokio::test]
    async fn test_delete_cancels_runs_and_keeps_logs() {
        let h = harness();
        let wf = h.workflow("gate").await;
        let s = h.every_minute(&wf, |s| s).await;

        h.runtime.tick(t0()).await.unwrap();
        settle().await;
        h.runtime.delete(&s.id).await.unwrap();
        h.runtime.wait_idle().await;

        let logs = h.logs(&s.id).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Cancelled);
        assert!(h.runtime.list_schedules(&ScheduleFilter::default()).await.unwrap().is_empty());
        assert_eq!(h.runtime.tick(minutes(1)).await.unwrap(), 0);
        assert!(matches!(h.runtime.pause(&s.id).await, Err(FlowError::ScheduleNotFound(_))));
    }

    #[tokio::test]
    async fn test_manual_trigger_merges_overrides_and_respects_status() {
        let h = harness();
        let wf = h.workflow("echo").await;
        let s = h
            .every_minute(&wf, |s| s.with_input(json!({"who": "{{schedule_name}}", "n": 1})))
            .await;

        let log_id = h.runtime.trigger_manually(&s.id, Some(json!({"n": 2}))).await.unwrap();
        h.runtime.wait_idle().await;
        let entry = h.runtime.list_logs(&LogFilter::default()).await.unwrap();
        assert_eq!(entry[0].id, log_id);
        assert_eq!(entry[0].trigger_type, TriggerType::Manual);
        assert_eq!(entry[0].input, json!({"who": "job", "n": 2}));
        assert_eq!(entry[0].status, LogStatus::Completed);

        h.runtime.pause(&s.id).await.unwrap();
        assert!(matches!(
            h.runtime.trigger_manually(&s.id, None).await,
            Err(FlowError::ScheduleInactive(_))
        ));
        assert_eq!(h.runtime.tick(minutes(5)).await.unwrap(), 0);

        let resumed = h.runtime.resume(&s.id).await.unwrap();
        assert!(resumed.next_fire_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_priority_orders_dispatch() {
        let h = harness();
        let wf = h.workflow("echo").await;
        let low = h.every_minute(&wf, |s| s.with_priority(1)).await;
        let high = h.every_minute(&wf, |s| s.with_priority(9)).await;

        assert_eq!(h.runtime.tick(t0()).await.unwrap(), 2);
        h.runtime.wait_idle().await;
        let listed = h.runtime.list_schedules(&ScheduleFilter::default()).await.unwrap();
        assert_eq!(listed[0].id, high.id);
        assert_eq!(listed[1].id, low.id);
    }

    #[tokio::test]
    async fn test_recover_closes_interrupted_runs() {
        let logs = Arc::new(MemoryRepository::<ScheduleLogEntry>::new());
        let h = build(
            Arc::new(MemoryRepository::<ScheduleDefinition>::new()),
            logs.clone(),
            Arc::new(MemoryRepository::<WorkflowDefinition>::new()),
            Arc::new(MemoryRepository::<ExecutionRecord>::new()),
        );
        let schedule = ScheduleDefinition::cron("s", "wf", "* * * * *");
        let stale = ScheduleLogRecorder::new(logs, "test-node");
        stale.open(&schedule, TriggerType::Scheduled, t0(), Value::Null).await.unwrap();

        assert_eq!(h.runtime.recover().await.unwrap(), 1);
        let entries = h.runtime.list_logs(&LogFilter::default()).await.unwrap();
        assert_eq!(entries[0].status, LogStatus::Failed);
        assert_eq!(h.runtime.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawned_loop_stops_on_shutdown() {
        let h = harness();
        let shutdown = CancellationToken::new();
        let handle = h.runtime.spawn(Duration::from_millis(10), shutdown.clone());
        settle().await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
