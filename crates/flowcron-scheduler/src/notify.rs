//! Notification router — fans failure events out to every registered sink.
//! Lightweight: no queues. A sink that fails is logged and skipped.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use flowcron_core::error::Result;
use flowcron_core::traits::{NotificationEvent, NotificationSink};

pub struct NotifyRouter {
    sinks: Vec<Arc<dyn NotificationSink>>,
    /// In-memory ring buffer of recent events.
    history: Mutex<VecDeque<NotificationEvent>>,
    history_size: usize,
}

impl NotifyRouter {
    pub fn new(history_size: usize) -> Self {
        Self {
            sinks: Vec::new(),
            history: Mutex::new(VecDeque::new()),
            history_size: history_size.max(1),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name().to_string()).collect()
    }

    /// Record the event and deliver it to every sink. Never fails.
    pub async fn publish(&self, event: NotificationEvent) {
        {
            let mut history = self.history.lock().await;
            history.push_back(event.clone());
            while history.len() > self.history_size {
                history.pop_front();
            }
        }

        for sink in &self.sinks {
            if let Err(e) = sink.notify(&event).await {
                tracing::warn!("⚠️ Notification sink '{}' failed: {}", sink.name(), e);
            }
        }
    }

    /// Recent events, oldest first.
    pub async fn history(&self) -> Vec<NotificationEvent> {
        self.history.lock().await.iter().cloned().collect()
    }
}

impl Default for NotifyRouter {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Writes events to the tracing log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, event: &NotificationEvent) -> Result<()> {
        tracing::warn!(
            "📢 Schedule {} (workflow {}) ended {}: {}",
            event.schedule_id,
            event.workflow_id,
            event.status,
            event.message
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcron_core::error::FlowError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl NotificationSink for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn notify(&self, _event: &NotificationEvent) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl NotificationSink for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn notify(&self, _event: &NotificationEvent) -> Result<()> {
            Err(FlowError::Http("unreachable".into()))
        }
    }

    fn event(n: usize) -> NotificationEvent {
        NotificationEvent::new("s", "wf", &format!("log-{n}"), "failed", "boom")
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let router = NotifyRouter::new(10)
            .with_sink(Arc::new(Broken))
            .with_sink(Arc::new(LogSink))
            .with_sink(counting.clone());

        router.publish(event(1)).await;
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
        assert_eq!(router.sink_names(), vec!["broken", "log", "counting"]);
    }

    #[tokio::test]
    async fn test_history_is_a_ring_buffer() {
        let router = NotifyRouter::new(3);
        for n in 0..5 {
            router.publish(event(n)).await;
        }
        let ids: Vec<String> = router.history().await.into_iter().map(|e| e.log_id).collect();
        assert_eq!(ids, vec!["log-2", "log-3", "log-4"]);
    }
}
