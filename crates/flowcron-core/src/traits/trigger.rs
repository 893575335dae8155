use chrono::{DateTime, Utc};

use crate::error::Result;

/// Computes when a trigger expression fires next.
pub trait TriggerEvaluator: Send + Sync {
    /// Next fire time strictly after `after`, or `None` if it never fires again.
    fn next_fire_time(&self, expression: &str, after: DateTime<Utc>)
    -> Result<Option<DateTime<Utc>>>;

    /// Check an expression without caring about the result.
    fn validate(&self, expression: &str) -> Result<()> {
        self.next_fire_time(expression, Utc::now()).map(|_| ())
    }
}
