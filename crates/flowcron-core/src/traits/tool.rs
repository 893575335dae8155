use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::types::{ToolDefinition, ToolExecutionResult};

/// A named, pluggable operation a workflow step can invoke.
///
/// Return `Ok` with `success = false` for expected failures ("not found").
/// `Err` is for unexpected ones; the registry turns both into failure results.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, params: &Map<String, Value>) -> Result<ToolExecutionResult>;
}
