//! Domain types shared by the pipeline and the scheduler.

pub mod execution;
pub mod message;
pub mod tool;
pub mod workflow;

pub use execution::{ExecutionFilter, ExecutionRecord, ExecutionStatus};
pub use message::{ChatMessage, ChatRequest, ChatRole};
pub use tool::{OperationType, ToolDefinition, ToolExecutionResult, ToolVerdict};
pub use workflow::{StepDefinition, ToolCall, WorkflowDefinition, WorkflowFilter};

/// Generate a new random identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
