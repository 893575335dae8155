//! Pipeline executor — runs the ordered steps of one workflow invocation.
//!
//! ```text
//! validate(workflow) ──► record: running
//!   for step in steps (ascending order, disabled skipped)
//!     input   ← scope[input_variable] (or the trigger input)
//!     tool?   → success=false ⇒ halt
//!     model?  → error ⇒ fail
//!     scope[output_variable] ← result
//! record: completed | failed   (exactly once)
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use flowcron_core::error::{FlowError, Result};
use flowcron_core::traits::{AiClient, Repository, StreamCallbacks, spawn_stream_chat};
use flowcron_core::types::{
    ChatRequest, ExecutionRecord, ExecutionStatus, StepDefinition, ToolVerdict, WorkflowDefinition,
    new_id,
};
use flowcron_providers::ClientRegistry;
use flowcron_tools::ToolRegistry;
use flowcron_tools::registry::EXCEPTION_FLAG;

use crate::records::ExecutionRecords;
use crate::scope::Scope;
use crate::template;

/// One invocation of a workflow.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub workflow_id: String,
    pub input: Value,
    /// Pre-allocated record id; generated when absent.
    pub execution_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(workflow_id: &str, input: Value) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            input,
            execution_id: None,
        }
    }

    pub fn with_execution_id(mut self, id: &str) -> Self {
        self.execution_id = Some(id.to_string());
        self
    }
}

/// Why a run ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A tool answered `success = false`.
    Halted,
    /// Backend or tool error. Eligible for retry.
    Error,
    /// Missing model, tool or variable.
    Configuration,
    Cancelled,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Error)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub execution_id: String,
    pub status: ExecutionStatus,
    /// Final scope, or the partial scope of a failed run.
    pub output: Value,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

enum StepOutcome {
    Continue,
    Halted(String),
    Failed(FailureKind, String),
}

pub struct PipelineExecutor {
    workflows: Arc<dyn Repository<WorkflowDefinition>>,
    records: ExecutionRecords,
    tools: Arc<ToolRegistry>,
    clients: Arc<ClientRegistry>,
}

impl PipelineExecutor {
    pub fn new(
        workflows: Arc<dyn Repository<WorkflowDefinition>>,
        executions: Arc<dyn Repository<ExecutionRecord>>,
        tools: Arc<ToolRegistry>,
        clients: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            workflows,
            records: ExecutionRecords::new(executions),
            tools,
            clients,
        }
    }

    pub fn records(&self) -> &ExecutionRecords {
        &self.records
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Load a workflow and check that every enabled step can run.
    pub async fn validate(&self, workflow_id: &str) -> Result<WorkflowDefinition> {
        let workflow = self
            .workflows
            .get(workflow_id)
            .await?
            .ok_or_else(|| FlowError::WorkflowNotFound(workflow_id.to_string()))?;
        if !workflow.enabled {
            return Err(FlowError::Config(format!("workflow '{}' is disabled", workflow.name)));
        }

        let steps = workflow.ordered_steps()?;
        let mut runnable = 0;
        for step in steps.into_iter().filter(|s| s.enabled) {
            runnable += 1;
            if let Some(call) = &step.tool
                && !self.tools.has_tool(&call.name)
            {
                return Err(FlowError::Config(format!(
                    "step '{}' uses unknown tool '{}'",
                    step.name, call.name
                )));
            }
            if !step.model_ref.is_empty() {
                self.clients.get(&step.model_ref)?;
            } else if step.tool.is_none() {
                return Err(FlowError::Config(format!(
                    "step '{}' has neither a model nor a tool",
                    step.name
                )));
            }
        }
        if runnable == 0 {
            return Err(FlowError::Config(format!(
                "workflow '{}' has no enabled steps",
                workflow.name
            )));
        }
        Ok(workflow)
    }

    /// Run a workflow to a terminal record.
    ///
    /// Returns `Err` only for configuration failures found before the record
    /// exists, or when the record store itself fails.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<PipelineOutcome> {
        let workflow = self.validate(&request.workflow_id).await?;
        let execution_id = request.execution_id.clone().unwrap_or_else(new_id);
        let mut record = self
            .records
            .start(&execution_id, &workflow.id, &request.input)
            .await?;
        tracing::info!("▶️ Workflow '{}' started (execution {})", workflow.name, execution_id);

        let mut scope = Scope::seeded(&request.input);
        for step in workflow.ordered_steps()? {
            if !step.enabled {
                tracing::debug!("⏭️ Step '{}' disabled, skipped", step.name);
                continue;
            }
            let outcome = if cancel.is_cancelled() {
                StepOutcome::Failed(FailureKind::Cancelled, "cancelled before step".into())
            } else {
                self.run_step(step, &mut scope, &cancel).await
            };
            match outcome {
                StepOutcome::Continue => {}
                StepOutcome::Halted(message) => {
                    tracing::warn!("🛑 Step '{}' halted workflow '{}': {}", step.name, workflow.name, message);
                    return self.fail(record, scope, FailureKind::Halted, message).await;
                }
                StepOutcome::Failed(kind, message) => {
                    tracing::error!("❌ Step '{}' of workflow '{}' failed: {}", step.name, workflow.name, message);
                    return self.fail(record, scope, kind, message).await;
                }
            }
        }

        let output = scope.to_output();
        self.records.complete(&mut record, output.clone()).await?;
        tracing::info!("✅ Workflow '{}' completed (execution {})", workflow.name, execution_id);
        Ok(PipelineOutcome {
            execution_id,
            status: ExecutionStatus::Completed,
            output,
            error: None,
            failure: None,
        })
    }

    async fn fail(
        &self,
        mut record: ExecutionRecord,
        scope: Scope,
        kind: FailureKind,
        message: String,
    ) -> Result<PipelineOutcome> {
        let output = scope.to_output();
        self.records.fail(&mut record, &message, Some(output.clone())).await?;
        Ok(PipelineOutcome {
            execution_id: record.id,
            status: ExecutionStatus::Failed,
            output,
            error: Some(message),
            failure: Some(kind),
        })
    }

    async fn run_step(
        &self,
        step: &StepDefinition,
        scope: &mut Scope,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let Some(input) = scope.resolve_input(&step.input_variable).cloned() else {
            return StepOutcome::Failed(
                FailureKind::Configuration,
                format!("step '{}' reads undefined variable '{}'", step.name, step.input_variable),
            );
        };
        let mut vars = template::context(scope);
        let mut result = input;

        if let Some(call) = &step.tool {
            let params = template::render_value(&call.parameters, &vars);
            let Some(tool_result) =
                cancellable(cancel, self.tools.execute_result(&call.name, &params.to_string())).await
            else {
                return StepOutcome::Failed(
                    FailureKind::Cancelled,
                    format!("cancelled during tool '{}'", call.name),
                );
            };
            match tool_result.verdict() {
                ToolVerdict::Proceed(data) => {
                    vars.insert("tool_result".into(), data.clone());
                    result = data;
                }
                ToolVerdict::Halt(message) => {
                    let raised = tool_result
                        .metadata
                        .get(EXCEPTION_FLAG)
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    return if raised {
                        StepOutcome::Failed(FailureKind::Error, message)
                    } else {
                        StepOutcome::Halted(message)
                    };
                }
            }
        }

        if !step.model_ref.is_empty() {
            let client = match self.clients.get(&step.model_ref) {
                Ok(client) => client,
                Err(e) => return StepOutcome::Failed(FailureKind::Configuration, e.to_string()),
            };
            let system_prompt = template::render(&step.system_prompt, &vars);
            let message = user_message(step, &result, &vars);
            let reply = if step.stream {
                let request = ChatRequest::with_system(&system_prompt, &message, step.json_output);
                stream_reply(client, request, cancel).await
            } else {
                cancellable(cancel, client.chat_with_system(&system_prompt, &message, step.json_output))
                    .await
                    .unwrap_or_else(|| Err(FlowError::Cancelled(format!("model '{}'", step.model_ref))))
            };
            result = match reply {
                Ok(text) if step.json_output => {
                    serde_json::from_str(&text).unwrap_or(Value::String(text))
                }
                Ok(text) => Value::String(text),
                Err(e @ FlowError::Cancelled(_)) => {
                    return StepOutcome::Failed(FailureKind::Cancelled, e.to_string());
                }
                Err(e) if e.is_configuration() => {
                    return StepOutcome::Failed(FailureKind::Configuration, e.to_string());
                }
                Err(e) => {
                    return StepOutcome::Failed(
                        FailureKind::Error,
                        format!("model '{}' failed: {e}", step.model_ref),
                    );
                }
            };
        }

        scope.set(&step.output_variable, result);
        StepOutcome::Continue
    }
}

/// The user message for a model step: the rendered `user_prompt`, or the
/// step input as text. A prompt without placeholders gets the named input
/// variable appended.
fn user_message(step: &StepDefinition, input: &Value, vars: &serde_json::Map<String, Value>) -> String {
    if step.user_prompt.trim().is_empty() {
        return template::value_to_text(input);
    }
    let rendered = template::render(&step.user_prompt, vars);
    if step.input_variable.is_empty() || template::has_variables(&step.user_prompt) {
        return rendered;
    }
    format!(
        "{rendered}\n\n{}: {}",
        step.input_variable,
        template::value_to_text(input)
    )
}

/// Accumulate a streamed reply. Tokens only append to the buffer; the text
/// is read once the terminal callback arrives.
async fn stream_reply(
    client: Arc<dyn AiClient>,
    request: ChatRequest,
    cancel: &CancellationToken,
) -> Result<String> {
    let buffer = Arc::new(Mutex::new(String::new()));
    let sink = buffer.clone();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Result<()>>();
    let fail_tx = done_tx.clone();

    let callbacks = StreamCallbacks::new(
        move |token| {
            if let Ok(mut text) = sink.lock() {
                text.push_str(&token);
            }
        },
        move || {
            let _ = done_tx.send(Ok(()));
        },
        move |e| {
            let _ = fail_tx.send(Err(e));
        },
    );
    let handle = spawn_stream_chat(client, request, callbacks);

    let terminal = tokio::select! {
        _ = cancel.cancelled() => {
            handle.abort();
            return Err(FlowError::Cancelled("stream aborted".into()));
        }
        terminal = done_rx.recv() => terminal,
    };
    match terminal {
        Some(Ok(())) => Ok(buffer.lock().map(|text| text.clone()).unwrap_or_default()),
        Some(Err(e)) => Err(e),
        None => Err(FlowError::Provider("stream ended without a terminal event".into())),
    }
}

/// Race a future against cancellation. `None` means cancelled.
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}
