//! Workflow definitions — an ordered pipeline of steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FlowError, Result};
use crate::traits::repository::Entity;

/// A named, ordered pipeline of steps executed as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Owned by the workflow; steps have no lifecycle of their own.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    pub created_at: DateTime<Utc>,
}

/// One unit of work inside a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique and strictly increasing within a workflow.
    pub order: u32,
    #[serde(default)]
    pub name: String,
    /// Client name in the client registry. Empty means no model call.
    #[serde(default)]
    pub model_ref: String,
    #[serde(default)]
    pub system_prompt: String,
    /// When empty, the step input rendered as text is sent instead.
    #[serde(default)]
    pub user_prompt: String,
    /// Scope key to read. Empty means the trigger input.
    #[serde(default)]
    pub input_variable: String,
    /// Scope key to write. Empty means the result is discarded.
    #[serde(default)]
    pub output_variable: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tool: Option<ToolCall>,
    #[serde(default)]
    pub json_output: bool,
    #[serde(default)]
    pub stream: bool,
}

/// Tool reference with its parameter template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub parameters: Value,
}

fn bool_true() -> bool {
    true
}

impl WorkflowDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            id: super::new_id(),
            name: name.to_string(),
            description: String::new(),
            enabled: true,
            steps: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Steps sorted by order. Duplicate orders are a configuration error.
    pub fn ordered_steps(&self) -> Result<Vec<&StepDefinition>> {
        let mut steps: Vec<&StepDefinition> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.order);
        if let Some(pair) = steps.windows(2).find(|w| w[0].order == w[1].order) {
            return Err(FlowError::Config(format!(
                "workflow '{}' has duplicate step order {}",
                self.name, pair[0].order
            )));
        }
        Ok(steps)
    }
}

impl StepDefinition {
    fn blank(order: u32, name: &str) -> Self {
        Self {
            order,
            name: name.to_string(),
            model_ref: String::new(),
            system_prompt: String::new(),
            user_prompt: String::new(),
            input_variable: String::new(),
            output_variable: String::new(),
            enabled: true,
            tool: None,
            json_output: false,
            stream: false,
        }
    }

    /// A step that asks a model.
    pub fn chat(order: u32, name: &str, model_ref: &str, system_prompt: &str) -> Self {
        Self {
            model_ref: model_ref.to_string(),
            system_prompt: system_prompt.to_string(),
            ..Self::blank(order, name)
        }
    }

    /// A step that calls a tool.
    pub fn tool(order: u32, name: &str, tool_name: &str, parameters: Value) -> Self {
        Self {
            tool: Some(ToolCall { name: tool_name.to_string(), parameters }),
            ..Self::blank(order, name)
        }
    }

    pub fn reads(mut self, variable: &str) -> Self {
        self.input_variable = variable.to_string();
        self
    }

    pub fn writes(mut self, variable: &str) -> Self {
        self.output_variable = variable.to_string();
        self
    }

    pub fn with_model(mut self, model_ref: &str, system_prompt: &str) -> Self {
        self.model_ref = model_ref.to_string();
        self.system_prompt = system_prompt.to_string();
        self
    }

    pub fn with_user_prompt(mut self, user_prompt: &str) -> Self {
        self.user_prompt = user_prompt.to_string();
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub enabled: Option<bool>,
}

impl Entity for WorkflowDefinition {
    type Filter = WorkflowFilter;
    const KIND: &'static str = "workflow";

    fn id(&self) -> &str {
        &self.id
    }

    fn matches(&self, filter: &WorkflowFilter) -> bool {
        filter.enabled.is_none_or(|e| e == self.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ordered_steps_sorts() {
        let wf = WorkflowDefinition::new("wf")
            .with_step(StepDefinition::chat(20, "b", "m", ""))
            .with_step(StepDefinition::tool(10, "a", "lookup", json!({})));
        let names: Vec<_> = wf.ordered_steps().unwrap().iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_duplicate_order_rejected() {
        let wf = WorkflowDefinition::new("wf")
            .with_step(StepDefinition::chat(1, "a", "m", ""))
            .with_step(StepDefinition::chat(1, "b", "m", ""));
        assert!(matches!(wf.ordered_steps(), Err(FlowError::Config(_))));
    }

    #[test]
    fn test_step_defaults_when_deserialized() {
        let step: StepDefinition = serde_json::from_value(json!({"order": 1})).unwrap();
        assert!(step.enabled);
        assert!(step.tool.is_none());
        assert!(step.output_variable.is_empty());
    }
}
