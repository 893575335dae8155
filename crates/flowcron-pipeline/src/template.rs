//! `{{ variable }}` templates for prompts and tool parameters.
//!
//! Placeholders resolve against the run scope overlaid on a set of system
//! variables (`current_date`, `current_weekday`, ...). Dotted paths reach
//! into objects and arrays: `{{ weather.days.0 }}`.
//! Unknown placeholders are left intact.

use std::sync::LazyLock;

use chrono::{Datelike, Local};
use regex::Regex;
use serde_json::{Map, Value};

use crate::scope::Scope;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^}]+)\}\}").expect("placeholder pattern is valid"));

/// Render every placeholder in `template` as text.
pub fn render(template: &str, vars: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| {
            let name = caps[1].trim();
            match lookup(vars, name) {
                Some(value) => value_to_text(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Render a JSON template recursively.
///
/// A string that is exactly one placeholder is replaced by the raw value,
/// so numbers, arrays and objects keep their type.
pub fn render_value(template: &Value, vars: &Map<String, Value>) -> Value {
    match template {
        Value::String(s) => {
            if let Some(name) = whole_placeholder(s)
                && let Some(value) = lookup(vars, name)
            {
                return value.clone();
            }
            Value::String(render(s, vars))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, vars)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), render_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Plain-text form of a value: strings unquoted, null empty, the rest as JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Date variables injected into every template. Never written to the scope.
pub fn system_variables() -> Map<String, Value> {
    let now = Local::now();
    let mut vars = Map::new();
    vars.insert("current_date".into(), Value::String(now.format("%Y-%m-%d").to_string()));
    vars.insert("current_time".into(), Value::String(now.format("%H:%M:%S").to_string()));
    vars.insert("current_year".into(), Value::String(now.year().to_string()));
    vars.insert("current_month".into(), Value::String(now.month().to_string()));
    vars.insert("current_day".into(), Value::String(now.day().to_string()));
    vars.insert("current_weekday".into(), Value::String(now.format("%A").to_string()));
    vars
}

/// System variables overlaid by the scope. Scope values win.
pub fn context(scope: &Scope) -> Map<String, Value> {
    let mut vars = system_variables();
    for (key, value) in scope.vars() {
        vars.insert(key.clone(), value.clone());
    }
    vars
}

pub fn has_variables(template: &str) -> bool {
    PLACEHOLDER.is_match(template)
}

/// Distinct placeholder names in order of first appearance.
pub fn extract_variable_names(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in PLACEHOLDER.captures_iter(template) {
        let name = caps[1].trim().to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

pub fn missing_variables(template: &str, vars: &Map<String, Value>) -> Vec<String> {
    extract_variable_names(template)
        .into_iter()
        .filter(|name| lookup(vars, name).is_none())
        .collect()
}

fn whole_placeholder(s: &str) -> Option<&str> {
    let caps = PLACEHOLDER.captures(s)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == s.len() {
        caps.get(1).map(|m| m.as_str().trim())
    } else {
        None
    }
}

fn lookup<'a>(vars: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = vars.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(fields) => fields.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
