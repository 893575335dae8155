//! # FlowCron Tools
//!
//! Name-indexed tool dispatch for workflow steps, plus built-in tools.
//! A tool call never raises: every problem comes back as a failure
//! `ToolExecutionResult` that halts the calling pipeline.

pub mod http_request;
pub mod registry;

pub use http_request::HttpRequestTool;
pub use registry::{ToolRegistry, validate_args};
