//! # FlowCron Pipeline
//!
//! Runs one workflow invocation: seeds a [`Scope`] from the trigger input,
//! walks the enabled steps in order, calls tools and models, and moves the
//! execution record to exactly one terminal state.

pub mod executor;
pub mod records;
pub mod scope;
pub mod template;

pub use executor::{ExecutionRequest, FailureKind, PipelineExecutor, PipelineOutcome};
pub use records::ExecutionRecords;
pub use scope::Scope;
