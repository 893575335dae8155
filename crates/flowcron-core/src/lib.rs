//! # FlowCron Core
//!
//! Shared vocabulary for every FlowCron crate: configuration, the error
//! type, domain types and the traits that tools, AI backends, repositories,
//! trigger evaluators and notification sinks implement.

pub mod config;
pub mod error;
pub mod store;
pub mod traits;
pub mod types;

pub use config::FlowCronConfig;
pub use error::{FlowError, Result};
