//! Trait seams between FlowCron components.

pub mod ai_client;
pub mod notify;
pub mod repository;
pub mod tool;
pub mod trigger;

pub use ai_client::{AiClient, StreamCallbacks, TokenStream, spawn_stream_chat};
pub use notify::{NotificationEvent, NotificationSink};
pub use repository::{Entity, Repository};
pub use tool::Tool;
pub use trigger::TriggerEvaluator;
