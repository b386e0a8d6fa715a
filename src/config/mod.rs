mod env_overrides;
mod loader;
pub mod schema;

pub use schema::{
    ApprovalConfig, Config, EngineConfig, FeedbackConfig, ObservabilityConfig, PolicyConfig,
};
