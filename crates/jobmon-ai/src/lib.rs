//! Chat-completion client and the business-unit classification policy built on it.

pub mod client;
pub mod policy;

pub use client::{
    degraded_reply, AiClient, AiConfig, ChatCompletionsBackend, ChatRequest, CompletionBackend,
    CompletionError, ResponseMode, DEFAULT_MAX_RETRIES,
};
pub use policy::{AgencyProfile, ClassificationPolicy};

pub const CRATE_NAME: &str = "jobmon-ai";
