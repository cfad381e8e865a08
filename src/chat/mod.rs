//! Conversation turns: orchestration, prompt assembly and send limits,
//! plus retrieval-grounded message drafting

pub mod grounded;
pub mod orchestrator;
pub mod prompt;
pub mod rate_limiter;

pub use grounded::{GroundedDraft, GroundedGenerator, GroundedRequest, GroundingConfig};
pub use orchestrator::{
    OrchestratorConfig, SendMessageRequest, TurnEvent, TurnOrchestrator, TurnPair, TurnStream,
};
pub use prompt::{
    assemble_prompt, build_system_prompt, ActivitySummary, BusinessContext, BusinessContextSource,
    ContactSummary, NoBusinessContext,
};
pub use rate_limiter::RateLimiter;
