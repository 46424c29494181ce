//! C7: Agent Run — budget tracking, context compaction, and the turn-loop
//! orchestrator that drives an LLM through tool-calling rounds.

pub mod budget;
pub mod compaction;
pub mod orchestrator;

pub use orchestrator::{
    AgentProfile, AgentRun, AgentRunError, AgentRunOutcome, CancellationToken, RunRequest,
};
