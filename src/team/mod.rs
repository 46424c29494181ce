//! C9/C10: team workspaces — shared memory (tasks, facts, documents, the
//! inter-agent mailbox) and persistent-agent lifecycle/heartbeats.

pub mod manager;
pub mod memory;

pub use manager::{derive_agent_id, parse_mentions, TeamManager, TeamManagerError};
pub use memory::{TeamMemory, TeamMemoryError};
