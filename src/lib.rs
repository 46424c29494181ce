//! DevClaw: the channel-agnostic core of a multi-channel chatbot/agent
//! runtime.
//!
//! This crate owns identity normalization, authorization, pairing,
//! tool-calling, model failover, session history, the agent turn loop,
//! persistent team workspaces, scheduling, notifications, and metrics.
//! Concrete channel transports (Telegram, Slack, WhatsApp, a webhook
//! listener) and concrete LLM wire clients beyond the bundled Anthropic/
//! Ollama reference providers are external collaborators, plugged in at
//! the composition root through the [`channel::ChannelSink`] and
//! [`providers::LlmProvider`] seams.

pub mod access;
pub mod agent;
pub mod agent_router;
pub mod audit;
pub mod channel;
pub mod config;
pub mod credentials;
pub mod db;
pub mod failover;
pub mod group_policy;
pub mod hooks;
pub mod jid;
pub mod logging;
pub mod memory_indexer;
pub mod metrics;
pub mod notification;
pub mod pairing;
pub mod providers;
pub mod scheduler;
pub mod session;
pub mod team;
pub mod tools;
pub mod types;
