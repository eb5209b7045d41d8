//! Agent module - the conversation engine
//!
//! The agent is responsible for:
//!
//! - Processing inbound messages from the bus, sharded by conversation
//! - Building the system prompt from identity, workspace files, skills and memory
//! - Running the model/tool iteration to a terminal state
//! - Delegating work to background tasks and blocking subagents
//! - Persisting and summarizing conversation sessions
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  MessageBus │────>│  AgentLoop  │────>│  ToolLoop   │──> LLMProvider
//! │  (inbound)  │     │  (workers)  │     │             │──> ToolRegistry
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │                   ▼                   ▼
//!        │            ┌─────────────┐     ┌─────────────┐
//!        │            │   Session   │     │ Delegation  │
//!        │            │   Manager   │     │   Manager   │
//!        │            └─────────────┘     └─────────────┘
//!        │                                       │
//!        └──────── system completions ───────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use relayclaw::agent::AgentLoop;
//! use relayclaw::bus::MessageBus;
//! use relayclaw::config::Config;
//! use relayclaw::session::SessionManager;
//!
//! async fn run_agent(provider: Arc<dyn relayclaw::providers::LLMProvider>) {
//!     let bus = Arc::new(MessageBus::new());
//!     let agent = AgentLoop::new(Config::default(), SessionManager::new_memory(), bus);
//!
//!     agent.set_provider(provider).await;
//!     agent.register_builtin_tools().await.unwrap();
//!
//!     agent.start().await.unwrap();
//! }
//! ```

mod context;
mod delegation;
mod r#loop;
pub mod summarize;
mod tool_loop;

pub use context::{
    trim_orphan_tool_results, ContextBuilder, ContextSources, Document, IdentityConfig,
    SessionView,
};
pub use delegation::{
    DelegatedTask, DelegationKind, DelegationManager, SubagentReport, DELEGATION_TOOLS,
};
pub use r#loop::{should_suppress, AgentLoop, TurnKind, TurnOutcome, PERSIST_FAILURE_NOTICE};
pub use summarize::{Summarizer, SummaryPolicy};
pub use tool_loop::{
    LoopContext, LoopOutcome, Terminal, ToolLoop, UserRoute, ITERATION_LIMIT_NOTICE,
};
