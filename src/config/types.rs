//! Configuration type definitions for RelayClaw
//!
//! Every section derives serde with `#[serde(default)]`, so a partial JSON
//! document fills the rest from the `Default` impls below.

use serde::{Deserialize, Serialize};

use crate::bus::{OverflowPolicy, DEFAULT_BUFFER_SIZE};

/// Main configuration struct for RelayClaw
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Agent configuration (model, tokens, iterations, workers)
    pub agents: AgentConfig,
    /// Inbound/outbound queue sizing and overflow behaviour
    pub bus: BusConfig,
    /// History summarization thresholds
    pub summarization: SummarizationConfig,
    /// Spawn / subagent delegation
    pub delegation: DelegationConfig,
    /// Workspace containment and exec deny rules
    pub security: SecurityConfig,
    pub skills: SkillsConfig,
    pub memory: MemoryConfig,
    pub heartbeat: HeartbeatConfig,
    /// Retry behaviour for provider calls
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

// ============================================================================
// Agent Configuration
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Default agent settings
    pub defaults: AgentDefaults,
}

/// Default agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDefaults {
    /// Name the agent introduces itself with
    pub name: String,
    /// Workspace directory path
    pub workspace: String,
    /// Model passed to the provider
    pub model: String,
    /// Maximum tokens for responses
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Maximum tool-execution rounds per turn
    pub max_tool_iterations: u32,
    /// Wall-clock limit (seconds) for a single turn
    pub agent_timeout_secs: u64,
    /// Model context window in tokens, used for summarization thresholds
    pub context_window: usize,
    /// Number of sharded workers consuming the inbound queue
    pub workers: usize,
    /// Extra attempts when saving a session fails
    pub persist_retries: u32,
    /// When to skip the final reply after the message tool already delivered
    pub reply_suppression: ReplySuppression,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            name: "RelayClaw".to_string(),
            workspace: "~/.relayclaw/workspace".to_string(),
            model: "claude-sonnet-4-5-20250929".to_string(),
            max_tokens: 8192,
            temperature: 0.7,
            max_tool_iterations: 20,
            agent_timeout_secs: 300,
            context_window: 128_000,
            workers: 1,
            persist_retries: 2,
            reply_suppression: ReplySuppression::default(),
        }
    }
}

/// Outbound reply handling when the `message` tool already delivered content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySuppression {
    /// Skip the reply whenever anything was delivered directly.
    Always,
    /// Skip the reply only if it is empty or repeats delivered content.
    #[default]
    WhenDuplicate,
    /// Always send the reply.
    Never,
}

// ============================================================================
// Bus Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub inbound_overflow: OverflowPolicy,
    pub outbound_overflow: OverflowPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: DEFAULT_BUFFER_SIZE,
            outbound_capacity: DEFAULT_BUFFER_SIZE,
            inbound_overflow: OverflowPolicy::Block,
            outbound_overflow: OverflowPolicy::Block,
        }
    }
}

// ============================================================================
// Summarization Configuration
// ============================================================================

/// History summarization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizationConfig {
    pub enabled: bool,
    /// Summarize once history holds more than this many messages.
    pub message_threshold: usize,
    /// Fraction of the context window that triggers summarization.
    pub token_ratio: f64,
    /// Messages kept verbatim after summarizing.
    pub keep_recent: usize,
    /// Fraction of the context window above which a single message is left
    /// out of the summarizer input.
    pub oversized_ratio: f64,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            message_threshold: 20,
            token_ratio: 0.75,
            keep_recent: 4,
            oversized_ratio: 0.5,
        }
    }
}

// ============================================================================
// Delegation Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    /// Whether `spawn` and `subagent` are registered.
    pub enabled: bool,
    /// Tool rounds allowed in a delegated loop
    pub max_iterations: u32,
    /// Delegated loops allowed to run at once
    pub max_concurrent: usize,
    /// Model override for delegated loops
    pub model: Option<String>,
    /// System prompt for delegated loops
    pub system_prompt: String,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: 10,
            max_concurrent: 3,
            model: None,
            system_prompt: "You are a focused sub-agent. Complete the task you are given \
                            using the available tools, then reply with a concise report \
                            of what you did and what you found."
                .to_string(),
        }
    }
}

// ============================================================================
// Security Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Confine filesystem and exec tools to the workspace.
    pub restrict_to_workspace: bool,
    /// Extra regex patterns denied for the exec tool.
    pub deny_patterns: Vec<String>,
    /// Default exec timeout in seconds
    pub exec_timeout_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            restrict_to_workspace: true,
            deny_patterns: Vec::new(),
            exec_timeout_secs: 60,
        }
    }
}

// ============================================================================
// Skills Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillsConfig {
    pub enabled: bool,
    /// Override for the workspace skills directory (default: `<workspace>/skills`)
    pub workspace_dir: Option<String>,
    /// Directory with bundled skills, if any
    pub builtin_dir: Option<String>,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workspace_dir: None,
            builtin_dir: None,
        }
    }
}

// ============================================================================
// Memory Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// How many dated notes go into the prompt
    pub recent_notes: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { recent_notes: 3 }
    }
}

// ============================================================================
// Heartbeat Configuration
// ============================================================================

/// Heartbeat poller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Seconds between ticks
    pub interval_secs: u64,
    /// Heartbeat file override (default: `<workspace>/HEARTBEAT.md`)
    pub file_path: Option<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 30 * 60,
            file_path: None,
        }
    }
}

// ============================================================================
// Retry Configuration
// ============================================================================

/// Retry behavior for provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Cap in milliseconds for exponential backoff.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

// ============================================================================
// Logging Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    #[default]
    Component,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Append logs to this file instead of stderr
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Component,
            level: "info".to_string(),
            file: None,
        }
    }
}
