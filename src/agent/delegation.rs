//! Delegated execution: `spawn` (background) and `subagent` (blocking).
//!
//! Both modes run the shared [`ToolLoop`] with a registry that has the
//! delegation tools removed, so a delegated loop can never delegate again.
//! Background results never touch a session directly: they re-enter the bus
//! as a `system` message for the originating conversation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::config::DelegationConfig;
use crate::error::{RelayError, Result};
use crate::providers::{ChatOptions, LLMProvider, ProviderSlot};
use crate::security::SecurityPolicy;
use crate::session::Message;
use crate::tools::{CompletionSink, DispatchContext, ToolRegistry};

use super::tool_loop::{LoopContext, Terminal, ToolLoop};

/// Tool names removed from every delegated registry.
pub const DELEGATION_TOOLS: &[&str] = &["spawn", "subagent"];

/// Nesting depth of every delegated loop.
const DELEGATION_DEPTH: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationKind {
    Spawn,
    Subagent,
}

/// A delegated loop that has not terminated yet.
#[derive(Debug, Clone)]
pub struct DelegatedTask {
    pub id: String,
    pub kind: DelegationKind,
    /// Session key of the conversation that delegated, when known.
    pub origin: Option<String>,
    pub instructions: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

/// Terminal state of a subagent run.
#[derive(Debug, Clone, PartialEq)]
pub struct SubagentReport {
    pub content: String,
    pub terminal: Terminal,
    pub iterations: u32,
}

/// Runs delegated tool loops with an isolated registry.
pub struct DelegationManager {
    provider: ProviderSlot,
    tools: Arc<ToolRegistry>,
    config: DelegationConfig,
    policy: Arc<SecurityPolicy>,
    model: Option<String>,
    options: ChatOptions,
    workspace: Option<PathBuf>,
    permits: Arc<Semaphore>,
    tasks: Mutex<HashMap<String, DelegatedTask>>,
    shutdown: CancellationToken,
}

impl DelegationManager {
    /// Create a manager whose loops use `registry` minus the delegation tools.
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        registry: &ToolRegistry,
        config: DelegationConfig,
        policy: Arc<SecurityPolicy>,
    ) -> Self {
        Self::with_provider_slot(ProviderSlot::with(provider), registry, config, policy)
    }

    /// Like [`new`](Self::new), but every delegated loop reads the provider
    /// from `provider` when it starts.
    pub fn with_provider_slot(
        provider: ProviderSlot,
        registry: &ToolRegistry,
        config: DelegationConfig,
        policy: Arc<SecurityPolicy>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            provider,
            tools: Arc::new(registry.isolated(DELEGATION_TOOLS)),
            model: config.model.clone(),
            config,
            policy,
            options: ChatOptions::new(),
            workspace: None,
            permits,
            tasks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Model used when the configuration has no delegation override.
    pub fn with_default_model(mut self, model: &str) -> Self {
        if self.model.is_none() {
            self.model = Some(model.to_string());
        }
        self
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    /// Cancel every background task, running or started later. Each still
    /// publishes its failure completion.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    /// The registry delegated loops see.
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub async fn active_tasks(&self) -> Vec<DelegatedTask> {
        self.tasks.lock().await.values().cloned().collect()
    }

    pub async fn active_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Run a subagent to a terminal state and return its report.
    pub async fn run_subagent(
        &self,
        instructions: &str,
        origin: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<SubagentReport> {
        let task = self
            .register(DelegationKind::Subagent, instructions, "subagent", origin)
            .await;
        let result = self.execute(&task, cancel).await;
        self.tasks.lock().await.remove(&task.id);
        result
    }

    /// Start a background task and return its id immediately.
    ///
    /// Exactly one completion is published through `sink` when the task
    /// terminates, whether it succeeded, failed or hit the iteration limit.
    pub async fn spawn(
        self: &Arc<Self>,
        instructions: &str,
        label: &str,
        sink: CompletionSink,
    ) -> Result<String> {
        self.policy.check_delegation(DELEGATION_DEPTH)?;
        let task = self
            .register(
                DelegationKind::Spawn,
                instructions,
                label,
                Some(sink.origin_key()),
            )
            .await;
        let task_id = task.id.clone();
        let manager = Arc::clone(self);
        let span = info_span!("spawn", task_id = %task.id, origin = %sink.origin_key());

        tokio::spawn(
            async move {
                let cancel = manager.shutdown.child_token();
                let result = manager.execute(&task, &cancel).await;
                manager.tasks.lock().await.remove(&task.id);

                let content = match result {
                    Ok(report) => {
                        info!(terminal = %report.terminal, iterations = report.iterations, "Background task finished");
                        format!(
                            "[Background task '{}' finished: {}]\n\n{}",
                            task.label, report.terminal, report.content
                        )
                    }
                    Err(e) => {
                        error!(error = %e, "Background task failed");
                        format!(
                            "[Background task '{}' failed]\n\n{}",
                            task.label,
                            e.model_safe_message()
                        )
                    }
                };

                let metadata = HashMap::from([
                    ("task_id".to_string(), task.id.clone()),
                    ("label".to_string(), task.label.clone()),
                ]);
                if let Err(e) = sink
                    .complete(&format!("spawn:{}", task.id), &content, metadata)
                    .await
                {
                    error!(error = %e, "Failed to publish background task completion");
                }
            }
            .instrument(span),
        );

        Ok(task_id)
    }

    async fn register(
        &self,
        kind: DelegationKind,
        instructions: &str,
        label: &str,
        origin: Option<&str>,
    ) -> DelegatedTask {
        let task = DelegatedTask {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            kind,
            origin: origin.map(str::to_string),
            instructions: instructions.to_string(),
            label: label.to_string(),
            created_at: Utc::now(),
        };
        self.tasks.lock().await.insert(task.id.clone(), task.clone());
        task
    }

    async fn execute(&self, task: &DelegatedTask, cancel: &CancellationToken) -> Result<SubagentReport> {
        self.policy.check_delegation(DELEGATION_DEPTH)?;
        let provider = self.provider.get().await?;

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RelayError::Cancelled("delegated task cancelled while queued".to_string()));
            }
            permit = self.permits.acquire() => permit
                .map_err(|_| RelayError::Cancelled("delegation is shut down".to_string()))?,
        };

        let mut tool_loop = ToolLoop::new(
            provider,
            Arc::clone(&self.tools),
            self.config.max_iterations,
        )
        .with_options(self.options.clone());
        if let Some(ref model) = self.model {
            tool_loop = tool_loop.with_model(model.clone());
        }

        let mut dispatch = DispatchContext::new().with_cancel(cancel.clone());
        if let Some(ref workspace) = self.workspace {
            dispatch = dispatch.with_workspace(workspace.clone());
        }
        if let Some((channel, chat_id)) = task.origin.as_deref().and_then(|o| o.split_once(':')) {
            dispatch = dispatch.with_channel(channel, chat_id);
        }

        let base = [Message::system(&self.config.system_prompt)];
        let mut turn = vec![Message::user(&task.instructions)];
        let outcome = tool_loop
            .run(&base, &mut turn, &LoopContext::new(dispatch))
            .await?;

        Ok(SubagentReport {
            content: outcome.content,
            terminal: outcome.terminal,
            iterations: outcome.iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MessageBus, SYSTEM_CHANNEL};
    use crate::providers::{LLMResponse, LLMToolCall, ToolDefinition};
    use crate::tools::EchoTool;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Requests one echo call, then answers with the tool names it was offered.
    struct ListingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LLMProvider for ListingProvider {
        async fn chat(
            &self,
            _messages: Vec<Message>,
            tools: Vec<ToolDefinition>,
            _model: Option<&str>,
            _options: ChatOptions,
        ) -> Result<LLMResponse> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(LLMResponse::with_tools(
                    "",
                    vec![LLMToolCall::new("e1", "echo", r#"{"message":"ping"}"#)],
                ));
            }
            let names: Vec<String> = tools.into_iter().map(|t| t.name).collect();
            Ok(LLMResponse::text(&format!("tools: {}", names.join(","))))
        }

        fn default_model(&self) -> &str {
            "lister"
        }

        fn name(&self) -> &str {
            "lister"
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl LLMProvider for FailingProvider {
        async fn chat(
            &self,
            _messages: Vec<Message>,
            _tools: Vec<ToolDefinition>,
            _model: Option<&str>,
            _options: ChatOptions,
        ) -> Result<LLMResponse> {
            Err(RelayError::Provider("secret upstream detail".to_string()))
        }

        fn default_model(&self) -> &str {
            "failing"
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    struct NamedStub(&'static str);

    #[async_trait]
    impl crate::tools::Tool for NamedStub {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "stub"
        }

        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }

        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &crate::tools::ToolContext,
        ) -> Result<crate::tools::ToolResult> {
            Ok(crate::tools::ToolResult::llm_only("stub"))
        }
    }

    fn registry_with_delegation() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        registry.register(Arc::new(NamedStub("spawn"))).unwrap();
        registry.register(Arc::new(NamedStub("subagent"))).unwrap();
        registry
    }

    fn manager(provider: Arc<dyn LLMProvider>) -> DelegationManager {
        DelegationManager::new(
            provider,
            &registry_with_delegation(),
            DelegationConfig::default(),
            Arc::new(SecurityPolicy::default()),
        )
    }

    #[test]
    fn test_isolated_registry_has_no_delegation_tools() {
        let manager = manager(Arc::new(FailingProvider));
        assert!(manager.tools().has("echo"));
        assert!(!manager.tools().has("spawn"));
        assert!(!manager.tools().has("subagent"));
    }

    #[tokio::test]
    async fn test_subagent_runs_nested_loop() {
        let manager = manager(Arc::new(ListingProvider {
            calls: AtomicUsize::new(0),
        }));
        let report = manager
            .run_subagent("check things", Some("telegram:1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.terminal, Terminal::Done);
        assert_eq!(report.iterations, 1);
        assert_eq!(report.content, "tools: echo");
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_subagent_cancelled() {
        let manager = manager(Arc::new(FailingProvider));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = manager
            .run_subagent("anything", None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_spawn_publishes_one_completion() {
        let manager = Arc::new(manager(Arc::new(ListingProvider {
            calls: AtomicUsize::new(0),
        })));
        let bus = MessageBus::new();
        let sink = CompletionSink::new(bus.clone(), "telegram:42");

        let task_id = manager.spawn("research", "research", sink).await.unwrap();
        assert_eq!(task_id.len(), 8);

        let msg = bus.consume_inbound().await.unwrap();
        assert_eq!(msg.channel, SYSTEM_CHANNEL);
        assert_eq!(msg.chat_id, "telegram:42");
        assert_eq!(msg.sender_id, format!("spawn:{}", task_id));
        assert_eq!(msg.metadata.get("task_id"), Some(&task_id));
        assert_eq!(msg.metadata.get("label").map(String::as_str), Some("research"));
        assert!(msg.content.contains("finished: done"));
        assert!(msg.content.contains("tools: echo"));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(bus.pending_inbound(), 0);
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_sanitized() {
        let manager = Arc::new(manager(Arc::new(FailingProvider)));
        let bus = MessageBus::new();
        let sink = CompletionSink::new(bus.clone(), "slack:C1");

        manager.spawn("do it", "job", sink).await.unwrap();
        let msg = bus.consume_inbound().await.unwrap();
        assert!(msg.content.starts_with("[Background task 'job' failed]"));
        assert!(!msg.content.contains("secret upstream detail"));
    }

    #[tokio::test]
    async fn test_cancel_all_still_publishes_completion() {
        let manager = Arc::new(manager(Arc::new(ListingProvider {
            calls: AtomicUsize::new(0),
        })));
        manager.cancel_all();
        let bus = MessageBus::new();
        let sink = CompletionSink::new(bus.clone(), "telegram:7");

        manager.spawn("slow work", "slow", sink).await.unwrap();
        let msg = bus.consume_inbound().await.unwrap();
        assert!(msg.content.starts_with("[Background task 'slow' failed]"));
    }
}
