//! Agent loop implementation
//!
//! The conversation engine: consumes inbound messages from the bus, routes
//! each one to the system path (delegated-task completions) or the user path
//! (context building, the tool loop, persistence, summarization), and
//! publishes replies to the outbound queue.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::bus::{is_internal_channel, InboundMessage, MessageBus, OutboundMessage};
use crate::config::{Config, ReplySuppression};
use crate::error::{RelayError, Result};
use crate::heartbeat::is_heartbeat_ok;
use crate::providers::{ChatOptions, LLMProvider, ProviderSlot, RetryProvider};
use crate::security::SecurityPolicy;
use crate::session::{Message, Session, SessionManager};
use crate::skills::SkillsLoader;
use crate::state::StateWriter;
use crate::tools::filesystem::{ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::message::MessageTool;
use crate::tools::shell::ShellTool;
use crate::tools::spawn::SpawnTool;
use crate::tools::subagent::SubagentTool;
use crate::tools::{CompletionSink, DispatchContext, Tool, ToolRegistry};

use super::context::{ContextBuilder, ContextSources, IdentityConfig, SessionView};
use super::delegation::DelegationManager;
use super::summarize::{SummaryPolicy, Summarizer};
use super::tool_loop::{LoopContext, Terminal, ToolLoop, UserRoute};

/// Appended to a reply when the session could not be saved.
pub const PERSIST_FAILURE_NOTICE: &str =
    "(Note: this conversation could not be saved. Recent messages may be lost after a restart.)";

/// Prefix of the notice sent when a message could not be processed.
const FAILURE_NOTICE_PREFIX: &str = "Sorry, I couldn't process your message.";

/// Which path handled a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    User,
    System,
    /// A system message whose origin cannot receive replies.
    Dropped,
}

/// What a processed message produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub kind: TurnKind,
    /// Final assistant content (or the delivered completion on the system path).
    pub content: String,
    /// Reply to publish, if any.
    pub reply: Option<OutboundMessage>,
    /// `None` on the system path.
    pub terminal: Option<Terminal>,
    pub iterations: u32,
    /// Content the message tool delivered directly during the turn.
    pub delivered: Vec<String>,
    pub summarized: bool,
    pub persisted: bool,
}

impl TurnOutcome {
    fn dropped() -> Self {
        Self {
            kind: TurnKind::Dropped,
            content: String::new(),
            reply: None,
            terminal: None,
            iterations: 0,
            delivered: Vec::new(),
            summarized: false,
            persisted: false,
        }
    }
}

/// The main agent loop that processes messages and coordinates with LLM providers.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use relayclaw::agent::AgentLoop;
/// use relayclaw::bus::MessageBus;
/// use relayclaw::config::Config;
/// use relayclaw::session::SessionManager;
///
/// let config = Config::load()?;
/// let bus = Arc::new(MessageBus::from_config(&config.bus));
/// let agent = Arc::new(AgentLoop::new(config, SessionManager::new()?, bus));
///
/// agent.set_provider(Arc::new(my_provider)).await;
/// agent.register_builtin_tools().await?;
///
/// let runner = Arc::clone(&agent);
/// tokio::spawn(async move { runner.start().await });
/// // ...
/// agent.stop();
/// ```
pub struct AgentLoop {
    config: Config,
    session_manager: Arc<SessionManager>,
    bus: Arc<MessageBus>,
    /// Shared with delegated loops; cloned out per turn.
    provider: ProviderSlot,
    tools: RwLock<ToolRegistry>,
    identity: IdentityConfig,
    skills: Option<SkillsLoader>,
    summary_policy: SummaryPolicy,
    policy: Arc<SecurityPolicy>,
    state: Option<StateWriter>,
    delegation: RwLock<Option<Arc<DelegationManager>>>,
    running: AtomicBool,
    /// Replaced on every `stop()`, so the loop can be started again.
    shutdown: std::sync::Mutex<CancellationToken>,
    /// Serializes direct `process_message` calls for the same session.
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AgentLoop {
    /// Create a new agent loop.
    ///
    /// # Example
    /// ```rust
    /// use std::sync::Arc;
    /// use relayclaw::agent::AgentLoop;
    /// use relayclaw::bus::MessageBus;
    /// use relayclaw::config::Config;
    /// use relayclaw::session::SessionManager;
    ///
    /// let agent = AgentLoop::new(
    ///     Config::default(),
    ///     SessionManager::new_memory(),
    ///     Arc::new(MessageBus::new()),
    /// );
    /// assert!(!agent.is_running());
    /// ```
    pub fn new(config: Config, session_manager: SessionManager, bus: Arc<MessageBus>) -> Self {
        let summary_policy =
            SummaryPolicy::from_config(&config.summarization, config.agents.defaults.context_window);
        let identity = IdentityConfig::from_config(&config);
        let policy = SecurityPolicy::from_config(&config.security).unwrap_or_else(|e| {
            warn!(error = %e, "Invalid security config; using the restricted default");
            SecurityPolicy::default()
        });
        Self {
            session_manager: Arc::new(session_manager),
            bus,
            provider: ProviderSlot::new(),
            tools: RwLock::new(ToolRegistry::new()),
            identity,
            skills: None,
            summary_policy,
            policy: Arc::new(policy),
            state: None,
            delegation: RwLock::new(None),
            running: AtomicBool::new(false),
            shutdown: std::sync::Mutex::new(CancellationToken::new()),
            session_locks: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Record last-active channels through `writer`.
    pub fn with_state(mut self, writer: StateWriter) -> Self {
        self.state = Some(writer);
        self
    }

    pub fn with_skills(mut self, loader: SkillsLoader) -> Self {
        self.skills = Some(loader);
        self
    }

    pub fn with_identity(mut self, identity: IdentityConfig) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_security_policy(mut self, policy: SecurityPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Set the model backend, wrapped in [`RetryProvider`] when retries are enabled.
    pub async fn set_provider(&self, provider: Arc<dyn LLMProvider>) {
        let provider = RetryProvider::wrap(provider, &self.config.retry);
        info!(provider = provider.name(), "Provider configured");
        self.provider.set(provider).await;
    }

    /// Register a tool. Duplicate names are a configuration error.
    pub async fn register_tool(&self, tool: Arc<dyn Tool>) -> Result<()> {
        self.tools.write().await.register(tool)
    }

    /// Register the filesystem, exec and message tools, plus `spawn` and
    /// `subagent` when delegation is enabled.
    ///
    /// Delegated loops see the registry as it is at this point, minus the
    /// delegation tools, so register custom tools first. They read the
    /// provider when they start, so it may be set afterwards. On error the
    /// registry is left unchanged.
    pub async fn register_builtin_tools(&self) -> Result<()> {
        let workspace = self.config.workspace_path();
        let mut tools = self.tools.write().await;
        let mut staged = tools.clone();
        staged.register(Arc::new(ReadFileTool::new(Arc::clone(&self.policy))))?;
        staged.register(Arc::new(WriteFileTool::new(Arc::clone(&self.policy))))?;
        staged.register(Arc::new(ListDirTool::new(Arc::clone(&self.policy))))?;
        staged.register(Arc::new(ShellTool::new(Arc::clone(&self.policy))))?;
        staged.register(Arc::new(MessageTool::new((*self.bus).clone())))?;

        let mut delegation = None;
        if self.config.delegation.enabled {
            let manager = Arc::new(
                DelegationManager::with_provider_slot(
                    self.provider.clone(),
                    &staged,
                    self.config.delegation.clone(),
                    Arc::clone(&self.policy),
                )
                .with_default_model(&self.config.agents.defaults.model)
                .with_options(self.chat_options())
                .with_workspace(workspace),
            );
            staged.register(Arc::new(SpawnTool::new(Arc::clone(&manager))))?;
            staged.register(Arc::new(SubagentTool::new(Arc::clone(&manager))))?;
            delegation = Some(manager);
        }

        *tools = staged;
        if let Some(manager) = delegation {
            *self.delegation.write().await = Some(manager);
        }
        info!(tools = tools.len(), "Built-in tools registered");
        Ok(())
    }

    pub async fn tool_count(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn has_tool(&self, name: &str) -> bool {
        self.tools.read().await.has(name)
    }

    /// Cancel every running background task started through `spawn`.
    pub async fn cancel_background_tasks(&self) {
        if let Some(ref manager) = *self.delegation.read().await {
            manager.cancel_all();
        }
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.session_manager
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn provider(&self) -> Result<Arc<dyn LLMProvider>> {
        self.provider.get().await
    }

    /// Options for one turn, read from configuration.
    fn chat_options(&self) -> ChatOptions {
        let defaults = &self.config.agents.defaults;
        ChatOptions::new()
            .with_max_tokens(defaults.max_tokens)
            .with_temperature(defaults.temperature)
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn session_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Drop the lock for `key` once no turn holds or waits on it.
    async fn prune_session_lock(&self, key: &str) {
        let mut locks = self.session_locks.lock().await;
        if locks
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(key);
        }
    }

    /// Process a single inbound message and return what it produced.
    ///
    /// The reply is returned, not published; [`start`](Self::start) publishes it.
    pub async fn process_message(&self, msg: &InboundMessage) -> Result<TurnOutcome> {
        let cancel = self.shutdown_token();
        self.process_with_cancel(msg, &cancel).await
    }

    async fn process_with_cancel(
        &self,
        msg: &InboundMessage,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let result = if msg.channel == crate::bus::SYSTEM_CHANNEL {
            self.process_system(msg).await
        } else {
            self.process_user(msg, cancel).await
        };
        self.prune_session_lock(routing_key(msg)).await;
        result
    }

    /// Deliver a delegated-task completion to its origin conversation.
    async fn process_system(&self, msg: &InboundMessage) -> Result<TurnOutcome> {
        let Some((channel, chat_id)) = msg.chat_id.split_once(':') else {
            warn!(origin = %msg.chat_id, "System message without a routable origin");
            return Ok(TurnOutcome::dropped());
        };
        if is_internal_channel(channel) {
            info!(origin = %msg.chat_id, sender = %msg.sender_id, "Dropping completion for internal origin");
            return Ok(TurnOutcome::dropped());
        }

        let lock = self.session_lock(&msg.chat_id).await;
        let _guard = lock.lock().await;

        let mut session = self.session_manager.get_or_create(&msg.chat_id).await?;
        session.add_message(Message::assistant(&msg.content));
        let persisted = self.persist(&session).await.is_ok();

        let mut content = msg.content.clone();
        if !persisted {
            content = format!("{}\n\n{}", content, PERSIST_FAILURE_NOTICE);
        }
        let mut reply = OutboundMessage::new(channel, chat_id, &content);
        for key in ["task_id", "label"] {
            if let Some(value) = msg.metadata.get(key) {
                reply = reply.with_metadata(key, value);
            }
        }

        Ok(TurnOutcome {
            kind: TurnKind::System,
            content: msg.content.clone(),
            reply: Some(reply),
            terminal: None,
            iterations: 0,
            delivered: Vec::new(),
            summarized: false,
            persisted,
        })
    }

    async fn process_user(
        &self,
        msg: &InboundMessage,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        if let Some(ref writer) = self.state {
            if let Err(e) = writer.record_activity(&msg.channel, &msg.chat_id).await {
                warn!(error = %e, "Failed to record last active channel");
            }
        }

        let provider = self.provider().await?;
        let lock = self.session_lock(&msg.session_key).await;
        let _guard = lock.lock().await;

        let defaults = &self.config.agents.defaults;
        let options = self.chat_options();
        let workspace = self.config.workspace_path();
        let use_history = !msg.skips_history();

        let tools = Arc::new(self.tools.read().await.clone());
        let mut session = self.session_manager.get_or_create(&msg.session_key).await?;

        let sources = ContextSources::load(
            &workspace,
            self.skills.as_ref(),
            self.config.memory.recent_notes,
        );
        let view = SessionView {
            channel: &msg.channel,
            chat_id: &msg.chat_id,
            session_key: &msg.session_key,
            summary: session.summary.as_deref().filter(|_| use_history),
        };
        let system = ContextBuilder::new(self.identity.clone())
            .with_tools(tools.schemas())
            .build_system_message(&sources, &view, Utc::now());
        let history: &[Message] = if use_history { &session.messages } else { &[] };
        let base = ContextBuilder::build_messages(system, history, &msg.content);

        // Empty input is neither sent to the model nor stored.
        if !msg.content.is_empty() {
            session.add_message(Message::user(&msg.content));
            if let Err(e) = self.session_manager.save(&session).await {
                warn!(session = %session.key, error = %e, "Failed to save user message; retrying after the turn");
            }
        }

        let turn_cancel = cancel.child_token();
        let timeout = Duration::from_secs(defaults.agent_timeout_secs.max(1));
        let timer = {
            let token = turn_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        };

        let dispatch = DispatchContext::new()
            .with_channel(&msg.channel, &msg.chat_id)
            .with_workspace(workspace)
            .with_completion(CompletionSink::new((*self.bus).clone(), &msg.session_key))
            .with_cancel(turn_cancel.clone());
        let loop_ctx = LoopContext::new(dispatch).with_user_route(UserRoute::new(
            (*self.bus).clone(),
            &msg.channel,
            &msg.chat_id,
        ));
        let tool_loop = ToolLoop::new(Arc::clone(&provider), tools, defaults.max_tool_iterations)
            .with_model(defaults.model.clone())
            .with_options(options.clone());

        let mut turn = Vec::new();
        let result = tool_loop.run(&base, &mut turn, &loop_ctx).await;
        timer.abort();
        session.extend_messages(turn);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(pe) = self.persist(&session).await {
                    error!(session = %session.key, error = %pe, "Failed to save partial turn");
                }
                if e.is_cancellation() && !cancel.is_cancelled() && turn_cancel.is_cancelled() {
                    return Err(RelayError::Timeout(format!(
                        "turn exceeded {}s",
                        timeout.as_secs()
                    )));
                }
                return Err(e);
            }
        };

        let mut persisted = self.persist(&session).await.is_ok();

        let mut summarized = false;
        if self.summary_policy.should_summarize(&session.messages) {
            let summarizer = Summarizer::new(Arc::clone(&provider), self.summary_policy.clone())
                .with_model(defaults.model.clone())
                .with_options(options);
            match summarizer.summarize(&mut session).await {
                Ok(folded) => {
                    summarized = folded > 0;
                    if summarized {
                        persisted = self.persist(&session).await.is_ok() && persisted;
                    }
                }
                Err(e) => warn!(session = %session.key, error = %e, "Summarization failed; will retry next turn"),
            }
        }

        let reply = self.build_reply(msg, &outcome.content, &outcome.delivered, persisted);
        Ok(TurnOutcome {
            kind: TurnKind::User,
            content: outcome.content,
            reply,
            terminal: Some(outcome.terminal),
            iterations: outcome.iterations,
            delivered: outcome.delivered,
            summarized,
            persisted,
        })
    }

    fn build_reply(
        &self,
        msg: &InboundMessage,
        content: &str,
        delivered: &[String],
        persisted: bool,
    ) -> Option<OutboundMessage> {
        if msg.is_internal() {
            return None;
        }
        let heartbeat_idle =
            msg.metadata.get("heartbeat").map(String::as_str) == Some("true") && is_heartbeat_ok(content);
        let suppress = heartbeat_idle
            || should_suppress(self.config.agents.defaults.reply_suppression, content, delivered);
        let mut text = if suppress { String::new() } else { content.trim().to_string() };
        if !persisted {
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(PERSIST_FAILURE_NOTICE);
        }
        if text.is_empty() {
            debug!(suppressed = suppress, "No reply to send");
            return None;
        }
        Some(OutboundMessage::reply_to(msg, &text))
    }

    /// Save `session`, retrying `persist_retries` times.
    async fn persist(&self, session: &Session) -> Result<()> {
        let attempts = self.config.agents.defaults.persist_retries + 1;
        let mut attempt = 1;
        loop {
            match self.session_manager.save(session).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(session = %session.key, attempt, error = %e, "Session save failed; retrying");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(session = %session.key, attempts, error = %e, "Session save failed");
                    return Err(e);
                }
            }
        }
    }

    /// Start the agent loop (consuming from the message bus).
    ///
    /// Messages are sharded over `workers` by routing key, so one
    /// conversation is always handled in order by the same worker while
    /// different conversations proceed concurrently. Runs until
    /// [`stop`](Self::stop) is called or the inbound queue closes.
    ///
    /// # Errors
    /// Returns an error if the loop is already running.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RelayError::Config("Agent loop already running".into()));
        }
        let cancel = self.shutdown_token();
        let workers = self.config.agents.defaults.workers.max(1);
        info!(workers, "Starting agent loop");

        let mut senders = Vec::with_capacity(workers);
        let mut receivers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::channel::<InboundMessage>(self.config.bus.inbound_capacity.max(1));
            senders.push(tx);
            receivers.push(rx);
        }

        let dispatcher = {
            let cancel = cancel.clone();
            async move {
                loop {
                    let msg = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        msg = self.bus.consume_inbound() => msg,
                    };
                    let Some(msg) = msg else {
                        info!("Inbound channel closed");
                        break;
                    };
                    let shard = shard_for(routing_key(&msg), workers);
                    let permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        permit = senders[shard].reserve() => permit.ok(),
                    };
                    match permit {
                        Some(permit) => permit.send(msg),
                        None => {
                            self.requeue(msg);
                            break;
                        }
                    }
                }
            }
        };
        let shards = receivers
            .into_iter()
            .enumerate()
            .map(|(id, rx)| self.run_worker(id, rx, cancel.clone()));

        tokio::join!(dispatcher, join_all(shards));

        self.running.store(false, Ordering::SeqCst);
        info!("Agent loop stopped");
        Ok(())
    }

    async fn run_worker(
        &self,
        id: usize,
        mut rx: mpsc::Receiver<InboundMessage>,
        cancel: CancellationToken,
    ) {
        debug!(worker = id, "Worker started");
        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = rx.recv() => msg,
            };
            let Some(msg) = msg else { break };
            self.handle_inbound(msg, &cancel).await;
        }

        // Hand queued messages back to the bus so a restart picks them up.
        rx.close();
        while let Ok(msg) = rx.try_recv() {
            self.requeue(msg);
        }
        debug!(worker = id, "Worker stopped");
    }

    fn requeue(&self, msg: InboundMessage) {
        let session = msg.session_key.clone();
        if let Err(e) = self.bus.try_publish_inbound(msg) {
            warn!(session = %session, error = %e, "Dropped queued message on shutdown");
        }
    }

    async fn handle_inbound(&self, msg: InboundMessage, cancel: &CancellationToken) {
        let request_span = info_span!(
            "request",
            request_id = %uuid::Uuid::new_v4(),
            session_id = %msg.session_key,
            channel = %msg.channel,
            sender = %msg.sender_id,
        );
        async {
            info!("Processing message");
            let start = Instant::now();
            match self.process_with_cancel(&msg, cancel).await {
                Ok(outcome) => {
                    info!(
                        latency_ms = start.elapsed().as_millis() as u64,
                        iterations = outcome.iterations,
                        summarized = outcome.summarized,
                        replied = outcome.reply.is_some(),
                        "Request completed"
                    );
                    if let Some(reply) = outcome.reply {
                        if let Err(e) = self.bus.publish_outbound_until(reply, cancel).await {
                            error!(error = %e, "Failed to publish outbound message");
                        }
                    }
                }
                Err(e) => {
                    error!(latency_ms = start.elapsed().as_millis() as u64, error = %e, "Request failed");
                    if cancel.is_cancelled() || msg.is_internal() {
                        return;
                    }
                    let notice = OutboundMessage::reply_to(
                        &msg,
                        &format!("{} {}", FAILURE_NOTICE_PREFIX, e.model_safe_message()),
                    );
                    if let Err(e) = self.bus.publish_outbound_until(notice, cancel).await {
                        error!(error = %e, "Failed to publish failure notice");
                    }
                }
            }
        }
        .instrument(request_span)
        .await;
    }

    /// Stop the agent loop.
    ///
    /// In-flight turns are cancelled and [`start`](Self::start) returns
    /// once the workers exit. The loop can be started again afterwards.
    pub fn stop(&self) {
        info!("Stopping agent loop");
        let mut token = self
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        token.cancel();
        *token = CancellationToken::new();
    }
}

/// Key that decides which worker handles `msg`. Completions carry their
/// origin session key in `chat_id`, so they queue behind that conversation.
fn routing_key(msg: &InboundMessage) -> &str {
    if msg.channel == crate::bus::SYSTEM_CHANNEL {
        &msg.chat_id
    } else {
        &msg.session_key
    }
}

fn shard_for(key: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

/// Whether the final reply is skipped because the message tool already
/// delivered content in this turn.
pub fn should_suppress(mode: ReplySuppression, content: &str, delivered: &[String]) -> bool {
    if delivered.is_empty() {
        return false;
    }
    match mode {
        ReplySuppression::Always => true,
        ReplySuppression::WhenDuplicate => {
            let content = content.trim();
            content.is_empty() || delivered.iter().any(|d| d.trim() == content)
        }
        ReplySuppression::Never => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{LLMResponse, LLMToolCall, ToolDefinition};
    use crate::session::Role;
    use crate::state::StateStore;
    use crate::tools::EchoTool;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Scripted {
        responses: std::sync::Mutex<Vec<LLMResponse>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut responses: Vec<LLMResponse>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: std::sync::Mutex::new(responses),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LLMProvider for Scripted {
        async fn chat(
            &self,
            _messages: Vec<Message>,
            _tools: Vec<ToolDefinition>,
            _model: Option<&str>,
            _options: ChatOptions,
        ) -> Result<LLMResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.responses.lock().unwrap().pop();
            Ok(next.unwrap_or_else(|| LLMResponse::text("fallback")))
        }

        fn default_model(&self) -> &str {
            "scripted"
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    struct Broken;

    #[async_trait]
    impl LLMProvider for Broken {
        async fn chat(
            &self,
            _messages: Vec<Message>,
            _tools: Vec<ToolDefinition>,
            _model: Option<&str>,
            _options: ChatOptions,
        ) -> Result<LLMResponse> {
            Err(RelayError::Provider("upstream down".to_string()))
        }

        fn default_model(&self) -> &str {
            "broken"
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    /// Never answers; only cancellation ends its turn.
    struct Stalled;

    #[async_trait]
    impl LLMProvider for Stalled {
        async fn chat(
            &self,
            _messages: Vec<Message>,
            _tools: Vec<ToolDefinition>,
            _model: Option<&str>,
            _options: ChatOptions,
        ) -> Result<LLMResponse> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(LLMResponse::text("too late"))
        }

        fn default_model(&self) -> &str {
            "stalled"
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    /// Occupies the `subagent` name.
    struct Reserved;

    #[async_trait]
    impl Tool for Reserved {
        fn name(&self) -> &str {
            "subagent"
        }

        fn description(&self) -> &str {
            "reserved"
        }

        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }

        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &crate::tools::ToolContext,
        ) -> Result<crate::tools::ToolResult> {
            Ok(crate::tools::ToolResult::llm_only("reserved"))
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.agents.defaults.workspace = std::env::temp_dir().to_string_lossy().to_string();
        config.delegation.enabled = false;
        config
    }

    fn agent(config: Config) -> AgentLoop {
        AgentLoop::new(config, SessionManager::new_memory(), Arc::new(MessageBus::new()))
    }

    #[test]
    fn test_should_suppress_modes() {
        let delivered = vec!["hello".to_string()];
        assert!(!should_suppress(ReplySuppression::Always, "x", &[]));
        assert!(should_suppress(ReplySuppression::Always, "other", &delivered));
        assert!(should_suppress(ReplySuppression::WhenDuplicate, " hello ", &delivered));
        assert!(should_suppress(ReplySuppression::WhenDuplicate, "", &delivered));
        assert!(!should_suppress(ReplySuppression::WhenDuplicate, "other", &delivered));
        assert!(!should_suppress(ReplySuppression::Never, "hello", &delivered));
    }

    #[test]
    fn test_routing_key_for_system_messages() {
        let completion = InboundMessage::system_completion("telegram:1", "spawn:ab", "done");
        assert_eq!(routing_key(&completion), "telegram:1");
        let user = InboundMessage::new("telegram", "u", "1", "hi");
        assert_eq!(routing_key(&user), "telegram:1");
        assert_eq!(
            shard_for(routing_key(&completion), 4),
            shard_for(routing_key(&user), 4)
        );
    }

    #[tokio::test]
    async fn test_process_requires_provider() {
        let agent = agent(test_config());
        let err = agent
            .process_message(&InboundMessage::new("telegram", "u", "1", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Provider(_)));
    }

    #[tokio::test]
    async fn test_user_turn_persists_and_replies() {
        let agent = agent(test_config());
        agent
            .set_provider(Scripted::new(vec![
                LLMResponse::with_tools(
                    "",
                    vec![LLMToolCall::new("c1", "echo", r#"{"message":"x"}"#)],
                ),
                LLMResponse::text("final answer"),
            ]))
            .await;
        agent.register_tool(Arc::new(EchoTool)).await.unwrap();

        let msg = InboundMessage::new("telegram", "u", "1", "hi");
        let outcome = agent.process_message(&msg).await.unwrap();
        assert_eq!(outcome.kind, TurnKind::User);
        assert_eq!(outcome.terminal, Some(Terminal::Done));
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.persisted);
        assert_eq!(outcome.reply.unwrap().content, "final answer");

        let session = agent.session_manager().get("telegram:1").await.unwrap().unwrap();
        // user, tool call, tool result, answer
        assert_eq!(session.message_count(), 4);
    }

    #[tokio::test]
    async fn test_internal_channel_gets_no_reply_and_no_state() {
        let (writer, reader) = StateStore::in_memory();
        let agent = agent(test_config()).with_state(writer);
        agent
            .set_provider(Scripted::new(vec![LLMResponse::text("ok")]))
            .await;

        let outcome = agent
            .process_message(&InboundMessage::new("cli", "user", "local", "hi"))
            .await
            .unwrap();
        assert!(outcome.reply.is_none());
        assert!(reader.last_active().await.is_none());
    }

    #[tokio::test]
    async fn test_state_updated_for_user_channel() {
        let (writer, reader) = StateStore::in_memory();
        let agent = agent(test_config()).with_state(writer);
        agent
            .set_provider(Scripted::new(vec![LLMResponse::text("ok")]))
            .await;

        agent
            .process_message(&InboundMessage::new("slack", "u", "C9", "hi"))
            .await
            .unwrap();
        assert_eq!(
            reader.last_active().await,
            Some(("slack".to_string(), "C9".to_string()))
        );
    }

    #[tokio::test]
    async fn test_system_path_appends_completion_without_model_call() {
        let provider = Scripted::new(vec![]);
        let agent = agent(test_config());
        agent.set_provider(provider.clone()).await;

        let msg = InboundMessage::system_completion("telegram:5", "spawn:1234", "report")
            .with_metadata("task_id", "1234");
        let outcome = agent.process_message(&msg).await.unwrap();
        assert_eq!(outcome.kind, TurnKind::System);
        let reply = outcome.reply.unwrap();
        assert_eq!(reply.channel, "telegram");
        assert_eq!(reply.chat_id, "5");
        assert_eq!(reply.metadata.get("task_id").map(String::as_str), Some("1234"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        let session = agent.session_manager().get("telegram:5").await.unwrap().unwrap();
        assert_eq!(session.messages[0].content, "report");
    }

    #[tokio::test]
    async fn test_system_path_drops_internal_origin() {
        let agent = agent(test_config());
        let msg = InboundMessage::system_completion("cli:local", "spawn:1", "report");
        let outcome = agent.process_message(&msg).await.unwrap();
        assert_eq!(outcome.kind, TurnKind::Dropped);
        assert!(outcome.reply.is_none());
        assert!(!agent.session_manager().exists("cli:local").await);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let agent = Arc::new(agent(test_config()));
        let runner = Arc::clone(&agent);
        let handle = tokio::spawn(async move { runner.start().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = agent.start().await.unwrap_err();
        assert!(err.to_string().contains("already running"));

        agent.stop();
        handle.await.unwrap().unwrap();
        assert!(!agent.is_running());
    }

    #[tokio::test]
    async fn test_builtin_tools_without_delegation() {
        let agent = agent(test_config());
        agent.register_builtin_tools().await.unwrap();
        for name in ["read_file", "write_file", "list_dir", "exec", "message"] {
            assert!(agent.has_tool(name).await, "missing {}", name);
        }
        assert!(!agent.has_tool("spawn").await);
    }

    #[tokio::test]
    async fn test_builtin_delegation_registers_before_provider() {
        let mut config = test_config();
        config.delegation.enabled = true;
        let agent = agent(config);
        agent.register_builtin_tools().await.unwrap();
        assert_eq!(agent.tool_count().await, 7);

        let manager = agent.delegation.read().await.clone().unwrap();
        let err = manager
            .run_subagent("look around", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Provider(_)));
    }

    #[tokio::test]
    async fn test_builtin_failure_leaves_registry_unchanged() {
        let mut config = test_config();
        config.delegation.enabled = true;
        let agent = agent(config);
        agent.register_tool(Arc::new(Reserved)).await.unwrap();

        assert!(agent.register_builtin_tools().await.is_err());
        assert_eq!(agent.tool_count().await, 1);
        assert!(!agent.has_tool("read_file").await);
        assert!(agent.delegation.read().await.is_none());

        let mut config = test_config();
        config.delegation.enabled = true;
        let agent = self::agent(config);
        assert!(agent.register_builtin_tools().await.is_ok());
        let err = agent.register_builtin_tools().await.unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert_eq!(agent.tool_count().await, 7);
    }

    #[tokio::test]
    async fn test_delegation_follows_provider_replacement() {
        let mut config = test_config();
        config.delegation.enabled = true;
        let agent = agent(config);
        agent.register_builtin_tools().await.unwrap();
        let manager = agent.delegation.read().await.clone().unwrap();

        agent
            .set_provider(Scripted::new(vec![LLMResponse::text("first backend")]))
            .await;
        let report = manager
            .run_subagent("task", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.content, "first backend");

        agent
            .set_provider(Scripted::new(vec![LLMResponse::text("second backend")]))
            .await;
        let report = manager
            .run_subagent("task", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.content, "second backend");
    }

    #[tokio::test]
    async fn test_state_recorded_when_model_fails() {
        let (writer, reader) = StateStore::in_memory();
        let agent = agent(test_config()).with_state(writer);
        agent.set_provider(Arc::new(Broken)).await;

        let result = agent
            .process_message(&InboundMessage::new("discord", "u", "D1", "hi"))
            .await;
        assert!(result.is_err());
        assert_eq!(
            reader.last_active().await,
            Some(("discord".to_string(), "D1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_session_locks_released_after_turns() {
        let agent = agent(test_config());
        agent
            .set_provider(Scripted::new(vec![
                LLMResponse::text("one"),
                LLMResponse::text("two"),
            ]))
            .await;

        for chat in ["1", "2"] {
            agent
                .process_message(&InboundMessage::new("telegram", "u", chat, "hi"))
                .await
                .unwrap();
        }
        agent
            .process_message(&InboundMessage::system_completion("telegram:1", "spawn:1", "done"))
            .await
            .unwrap();
        assert!(agent.session_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_content_not_stored() {
        let agent = agent(test_config());
        agent
            .set_provider(Scripted::new(vec![LLMResponse::text("anything else?")]))
            .await;

        agent
            .process_message(&InboundMessage::new("telegram", "u", "3", ""))
            .await
            .unwrap();
        let session = agent.session_manager().get("telegram:3").await.unwrap().unwrap();
        assert_eq!(session.message_count(), 1);
        assert_eq!(session.messages[0].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_stop_requeues_message_waiting_for_full_shard() {
        let mut config = test_config();
        config.agents.defaults.workers = 1;
        config.bus.inbound_capacity = 1;
        let agent = Arc::new(agent(config));
        agent.set_provider(Arc::new(Stalled)).await;

        for text in ["first", "second", "third"] {
            agent
                .bus()
                .publish_inbound(InboundMessage::new("telegram", "u", "7", text))
                .await
                .unwrap();
        }
        let runner = Arc::clone(&agent);
        let handle = tokio::spawn(async move { runner.start().await });
        // "first" is stuck in the model, "second" fills the shard and the
        // dispatcher holds "third".
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(agent.bus().pending_inbound(), 0);

        agent.stop();
        handle.await.unwrap().unwrap();

        let mut requeued = Vec::new();
        while agent.bus().pending_inbound() > 0 {
            requeued.push(agent.bus().consume_inbound().await.unwrap().content);
        }
        requeued.sort();
        assert_eq!(requeued, vec!["second".to_string(), "third".to_string()]);
    }

    #[tokio::test]
    async fn test_builtin_tools_with_delegation() {
        let mut config = test_config();
        config.delegation.enabled = true;
        let agent = agent(config);
        agent.set_provider(Scripted::new(vec![])).await;
        agent.register_builtin_tools().await.unwrap();
        assert!(agent.has_tool("spawn").await);
        assert!(agent.has_tool("subagent").await);
        assert_eq!(agent.tool_count().await, 7);
    }
}
