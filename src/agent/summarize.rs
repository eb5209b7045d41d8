//! History summarization.
//!
//! When a session grows past the message threshold or a share of the context
//! window, the older part of its history is folded into a rolling summary
//! produced by the same model. Only the most recent messages stay verbatim.
//! A failed attempt leaves the session exactly as it was.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::SummarizationConfig;
use crate::error::{RelayError, Result};
use crate::providers::{ChatOptions, LLMProvider};
use crate::session::{Message, Session};

/// Metadata key holding how many messages have been folded into the summary.
pub const SUMMARIZED_MESSAGES_KEY: &str = "summarized_messages";
/// Metadata key holding how many oversized messages were left out.
pub const OVERSIZED_MESSAGES_KEY: &str = "oversized_messages";

const SUMMARY_INSTRUCTION: &str = "Summarize the following conversation focusing on key \
     decisions, information exchanged, and actions taken. Keep facts the assistant will \
     need later. Be concise.";

/// Estimated token count of one message: a quarter of its characters,
/// rounded up. Tool-call names and arguments count too.
///
/// # Example
/// ```
/// use relayclaw::agent::summarize::estimate_tokens;
/// use relayclaw::session::Message;
///
/// assert_eq!(estimate_tokens(&Message::user("12345")), 2);
/// ```
pub fn estimate_tokens(message: &Message) -> usize {
    let mut chars = message.content.chars().count();
    if let Some(ref calls) = message.tool_calls {
        for call in calls {
            chars += call.name.chars().count() + call.arguments.chars().count();
        }
    }
    chars.div_ceil(4)
}

pub fn estimate_history_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_tokens).sum()
}

/// When to summarize and what to keep.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryPolicy {
    pub enabled: bool,
    pub message_threshold: usize,
    pub token_ratio: f64,
    pub keep_recent: usize,
    pub oversized_ratio: f64,
    pub context_window: usize,
}

impl SummaryPolicy {
    pub fn from_config(config: &SummarizationConfig, context_window: usize) -> Self {
        Self {
            enabled: config.enabled,
            message_threshold: config.message_threshold,
            token_ratio: config.token_ratio,
            keep_recent: config.keep_recent,
            oversized_ratio: config.oversized_ratio,
            context_window,
        }
    }

    /// Estimated history size above which summarization triggers.
    pub fn token_limit(&self) -> usize {
        (self.context_window as f64 * self.token_ratio) as usize
    }

    /// Estimated size above which a single message is left out of the
    /// summarizer input.
    pub fn oversized_limit(&self) -> usize {
        (self.context_window as f64 * self.oversized_ratio) as usize
    }

    /// # Example
    /// ```
    /// use relayclaw::agent::summarize::SummaryPolicy;
    /// use relayclaw::config::SummarizationConfig;
    /// use relayclaw::session::Message;
    ///
    /// let policy = SummaryPolicy::from_config(&SummarizationConfig::default(), 128_000);
    /// let history: Vec<Message> = (0..21).map(|i| Message::user(&i.to_string())).collect();
    /// assert!(policy.should_summarize(&history));
    /// assert!(!policy.should_summarize(&history[..20]));
    /// ```
    pub fn should_summarize(&self, history: &[Message]) -> bool {
        if !self.enabled || history.len() <= self.keep_recent {
            return false;
        }
        history.len() > self.message_threshold
            || estimate_history_tokens(history) > self.token_limit()
    }
}

impl Default for SummaryPolicy {
    fn default() -> Self {
        Self::from_config(&SummarizationConfig::default(), 128_000)
    }
}

/// Folds old history into a rolling summary using the model backend.
pub struct Summarizer {
    provider: Arc<dyn LLMProvider>,
    model: Option<String>,
    options: ChatOptions,
    policy: SummaryPolicy,
}

impl Summarizer {
    pub fn new(provider: Arc<dyn LLMProvider>, policy: SummaryPolicy) -> Self {
        Self {
            provider,
            model: None,
            options: ChatOptions::new(),
            policy,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    pub fn policy(&self) -> &SummaryPolicy {
        &self.policy
    }

    /// Summarize `session` and return how many messages were folded.
    ///
    /// The session is modified only after the model returned a non-empty
    /// summary. On error it is left untouched.
    pub async fn summarize(&self, session: &mut Session) -> Result<usize> {
        let keep = self.policy.keep_recent;
        if session.messages.len() <= keep {
            return Ok(0);
        }
        let split = session.messages.len() - keep;
        let older = &session.messages[..split];

        let (prompt, oversized) =
            build_summary_prompt(session.summary.as_deref(), older, self.policy.oversized_limit());
        if oversized > 0 {
            warn!(
                session = %session.key,
                oversized,
                limit_tokens = self.policy.oversized_limit(),
                "Oversized messages left out of summary input"
            );
        }

        debug!(session = %session.key, folding = split, "Requesting summary");
        let response = self
            .provider
            .chat(
                vec![Message::user(&prompt)],
                Vec::new(),
                self.model.as_deref(),
                self.options.clone(),
            )
            .await?;
        let summary = response.content.trim();
        if summary.is_empty() {
            return Err(RelayError::Provider("summarizer returned empty text".to_string()));
        }

        let summary = summary.to_string();
        let limit = self.policy.oversized_limit();
        let folded: Vec<Message> = session.messages.drain(..split).collect();
        session
            .excluded
            .extend(folded.into_iter().filter(|m| estimate_tokens(m) > limit));
        session.set_summary(&summary);
        bump_counter(session, SUMMARIZED_MESSAGES_KEY, split);
        if oversized > 0 {
            bump_counter(session, OVERSIZED_MESSAGES_KEY, oversized);
        }

        info!(
            session = %session.key,
            folded = split,
            kept = session.messages.len(),
            "Session history summarized"
        );
        Ok(split)
    }
}

fn bump_counter(session: &mut Session, key: &str, by: usize) {
    let previous = session
        .metadata
        .get(key)
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    session
        .metadata
        .insert(key.to_string(), (previous + by).to_string());
}

/// Build the summarizer prompt. Returns the prompt and the number of
/// messages left out for exceeding `oversized_limit` tokens.
pub fn build_summary_prompt(
    existing: Option<&str>,
    messages: &[Message],
    oversized_limit: usize,
) -> (String, usize) {
    let mut transcript = String::new();
    let mut oversized = 0;
    for msg in messages {
        if estimate_tokens(msg) > oversized_limit {
            oversized += 1;
            transcript.push_str(&format!("{}: [oversized message omitted]\n", msg.role));
            continue;
        }
        if msg.content.trim().is_empty() {
            if let Some(ref calls) = msg.tool_calls {
                let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
                transcript.push_str(&format!("{}: [called {}]\n", msg.role, names.join(", ")));
            }
            continue;
        }
        transcript.push_str(&format!("{}: {}\n", msg.role, msg.content));
    }

    let mut prompt = String::from(SUMMARY_INSTRUCTION);
    if let Some(existing) = existing.filter(|s| !s.trim().is_empty()) {
        prompt.push_str("\n\nSummary of the conversation so far:\n");
        prompt.push_str(existing);
    }
    prompt.push_str("\n\n");
    prompt.push_str(&transcript);
    (prompt, oversized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{LLMResponse, ToolDefinition};
    use crate::session::ToolCall;
    use std::sync::Mutex;

    struct FixedSummary {
        reply: std::result::Result<String, String>,
        prompts: Mutex<Vec<String>>,
    }

    impl FixedSummary {
        fn ok(text: &str) -> Self {
            Self {
                reply: Ok(text.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                reply: Err("boom".to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl LLMProvider for FixedSummary {
        async fn chat(
            &self,
            messages: Vec<Message>,
            tools: Vec<ToolDefinition>,
            _model: Option<&str>,
            _options: ChatOptions,
        ) -> Result<LLMResponse> {
            assert!(tools.is_empty());
            self.prompts
                .lock()
                .unwrap()
                .push(messages[0].content.clone());
            match &self.reply {
                Ok(text) => Ok(LLMResponse::text(text)),
                Err(e) => Err(RelayError::Provider(e.clone())),
            }
        }

        fn default_model(&self) -> &str {
            "fixed"
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn session_with(n: usize) -> Session {
        let mut session = Session::new("test:1");
        for i in 0..n {
            if i % 2 == 0 {
                session.add_message(Message::user(&format!("question {}", i)));
            } else {
                session.add_message(Message::assistant(&format!("answer {}", i)));
            }
        }
        session
    }

    #[test]
    fn test_estimate_tokens_rounds_up_and_counts_tool_calls() {
        assert_eq!(estimate_tokens(&Message::user("")), 0);
        assert_eq!(estimate_tokens(&Message::user("abcd")), 1);
        assert_eq!(estimate_tokens(&Message::user("abcde")), 2);

        let msg = Message::assistant_with_tools("", vec![ToolCall::new("1", "echo", "{}")]);
        // "echo" + "{}" = 6 chars
        assert_eq!(estimate_tokens(&msg), 2);
    }

    #[test]
    fn test_should_summarize_by_tokens() {
        let policy = SummaryPolicy::from_config(&SummarizationConfig::default(), 100);
        let history = vec![
            Message::user(&"x".repeat(200)),
            Message::assistant("ok"),
            Message::user("a"),
            Message::assistant("b"),
            Message::user(&"y".repeat(200)),
        ];
        // 50 + 1 + 1 + 1 + 50 tokens > 75
        assert!(policy.should_summarize(&history));
    }

    #[test]
    fn test_should_summarize_disabled() {
        let config = SummarizationConfig {
            enabled: false,
            ..Default::default()
        };
        let policy = SummaryPolicy::from_config(&config, 128_000);
        assert!(!policy.should_summarize(&session_with(50).messages));
    }

    #[tokio::test]
    async fn test_summarize_fifty_messages_keeps_four_plus_summary() {
        let provider = Arc::new(FixedSummary::ok("the gist"));
        let summarizer = Summarizer::new(provider, SummaryPolicy::default());
        let mut session = session_with(50);

        let folded = summarizer.summarize(&mut session).await.unwrap();
        assert_eq!(folded, 46);
        assert_eq!(session.message_count(), 4);
        assert_eq!(session.entry_count(), 5);
        assert_eq!(session.summary.as_deref(), Some("the gist"));
        assert_eq!(session.messages[0].content, "question 46");
        assert_eq!(
            session.metadata.get(SUMMARIZED_MESSAGES_KEY).map(String::as_str),
            Some("46")
        );
    }

    #[tokio::test]
    async fn test_summary_prompt_includes_existing_summary() {
        let provider = Arc::new(FixedSummary::ok("new gist"));
        let summarizer = Summarizer::new(provider.clone(), SummaryPolicy::default());
        let mut session = session_with(10);
        session.set_summary("old gist");

        summarizer.summarize(&mut session).await.unwrap();
        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts[0].contains("old gist"));
        assert!(prompts[0].contains("user: question 0"));
        assert!(!prompts[0].contains("question 8"));
    }

    #[tokio::test]
    async fn test_failure_leaves_session_untouched() {
        let summarizer = Summarizer::new(Arc::new(FixedSummary::failing()), SummaryPolicy::default());
        let mut session = session_with(30);
        let before = session.messages.clone();

        assert!(summarizer.summarize(&mut session).await.is_err());
        assert_eq!(session.messages, before);
        assert!(session.summary.is_none());
        assert!(session.metadata.is_empty());
        assert!(session.excluded.is_empty());
    }

    #[tokio::test]
    async fn test_empty_summary_is_failure() {
        let summarizer = Summarizer::new(Arc::new(FixedSummary::ok("   ")), SummaryPolicy::default());
        let mut session = session_with(30);
        assert!(summarizer.summarize(&mut session).await.is_err());
        assert_eq!(session.message_count(), 30);
    }

    #[tokio::test]
    async fn test_oversized_message_excluded_but_counted() {
        let provider = Arc::new(FixedSummary::ok("gist"));
        let policy = SummaryPolicy {
            context_window: 100,
            ..SummaryPolicy::default()
        };
        let summarizer = Summarizer::new(provider.clone(), policy);

        let mut session = session_with(6);
        session.messages.insert(1, Message::user(&"z".repeat(400)));

        summarizer.summarize(&mut session).await.unwrap();
        let prompts = provider.prompts.lock().unwrap();
        assert!(!prompts[0].contains("zzzz"));
        assert!(prompts[0].contains("[oversized message omitted]"));
        assert_eq!(
            session.metadata.get(OVERSIZED_MESSAGES_KEY).map(String::as_str),
            Some("1")
        );

        assert_eq!(session.message_count(), 4);
        assert_eq!(session.entry_count(), 5);
        assert_eq!(session.excluded.len(), 1);
        assert_eq!(session.excluded[0].content, "z".repeat(400));

        let saved = serde_json::to_string(&session).unwrap();
        let restored: Session = serde_json::from_str(&saved).unwrap();
        assert_eq!(restored.excluded, session.excluded);
    }

    #[tokio::test]
    async fn test_short_history_not_summarized() {
        let provider = Arc::new(FixedSummary::ok("gist"));
        let summarizer = Summarizer::new(provider.clone(), SummaryPolicy::default());
        let mut session = session_with(3);
        assert_eq!(summarizer.summarize(&mut session).await.unwrap(), 0);
        assert!(provider.prompts.lock().unwrap().is_empty());
    }
}
