//! Context builder for agent conversations
//!
//! The system prompt is assembled in a fixed order:
//!
//! 1. identity and runtime preamble, with the available tools
//! 2. bootstrap documents (`AGENTS.md`, `SOUL.md`, `USER.md`, `IDENTITY.md`)
//! 3. skills catalog
//! 4. memory (`memory/MEMORY.md` plus the most recent dated notes)
//! 5. session summary
//! 6. session metadata
//!
//! Missing optional sections are skipped. Rendering is a pure function of its
//! inputs: all file access happens in [`ContextSources::load`], and the clock
//! is passed in, so the same inputs always give the same prompt.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::providers::ToolDefinition;
use crate::session::{Message, Role};
use crate::skills::{SkillSummary, SkillsLoader};

/// Workspace documents included in the prompt, in priority order.
pub const BOOTSTRAP_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md", "IDENTITY.md"];

const DEFAULT_INSTRUCTIONS: &str = "You have access to tools to help accomplish tasks. \
Use them when needed.\n\nBe concise but helpful. Focus on completing the user's request efficiently.";

const SECTION_SEPARATOR: &str = "\n\n---\n\n";

static DATED_NOTE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^(\d{4})-?(\d{2})-?(\d{2})\.md$").ok());

/// Who the agent is and where it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityConfig {
    pub name: String,
    pub instructions: String,
    pub workspace: String,
    pub platform: String,
}

impl IdentityConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            workspace: String::new(),
            platform: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.agents.defaults.name)
            .with_workspace(&config.workspace_path().to_string_lossy())
    }

    pub fn with_instructions(mut self, instructions: &str) -> Self {
        self.instructions = instructions.to_string();
        self
    }

    pub fn with_workspace(mut self, workspace: &str) -> Self {
        self.workspace = workspace.to_string();
        self
    }

    pub fn with_platform(mut self, platform: &str) -> Self {
        self.platform = platform.to_string();
        self
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self::new("RelayClaw")
    }
}

/// A named document included verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub name: String,
    pub content: String,
}

impl Document {
    pub fn new(name: &str, content: &str) -> Self {
        Self {
            name: name.to_string(),
            content: content.to_string(),
        }
    }
}

/// Everything the builder reads from disk, loaded in one place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextSources {
    /// Present bootstrap documents, in priority order.
    pub bootstrap: Vec<Document>,
    pub skills: Vec<SkillSummary>,
    /// Durable notes from `memory/MEMORY.md`.
    pub memory: Option<String>,
    /// Dated notes, newest first. Names are the ISO date.
    pub recent_notes: Vec<Document>,
}

impl ContextSources {
    /// Read bootstrap files, the skills catalog and memory from `workspace`.
    pub fn load(workspace: &Path, skills: Option<&SkillsLoader>, recent_notes: usize) -> Self {
        let bootstrap = BOOTSTRAP_FILES
            .iter()
            .filter_map(|name| read_optional(&workspace.join(name)).map(|c| Document::new(name, &c)))
            .collect();

        let memory_dir = workspace.join("memory");
        let memory = read_optional(&memory_dir.join("MEMORY.md"));
        let recent_notes = load_recent_notes(&memory_dir, recent_notes);

        let sources = Self {
            bootstrap,
            skills: skills.map(SkillsLoader::catalog).unwrap_or_default(),
            memory,
            recent_notes,
        };
        debug!(
            bootstrap = sources.bootstrap.len(),
            skills = sources.skills.len(),
            notes = sources.recent_notes.len(),
            "Loaded context sources"
        );
        sources
    }
}

fn read_optional(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) if !content.trim().is_empty() => Some(content.trim().to_string()),
        Ok(_) => None,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read context file");
            None
        }
    }
}

/// The `limit` newest dated notes anywhere under `dir`.
fn load_recent_notes(dir: &Path, limit: usize) -> Vec<Document> {
    if limit == 0 {
        return Vec::new();
    }
    let mut found: Vec<(String, PathBuf)> = Vec::new();
    collect_dated_notes(dir, &mut found);
    // Newest first; path breaks ties so the order is stable.
    found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    found
        .into_iter()
        .filter_map(|(date, path)| read_optional(&path).map(|c| Document::new(&date, &c)))
        .take(limit)
        .collect()
}

fn collect_dated_notes(dir: &Path, out: &mut Vec<(String, PathBuf)>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let Some(re) = DATED_NOTE.as_ref() else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_dated_notes(&path, out);
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(caps) = re.captures(&name) {
            let date = format!("{}-{}-{}", &caps[1], &caps[2], &caps[3]);
            out.push((date, path));
        }
    }
}

/// The conversation-specific part of the prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionView<'a> {
    pub channel: &'a str,
    pub chat_id: &'a str,
    pub session_key: &'a str,
    pub summary: Option<&'a str>,
}

/// Builder for the system prompt and the message list sent to the model.
///
/// # Example
///
/// ```rust
/// use chrono::{TimeZone, Utc};
/// use relayclaw::agent::{ContextBuilder, ContextSources, IdentityConfig, SessionView};
///
/// let builder = ContextBuilder::new(IdentityConfig::new("Relay"));
/// let view = SessionView {
///     channel: "telegram",
///     chat_id: "42",
///     session_key: "telegram:42",
///     summary: None,
/// };
/// let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
/// let prompt = builder.build_system_prompt(&ContextSources::default(), &view, now);
/// assert!(prompt.starts_with("# Relay"));
/// assert!(prompt.contains("Session key: telegram:42"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    identity: IdentityConfig,
    tools: Vec<ToolDefinition>,
}

impl ContextBuilder {
    pub fn new(identity: IdentityConfig) -> Self {
        Self {
            identity,
            tools: Vec::new(),
        }
    }

    /// Tools listed in the preamble.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn identity(&self) -> &IdentityConfig {
        &self.identity
    }

    /// Render the full system prompt.
    pub fn build_system_prompt(
        &self,
        sources: &ContextSources,
        session: &SessionView<'_>,
        now: DateTime<Utc>,
    ) -> String {
        let mut sections = vec![self.render_preamble(now)];

        for doc in &sources.bootstrap {
            sections.push(format!("## {}\n\n{}", doc.name, doc.content));
        }
        if let Some(skills) = render_skills(&sources.skills) {
            sections.push(skills);
        }
        if let Some(memory) = render_memory(sources) {
            sections.push(memory);
        }
        if let Some(summary) = session.summary.filter(|s| !s.trim().is_empty()) {
            sections.push(format!("## Conversation Summary\n\n{}", summary.trim()));
        }
        sections.push(render_session(session));

        sections.join(SECTION_SEPARATOR)
    }

    pub fn build_system_message(
        &self,
        sources: &ContextSources,
        session: &SessionView<'_>,
        now: DateTime<Utc>,
    ) -> Message {
        Message::system(&self.build_system_prompt(sources, session, now))
    }

    /// Build `[system, history..., user]`.
    ///
    /// Leading tool results whose call was folded into the summary are
    /// dropped, and an empty `user_input` adds no user message.
    ///
    /// # Example
    /// ```rust
    /// use relayclaw::agent::ContextBuilder;
    /// use relayclaw::session::Message;
    ///
    /// let history = vec![
    ///     Message::tool_result("call_0", "stale"),
    ///     Message::user("Hello"),
    ///     Message::assistant("Hi there!"),
    /// ];
    /// let messages = ContextBuilder::build_messages(Message::system("sys"), &history, "How are you?");
    /// assert_eq!(messages.len(), 4); // system + 2 history + new user
    /// ```
    pub fn build_messages(system: Message, history: &[Message], user_input: &str) -> Vec<Message> {
        let history = trim_orphan_tool_results(history);
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(system);
        messages.extend_from_slice(history);
        if !user_input.is_empty() {
            messages.push(Message::user(user_input));
        }
        messages
    }

    fn render_preamble(&self, now: DateTime<Utc>) -> String {
        let identity = &self.identity;
        let mut out = format!("# {}\n\n{}\n\n## Runtime\n\n", identity.name, identity.instructions);
        out.push_str(&format!("- Current time: {}\n", now.format("%Y-%m-%d %H:%M:%S UTC")));
        if !identity.workspace.is_empty() {
            out.push_str(&format!("- Workspace: {}\n", identity.workspace));
        }
        out.push_str(&format!("- Platform: {}", identity.platform));

        if !self.tools.is_empty() {
            out.push_str("\n\n## Tools\n");
            for tool in &self.tools {
                out.push_str(&format!("\n- {}: {}", tool.name, tool.description));
            }
        }
        out
    }
}

/// Skip tool results at the start of `history`; their calls are gone.
pub fn trim_orphan_tool_results(history: &[Message]) -> &[Message] {
    let start = history
        .iter()
        .position(|m| m.role != Role::Tool)
        .unwrap_or(history.len());
    &history[start..]
}

fn render_skills(skills: &[SkillSummary]) -> Option<String> {
    if skills.is_empty() {
        return None;
    }
    let mut lines = vec![
        "## Skills\n\nRead a skill's SKILL.md before using it.\n".to_string(),
        "<skills>".to_string(),
    ];
    for skill in skills {
        lines.push(format!("  <skill available=\"{}\">", skill.available));
        lines.push(format!("    <name>{}</name>", escape_xml(&skill.name)));
        lines.push(format!(
            "    <description>{}</description>",
            escape_xml(&skill.description)
        ));
        lines.push(format!("    <location>{}</location>", escape_xml(&skill.location)));
        lines.push(format!("    <source>{}</source>", skill.source));
        lines.push("  </skill>".to_string());
    }
    lines.push("</skills>".to_string());
    Some(lines.join("\n"))
}

fn render_memory(sources: &ContextSources) -> Option<String> {
    if sources.memory.is_none() && sources.recent_notes.is_empty() {
        return None;
    }
    let mut out = String::from("## Memory");
    if let Some(ref memory) = sources.memory {
        out.push_str("\n\n### Long-term Memory\n\n");
        out.push_str(memory);
    }
    if !sources.recent_notes.is_empty() {
        out.push_str("\n\n### Recent Notes");
        for note in &sources.recent_notes {
            out.push_str(&format!("\n\n#### {}\n\n{}", note.name, note.content));
        }
    }
    Some(out)
}

fn render_session(session: &SessionView<'_>) -> String {
    format!(
        "## Current Session\n\n- Channel: {}\n- Chat ID: {}\n- Session key: {}",
        session.channel, session.chat_id, session.session_key
    )
}

fn escape_xml(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
