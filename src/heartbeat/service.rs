//! Heartbeat service implementation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{InboundMessage, MessageBus};
use crate::config::Config;
use crate::state::StateReader;

/// Reply meaning "nothing needed attention"; never forwarded to the user.
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

/// Sender id of injected heartbeat messages.
pub const HEARTBEAT_SENDER: &str = "heartbeat";

/// Lower bound on the tick interval.
const MIN_INTERVAL_SECS: u64 = 30;

/// Structured result from a heartbeat tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResult {
    pub timestamp: DateTime<Utc>,
    pub file_found: bool,
    /// Whether the file had actionable content.
    pub actionable: bool,
    /// `channel:chat` the prompt was sent to.
    pub target: Option<String>,
    pub delivered: bool,
    pub error: Option<String>,
}

impl HeartbeatResult {
    fn skipped(file_found: bool, actionable: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            file_found,
            actionable,
            target: None,
            delivered: false,
            error: None,
        }
    }

    fn err(msg: String) -> Self {
        Self {
            error: Some(msg),
            ..Self::skipped(false, false)
        }
    }
}

struct Inner {
    file_path: PathBuf,
    bus: Arc<MessageBus>,
    state: StateReader,
    consecutive_failures: AtomicU32,
    failure_alert_threshold: u32,
}

/// Periodically asks the agent to work through `HEARTBEAT.md`.
///
/// Each tick targets the conversation that was active last and injects a
/// history-free message, so the agent acts on the file without replaying
/// the whole chat.
pub struct HeartbeatService {
    inner: Arc<Inner>,
    interval: Duration,
    running: Arc<AtomicBool>,
    shutdown: std::sync::Mutex<CancellationToken>,
}

impl HeartbeatService {
    pub fn new(
        file_path: PathBuf,
        interval_secs: u64,
        bus: Arc<MessageBus>,
        state: StateReader,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                file_path,
                bus,
                state,
                consecutive_failures: AtomicU32::new(0),
                failure_alert_threshold: 3,
            }),
            interval: Duration::from_secs(interval_secs.max(MIN_INTERVAL_SECS)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    pub fn from_config(config: &Config, bus: Arc<MessageBus>, state: StateReader) -> Self {
        Self::new(
            config.heartbeat_path(),
            config.heartbeat.interval_secs,
            bus,
            state,
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the tick loop in the background. A second call is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Heartbeat service already running");
            return;
        }
        let cancel = {
            let mut token = self
                .shutdown
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
            token.clone()
        };
        let inner = Arc::clone(&self.inner);
        let running = Arc::clone(&self.running);
        let interval = self.interval;

        info!(
            interval_secs = interval.as_secs(),
            file = %inner.file_path.display(),
            "Heartbeat service started"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let result = inner.tick().await;
                if result.error.is_some() {
                    let count = inner.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    if count >= inner.failure_alert_threshold {
                        warn!(consecutive_failures = count, "Heartbeat degraded");
                    }
                } else {
                    inner.consecutive_failures.store(0, Ordering::Relaxed);
                }
            }
            running.store(false, Ordering::SeqCst);
            info!("Heartbeat service stopped");
        });
    }

    pub fn stop(&self) {
        self.shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .cancel();
    }

    /// Run one tick now.
    pub async fn trigger_now(&self) -> HeartbeatResult {
        self.inner.tick().await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures() < self.inner.failure_alert_threshold
    }
}

impl Inner {
    async fn tick(&self) -> HeartbeatResult {
        let content = match read_heartbeat_file(&self.file_path).await {
            Ok(Some(content)) => content,
            Ok(None) => {
                debug!(file = %self.file_path.display(), "Heartbeat file missing, skipping tick");
                return HeartbeatResult::skipped(false, false);
            }
            Err(e) => {
                warn!(file = %self.file_path.display(), error = %e, "Failed to read heartbeat file");
                return HeartbeatResult::err(format!("Failed to read file: {}", e));
            }
        };

        if is_empty(&content) {
            debug!("Heartbeat file has no actionable content");
            return HeartbeatResult::skipped(true, false);
        }

        let Some((channel, chat_id)) = self.state.last_active().await else {
            debug!("No active conversation, skipping heartbeat");
            return HeartbeatResult::skipped(true, true);
        };

        let message = InboundMessage::new(
            &channel,
            HEARTBEAT_SENDER,
            &chat_id,
            &heartbeat_prompt(&content),
        )
        .with_metadata("no_history", "true")
        .with_metadata("heartbeat", "true");

        let target = format!("{}:{}", channel, chat_id);
        match self.bus.try_publish_inbound(message) {
            Ok(()) => {
                info!(target = %target, "Heartbeat delivered to bus");
                HeartbeatResult {
                    target: Some(target),
                    delivered: true,
                    ..HeartbeatResult::skipped(true, true)
                }
            }
            Err(e) => {
                error!(target = %target, error = %e, "Failed to publish heartbeat");
                HeartbeatResult {
                    file_found: true,
                    actionable: true,
                    target: Some(target),
                    ..HeartbeatResult::err(format!("Delivery failed: {}", e))
                }
            }
        }
    }
}

async fn read_heartbeat_file(path: &Path) -> std::io::Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn heartbeat_prompt(content: &str) -> String {
    format!(
        "Heartbeat check. Work through the actionable items below from HEARTBEAT.md.\n\
         If nothing needs attention, reply with exactly: {}\n\n{}",
        HEARTBEAT_OK,
        content.trim()
    )
}

/// Whether heartbeat content has nothing actionable: only headers, HTML
/// comments and unchecked empty list items.
pub fn is_empty(content: &str) -> bool {
    content.lines().map(str::trim).all(|line| {
        line.is_empty()
            || line.starts_with('#')
            || line.starts_with("<!--")
            || line == "- [ ]"
            || line == "* [ ]"
    })
}

/// Whether `content` is the agent's "nothing to do" heartbeat reply.
pub fn is_heartbeat_ok(content: &str) -> bool {
    content.trim().trim_end_matches('.') == HEARTBEAT_OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStore;

    fn write_file(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let file = dir.path().join("HEARTBEAT.md");
        std::fs::write(&file, content).unwrap();
        file
    }

    #[test]
    fn test_is_empty() {
        assert!(is_empty(""));
        assert!(is_empty("# Header\n## Tasks"));
        assert!(is_empty("<!-- comment -->\n\n- [ ]"));
        assert!(!is_empty("Check orders"));
        assert!(!is_empty("- [x] Done"));
        assert!(!is_empty("# Header\n- Send alert"));
    }

    #[test]
    fn test_is_heartbeat_ok() {
        assert!(is_heartbeat_ok(" HEARTBEAT_OK\n"));
        assert!(is_heartbeat_ok("HEARTBEAT_OK."));
        assert!(!is_heartbeat_ok("HEARTBEAT_OK but also this"));
    }

    #[tokio::test]
    async fn test_tick_missing_file() {
        let (_writer, reader) = StateStore::in_memory();
        let service = HeartbeatService::new(
            PathBuf::from("/nonexistent/HEARTBEAT.md"),
            60,
            Arc::new(MessageBus::new()),
            reader,
        );
        let result = service.trigger_now().await;
        assert!(!result.file_found);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_tick_skips_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader) = StateStore::in_memory();
        writer.record_activity("telegram", "1").await.unwrap();
        let bus = Arc::new(MessageBus::new());
        let service =
            HeartbeatService::new(write_file(&dir, "# Tasks\n\n"), 60, Arc::clone(&bus), reader);

        let result = service.trigger_now().await;
        assert!(result.file_found);
        assert!(!result.actionable);
        assert_eq!(bus.pending_inbound(), 0);
    }

    #[tokio::test]
    async fn test_tick_skips_without_target() {
        let dir = tempfile::tempdir().unwrap();
        let (_writer, reader) = StateStore::in_memory();
        let bus = Arc::new(MessageBus::new());
        let service = HeartbeatService::new(
            write_file(&dir, "- Check orders"),
            60,
            Arc::clone(&bus),
            reader,
        );

        let result = service.trigger_now().await;
        assert!(result.actionable);
        assert!(result.target.is_none());
        assert!(!result.delivered);
        assert_eq!(bus.pending_inbound(), 0);
    }

    #[tokio::test]
    async fn test_tick_targets_last_active_without_history() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader) = StateStore::in_memory();
        writer.record_activity("slack", "C42").await.unwrap();
        let bus = Arc::new(MessageBus::new());
        let service = HeartbeatService::new(
            write_file(&dir, "# Tasks\n- Check orders\n"),
            60,
            Arc::clone(&bus),
            reader,
        );

        let result = service.trigger_now().await;
        assert!(result.delivered);
        assert_eq!(result.target.as_deref(), Some("slack:C42"));

        let msg = bus.consume_inbound().await.unwrap();
        assert_eq!(msg.channel, "slack");
        assert_eq!(msg.chat_id, "C42");
        assert_eq!(msg.sender_id, HEARTBEAT_SENDER);
        assert!(msg.skips_history());
        assert!(msg.content.contains("Check orders"));
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (_writer, reader) = StateStore::in_memory();
        let service = HeartbeatService::new(
            PathBuf::from("/nonexistent/HEARTBEAT.md"),
            1,
            Arc::new(MessageBus::new()),
            reader,
        );
        assert_eq!(service.interval(), Duration::from_secs(MIN_INTERVAL_SECS));
        service.start();
        assert!(service.is_running());
        service.stop();
        for _ in 0..50 {
            if !service.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!service.is_running());
        assert!(service.is_healthy());
    }
}
