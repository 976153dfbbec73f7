//! Operator notifications
//!
//! The dispatcher and the credential monitor describe what happened as an
//! [`Event`] and hand it to a [`Notifier`], which fans it out to every
//! configured [`NotificationSink`]. Delivery is best-effort: each sink gets a
//! timeout, and failures are logged and otherwise ignored.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PublishErrorKind;
use crate::types::Platform;

pub mod events;
pub mod telegram;

pub use events::{EventBus, EventReceiver};
pub use telegram::TelegramSink;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Delivery rejected: {0}")]
    Rejected(String),

    #[error("Notifier misconfigured: {0}")]
    Config(String),
}

/// Something the operator should hear about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Publishing on a platform is blocked until its credential is re-linked
    AuthGap { platform: Platform, reason: String },

    /// A credential has not been verified for too long
    CredentialStale {
        platform: Platform,
        account: String,
        age_days: i64,
    },

    /// A task ran out of attempts or was rejected outright
    UploadFailed {
        task_id: String,
        media_id: String,
        platform: Platform,
        title: String,
        error_kind: PublishErrorKind,
        message: String,
        attempts: u32,
    },

    /// Every task of a media item is posted
    UploadSucceededEverywhere {
        media_id: String,
        title: String,
        media_reference: String,
        platforms: Vec<Platform>,
    },

    /// The failure streak crossed its threshold and dispatch is paused
    QueueAutoPaused {
        consecutive_failures: u32,
        reason: String,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::AuthGap { .. } => "auth_gap",
            Event::CredentialStale { .. } => "credential_stale",
            Event::UploadFailed { .. } => "upload_failed",
            Event::UploadSucceededEverywhere { .. } => "upload_succeeded_everywhere",
            Event::QueueAutoPaused { .. } => "queue_auto_paused",
        }
    }

    /// One-line human readable text for chat sinks and logs.
    pub fn summary(&self) -> String {
        match self {
            Event::AuthGap { platform, reason } => format!(
                "{} publishing is blocked: {}. Re-link the account with `reel-creds link {}`.",
                platform.label(),
                reason,
                platform
            ),
            Event::CredentialStale {
                platform,
                account,
                age_days,
            } => format!(
                "{} session for {} was last verified {} days ago. Refresh it soon.",
                platform.label(),
                account,
                age_days
            ),
            Event::UploadFailed {
                platform,
                title,
                error_kind,
                message,
                attempts,
                ..
            } => format!(
                "Upload of \"{}\" to {} failed after {} attempt(s) ({}): {}",
                title,
                platform.label(),
                attempts,
                error_kind,
                message
            ),
            Event::UploadSucceededEverywhere {
                title, platforms, ..
            } => {
                let names: Vec<&str> = platforms.iter().map(|p| p.label()).collect();
                format!("\"{}\" is live on {}", title, names.join(", "))
            }
            Event::QueueAutoPaused {
                consecutive_failures,
                reason,
            } => format!(
                "Queue paused after {} consecutive failures: {}. Resume with `reel-queue resume`.",
                consecutive_failures, reason
            ),
        }
    }
}

/// Destination for operator events.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    async fn notify(&self, event: &Event) -> Result<(), NotifyError>;
}

/// Fan-out over all configured sinks.
#[derive(Clone)]
pub struct Notifier {
    sinks: Vec<Arc<dyn NotificationSink>>,
    timeout: Duration,
}

impl Notifier {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sinks: Vec::new(),
            timeout,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Deliver to every sink concurrently. Never fails.
    pub async fn notify(&self, event: Event) {
        let deliveries = self.sinks.iter().map(|sink| {
            let event = &event;
            async move {
                match tokio::time::timeout(self.timeout, sink.notify(event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(
                        sink = sink.name(),
                        event = event.kind(),
                        error = %e,
                        "Notification delivery failed"
                    ),
                    Err(_) => tracing::warn!(
                        sink = sink.name(),
                        event = event.kind(),
                        timeout = ?self.timeout,
                        "Notification delivery timed out"
                    ),
                }
            }
        });
        futures::future::join_all(deliveries).await;
    }
}

/// Writes every event to the tracing log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, event: &Event) -> Result<(), NotifyError> {
        match event {
            Event::UploadSucceededEverywhere { .. } => {
                tracing::info!(event = event.kind(), "{}", event.summary())
            }
            _ => tracing::warn!(event = event.kind(), "{}", event.summary()),
        }
        Ok(())
    }
}

/// Keeps events in memory; used by tests and embedding applications.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of recorded events of the given kind (see [`Event::kind`])
    pub fn count(&self, kind: &str) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn notify(&self, event: &Event) -> Result<(), NotifyError> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn notify(&self, _event: &Event) -> Result<(), NotifyError> {
            Err(NotifyError::Rejected("chat not found".to_string()))
        }
    }

    struct SlowSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NotificationSink for SlowSink {
        fn name(&self) -> &str {
            "slow"
        }

        async fn notify(&self, _event: &Event) -> Result<(), NotifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn paused_event() -> Event {
        Event::QueueAutoPaused {
            consecutive_failures: 5,
            reason: "network down".to_string(),
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_other_sinks() {
        let memory = Arc::new(MemorySink::new());
        let notifier = Notifier::new(Duration::from_secs(1))
            .with_sink(Arc::new(FailingSink))
            .with_sink(memory.clone());

        notifier.notify(paused_event()).await;
        assert_eq!(memory.events(), vec![paused_event()]);
    }

    #[tokio::test]
    async fn test_slow_sink_is_cut_off() {
        let slow = Arc::new(SlowSink {
            calls: AtomicUsize::new(0),
        });
        let memory = Arc::new(MemorySink::new());
        let notifier = Notifier::new(Duration::from_millis(50))
            .with_sink(slow.clone())
            .with_sink(memory.clone());

        let started = std::time::Instant::now();
        notifier.notify(paused_event()).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
        assert_eq!(memory.count("queue_auto_paused"), 1);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = Event::UploadFailed {
            task_id: "t1".to_string(),
            media_id: "m1".to_string(),
            platform: Platform::Tiktok,
            title: "Cat".to_string(),
            error_kind: PublishErrorKind::PermanentReject,
            message: "duplicate".to_string(),
            attempts: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "upload_failed");
        assert_eq!(json["platform"], "tiktok");
        assert_eq!(json["error_kind"], "permanent_reject");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_summaries_name_the_platform() {
        let gap = Event::AuthGap {
            platform: Platform::Instagram,
            reason: "session expired".to_string(),
        };
        assert!(gap.summary().starts_with("Instagram publishing is blocked"));
        assert!(gap.summary().contains("reel-creds link instagram"));

        let done = Event::UploadSucceededEverywhere {
            media_id: "m".to_string(),
            title: "Sunset".to_string(),
            media_reference: "/v/sunset.mp4".to_string(),
            platforms: vec![Platform::Youtube, Platform::Tiktok],
        };
        assert_eq!(done.summary(), "\"Sunset\" is live on YouTube, TikTok");
    }
}
