//! Core types for Reelcast

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DbError, ReelcastError, Result};

/// Publishing target. One task per platform is created for every media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Instagram,
    Tiktok,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Youtube, Platform::Instagram, Platform::Tiktok];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Youtube => "youtube",
            Platform::Instagram => "instagram",
            Platform::Tiktok => "tiktok",
        }
    }

    /// Human-facing name used in notifications
    pub fn label(&self) -> &'static str {
        match self {
            Platform::Youtube => "YouTube",
            Platform::Instagram => "Instagram",
            Platform::Tiktok => "TikTok",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ReelcastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "youtube" | "yt" => Ok(Platform::Youtube),
            "instagram" | "ig" => Ok(Platform::Instagram),
            "tiktok" | "tt" => Ok(Platform::Tiktok),
            other => Err(ReelcastError::InvalidInput(format!(
                "Unknown platform '{}'. Expected one of: youtube, instagram, tiktok",
                other
            ))),
        }
    }
}

/// Lifecycle of a publish task.
///
/// `pending -> due -> publishing -> {posted | retry_pending | failed}`, with
/// `retry_pending -> due` once its retry time has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Due,
    Publishing,
    Posted,
    RetryPending,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Due => "due",
            TaskState::Publishing => "publishing",
            TaskState::Posted => "posted",
            TaskState::RetryPending => "retry_pending",
            TaskState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Posted | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = ReelcastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(TaskState::Pending),
            "due" => Ok(TaskState::Due),
            "publishing" => Ok(TaskState::Publishing),
            "posted" => Ok(TaskState::Posted),
            "retry_pending" | "retry" => Ok(TaskState::RetryPending),
            "failed" => Ok(TaskState::Failed),
            other => Err(ReelcastError::InvalidInput(format!(
                "Unknown task state: {}",
                other
            ))),
        }
    }
}

/// One uploaded video and the copy that goes with it on every platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaItem {
    pub id: String,
    pub media_reference: String,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl MediaItem {
    pub fn new(
        media_reference: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            media_reference: media_reference.into(),
            title: title.into(),
            description: description.into(),
            created_at,
        }
    }
}

/// A single (media item, platform, slot) publish job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub media_id: String,
    pub media_reference: String,
    pub title: String,
    pub description: String,
    pub platform: Platform,
    pub scheduled_time: DateTime<Utc>,
    pub state: TaskState,
    pub attempt_count: u32,
    pub retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub posted_id: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A fresh pending task for `media` on `platform` at `scheduled_time`.
    pub fn new(
        media: &MediaItem,
        platform: Platform,
        scheduled_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            media_id: media.id.clone(),
            media_reference: media.media_reference.clone(),
            title: media.title.clone(),
            description: media.description.clone(),
            platform,
            scheduled_time,
            state: TaskState::Pending,
            attempt_count: 0,
            retry_at: None,
            last_error: None,
            posted_id: None,
            posted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The instant at which this task becomes eligible for dispatch.
    pub fn eligible_at(&self) -> DateTime<Utc> {
        match (self.state, self.retry_at) {
            (TaskState::RetryPending, Some(retry_at)) => retry_at,
            _ => self.scheduled_time,
        }
    }
}

/// One row of the append-only transition log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskTransition {
    pub task_id: String,
    pub from_state: Option<TaskState>,
    pub to_state: TaskState,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

/// Durable pause flag and failure streak.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QueueState {
    pub paused: bool,
    pub paused_at: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
    pub consecutive_failures: u32,
    pub streak_started_at: Option<DateTime<Utc>>,
}

/// Task count for one (platform, state) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateCount {
    pub platform: Platform,
    pub state: TaskState,
    pub count: i64,
}

/// Filter for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub platform: Option<Platform>,
    pub state: Option<TaskState>,
    pub media_id: Option<String>,
    pub limit: Option<usize>,
}

/// Store-format timestamp: RFC 3339, UTC, millisecond precision.
pub fn to_db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn from_db_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::InvalidData(format!("bad timestamp '{}': {}", raw, e)).into())
}

/// Truncate to the precision the store keeps.
pub fn db_precision(at: DateTime<Utc>) -> DateTime<Utc> {
    from_db_time(&to_db_time(at)).unwrap_or(at)
}
