//! Reelcast - drip-feed short videos to YouTube, Instagram and TikTok
//!
//! This library holds the scheduling and upload-orchestration engine shared by
//! the `reel-send` daemon and the `reel-queue` / `reel-creds` tools. The tools
//! share nothing but the SQLite store.

pub mod config;
pub mod credentials;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod notify;
pub mod platforms;
pub mod queue;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod types;
pub mod when;

// Re-export commonly used types
pub use config::Config;
pub use credentials::{Credential, CredentialMonitor, CredentialStatus, RawCredential};
pub use db::Database;
pub use dispatch::{Dispatcher, TickReport};
pub use error::{PublishError, PublishErrorKind, ReelcastError, Result};
pub use queue::{NewMedia, TaskQueue};
pub use schedule::ScheduleConfig;
pub use service::Reelcast;
pub use types::{MediaItem, Platform, Task, TaskState};
