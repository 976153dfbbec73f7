//! Error types for Reelcast

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Platform, TaskState};

pub type Result<T> = std::result::Result<T, ReelcastError>;

#[derive(Error, Debug)]
pub enum ReelcastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ReelcastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ReelcastError::InvalidInput(_) => 3,
            ReelcastError::Config(_) => 2,
            ReelcastError::Database(_) => 2,
            ReelcastError::Credential(_) => 2,
            ReelcastError::Publish(_) => 1,
            ReelcastError::Queue(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("No available slot within the scheduling horizon")]
    NoAvailableSlot,

    #[error("Not enough free slots: needed {needed}, found {found}")]
    InsufficientSlots { needed: usize, found: usize },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row data: {0}")]
    InvalidData(String),
}

#[derive(Error, Debug, Clone)]
pub enum CredentialError {
    #[error("No credential linked for {0}")]
    Missing(Platform),

    #[error("Credential for {platform} is {status}")]
    NotUsable { platform: Platform, status: String },

    #[error("Could not parse credential: {0}")]
    Unparseable(String),

    #[error("Verification failed: {0}")]
    Verification(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task {id} is {state}; {action} is not allowed")]
    InvalidTransition {
        id: String,
        state: TaskState,
        action: String,
    },

    #[error("Task {0} changed concurrently; try again")]
    Conflict(String),

    #[error("Slot {time} on {platform} is already taken")]
    SlotOccupied { platform: Platform, time: String },
}

/// Classification of a publish failure, driving the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishErrorKind {
    AuthExpired,
    RateLimited,
    TransientNetwork,
    PermanentReject,
    Timeout,
}

impl PublishErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishErrorKind::AuthExpired => "auth_expired",
            PublishErrorKind::RateLimited => "rate_limited",
            PublishErrorKind::TransientNetwork => "transient_network",
            PublishErrorKind::PermanentReject => "permanent_reject",
            PublishErrorKind::Timeout => "timeout",
        }
    }

    /// Auth failures wait for a re-link and do not use up an attempt.
    pub fn consumes_attempt(&self) -> bool {
        !matches!(self, PublishErrorKind::AuthExpired)
    }

    pub fn counts_toward_streak(&self) -> bool {
        !matches!(self, PublishErrorKind::AuthExpired)
    }
}

impl fmt::Display for PublishErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PublishErrorKind {
    type Err = ReelcastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "auth_expired" => Ok(PublishErrorKind::AuthExpired),
            "rate_limited" => Ok(PublishErrorKind::RateLimited),
            "transient_network" | "network" => Ok(PublishErrorKind::TransientNetwork),
            "permanent_reject" | "rejected" => Ok(PublishErrorKind::PermanentReject),
            "timeout" => Ok(PublishErrorKind::Timeout),
            other => Err(ReelcastError::InvalidInput(format!(
                "Unknown publish error kind: {}",
                other
            ))),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum PublishError {
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Network error: {0}")]
    TransientNetwork(String),

    #[error("Rejected by platform: {0}")]
    PermanentReject(String),

    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),
}

impl PublishError {
    pub fn new(kind: PublishErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            PublishErrorKind::AuthExpired => PublishError::AuthExpired(message),
            PublishErrorKind::RateLimited => PublishError::RateLimited(message),
            PublishErrorKind::TransientNetwork => PublishError::TransientNetwork(message),
            PublishErrorKind::PermanentReject => PublishError::PermanentReject(message),
            PublishErrorKind::Timeout => PublishError::Timeout(Duration::ZERO),
        }
    }

    pub fn kind(&self) -> PublishErrorKind {
        match self {
            PublishError::AuthExpired(_) => PublishErrorKind::AuthExpired,
            PublishError::RateLimited(_) => PublishErrorKind::RateLimited,
            PublishError::TransientNetwork(_) => PublishErrorKind::TransientNetwork,
            PublishError::PermanentReject(_) => PublishErrorKind::PermanentReject,
            PublishError::Timeout(_) => PublishErrorKind::Timeout,
        }
    }
}

impl From<ReelcastError> for PublishError {
    /// Anything that is not already a publish failure is treated as transient.
    fn from(err: ReelcastError) -> Self {
        match err {
            ReelcastError::Publish(inner) => inner,
            other => PublishError::TransientNetwork(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = ReelcastError::InvalidInput("Empty title".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_config_error() {
        let error = ReelcastError::Config(ConfigError::MissingField("database.path".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_database_error() {
        let db_error = DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "File not found",
        ));
        assert_eq!(ReelcastError::Database(db_error).exit_code(), 2);
    }

    #[test]
    fn test_exit_code_queue_error() {
        let error = ReelcastError::Queue(QueueError::NotFound("abc".to_string()));
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_error_message_formatting_slots() {
        let error = ReelcastError::Config(ConfigError::InsufficientSlots {
            needed: 4,
            found: 2,
        });
        assert_eq!(
            error.to_string(),
            "Configuration error: Not enough free slots: needed 4, found 2"
        );
    }

    #[test]
    fn test_error_message_formatting_transition() {
        let error = QueueError::InvalidTransition {
            id: "t1".to_string(),
            state: TaskState::Posted,
            action: "reschedule".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Task t1 is posted; reschedule is not allowed"
        );
    }

    #[test]
    fn test_publish_error_kinds() {
        assert_eq!(
            PublishError::AuthExpired("x".into()).kind(),
            PublishErrorKind::AuthExpired
        );
        assert_eq!(
            PublishError::Timeout(Duration::from_secs(5)).kind(),
            PublishErrorKind::Timeout
        );
        assert!(!PublishErrorKind::AuthExpired.consumes_attempt());
        assert!(PublishErrorKind::RateLimited.consumes_attempt());
        assert!(PublishErrorKind::PermanentReject.counts_toward_streak());
    }

    #[test]
    fn test_publish_timeout_message() {
        let error = PublishError::Timeout(Duration::from_secs(90));
        assert_eq!(error.to_string(), "Publish timed out after 90s");
    }

    #[test]
    fn test_publish_error_kind_parsing() {
        assert_eq!(
            "auth_expired".parse::<PublishErrorKind>().unwrap(),
            PublishErrorKind::AuthExpired
        );
        assert_eq!(
            "Network".parse::<PublishErrorKind>().unwrap(),
            PublishErrorKind::TransientNetwork
        );
        assert!("bogus".parse::<PublishErrorKind>().is_err());
    }

    #[test]
    fn test_non_publish_error_becomes_transient() {
        let err: PublishError = ReelcastError::InvalidInput("bad".to_string()).into();
        assert_eq!(err.kind(), PublishErrorKind::TransientNetwork);

        let err: PublishError =
            ReelcastError::Publish(PublishError::PermanentReject("nope".into())).into();
        assert_eq!(err.kind(), PublishErrorKind::PermanentReject);
    }

    #[test]
    fn test_error_conversion_from_config_error() {
        let err: ReelcastError = ConfigError::NoAvailableSlot.into();
        assert!(matches!(err, ReelcastError::Config(ConfigError::NoAvailableSlot)));
    }
}
