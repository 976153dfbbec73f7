//! Retry and backoff decisions
//!
//! The controller classifies a failed publish into a [`Decision`] and keeps the
//! durable failure streak that trips the queue-wide auto-pause. It does not
//! move tasks itself; the dispatcher applies the decision.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::RetryConfig;
use crate::credentials::to_chrono;
use crate::db::Database;
use crate::error::{ConfigError, PublishError, PublishErrorKind, Result};
use crate::types::Task;

/// Growth factor for attempts past the configured backoff steps
const BACKOFF_GROWTH: i32 = 4;

/// Caps the growth exponent so the delay never overflows
const MAX_GROWTH_STEPS: u32 = 8;

/// What happens to the failed task itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    RetryAt(DateTime<Utc>),
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    RetryAt(DateTime<Utc>),
    Fail,
    /// The failure streak reached the threshold: apply the disposition and
    /// pause the whole queue
    PauseQueue(Disposition),
}

impl Decision {
    pub fn disposition(&self) -> Disposition {
        match self {
            Decision::RetryAt(at) => Disposition::RetryAt(*at),
            Decision::Fail => Disposition::Fail,
            Decision::PauseQueue(disposition) => *disposition,
        }
    }

    pub fn pauses_queue(&self) -> bool {
        matches!(self, Decision::PauseQueue(_))
    }
}

/// A decision plus the attempt count to store with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub attempt_count: u32,
    pub decision: Decision,
    /// Failure streak after this failure; `None` when the kind is not counted
    pub streak: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
    pub auth_gap_backoff: Duration,
    pub pause_threshold: u32,
    pub pause_window: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: vec![Duration::minutes(5), Duration::minutes(30), Duration::hours(2)],
            auth_gap_backoff: Duration::minutes(30),
            pause_threshold: 5,
            pause_window: Duration::minutes(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Result<Self> {
        let backoff = config
            .backoff
            .iter()
            .map(|step| to_chrono(*step, "retry.backoff"))
            .collect::<Result<Vec<_>>>()?;
        if backoff.is_empty() || backoff.windows(2).any(|w| w[1] <= w[0]) {
            return Err(ConfigError::InvalidValue {
                field: "retry.backoff".to_string(),
                message: "steps must be non-empty and strictly increasing".to_string(),
            }
            .into());
        }

        Ok(Self {
            max_attempts: config.max_attempts.max(1),
            backoff,
            auth_gap_backoff: to_chrono(config.auth_gap_backoff, "retry.auth_gap_backoff")?,
            pause_threshold: config.pause_threshold.max(1),
            pause_window: to_chrono(config.pause_window, "retry.pause_window")?,
        })
    }

    /// Delay before retrying after the `attempt`-th failed attempt (1-based).
    ///
    /// Attempts past the configured steps multiply the last step by 4 per
    /// extra attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let index = attempt.max(1) as usize - 1;
        if let Some(step) = self.backoff.get(index) {
            return *step;
        }

        let last = self.backoff.last().copied().unwrap_or(Duration::minutes(5));
        let extra = (index + 1 - self.backoff.len()) as u32;
        let mut delay = last;
        for _ in 0..extra.min(MAX_GROWTH_STEPS) {
            delay = delay * BACKOFF_GROWTH;
        }
        delay
    }

    /// Decision for one failure, before the failure streak is considered.
    ///
    /// `attempt_count` is the task's count including this attempt.
    pub fn classify(&self, kind: PublishErrorKind, attempt_count: u32, now: DateTime<Utc>) -> Disposition {
        match kind {
            PublishErrorKind::AuthExpired => Disposition::RetryAt(now + self.auth_gap_backoff),
            PublishErrorKind::PermanentReject => Disposition::Fail,
            PublishErrorKind::RateLimited
            | PublishErrorKind::TransientNetwork
            | PublishErrorKind::Timeout => {
                if attempt_count < self.max_attempts {
                    Disposition::RetryAt(now + self.backoff_for(attempt_count))
                } else {
                    Disposition::Fail
                }
            }
        }
    }

    pub fn decide(
        &self,
        kind: PublishErrorKind,
        attempt_count: u32,
        streak: Option<u32>,
        now: DateTime<Utc>,
    ) -> Decision {
        let disposition = self.classify(kind, attempt_count, now);
        match (streak, disposition) {
            (Some(streak), disposition) if streak >= self.pause_threshold => {
                Decision::PauseQueue(disposition)
            }
            (_, Disposition::RetryAt(at)) => Decision::RetryAt(at),
            (_, Disposition::Fail) => Decision::Fail,
        }
    }
}

/// Applies [`RetryPolicy`] against the durable failure streak
#[derive(Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    db: Arc<Database>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, db: Arc<Database>) -> Self {
        Self { policy, db }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn on_failure(&self, task: &Task, error: &PublishError, now: DateTime<Utc>) -> Result<Verdict> {
        let kind = error.kind();
        let attempt_count = if kind.consumes_attempt() {
            task.attempt_count + 1
        } else {
            task.attempt_count
        };

        let streak = if kind.counts_toward_streak() {
            Some(self.db.record_failure(now, self.policy.pause_window).await?)
        } else {
            None
        };

        let decision = self.policy.decide(kind, attempt_count, streak, now);
        tracing::debug!(
            task_id = %task.id,
            platform = %task.platform,
            kind = %kind,
            attempt_count,
            ?streak,
            ?decision,
            "Failure classified"
        );

        Ok(Verdict {
            attempt_count,
            decision,
            streak,
        })
    }

    /// A success ends the failure streak.
    pub async fn on_success(&self) -> Result<()> {
        self.db.reset_failures().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MediaItem, Platform};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 6, 12, 0, 0).unwrap()
    }

    fn task(attempt_count: u32) -> Task {
        let media = MediaItem::new("/v/a.mp4", "A", "", now());
        let mut task = Task::new(&media, Platform::Youtube, now(), now());
        task.attempt_count = attempt_count;
        task
    }

    #[test]
    fn test_backoff_steps_and_extension() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::minutes(5));
        assert_eq!(policy.backoff_for(2), Duration::minutes(30));
        assert_eq!(policy.backoff_for(3), Duration::hours(2));
        assert_eq!(policy.backoff_for(4), Duration::hours(8));
        assert_eq!(policy.backoff_for(5), Duration::hours(32));

        let delays: Vec<Duration> = (1..=10).map(|n| policy.backoff_for(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_classify_by_kind() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.classify(PublishErrorKind::AuthExpired, 0, now()),
            Disposition::RetryAt(now() + Duration::minutes(30))
        );
        assert_eq!(
            policy.classify(PublishErrorKind::PermanentReject, 1, now()),
            Disposition::Fail
        );
        assert_eq!(
            policy.classify(PublishErrorKind::RateLimited, 1, now()),
            Disposition::RetryAt(now() + Duration::minutes(5))
        );
        assert_eq!(
            policy.classify(PublishErrorKind::Timeout, 2, now()),
            Disposition::RetryAt(now() + Duration::minutes(30))
        );
        assert_eq!(
            policy.classify(PublishErrorKind::TransientNetwork, 3, now()),
            Disposition::Fail
        );
    }

    #[test]
    fn test_streak_threshold_pauses() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(PublishErrorKind::TransientNetwork, 1, Some(4), now()),
            Decision::RetryAt(now() + Duration::minutes(5))
        );
        assert_eq!(
            policy.decide(PublishErrorKind::TransientNetwork, 1, Some(5), now()),
            Decision::PauseQueue(Disposition::RetryAt(now() + Duration::minutes(5)))
        );
        assert_eq!(
            policy.decide(PublishErrorKind::PermanentReject, 1, Some(6), now()),
            Decision::PauseQueue(Disposition::Fail)
        );
    }

    #[test]
    fn test_from_config_rejects_unordered_backoff() {
        let mut config = RetryConfig::default();
        config.backoff = vec![
            std::time::Duration::from_secs(600),
            std::time::Duration::from_secs(60),
        ];
        assert!(RetryPolicy::from_config(&config).is_err());

        let policy = RetryPolicy::from_config(&RetryConfig::default()).unwrap();
        assert_eq!(policy, RetryPolicy::default());
    }

    #[tokio::test]
    async fn test_auth_expired_consumes_nothing() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let controller = RetryController::new(RetryPolicy::default(), db.clone());

        let verdict = controller
            .on_failure(&task(1), &PublishError::AuthExpired("token revoked".into()), now())
            .await
            .unwrap();
        assert_eq!(verdict.attempt_count, 1);
        assert_eq!(verdict.streak, None);
        assert_eq!(db.queue_state().await.unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_max() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let controller = RetryController::new(RetryPolicy::default(), db);

        let mut current = task(0);
        let mut decisions = Vec::new();
        loop {
            let verdict = controller
                .on_failure(&current, &PublishError::TransientNetwork("reset".into()), now())
                .await
                .unwrap();
            assert!(verdict.attempt_count <= 3);
            current.attempt_count = verdict.attempt_count;
            decisions.push(verdict.decision);
            if verdict.decision.disposition() == Disposition::Fail {
                break;
            }
        }
        assert_eq!(decisions.len(), 3);
        assert_eq!(current.attempt_count, 3);
    }

    #[tokio::test]
    async fn test_streak_window_and_reset() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let controller = RetryController::new(RetryPolicy::default(), db.clone());
        let error = PublishError::RateLimited("429".into());

        for i in 0..4 {
            let verdict = controller
                .on_failure(&task(0), &error, now() + Duration::minutes(i))
                .await
                .unwrap();
            assert!(!verdict.decision.pauses_queue());
        }
        // Outside the 30 minute window the streak restarts
        let verdict = controller
            .on_failure(&task(0), &error, now() + Duration::minutes(45))
            .await
            .unwrap();
        assert_eq!(verdict.streak, Some(1));

        controller.on_success().await.unwrap();
        assert_eq!(db.queue_state().await.unwrap().consecutive_failures, 0);

        let mut last = None;
        for i in 0..5 {
            last = Some(
                controller
                    .on_failure(&task(0), &error, now() + Duration::minutes(60 + i))
                    .await
                    .unwrap(),
            );
        }
        assert!(last.unwrap().decision.pauses_queue());
    }
}
