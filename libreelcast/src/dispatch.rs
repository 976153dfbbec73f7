//! Dispatch loop
//!
//! Each tick pulls the due tasks, splits them into one lane per platform and
//! runs the lanes concurrently. Inside a lane tasks are published one at a
//! time in scheduled order, so a platform never has two uploads in flight.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::credentials::{Credential, CredentialMonitor, Gate};
use crate::error::{PublishError, PublishErrorKind, ReelcastError, Result};
use crate::notify::{Event, Notifier};
use crate::platforms::{PublishRequest, Publisher, PublisherRegistry};
use crate::queue::TaskQueue;
use crate::retry::{Decision, Disposition, RetryController};
use crate::types::{from_db_time, to_db_time, Platform, Task, TaskFilter, TaskState};

const HEALTH_CHECK_KEY: &str = "health_check.last_run";

/// Slack on top of the publish timeout before a `publishing` row counts as orphaned
const RECOVERY_GRACE: Duration = Duration::from_secs(60);

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub paused: bool,
    pub health_checked: bool,
    /// Orphaned uploads put back in line
    pub recovered: usize,
    pub posted: usize,
    pub retried: usize,
    pub failed: usize,
    /// Tasks sent back to wait for a usable credential
    pub deferred: usize,
    /// Tasks another process changed under us
    pub conflicts: usize,
    pub auto_paused: bool,
    /// Platforms with due tasks but no registered publisher
    pub unhandled: Vec<Platform>,
}

impl TickReport {
    fn merge(&mut self, lane: TickReport) {
        self.posted += lane.posted;
        self.retried += lane.retried;
        self.failed += lane.failed;
        self.deferred += lane.deferred;
        self.conflicts += lane.conflicts;
        self.auto_paused |= lane.auto_paused;
    }

    pub fn processed(&self) -> usize {
        self.posted + self.retried + self.failed + self.deferred
    }
}

pub struct Dispatcher {
    queue: TaskQueue,
    publishers: PublisherRegistry,
    credentials: CredentialMonitor,
    retry: RetryController,
    notifier: Notifier,
    publish_timeout: Duration,
    health_check_interval: chrono::Duration,
    jitter: (Duration, Duration),
}

impl Dispatcher {
    pub fn new(
        queue: TaskQueue,
        publishers: PublisherRegistry,
        credentials: CredentialMonitor,
        retry: RetryController,
        notifier: Notifier,
    ) -> Self {
        Self {
            queue,
            publishers,
            credentials,
            retry,
            notifier,
            publish_timeout: Duration::from_secs(15 * 60),
            health_check_interval: chrono::Duration::hours(6),
            jitter: (Duration::ZERO, Duration::ZERO),
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_health_check_interval(mut self, interval: chrono::Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Random pause in `[min, max]` before each upload
    pub fn with_jitter(mut self, min: Duration, max: Duration) -> Self {
        self.jitter = (min, max.max(min));
        self
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Reset uploads left `publishing` longer than any live publish can run.
    ///
    /// An upload still owned by a running daemon is never touched.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let stale_after = chrono::Duration::from_std(self.publish_timeout + RECOVERY_GRACE)
            .map_err(|_| ReelcastError::InvalidInput("publish timeout is out of range".to_string()))?;
        self.queue.recover(stale_after, now).await
    }

    /// Run until `shutdown` is set. In-flight uploads finish before exit.
    pub async fn run(&self, poll_interval: Duration, shutdown: Arc<AtomicBool>) -> Result<()> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Shutdown requested, stopping dispatch loop");
                break;
            }

            match self.tick(Utc::now()).await {
                Ok(report) if report.processed() > 0 || report.auto_paused => {
                    info!(?report, "Tick finished")
                }
                Ok(report) => debug!(?report, "Tick finished"),
                Err(e) => error!(error = %e, "Tick failed; retrying next interval"),
            }

            // Sleep until next poll (check shutdown every second)
            let mut waited = Duration::ZERO;
            while waited < poll_interval {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let step = Duration::from_secs(1).min(poll_interval - waited);
                sleep(step).await;
                waited += step;
            }
        }

        Ok(())
    }

    /// One pass over the due tasks.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        let recovered = self.recover(now).await?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "Recovered interrupted uploads");
            report.recovered = recovered.len();
        }

        if self.queue.queue_state().await?.paused {
            debug!("Queue is paused; nothing dispatched");
            report.paused = true;
            return Ok(report);
        }

        report.health_checked = self.health_check_if_due(now).await?;

        let due = self.queue.due(now).await?;
        if due.is_empty() {
            return Ok(report);
        }
        info!(count = due.len(), "Found due task(s)");

        let mut lanes: BTreeMap<Platform, Vec<Task>> = BTreeMap::new();
        for task in due {
            lanes.entry(task.platform).or_default().push(task);
        }

        let mut runnable = Vec::new();
        for (platform, tasks) in lanes {
            match self.publishers.get(platform) {
                Some(publisher) => runnable.push((publisher, tasks)),
                None => {
                    warn!(platform = %platform, count = tasks.len(), "No publisher configured; leaving tasks queued");
                    report.unhandled.push(platform);
                }
            }
        }

        let results = join_all(
            runnable
                .into_iter()
                .map(|(publisher, tasks)| self.run_lane(publisher, tasks, now)),
        )
        .await;

        for result in results {
            match result {
                Ok(lane) => report.merge(lane),
                Err(e) => error!(error = %e, "Lane aborted"),
            }
        }

        Ok(report)
    }

    async fn health_check_if_due(&self, now: DateTime<Utc>) -> Result<bool> {
        let db = self.queue.db();
        let last_run = db
            .get_setting(HEALTH_CHECK_KEY)
            .await?
            .and_then(|raw| from_db_time(&raw).ok());
        if let Some(last_run) = last_run {
            if now - last_run < self.health_check_interval {
                return Ok(false);
            }
        }

        match self.credentials.health_check(now).await {
            Ok(report) => debug!(?report, "Credential health check"),
            Err(e) => error!(error = %e, "Credential health check failed"),
        }
        db.set_setting(HEALTH_CHECK_KEY, &to_db_time(now), now).await?;
        Ok(true)
    }

    /// Publish one platform's due tasks in order.
    async fn run_lane(
        &self,
        publisher: Arc<dyn Publisher>,
        tasks: Vec<Task>,
        now: DateTime<Utc>,
    ) -> Result<TickReport> {
        let platform = publisher.platform();
        let mut report = TickReport::default();
        let lane_started = Instant::now();
        let clock = || lane_clock(now, lane_started);

        for mut task in tasks {
            if self.queue.queue_state().await?.paused {
                debug!(platform = %platform, "Queue paused mid-tick; stopping lane");
                break;
            }

            let pause = self.jitter_delay();
            if !pause.is_zero() {
                debug!(platform = %platform, delay_ms = pause.as_millis() as u64, "Waiting before upload");
                sleep(pause).await;
            }
            let now = clock();

            if !self.queue.mark_due(&task, now).await? {
                report.conflicts += 1;
                continue;
            }
            task.state = TaskState::Due;

            let credential = match self.credentials.gate(platform, now).await? {
                Gate::Ready(credential) => credential,
                Gate::Blocked(reason) => {
                    let reason = reason.to_string();
                    let retry_at = now + self.retry.policy().auth_gap_backoff;
                    if self.queue.defer_for_auth(&task.id, retry_at, &reason, now).await? {
                        report.deferred += 1;
                    }
                    warn!(platform = %platform, task_id = %task.id, reason = %reason, "Credential not usable; deferring platform");
                    self.credentials.raise_auth_gap(platform, &reason, now).await?;
                    break;
                }
            };

            // Another process holds the platform; later slots wait for the next tick
            if !self.queue.claim(&task, clock()).await? {
                report.conflicts += 1;
                break;
            }
            task.state = TaskState::Publishing;

            info!(platform = %platform, task_id = %task.id, title = %task.title, "Publishing");
            let outcome = match tokio::time::timeout(
                self.publish_timeout,
                publisher.publish(&PublishRequest::from_task(&task), &credential),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(PublishError::Timeout(self.publish_timeout)),
            };
            let finished = clock();

            match outcome {
                Ok(receipt) => {
                    self.on_posted(&task, &receipt.posted_id, finished).await?;
                    report.posted += 1;
                }
                Err(e) => {
                    let decision = self.on_failed(&task, &credential, &e, finished).await?;
                    match decision.disposition() {
                        Disposition::RetryAt(_) => report.retried += 1,
                        Disposition::Fail => report.failed += 1,
                    }
                    if decision.pauses_queue() {
                        report.auto_paused = true;
                        break;
                    }
                }
            }
        }

        Ok(report)
    }

    fn jitter_delay(&self) -> Duration {
        let (min, max) = self.jitter;
        if max.is_zero() {
            return Duration::ZERO;
        }
        let millis = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
        Duration::from_millis(millis)
    }

    async fn on_posted(&self, task: &Task, posted_id: &str, now: DateTime<Utc>) -> Result<()> {
        if !self.queue.mark_posted(&task.id, posted_id, now).await? {
            warn!(task_id = %task.id, "Task left publishing before its result was recorded");
            return Ok(());
        }
        self.retry.on_success().await?;
        info!(platform = %task.platform, task_id = %task.id, posted_id, "Posted");

        if let Some(media) = self.queue.complete_media(&task.media_id, now).await? {
            let mut platforms: Vec<Platform> = self
                .queue
                .list(&TaskFilter {
                    media_id: Some(media.id.clone()),
                    ..Default::default()
                })
                .await?
                .into_iter()
                .map(|t| t.platform)
                .collect();
            platforms.sort();
            platforms.dedup();

            self.notifier
                .notify(Event::UploadSucceededEverywhere {
                    media_id: media.id,
                    title: media.title,
                    media_reference: media.media_reference,
                    platforms,
                })
                .await;
        }
        Ok(())
    }

    async fn on_failed(
        &self,
        task: &Task,
        credential: &Credential,
        error: &PublishError,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let verdict = self.retry.on_failure(task, error, now).await?;
        let message = error.to_string();
        warn!(
            platform = %task.platform,
            task_id = %task.id,
            kind = %error.kind(),
            attempt = verdict.attempt_count,
            error = %message,
            "Publish failed"
        );

        if error.kind() == PublishErrorKind::AuthExpired {
            self.credentials.invalidate(credential, &message, now).await?;
        }

        match verdict.decision.disposition() {
            Disposition::RetryAt(retry_at) => {
                self.queue
                    .schedule_retry(&task.id, verdict.attempt_count, retry_at, &message, now)
                    .await?;
            }
            Disposition::Fail => {
                if self
                    .queue
                    .mark_failed(&task.id, verdict.attempt_count, &message, now)
                    .await?
                {
                    self.notifier
                        .notify(Event::UploadFailed {
                            task_id: task.id.clone(),
                            media_id: task.media_id.clone(),
                            platform: task.platform,
                            title: task.title.clone(),
                            error_kind: error.kind(),
                            message: message.clone(),
                            attempts: verdict.attempt_count,
                        })
                        .await;
                }
            }
        }

        if verdict.decision.pauses_queue() {
            let streak = verdict.streak.unwrap_or_default();
            let reason = format!(
                "{} consecutive publish failures within {} min",
                streak,
                self.retry.policy().pause_window.num_minutes()
            );
            if self.queue.pause(&reason, now).await? {
                self.notifier
                    .notify(Event::QueueAutoPaused {
                        consecutive_failures: streak,
                        reason,
                    })
                    .await;
            }
        }

        Ok(verdict.decision)
    }
}

/// Tick time advanced by the wall time spent in the lane so far
fn lane_clock(tick: DateTime<Utc>, lane_started: Instant) -> DateTime<Utc> {
    tick + chrono::Duration::from_std(lane_started.elapsed()).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialPolicy, RawCredential};
    use crate::db::Database;
    use crate::notify::MemorySink;
    use crate::platforms::mock::MockPublisher;
    use crate::queue::NewMedia;
    use crate::retry::RetryPolicy;
    use crate::schedule::ScheduleConfig;
    use chrono::{NaiveTime, TimeZone, Weekday};
    use chrono_tz::Tz;
    use tempfile::TempDir;

    struct Harness {
        dispatcher: Dispatcher,
        sink: Arc<MemorySink>,
        _dir: TempDir,
        tasks: Vec<Task>,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap()
    }

    async fn harness(publishers: Vec<Arc<MockPublisher>>, media: usize) -> Harness {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::in_memory().await.unwrap());
        let schedule = ScheduleConfig::new(
            &[Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri, Weekday::Sat, Weekday::Sun],
            &[NaiveTime::from_hms_opt(9, 0, 0).unwrap()],
            Tz::UTC,
            false,
        )
        .unwrap();
        let queue = TaskQueue::new(db.clone(), schedule);

        let sink = Arc::new(MemorySink::new());
        let notifier = Notifier::new(std::time::Duration::from_secs(1)).with_sink(sink.clone());
        let credentials = CredentialMonitor::new(db.clone(), CredentialPolicy::default(), notifier.clone());

        let mut registry = PublisherRegistry::new();
        let mut platforms = Vec::new();
        for publisher in publishers {
            platforms.push(publisher.platform());
            credentials
                .store()
                .link(publisher.platform(), "main", RawCredential::Token("tok".into()), now())
                .await
                .unwrap();
            registry.register(publisher);
        }

        let items: Vec<NewMedia> = (0..media)
            .map(|i| {
                let path = dir.path().join(format!("{}.mp4", i));
                std::fs::write(&path, b"video").unwrap();
                NewMedia::new(path.to_string_lossy(), format!("Video {}", i), "")
            })
            .collect();
        let tasks = if items.is_empty() {
            Vec::new()
        } else {
            queue.enqueue(items, &platforms, now()).await.unwrap()
        };

        let retry = RetryController::new(RetryPolicy::default(), db);
        Harness {
            dispatcher: Dispatcher::new(queue, registry, credentials, retry, notifier),
            sink,
            _dir: dir,
            tasks,
        }
    }

    #[tokio::test]
    async fn test_nothing_due_before_slot() {
        let publisher = Arc::new(MockPublisher::success(Platform::Youtube));
        let h = harness(vec![publisher.clone()], 1).await;

        let report = h.dispatcher.tick(now()).await.unwrap();
        assert_eq!(report.processed(), 0);
        assert!(report.health_checked);
        assert_eq!(publisher.publish_call_count(), 0);
    }

    #[tokio::test]
    async fn test_posts_in_order_and_notifies_when_complete() {
        let youtube = Arc::new(MockPublisher::success(Platform::Youtube));
        let tiktok = Arc::new(MockPublisher::success(Platform::Tiktok));
        let h = harness(vec![youtube.clone(), tiktok.clone()], 2).await;

        let later = now() + chrono::Duration::days(3);
        let report = h.dispatcher.tick(later).await.unwrap();
        assert_eq!(report.posted, 4);

        let mut expected: Vec<&Task> = h.tasks.iter().filter(|t| t.platform == Platform::Youtube).collect();
        expected.sort_by_key(|t| t.scheduled_time);
        let expected: Vec<String> = expected.iter().map(|t| t.id.clone()).collect();
        assert_eq!(youtube.published(), expected);

        assert_eq!(h.sink.count("upload_succeeded_everywhere"), 2);
        assert_eq!(h.dispatcher.queue().due(later).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_retry() {
        let publisher = Arc::new(MockPublisher::always_failing(
            Platform::Instagram,
            PublishError::TransientNetwork("connection reset".into()),
            1,
        ));
        let h = harness(vec![publisher.clone()], 1).await;
        let later = now() + chrono::Duration::days(1);

        let report = h.dispatcher.tick(later).await.unwrap();
        assert_eq!(report.retried, 1);

        let task = h.dispatcher.queue().get(&h.tasks[0].id).await.unwrap();
        assert_eq!(task.state, TaskState::RetryPending);
        assert_eq!(task.attempt_count, 1);
        assert!(task.retry_at.unwrap() >= later + chrono::Duration::minutes(5));

        // Not eligible until the backoff elapses
        let report = h.dispatcher.tick(later + chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(report.processed(), 0);

        let report = h.dispatcher.tick(later + chrono::Duration::minutes(10)).await.unwrap();
        assert_eq!(report.posted, 1);
        assert_eq!(publisher.publish_call_count(), 2);
    }

    #[tokio::test]
    async fn test_permanent_reject_fails_and_notifies() {
        let publisher = Arc::new(MockPublisher::always_failing(
            Platform::Youtube,
            PublishError::PermanentReject("too long".into()),
            1,
        ));
        let h = harness(vec![publisher], 1).await;
        let report = h.dispatcher.tick(now() + chrono::Duration::days(1)).await.unwrap();
        assert_eq!(report.failed, 1);

        let task = h.dispatcher.queue().get(&h.tasks[0].id).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(h.sink.count("upload_failed"), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let publisher = Arc::new(MockPublisher::with_delay(
            Platform::Tiktok,
            std::time::Duration::from_millis(500),
        ));
        let h = harness(vec![publisher], 1).await;
        let dispatcher = h.dispatcher.with_publish_timeout(Duration::from_millis(20));

        let report = dispatcher.tick(now() + chrono::Duration::days(1)).await.unwrap();
        assert_eq!(report.retried, 1);
        let task = dispatcher.queue().get(&h.tasks[0].id).await.unwrap();
        assert!(task.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_paused_queue_processes_nothing() {
        let publisher = Arc::new(MockPublisher::success(Platform::Youtube));
        let h = harness(vec![publisher.clone()], 1).await;
        h.dispatcher.queue().pause("maintenance", now()).await.unwrap();

        let report = h.dispatcher.tick(now() + chrono::Duration::days(1)).await.unwrap();
        assert!(report.paused);
        assert_eq!(publisher.publish_call_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_publisher_leaves_tasks() {
        let publisher = Arc::new(MockPublisher::success(Platform::Youtube));
        let h = harness(vec![publisher], 1).await;
        let mut registry = PublisherRegistry::new();
        registry.register(Arc::new(MockPublisher::success(Platform::Tiktok)));
        let Harness { dispatcher, .. } = h;
        let dispatcher = Dispatcher {
            publishers: registry,
            ..dispatcher
        };

        let report = dispatcher.tick(now() + chrono::Duration::days(1)).await.unwrap();
        assert_eq!(report.unhandled, vec![Platform::Youtube]);
        let pending = dispatcher
            .queue()
            .list(&TaskFilter {
                state: Some(TaskState::Pending),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_jitter_waits_before_each_upload() {
        let publisher = Arc::new(MockPublisher::success(Platform::Youtube));
        let h = harness(vec![publisher.clone()], 2).await;
        let dispatcher = h
            .dispatcher
            .with_jitter(Duration::from_millis(40), Duration::from_millis(60));

        let started = Instant::now();
        let report = dispatcher.tick(now() + chrono::Duration::days(3)).await.unwrap();
        assert_eq!(report.posted, 2);
        assert!(started.elapsed() >= Duration::from_millis(80));

        // Uploads are stamped with the time they actually happened
        for task in &h.tasks {
            let task = dispatcher.queue().get(&task.id).await.unwrap();
            assert!(task.posted_at.unwrap() >= now() + chrono::Duration::days(3) + chrono::Duration::milliseconds(40));
        }
    }

    #[tokio::test]
    async fn test_claim_conflict_holds_back_later_slots() {
        let publisher = Arc::new(MockPublisher::success(Platform::Youtube));
        let h = harness(vec![publisher.clone()], 3).await;
        let queue = h.dispatcher.queue().clone();
        let mut tasks = h.tasks.clone();
        tasks.sort_by_key(|t| t.scheduled_time);
        let later = now() + chrono::Duration::days(3);

        // Another process is uploading the second slot
        assert!(queue.mark_due(&tasks[1], later).await.unwrap());
        let held = queue.get(&tasks[1].id).await.unwrap();
        assert!(queue.claim(&held, later).await.unwrap());

        let report = h.dispatcher.tick(later).await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.posted, 0);
        assert_eq!(queue.get(&tasks[0].id).await.unwrap().state, TaskState::Due);
        assert_eq!(queue.get(&tasks[2].id).await.unwrap().state, TaskState::Pending);

        // Once the other upload lands the rest go out in slot order
        assert!(queue.mark_posted(&tasks[1].id, "elsewhere", later).await.unwrap());
        let report = h.dispatcher.tick(later).await.unwrap();
        assert_eq!(report.posted, 2);
        assert_eq!(publisher.published(), vec![tasks[0].id.clone(), tasks[2].id.clone()]);
    }

    #[tokio::test]
    async fn test_health_check_runs_on_interval() {
        let publisher = Arc::new(MockPublisher::success(Platform::Youtube));
        let h = harness(vec![publisher], 0).await;

        assert!(h.dispatcher.tick(now()).await.unwrap().health_checked);
        assert!(!h.dispatcher.tick(now() + chrono::Duration::hours(1)).await.unwrap().health_checked);
        assert!(h.dispatcher.tick(now() + chrono::Duration::hours(7)).await.unwrap().health_checked);
    }
}
