//! Task queue operations
//!
//! [`TaskQueue`] is the only way tasks change state. Every method is a guarded
//! compare-and-swap against the store, so the daemon and the operator CLIs can
//! act on the same queue without coordination. Manual actions that lose a
//! race report [`QueueError::Conflict`] instead of overwriting.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::db::{Database, TaskUpdate};
use crate::error::{QueueError, ReelcastError, Result};
use crate::scheduler::{self, Occupancy};
use crate::schedule::ScheduleConfig;
use crate::types::{
    db_precision, MediaItem, Platform, QueueState, StateCount, Task, TaskFilter, TaskState,
    TaskTransition,
};

/// History note for tasks reset by crash recovery
pub const RECOVERY_NOTE: &str = "recovery retry: upload may have completed before the restart";

/// A video to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMedia {
    pub media_reference: String,
    pub title: String,
    pub description: String,
}

impl NewMedia {
    pub fn new(
        media_reference: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            media_reference: media_reference.into(),
            title: title.into(),
            description: description.into(),
        }
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    db: Arc<Database>,
    schedule: ScheduleConfig,
}

impl TaskQueue {
    pub fn new(db: Arc<Database>, schedule: ScheduleConfig) -> Self {
        Self { db, schedule }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn schedule(&self) -> &ScheduleConfig {
        &self.schedule
    }

    // ------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------

    /// Fan each video out to one task per platform and persist them in one
    /// batch.
    pub async fn enqueue(
        &self,
        media: Vec<NewMedia>,
        platforms: &[Platform],
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        let mut rng = StdRng::from_entropy();
        self.enqueue_with_rng(media, platforms, now, &mut rng).await
    }

    /// [`TaskQueue::enqueue`] with a caller-supplied random source.
    pub async fn enqueue_with_rng<R: Rng + Send>(
        &self,
        media: Vec<NewMedia>,
        platforms: &[Platform],
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<Vec<Task>> {
        if media.is_empty() {
            return Err(ReelcastError::InvalidInput("no media files given".to_string()));
        }
        let mut platforms = platforms.to_vec();
        platforms.sort();
        platforms.dedup();
        if platforms.is_empty() {
            return Err(ReelcastError::InvalidInput("no platforms selected".to_string()));
        }

        let now = db_precision(now);
        let items = media
            .into_iter()
            .map(|m| validate_media(m, now))
            .collect::<Result<Vec<MediaItem>>>()?;

        let active = self.db.active_tasks(None).await?;
        let mut occupancy = Occupancy::from_tasks(&active);
        let assignments = scheduler::assign_slots(
            &self.schedule,
            items.len(),
            &platforms,
            &mut occupancy,
            now,
            rng,
        )?;

        let tasks: Vec<Task> = assignments
            .iter()
            .map(|a| Task::new(&items[a.item], a.platform, a.scheduled_time, now))
            .collect();

        self.db.insert_batch(&items, &tasks).await?;
        tracing::info!(media = items.len(), tasks = tasks.len(), "Enqueued uploads");
        Ok(tasks)
    }

    // ------------------------------------------------------------------
    // Dispatch transitions
    // ------------------------------------------------------------------

    /// Tasks eligible for dispatch, by scheduled time then platform
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        self.db.due_tasks(now).await
    }

    /// `pending | retry_pending -> due`; true if the task is now due
    pub async fn mark_due(&self, task: &Task, now: DateTime<Utc>) -> Result<bool> {
        match task.state {
            TaskState::Due => Ok(true),
            TaskState::Pending | TaskState::RetryPending => {
                self.db
                    .transition(&task.id, task.state, TaskState::Due, &TaskUpdate::default(), None, now)
                    .await
            }
            _ => Ok(false),
        }
    }

    /// `due -> publishing` when the platform has nothing else publishing
    pub async fn claim(&self, task: &Task, now: DateTime<Utc>) -> Result<bool> {
        self.db.claim(&task.id, task.platform, now).await
    }

    pub async fn mark_posted(&self, task_id: &str, posted_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let update = TaskUpdate {
            retry_at: Some(None),
            last_error: Some(None),
            posted_id: Some(posted_id.to_string()),
            posted_at: Some(now),
            ..Default::default()
        };
        self.db
            .transition(task_id, TaskState::Publishing, TaskState::Posted, &update, None, now)
            .await
    }

    /// `publishing -> retry_pending` after a failed attempt
    pub async fn schedule_retry(
        &self,
        task_id: &str,
        attempt_count: u32,
        retry_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let update = TaskUpdate {
            retry_at: Some(Some(retry_at)),
            attempt_count: Some(attempt_count),
            last_error: Some(Some(error.to_string())),
            ..Default::default()
        };
        self.db
            .transition(
                task_id,
                TaskState::Publishing,
                TaskState::RetryPending,
                &update,
                Some(error),
                now,
            )
            .await
    }

    /// `publishing -> failed`
    pub async fn mark_failed(
        &self,
        task_id: &str,
        attempt_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let update = TaskUpdate {
            retry_at: Some(None),
            attempt_count: Some(attempt_count),
            last_error: Some(Some(error.to_string())),
            ..Default::default()
        };
        self.db
            .transition(task_id, TaskState::Publishing, TaskState::Failed, &update, Some(error), now)
            .await
    }

    /// `due -> retry_pending` while the platform has no usable credential.
    /// The attempt count is untouched.
    pub async fn defer_for_auth(
        &self,
        task_id: &str,
        retry_at: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let update = TaskUpdate {
            retry_at: Some(Some(retry_at)),
            last_error: Some(Some(reason.to_string())),
            ..Default::default()
        };
        self.db
            .transition(task_id, TaskState::Due, TaskState::RetryPending, &update, Some(reason), now)
            .await
    }

    /// Media item, once every one of its tasks is posted. Only the first
    /// caller to observe completion gets `Some`.
    pub async fn complete_media(&self, media_id: &str, now: DateTime<Utc>) -> Result<Option<MediaItem>> {
        if !self.db.complete_media_if_done(media_id, now).await? {
            return Ok(None);
        }
        self.db.get_media(media_id).await
    }

    // ------------------------------------------------------------------
    // Manual actions
    // ------------------------------------------------------------------

    /// Move an unposted task to the next free slot after its current time
    pub async fn push_to_next_slot(&self, task_id: &str, now: DateTime<Utc>) -> Result<Task> {
        let task = self.get(task_id).await?;
        if !matches!(task.state, TaskState::Pending | TaskState::RetryPending) {
            return Err(invalid(&task, "push"));
        }

        let mut occupancy = self.occupancy(task.platform).await?;
        occupancy.remove(task.platform, task.scheduled_time);
        let after = task.scheduled_time.max(db_precision(now));
        let slot = scheduler::next_free_slot(&self.schedule, task.platform, &occupancy, after)?;

        let update = TaskUpdate {
            scheduled_time: Some(slot),
            retry_at: Some(None),
            ..Default::default()
        };
        self.swap(&task, TaskState::Pending, &update, "pushed to next slot", now)
            .await?;
        tracing::info!(task_id, platform = %task.platform, slot = %slot, "Task pushed");
        self.get(task_id).await
    }

    /// Give every pending or retrying task of `platform` (or of all platforms)
    /// a fresh slot from `now`, in random order. Returns how many moved.
    pub async fn reshuffle(&self, platform: Option<Platform>, now: DateTime<Utc>) -> Result<usize> {
        let mut rng = StdRng::from_entropy();
        self.reshuffle_with_rng(platform, now, &mut rng).await
    }

    pub async fn reshuffle_with_rng<R: Rng + Send>(
        &self,
        platform: Option<Platform>,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<usize> {
        let now = db_precision(now);
        let active = self.db.active_tasks(platform).await?;
        let (movable, fixed): (Vec<Task>, Vec<Task>) = active
            .into_iter()
            .partition(|t| matches!(t.state, TaskState::Pending | TaskState::RetryPending));

        let mut occupancy = Occupancy::from_tasks(&fixed);
        let plan = scheduler::reshuffle(&self.schedule, &movable, &mut occupancy, now, rng)?;

        let mut moved = 0;
        for (task_id, slot) in plan {
            let Some(task) = movable.iter().find(|t| t.id == task_id) else {
                continue;
            };
            let update = TaskUpdate {
                scheduled_time: Some(slot),
                retry_at: Some(None),
                ..Default::default()
            };
            if self
                .db
                .transition(&task.id, task.state, TaskState::Pending, &update, Some("reshuffled"), now)
                .await?
            {
                moved += 1;
            } else {
                tracing::debug!(task_id = %task.id, "Task changed during reshuffle; left alone");
            }
        }

        tracing::info!(moved, platform = ?platform, "Queue reshuffled");
        Ok(moved)
    }

    /// Put a task at an explicit time. A failed task is reactivated with its
    /// attempts reset.
    pub async fn reschedule(&self, task_id: &str, at: DateTime<Utc>, now: DateTime<Utc>) -> Result<Task> {
        let at = db_precision(at);
        let task = self.get(task_id).await?;
        if matches!(task.state, TaskState::Publishing | TaskState::Posted) {
            return Err(invalid(&task, "reschedule"));
        }

        let occupancy = self.occupancy(task.platform).await?;
        let own_slot = !task.state.is_terminal() && task.scheduled_time == at;
        if occupancy.is_taken(task.platform, at) && !own_slot {
            return Err(QueueError::SlotOccupied {
                platform: task.platform,
                time: at.to_rfc3339(),
            }
            .into());
        }

        let mut update = TaskUpdate {
            scheduled_time: Some(at),
            retry_at: Some(None),
            ..Default::default()
        };
        if task.state == TaskState::Failed {
            update.attempt_count = Some(0);
            update.last_error = Some(None);
        }

        self.swap(&task, TaskState::Pending, &update, "rescheduled", now)
            .await?;
        self.get(task_id).await
    }

    /// Make a pending or retrying task due immediately
    pub async fn force_now(&self, task_id: &str, now: DateTime<Utc>) -> Result<Task> {
        let task = self.get(task_id).await?;
        if !matches!(task.state, TaskState::Pending | TaskState::RetryPending) {
            return Err(invalid(&task, "force upload"));
        }
        self.swap(&task, TaskState::Due, &TaskUpdate::default(), "forced by operator", now)
            .await?;
        self.get(task_id).await
    }

    /// Delete a task that is not publishing
    pub async fn remove(&self, task_id: &str) -> Result<()> {
        let task = self.get(task_id).await?;
        if task.state == TaskState::Publishing {
            return Err(invalid(&task, "remove"));
        }
        if !self.db.delete_task(task_id).await? {
            return Err(QueueError::Conflict(task_id.to_string()).into());
        }
        tracing::info!(task_id, "Task removed");
        Ok(())
    }

    pub async fn pause(&self, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let flipped = self.db.pause(reason, now).await?;
        if flipped {
            tracing::warn!(reason, "Queue paused");
        }
        Ok(flipped)
    }

    /// Clear the pause flag and the failure streak
    pub async fn resume(&self) -> Result<bool> {
        let was_paused = self.db.resume().await?;
        if was_paused {
            tracing::info!("Queue resumed");
        }
        Ok(was_paused)
    }

    pub async fn queue_state(&self) -> Result<QueueState> {
        self.db.queue_state().await
    }

    /// Return tasks left `publishing` for longer than `stale_after` to
    /// `retry_pending`, due now and without spending an attempt.
    ///
    /// A live publish never outlasts the publish timeout, so `stale_after`
    /// must exceed it or a running upload could be reset under its owner.
    pub async fn recover(&self, stale_after: Duration, now: DateTime<Utc>) -> Result<Vec<String>> {
        let cutoff = now - stale_after;
        let stuck: Vec<Task> = self
            .db
            .list_tasks(&TaskFilter {
                state: Some(TaskState::Publishing),
                ..Default::default()
            })
            .await?
            .into_iter()
            .filter(|task| task.updated_at <= cutoff)
            .collect();

        let mut recovered = Vec::with_capacity(stuck.len());
        for task in stuck {
            let update = TaskUpdate {
                retry_at: Some(Some(now)),
                ..Default::default()
            };
            if self
                .db
                .transition(
                    &task.id,
                    TaskState::Publishing,
                    TaskState::RetryPending,
                    &update,
                    Some(RECOVERY_NOTE),
                    now,
                )
                .await?
            {
                tracing::warn!(
                    task_id = %task.id,
                    platform = %task.platform,
                    media = %task.media_reference,
                    "RecoveryAmbiguity: upload was in flight at shutdown; retrying, a duplicate post is possible"
                );
                recovered.push(task.id);
            }
        }
        Ok(recovered)
    }

    /// Archive posted and failed tasks untouched for `older_than`
    pub async fn sweep(&self, older_than: Duration, now: DateTime<Utc>) -> Result<u64> {
        let swept = self.db.sweep_terminal(now - older_than, now).await?;
        tracing::info!(swept, "Archived terminal tasks");
        Ok(swept)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get(&self, task_id: &str) -> Result<Task> {
        self.db
            .get_task(task_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()).into())
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.db.list_tasks(filter).await
    }

    pub async fn stats(&self) -> Result<Vec<StateCount>> {
        self.db.stats().await
    }

    pub async fn history(&self, task_id: &str) -> Result<Vec<TaskTransition>> {
        let history = self.db.history(task_id).await?;
        if history.is_empty() {
            return Err(QueueError::NotFound(task_id.to_string()).into());
        }
        Ok(history)
    }

    async fn occupancy(&self, platform: Platform) -> Result<Occupancy> {
        let active = self.db.active_tasks(Some(platform)).await?;
        Ok(Occupancy::from_tasks(&active))
    }

    async fn swap(
        &self,
        task: &Task,
        to: TaskState,
        update: &TaskUpdate,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self
            .db
            .transition(&task.id, task.state, to, update, Some(note), now)
            .await?
        {
            Ok(())
        } else {
            Err(QueueError::Conflict(task.id.clone()).into())
        }
    }
}

fn invalid(task: &Task, action: &str) -> ReelcastError {
    QueueError::InvalidTransition {
        id: task.id.clone(),
        state: task.state,
        action: action.to_string(),
    }
    .into()
}

/// Resolve the file to an absolute path and refuse missing or empty files.
fn validate_media(media: NewMedia, now: DateTime<Utc>) -> Result<MediaItem> {
    let title = media.title.trim();
    if title.is_empty() {
        return Err(ReelcastError::InvalidInput("title cannot be empty".to_string()));
    }

    let expanded = shellexpand::tilde(&media.media_reference).to_string();
    let path = Path::new(&expanded);
    let metadata = std::fs::metadata(path).map_err(|e| {
        ReelcastError::InvalidInput(format!("cannot read {}: {}", media.media_reference, e))
    })?;
    if !metadata.is_file() {
        return Err(ReelcastError::InvalidInput(format!(
            "{} is not a file",
            media.media_reference
        )));
    }
    if metadata.len() == 0 {
        return Err(ReelcastError::InvalidInput(format!(
            "{} is empty",
            media.media_reference
        )));
    }
    let absolute = std::fs::canonicalize(path)
        .map_err(|e| ReelcastError::InvalidInput(format!("cannot resolve {}: {}", expanded, e)))?;

    Ok(MediaItem::new(
        absolute.to_string_lossy(),
        title,
        media.description.trim(),
        now,
    ))
}
