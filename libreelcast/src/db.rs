//! Database operations for Reelcast
//!
//! Every state change is a single guarded `UPDATE ... WHERE state = ?` so that
//! the daemon and the CLIs, which share only this file, never clobber each
//! other. Callers learn from the returned `bool` whether their swap won.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction};

use crate::credentials::{Credential, CredentialStatus, SecretKind};
use crate::error::{DbError, Result};
use crate::types::{
    from_db_time, to_db_time, MediaItem, Platform, QueueState, StateCount, Task, TaskFilter,
    TaskState, TaskTransition,
};

const TASK_COLUMNS: &str = r#"
    t.id, t.media_id, m.media_reference, m.title, m.description, t.platform,
    t.scheduled_time, t.state, t.attempt_count, t.retry_at, t.last_error,
    t.posted_id, t.posted_at, t.created_at, t.updated_at
"#;

/// Fields written when a task leaves `publishing` or is rescheduled.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub scheduled_time: Option<DateTime<Utc>>,
    /// `Some(None)` clears the column
    pub retry_at: Option<Option<DateTime<Utc>>>,
    pub attempt_count: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub posted_id: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = std::path::Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        // WAL + busy timeout: the daemon and the CLIs write concurrently
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        Self::from_pool(pool).await
    }

    /// Private in-memory database on a single connection
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(DbError::SqlxError)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Persist media items and their tasks in one transaction
    pub async fn insert_batch(&self, media: &[MediaItem], tasks: &[Task]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        for item in media {
            sqlx::query(
                r#"
                INSERT INTO media (id, media_reference, title, description, created_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&item.id)
            .bind(&item.media_reference)
            .bind(&item.title)
            .bind(&item.description)
            .bind(to_db_time(item.created_at))
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
        }

        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO tasks (id, media_id, platform, scheduled_time, state, attempt_count,
                                   retry_at, last_error, posted_id, posted_at, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&task.id)
            .bind(&task.media_id)
            .bind(task.platform.as_str())
            .bind(to_db_time(task.scheduled_time))
            .bind(task.state.as_str())
            .bind(task.attempt_count as i64)
            .bind(task.retry_at.map(to_db_time))
            .bind(&task.last_error)
            .bind(&task.posted_id)
            .bind(task.posted_at.map(to_db_time))
            .bind(to_db_time(task.created_at))
            .bind(to_db_time(task.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

            record_history(&mut tx, &task.id, None, task.state, Some("enqueued"), task.created_at)
                .await?;
        }

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks t JOIN media m ON m.id = t.media_id WHERE t.id = ?",
            TASK_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(task_from_row).transpose()
    }

    /// Tasks matching `filter`, ordered by scheduled time then platform
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut sql = format!(
            "SELECT {} FROM tasks t JOIN media m ON m.id = t.media_id WHERE 1 = 1",
            TASK_COLUMNS
        );
        if filter.platform.is_some() {
            sql.push_str(" AND t.platform = ?");
        }
        if filter.state.is_some() {
            sql.push_str(" AND t.state = ?");
        }
        if filter.media_id.is_some() {
            sql.push_str(" AND t.media_id = ?");
        }
        sql.push_str(" ORDER BY t.scheduled_time ASC, t.platform ASC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(platform) = filter.platform {
            query = query.bind(platform.as_str());
        }
        if let Some(state) = filter.state {
            query = query.bind(state.as_str());
        }
        if let Some(media_id) = &filter.media_id {
            query = query.bind(media_id.clone());
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        rows.iter().map(task_from_row).collect()
    }

    /// All non-terminal tasks, optionally for one platform
    pub async fn active_tasks(&self, platform: Option<Platform>) -> Result<Vec<Task>> {
        let sql = format!(
            r#"
            SELECT {} FROM tasks t JOIN media m ON m.id = t.media_id
            WHERE t.state NOT IN ('posted', 'failed') AND (? IS NULL OR t.platform = ?)
            ORDER BY t.scheduled_time ASC, t.platform ASC
            "#,
            TASK_COLUMNS
        );
        let platform = platform.map(|p| p.as_str());
        let rows = sqlx::query(&sql)
            .bind(platform)
            .bind(platform)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        rows.iter().map(task_from_row).collect()
    }

    /// Tasks eligible for dispatch at `now`
    pub async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let sql = format!(
            r#"
            SELECT {} FROM tasks t JOIN media m ON m.id = t.media_id
            WHERE (t.state = 'pending' AND t.scheduled_time <= ?1)
               OR (t.state = 'retry_pending' AND t.retry_at IS NOT NULL AND t.retry_at <= ?1)
               OR t.state = 'due'
            ORDER BY t.scheduled_time ASC, t.platform ASC
            "#,
            TASK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(to_db_time(now))
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        rows.iter().map(task_from_row).collect()
    }

    /// Compare-and-swap `from -> to`, applying `update` and logging history
    pub async fn transition(
        &self,
        task_id: &str,
        from: TaskState,
        to: TaskState,
        update: &TaskUpdate,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                state = ?,
                scheduled_time = COALESCE(?, scheduled_time),
                retry_at = CASE WHEN ? THEN ? ELSE retry_at END,
                attempt_count = COALESCE(?, attempt_count),
                last_error = CASE WHEN ? THEN ? ELSE last_error END,
                posted_id = COALESCE(?, posted_id),
                posted_at = COALESCE(?, posted_at),
                updated_at = ?
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(to.as_str())
        .bind(update.scheduled_time.map(to_db_time))
        .bind(update.retry_at.is_some())
        .bind(update.retry_at.flatten().map(to_db_time))
        .bind(update.attempt_count.map(|n| n as i64))
        .bind(update.last_error.is_some())
        .bind(update.last_error.clone().flatten())
        .bind(update.posted_id.clone())
        .bind(update.posted_at.map(to_db_time))
        .bind(to_db_time(now))
        .bind(task_id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        record_history(&mut tx, task_id, Some(from), to, note, now).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(true)
    }

    /// `due -> publishing`, only while no other task of the platform is
    /// publishing
    pub async fn claim(&self, task_id: &str, platform: Platform, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let result = sqlx::query(
            r#"
            UPDATE tasks SET state = 'publishing', updated_at = ?
            WHERE id = ? AND state = 'due'
              AND NOT EXISTS (
                  SELECT 1 FROM tasks WHERE platform = ? AND state = 'publishing'
              )
            "#,
        )
        .bind(to_db_time(now))
        .bind(task_id)
        .bind(platform.as_str())
        .execute(&mut *tx)
        .await;

        let result = match result {
            Ok(result) => result,
            // Another writer got in first; the partial unique index caught it
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => return Ok(false),
            Err(e) => return Err(DbError::SqlxError(e).into()),
        };

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        record_history(
            &mut tx,
            task_id,
            Some(TaskState::Due),
            TaskState::Publishing,
            None,
            now,
        )
        .await?;
        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(true)
    }

    /// Delete a task unless it is publishing
    pub async fn delete_task(&self, task_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let media_id: Option<String> =
            sqlx::query_scalar("SELECT media_id FROM tasks WHERE id = ? AND state != 'publishing'")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(DbError::SqlxError)?;

        let Some(media_id) = media_id else {
            return Ok(false);
        };

        let result = sqlx::query("DELETE FROM tasks WHERE id = ? AND state != 'publishing'")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        delete_orphan_media(&mut tx, Some(&media_id)).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(true)
    }

    /// Stamp the media item complete once every one of its tasks is posted.
    ///
    /// Returns true only for the call that stamped it.
    pub async fn complete_media_if_done(&self, media_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE media SET completed_at = ?
            WHERE id = ? AND completed_at IS NULL
              AND EXISTS (SELECT 1 FROM tasks WHERE media_id = media.id)
              AND NOT EXISTS (
                  SELECT 1 FROM tasks WHERE media_id = media.id AND state != 'posted'
              )
            "#,
        )
        .bind(to_db_time(now))
        .bind(media_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_media(&self, media_id: &str) -> Result<Option<MediaItem>> {
        let row = sqlx::query(
            "SELECT id, media_reference, title, description, created_at FROM media WHERE id = ?",
        )
        .bind(media_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| {
            Ok(MediaItem {
                id: r.get("id"),
                media_reference: r.get("media_reference"),
                title: r.get("title"),
                description: r.get("description"),
                created_at: from_db_time(r.get::<&str, _>("created_at"))?,
            })
        })
        .transpose()
    }

    pub async fn history(&self, task_id: &str) -> Result<Vec<TaskTransition>> {
        let rows = sqlx::query(
            r#"
            SELECT task_id, from_state, to_state, note, at
            FROM task_history WHERE task_id = ? ORDER BY id ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| {
                Ok(TaskTransition {
                    task_id: r.get("task_id"),
                    from_state: r
                        .get::<Option<String>, _>("from_state")
                        .map(|s| parse_column::<TaskState>(&s))
                        .transpose()?,
                    to_state: parse_column(r.get::<&str, _>("to_state"))?,
                    note: r.get("note"),
                    at: from_db_time(r.get::<&str, _>("at"))?,
                })
            })
            .collect()
    }

    pub async fn stats(&self) -> Result<Vec<StateCount>> {
        let rows = sqlx::query(
            r#"
            SELECT platform, state, COUNT(*) AS count FROM tasks
            GROUP BY platform, state ORDER BY platform, state
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| {
                Ok(StateCount {
                    platform: parse_column(r.get::<&str, _>("platform"))?,
                    state: parse_column(r.get::<&str, _>("state"))?,
                    count: r.get("count"),
                })
            })
            .collect()
    }

    /// Move terminal tasks last touched before `cutoff` into the archive
    pub async fn sweep_terminal(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO upload_archive
                (id, media_id, media_reference, title, platform, scheduled_time, final_state,
                 attempt_count, last_error, posted_id, posted_at, created_at, archived_at)
            SELECT t.id, t.media_id, m.media_reference, m.title, t.platform, t.scheduled_time,
                   t.state, t.attempt_count, t.last_error, t.posted_id, t.posted_at,
                   t.created_at, ?
            FROM tasks t JOIN media m ON m.id = t.media_id
            WHERE t.state IN ('posted', 'failed') AND t.updated_at < ?
            "#,
        )
        .bind(to_db_time(now))
        .bind(to_db_time(cutoff))
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        let deleted = sqlx::query(
            "DELETE FROM tasks WHERE state IN ('posted', 'failed') AND updated_at < ?",
        )
        .bind(to_db_time(cutoff))
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?
        .rows_affected();

        delete_orphan_media(&mut tx, None).await?;
        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(deleted)
    }

    pub async fn archived_count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM upload_archive")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DbError::SqlxError(e).into())
    }

    // ------------------------------------------------------------------
    // Queue state
    // ------------------------------------------------------------------

    pub async fn queue_state(&self) -> Result<QueueState> {
        let row = sqlx::query(
            r#"
            SELECT paused, paused_at, pause_reason, consecutive_failures, streak_started_at
            FROM queue_state WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let Some(r) = row else {
            return Ok(QueueState::default());
        };

        Ok(QueueState {
            paused: r.get::<i64, _>("paused") != 0,
            paused_at: optional_time(&r, "paused_at")?,
            pause_reason: r.get("pause_reason"),
            consecutive_failures: r.get::<i64, _>("consecutive_failures") as u32,
            streak_started_at: optional_time(&r, "streak_started_at")?,
        })
    }

    /// Set the pause flag; true only if this call flipped it
    pub async fn pause(&self, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE queue_state SET paused = 1, paused_at = ?, pause_reason = ? WHERE id = 1 AND paused = 0",
        )
        .bind(to_db_time(now))
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected() == 1)
    }

    /// Clear the pause flag and the failure streak; true if it was paused
    pub async fn resume(&self) -> Result<bool> {
        let was_paused: i64 = sqlx::query_scalar("SELECT paused FROM queue_state WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            UPDATE queue_state SET paused = 0, paused_at = NULL, pause_reason = NULL,
                consecutive_failures = 0, streak_started_at = NULL
            WHERE id = 1
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(was_paused != 0)
    }

    /// Count one failure into the streak, restarting it when the window since
    /// its first failure has elapsed. Returns the new streak length.
    pub async fn record_failure(&self, now: DateTime<Utc>, window: chrono::Duration) -> Result<u32> {
        let window_start = to_db_time(now - window);
        let now_str = to_db_time(now);

        let count: i64 = sqlx::query_scalar(
            r#"
            UPDATE queue_state SET
                consecutive_failures = CASE
                    WHEN streak_started_at IS NULL OR streak_started_at < ?1 THEN 1
                    ELSE consecutive_failures + 1
                END,
                streak_started_at = CASE
                    WHEN streak_started_at IS NULL OR streak_started_at < ?1 THEN ?2
                    ELSE streak_started_at
                END
            WHERE id = 1
            RETURNING consecutive_failures
            "#,
        )
        .bind(window_start)
        .bind(now_str)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(count as u32)
    }

    pub async fn reset_failures(&self) -> Result<()> {
        sqlx::query(
            "UPDATE queue_state SET consecutive_failures = 0, streak_started_at = NULL WHERE id = 1",
        )
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------

    pub async fn upsert_credential(&self, credential: &Credential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials
                (platform, account, kind, secret, status, linked_at, last_verified_at, estimated_expiry)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(platform, account) DO UPDATE SET
                kind = excluded.kind,
                secret = excluded.secret,
                status = excluded.status,
                linked_at = excluded.linked_at,
                last_verified_at = excluded.last_verified_at,
                estimated_expiry = excluded.estimated_expiry
            "#,
        )
        .bind(credential.platform.as_str())
        .bind(&credential.account)
        .bind(credential.kind.as_str())
        .bind(credential.secret.expose_secret())
        .bind(credential.status.as_str())
        .bind(to_db_time(credential.linked_at))
        .bind(credential.last_verified_at.map(to_db_time))
        .bind(credential.estimated_expiry.map(to_db_time))
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// The most recently linked credential for `platform`
    pub async fn active_credential(&self, platform: Platform) -> Result<Option<Credential>> {
        let row = sqlx::query(
            r#"
            SELECT platform, account, kind, secret, status, linked_at, last_verified_at, estimated_expiry
            FROM credentials WHERE platform = ?
            ORDER BY linked_at DESC, account ASC LIMIT 1
            "#,
        )
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(credential_from_row).transpose()
    }

    pub async fn list_credentials(&self) -> Result<Vec<Credential>> {
        let rows = sqlx::query(
            r#"
            SELECT platform, account, kind, secret, status, linked_at, last_verified_at, estimated_expiry
            FROM credentials ORDER BY platform, linked_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(credential_from_row).collect()
    }

    pub async fn update_credential_status(
        &self,
        platform: Platform,
        account: &str,
        status: CredentialStatus,
        verified_at: Option<DateTime<Utc>>,
        estimated_expiry: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE credentials SET
                status = ?,
                last_verified_at = COALESCE(?, last_verified_at),
                estimated_expiry = COALESCE(?, estimated_expiry)
            WHERE platform = ? AND account = ?
            "#,
        )
        .bind(status.as_str())
        .bind(verified_at.map(to_db_time))
        .bind(estimated_expiry.map(to_db_time))
        .bind(platform.as_str())
        .bind(account)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_credential(&self, platform: Platform, account: Option<&str>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM credentials WHERE platform = ? AND (? IS NULL OR account = ?)",
        )
        .bind(platform.as_str())
        .bind(account)
        .bind(account)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DbError::SqlxError(e).into())
    }

    pub async fn set_setting(&self, key: &str, value: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(to_db_time(now))
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Insert `key` if absent; true when this call created it
    pub async fn set_flag_once(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO settings (key, value, updated_at) VALUES (?, ?, ?)")
                .bind(key)
                .bind(to_db_time(now))
                .bind(to_db_time(now))
                .execute(&self.pool)
                .await
                .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn clear_setting(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected() == 1)
    }
}

async fn record_history(
    tx: &mut Transaction<'_, Sqlite>,
    task_id: &str,
    from: Option<TaskState>,
    to: TaskState,
    note: Option<&str>,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_history (task_id, from_state, to_state, note, at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(task_id)
    .bind(from.map(|s| s.as_str()))
    .bind(to.as_str())
    .bind(note)
    .bind(to_db_time(at))
    .execute(&mut **tx)
    .await
    .map_err(DbError::SqlxError)?;
    Ok(())
}

/// Remove media rows left without tasks (all of them, or just `media_id`)
async fn delete_orphan_media(tx: &mut Transaction<'_, Sqlite>, media_id: Option<&str>) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM media
        WHERE (? IS NULL OR id = ?)
          AND NOT EXISTS (SELECT 1 FROM tasks WHERE tasks.media_id = media.id)
        "#,
    )
    .bind(media_id)
    .bind(media_id)
    .execute(&mut **tx)
    .await
    .map_err(DbError::SqlxError)?;
    Ok(())
}

fn parse_column<T: FromStr>(raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| DbError::InvalidData(format!("unexpected value '{}'", raw)).into())
}

fn optional_time(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    row.get::<Option<String>, _>(column)
        .map(|raw| from_db_time(&raw))
        .transpose()
}

fn task_from_row(r: &SqliteRow) -> Result<Task> {
    Ok(Task {
        id: r.get("id"),
        media_id: r.get("media_id"),
        media_reference: r.get("media_reference"),
        title: r.get("title"),
        description: r.get("description"),
        platform: parse_column(r.get::<&str, _>("platform"))?,
        scheduled_time: from_db_time(r.get::<&str, _>("scheduled_time"))?,
        state: parse_column(r.get::<&str, _>("state"))?,
        attempt_count: r.get::<i64, _>("attempt_count") as u32,
        retry_at: optional_time(r, "retry_at")?,
        last_error: r.get("last_error"),
        posted_id: r.get("posted_id"),
        posted_at: optional_time(r, "posted_at")?,
        created_at: from_db_time(r.get::<&str, _>("created_at"))?,
        updated_at: from_db_time(r.get::<&str, _>("updated_at"))?,
    })
}

fn credential_from_row(r: &SqliteRow) -> Result<Credential> {
    Ok(Credential {
        platform: parse_column(r.get::<&str, _>("platform"))?,
        account: r.get("account"),
        kind: parse_column::<SecretKind>(r.get::<&str, _>("kind"))?,
        secret: SecretString::from(r.get::<String, _>("secret")),
        status: parse_column(r.get::<&str, _>("status"))?,
        linked_at: from_db_time(r.get::<&str, _>("linked_at"))?,
        last_verified_at: optional_time(r, "last_verified_at")?,
        estimated_expiry: optional_time(r, "estimated_expiry")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::db_precision;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 6, 12, 0, 0).unwrap()
    }

    async fn seeded(db: &Database, platform: Platform, at: DateTime<Utc>) -> Task {
        let media = MediaItem::new("/videos/clip.mp4", "Clip", "desc", now());
        let task = Task::new(&media, platform, at, now());
        db.insert_batch(&[media], &[task.clone()]).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_database_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("dir").join("reelcast.db");

        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        assert!(db_path.exists());
        assert!(!db.queue_state().await.unwrap().paused);
    }

    #[tokio::test]
    async fn test_insert_and_get_task() {
        let db = Database::in_memory().await.unwrap();
        let task = seeded(&db, Platform::Youtube, now()).await;

        let fetched = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched, task);
        assert!(db.get_task("missing").await.unwrap().is_none());

        let history = db.history(&task.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_state, None);
        assert_eq!(history[0].to_state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_invalid_state_rejected_by_schema() {
        let db = Database::in_memory().await.unwrap();
        let task = seeded(&db, Platform::Youtube, now()).await;

        let result = sqlx::query("UPDATE tasks SET state = 'exploded' WHERE id = ?")
            .bind(&task.id)
            .execute(db.pool())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_due_tasks_selection_and_order() {
        let db = Database::in_memory().await.unwrap();
        let early_tt = seeded(&db, Platform::Tiktok, now() - chrono::Duration::hours(2)).await;
        let early_yt = seeded(&db, Platform::Youtube, now() - chrono::Duration::hours(2)).await;
        let later = seeded(&db, Platform::Youtube, now() - chrono::Duration::hours(1)).await;
        let future = seeded(&db, Platform::Youtube, now() + chrono::Duration::hours(1)).await;

        // retry whose time has not come yet
        let waiting = seeded(&db, Platform::Instagram, now() - chrono::Duration::hours(3)).await;
        db.transition(
            &waiting.id,
            TaskState::Pending,
            TaskState::RetryPending,
            &TaskUpdate {
                retry_at: Some(Some(now() + chrono::Duration::minutes(5))),
                ..Default::default()
            },
            None,
            now(),
        )
        .await
        .unwrap();

        let due: Vec<String> = db
            .due_tasks(now())
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(due, vec![early_tt.id, early_yt.id, later.id]);
        assert!(!due.contains(&future.id));
        assert!(!due.contains(&waiting.id));

        let due_later = db
            .due_tasks(now() + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert!(due_later.iter().any(|t| t.id == waiting.id));
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_swap() {
        let db = Database::in_memory().await.unwrap();
        let task = seeded(&db, Platform::Youtube, now()).await;

        let swapped = db
            .transition(&task.id, TaskState::Pending, TaskState::Due, &TaskUpdate::default(), None, now())
            .await
            .unwrap();
        assert!(swapped);

        // Stale expectation loses
        let again = db
            .transition(&task.id, TaskState::Pending, TaskState::Due, &TaskUpdate::default(), None, now())
            .await
            .unwrap();
        assert!(!again);
        assert_eq!(db.history(&task.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_transition_updates_fields() {
        let db = Database::in_memory().await.unwrap();
        let task = seeded(&db, Platform::Youtube, now()).await;
        let retry_at = now() + chrono::Duration::minutes(30);

        db.transition(
            &task.id,
            TaskState::Pending,
            TaskState::RetryPending,
            &TaskUpdate {
                retry_at: Some(Some(retry_at)),
                attempt_count: Some(2),
                last_error: Some(Some("boom".to_string())),
                ..Default::default()
            },
            Some("retry"),
            now(),
        )
        .await
        .unwrap();

        let fetched = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched.retry_at, Some(retry_at));
        assert_eq!(fetched.attempt_count, 2);
        assert_eq!(fetched.last_error.as_deref(), Some("boom"));

        // Clearing
        db.transition(
            &task.id,
            TaskState::RetryPending,
            TaskState::Pending,
            &TaskUpdate {
                retry_at: Some(None),
                last_error: Some(None),
                ..Default::default()
            },
            None,
            now(),
        )
        .await
        .unwrap();
        let fetched = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched.retry_at, None);
        assert_eq!(fetched.last_error, None);
        assert_eq!(fetched.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_claim_allows_one_publishing_per_platform() {
        let db = Database::in_memory().await.unwrap();
        let a = seeded(&db, Platform::Youtube, now()).await;
        let b = seeded(&db, Platform::Youtube, now()).await;
        let c = seeded(&db, Platform::Tiktok, now()).await;
        for t in [&a, &b, &c] {
            db.transition(&t.id, TaskState::Pending, TaskState::Due, &TaskUpdate::default(), None, now())
                .await
                .unwrap();
        }

        assert!(db.claim(&a.id, Platform::Youtube, now()).await.unwrap());
        assert!(!db.claim(&b.id, Platform::Youtube, now()).await.unwrap());
        assert!(db.claim(&c.id, Platform::Tiktok, now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_unique_index_blocks_second_publishing() {
        let db = Database::in_memory().await.unwrap();
        let a = seeded(&db, Platform::Youtube, now()).await;
        let b = seeded(&db, Platform::Youtube, now()).await;

        sqlx::query("UPDATE tasks SET state = 'publishing' WHERE id = ?")
            .bind(&a.id)
            .execute(db.pool())
            .await
            .unwrap();
        let result = sqlx::query("UPDATE tasks SET state = 'publishing' WHERE id = ?")
            .bind(&b.id)
            .execute(db.pool())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_delete_task_refuses_publishing() {
        let db = Database::in_memory().await.unwrap();
        let a = seeded(&db, Platform::Youtube, now()).await;
        let b = seeded(&db, Platform::Youtube, now()).await;
        sqlx::query("UPDATE tasks SET state = 'publishing' WHERE id = ?")
            .bind(&a.id)
            .execute(db.pool())
            .await
            .unwrap();

        assert!(!db.delete_task(&a.id).await.unwrap());
        assert!(db.delete_task(&b.id).await.unwrap());
        assert!(db.get_task(&b.id).await.unwrap().is_none());
        assert!(db.get_media(&b.media_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_media_only_once() {
        let db = Database::in_memory().await.unwrap();
        let media = MediaItem::new("/v.mp4", "V", "", now());
        let yt = Task::new(&media, Platform::Youtube, now(), now());
        let ig = Task::new(&media, Platform::Instagram, now(), now());
        db.insert_batch(&[media.clone()], &[yt.clone(), ig.clone()])
            .await
            .unwrap();

        sqlx::query("UPDATE tasks SET state = 'posted' WHERE id = ?")
            .bind(&yt.id)
            .execute(db.pool())
            .await
            .unwrap();
        assert!(!db.complete_media_if_done(&media.id, now()).await.unwrap());

        sqlx::query("UPDATE tasks SET state = 'posted' WHERE id = ?")
            .bind(&ig.id)
            .execute(db.pool())
            .await
            .unwrap();
        assert!(db.complete_media_if_done(&media.id, now()).await.unwrap());
        assert!(!db.complete_media_if_done(&media.id, now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_streak_window() {
        let db = Database::in_memory().await.unwrap();
        let window = chrono::Duration::minutes(30);

        assert_eq!(db.record_failure(now(), window).await.unwrap(), 1);
        assert_eq!(
            db.record_failure(now() + chrono::Duration::minutes(10), window)
                .await
                .unwrap(),
            2
        );
        // Window measured from the first failure of the streak
        assert_eq!(
            db.record_failure(now() + chrono::Duration::minutes(31), window)
                .await
                .unwrap(),
            1
        );

        db.reset_failures().await.unwrap();
        let state = db.queue_state().await.unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.streak_started_at, None);
    }

    #[tokio::test]
    async fn test_pause_flips_once_and_resume_clears_streak() {
        let db = Database::in_memory().await.unwrap();
        db.record_failure(now(), chrono::Duration::minutes(30))
            .await
            .unwrap();

        assert!(db.pause("too many failures", now()).await.unwrap());
        assert!(!db.pause("again", now()).await.unwrap());

        let state = db.queue_state().await.unwrap();
        assert!(state.paused);
        assert_eq!(state.pause_reason.as_deref(), Some("too many failures"));
        assert_eq!(state.paused_at, Some(db_precision(now())));

        assert!(db.resume().await.unwrap());
        let state = db.queue_state().await.unwrap();
        assert!(!state.paused);
        assert_eq!(state.consecutive_failures, 0);
        assert!(!db.resume().await.unwrap());
    }

    #[tokio::test]
    async fn test_flags_set_once() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.set_flag_once("auth_gap_notified.tiktok", now()).await.unwrap());
        assert!(!db.set_flag_once("auth_gap_notified.tiktok", now()).await.unwrap());
        assert!(db.clear_setting("auth_gap_notified.tiktok").await.unwrap());
        assert!(db.set_flag_once("auth_gap_notified.tiktok", now()).await.unwrap());

        db.set_setting("k", "v1", now()).await.unwrap();
        db.set_setting("k", "v2", now()).await.unwrap();
        assert_eq!(db.get_setting("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_sweep_moves_old_terminal_tasks() {
        let db = Database::in_memory().await.unwrap();
        let posted = seeded(&db, Platform::Youtube, now()).await;
        let pending = seeded(&db, Platform::Youtube, now()).await;
        db.transition(
            &posted.id,
            TaskState::Pending,
            TaskState::Posted,
            &TaskUpdate::default(),
            None,
            now(),
        )
        .await
        .unwrap();

        // Cutoff before the update: nothing moves
        assert_eq!(db.sweep_terminal(now(), now()).await.unwrap(), 0);

        let later = now() + chrono::Duration::days(8);
        assert_eq!(
            db.sweep_terminal(now() + chrono::Duration::days(7), later)
                .await
                .unwrap(),
            1
        );
        assert!(db.get_task(&posted.id).await.unwrap().is_none());
        assert!(db.get_task(&pending.id).await.unwrap().is_some());
        assert_eq!(db.archived_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stats_groups_by_platform_and_state() {
        let db = Database::in_memory().await.unwrap();
        seeded(&db, Platform::Youtube, now()).await;
        seeded(&db, Platform::Youtube, now()).await;
        seeded(&db, Platform::Tiktok, now()).await;

        let stats = db.stats().await.unwrap();
        assert!(stats.contains(&StateCount {
            platform: Platform::Youtube,
            state: TaskState::Pending,
            count: 2
        }));
        assert!(stats.contains(&StateCount {
            platform: Platform::Tiktok,
            state: TaskState::Pending,
            count: 1
        }));
    }
}
