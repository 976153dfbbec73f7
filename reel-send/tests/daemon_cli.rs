//! Integration tests for the reel-send daemon

use std::fs;
use std::sync::Arc;

use assert_cmd::Command;
use libreelcast::{Config, Database, NewMedia, Platform, RawCredential, TaskQueue, TaskState};
use predicates::prelude::*;
use tempfile::TempDir;

/// Setup test environment with config and database
fn setup_test_env(publishers: &str) -> (TempDir, String, String) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("test.db");

    let config_content = format!(
        r#"
[database]
path = "{}"

[schedule]
weekdays = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"]
times = ["09:00"]
timezone = "UTC"

[platforms]
enabled = ["youtube"]

[dispatch]
poll_interval = "1s"
publish_timeout = "30s"
jitter = ["0s", "0s"]

{}
"#,
        db_path.display().to_string().replace('\\', "/"),
        publishers
    );
    fs::write(&config_path, config_content).unwrap();

    (
        temp_dir,
        config_path.to_str().unwrap().to_string(),
        db_path.to_str().unwrap().to_string(),
    )
}

/// Enqueue one video for YouTube and make it due immediately
async fn create_due_task(dir: &TempDir, config_path: &str, db_path: &str) -> String {
    let config = Config::load_from_path(std::path::Path::new(config_path)).unwrap();
    let db = Arc::new(Database::new(db_path).await.unwrap());
    let queue = TaskQueue::new(db.clone(), config.schedule().unwrap());

    let video = dir.path().join("clip.mp4");
    fs::write(&video, b"fake video").unwrap();

    let now = chrono::Utc::now();
    let tasks = queue
        .enqueue(
            vec![NewMedia::new(video.to_string_lossy(), "Clip", "")],
            &[Platform::Youtube],
            now,
        )
        .await
        .unwrap();
    queue.force_now(&tasks[0].id, now).await.unwrap();

    libreelcast::credentials::CredentialStore::new(db)
        .link(Platform::Youtube, "default", RawCredential::Token("tok".into()), now)
        .await
        .unwrap();

    tasks[0].id.clone()
}

fn reel_send(config_path: &str, db_path: &str) -> Command {
    let mut cmd = Command::cargo_bin("reel-send").unwrap();
    cmd.env("REELCAST_CONFIG", config_path)
        .env("REELCAST_DB_PATH", db_path);
    cmd
}

#[test]
fn test_once_with_empty_queue() {
    let (_dir, config_path, db_path) = setup_test_env("");

    reel_send(&config_path, &db_path)
        .arg("--once")
        .assert()
        .success();
}

#[test]
fn test_missing_config_is_a_config_error() {
    let dir = TempDir::new().unwrap();

    Command::cargo_bin("reel-send")
        .unwrap()
        .env("REELCAST_CONFIG", dir.path().join("absent.toml"))
        .arg("--once")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_zero_poll_interval_rejected() {
    let (_dir, config_path, db_path) = setup_test_env("");

    reel_send(&config_path, &db_path)
        .args(["--poll-interval", "0s"])
        .assert()
        .failure()
        .code(3);
}

#[cfg(unix)]
#[tokio::test]
async fn test_once_publishes_due_task_through_uploader() {
    let (dir, _, _) = setup_test_env("");
    let script = dir.path().join("upload.sh");
    fs::write(
        &script,
        "#!/bin/sh\ncat > /dev/null\necho 'uploading...'\necho '{\"status\":\"success\",\"posted_id\":\"yt-42\"}'\n",
    )
    .unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    }

    let (_cfg_dir, config_path, db_path) = setup_test_env(&format!(
        r#"
[publishers.youtube]
command = "{}"
"#,
        script.display()
    ));
    let task_id = create_due_task(&dir, &config_path, &db_path).await;

    reel_send(&config_path, &db_path)
        .arg("--once")
        .assert()
        .success();

    let db = Database::new(&db_path).await.unwrap();
    let task = db.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Posted);
    assert_eq!(task.posted_id.as_deref(), Some("yt-42"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_once_records_rejection_as_failure() {
    let (dir, _, _) = setup_test_env("");
    let script = dir.path().join("upload.sh");
    fs::write(
        &script,
        "#!/bin/sh\ncat > /dev/null\necho '{\"status\":\"failure\",\"error_kind\":\"permanent_reject\",\"message\":\"video too long\"}'\n",
    )
    .unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    }

    let (_cfg_dir, config_path, db_path) = setup_test_env(&format!(
        r#"
[publishers.youtube]
command = "{}"
"#,
        script.display()
    ));
    let task_id = create_due_task(&dir, &config_path, &db_path).await;

    reel_send(&config_path, &db_path)
        .arg("--once")
        .assert()
        .success();

    let db = Database::new(&db_path).await.unwrap();
    let task = db.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert!(task.last_error.unwrap().contains("video too long"));
}
