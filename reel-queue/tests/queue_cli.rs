//! Integration tests for the reel-queue commands

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Helper to escape path for TOML on Windows
fn escape_path_for_toml(path: &str) -> String {
    path.replace('\\', "\\\\")
}

struct TestEnv {
    dir: TempDir,
    config_path: String,
    db_path: String,
}

impl TestEnv {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");
        let db_path = dir.path().join("data").join("reelcast.db");

        let config_content = format!(
            r#"
[database]
path = "{}"

[defaults]
title = "Daily short"

[schedule]
weekdays = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"]
times = ["09:00", "18:00"]
timezone = "UTC"

[platforms]
enabled = ["youtube", "tiktok"]
"#,
            escape_path_for_toml(&db_path.to_string_lossy())
        );
        fs::write(&config_path, config_content).unwrap();

        Self {
            dir,
            config_path: config_path.to_string_lossy().to_string(),
            db_path: db_path.to_string_lossy().to_string(),
        }
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("reel-queue").unwrap();
        cmd.env("REELCAST_CONFIG", &self.config_path)
            .env("REELCAST_DB_PATH", &self.db_path);
        cmd
    }

    fn video(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, b"fake mp4 bytes").unwrap();
        path
    }

    fn json(&self, args: &[&str]) -> serde_json::Value {
        let output = self.cmd().args(args).output().unwrap();
        assert!(output.status.success(), "{:?} failed: {:?}", args, output);
        serde_json::from_slice(&output.stdout).unwrap()
    }

    /// Enqueue one video on every enabled platform and return the task ids
    fn enqueue_one(&self, name: &str) -> Vec<String> {
        let video = self.video(name);
        let tasks = self.json(&["enqueue", video.to_str().unwrap(), "--format", "json"]);
        tasks
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_str().unwrap().to_string())
            .collect()
    }
}

#[test]
fn test_enqueue_fans_out_to_enabled_platforms() {
    let env = TestEnv::new();
    let first = env.video("first.mp4");
    let second = env.video("second.mp4");

    let tasks = env.json(&[
        "enqueue",
        first.to_str().unwrap(),
        second.to_str().unwrap(),
        "--format",
        "json",
    ]);
    let tasks = tasks.as_array().unwrap();
    assert_eq!(tasks.len(), 4);
    assert!(tasks.iter().all(|t| t["state"] == "pending"));
    assert!(tasks.iter().all(|t| t["title"] == "Daily short"));

    let youtube = tasks.iter().filter(|t| t["platform"] == "youtube").count();
    let tiktok = tasks.iter().filter(|t| t["platform"] == "tiktok").count();
    assert_eq!((youtube, tiktok), (2, 2));
}

#[test]
fn test_enqueue_with_explicit_platform_and_title() {
    let env = TestEnv::new();
    let video = env.video("clip.mp4");

    let tasks = env.json(&[
        "enqueue",
        video.to_str().unwrap(),
        "--platform",
        "instagram",
        "--title",
        "Behind the scenes",
        "--format",
        "json",
    ]);
    let tasks = tasks.as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["platform"], "instagram");
    assert_eq!(tasks[0]["title"], "Behind the scenes");
}

#[test]
fn test_enqueue_missing_file_is_invalid_input() {
    let env = TestEnv::new();
    let missing = env.dir.path().join("nope.mp4");

    env.cmd()
        .args(["enqueue", missing.to_str().unwrap()])
        .assert()
        .failure()
        .code(3);

    // Nothing was stored
    let tasks = env.json(&["list", "--format", "json"]);
    assert!(tasks.as_array().unwrap().is_empty());
}

#[test]
fn test_list_filters_by_platform() {
    let env = TestEnv::new();
    env.enqueue_one("a.mp4");
    env.enqueue_one("b.mp4");

    let tasks = env.json(&["list", "--platform", "tiktok", "--format", "json"]);
    let tasks = tasks.as_array().unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t["platform"] == "tiktok"));

    env.cmd()
        .args(["list", "--platform", "myspace"])
        .assert()
        .failure();
}

#[test]
fn test_reschedule_to_explicit_time() {
    let env = TestEnv::new();
    let ids = env.enqueue_one("a.mp4");

    env.cmd()
        .args(["reschedule", &ids[0], "2030-01-01 10:00"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2030-01-01 10:00 UTC"));

    env.cmd()
        .args(["reschedule", &ids[0], "someday maybe"])
        .assert()
        .failure()
        .code(3);
}

#[test]
fn test_push_moves_to_a_later_slot() {
    let env = TestEnv::new();
    let ids = env.enqueue_one("a.mp4");

    let before = env.json(&["list", "--format", "json"]);
    let scheduled = |tasks: &serde_json::Value, id: &str| {
        tasks
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["id"] == id)
            .map(|t| t["scheduled_time"].as_str().unwrap().to_string())
            .unwrap()
    };
    let old = scheduled(&before, &ids[0]);

    env.cmd().args(["push", &ids[0]]).assert().success();

    let after = env.json(&["list", "--format", "json"]);
    let new = scheduled(&after, &ids[0]);
    let old: chrono::DateTime<chrono::Utc> = old.parse().unwrap();
    let new: chrono::DateTime<chrono::Utc> = new.parse().unwrap();
    assert!(new > old);
}

#[test]
fn test_remove_then_task_is_gone() {
    let env = TestEnv::new();
    let ids = env.enqueue_one("a.mp4");

    env.cmd()
        .args(["history", &ids[0]])
        .assert()
        .success()
        .stdout(predicate::str::contains("pending"));

    env.cmd()
        .args(["remove", &ids[0]])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed"));

    env.cmd().args(["remove", &ids[0]]).assert().failure().code(1);
    env.cmd().args(["now", &ids[0]]).assert().failure().code(1);
    env.cmd().args(["history", "no-such-task"]).assert().failure().code(1);
}

#[test]
fn test_now_makes_task_due() {
    let env = TestEnv::new();
    let ids = env.enqueue_one("a.mp4");

    env.cmd()
        .args(["now", &ids[1]])
        .assert()
        .success()
        .stdout(predicate::str::contains("is due"));
}

#[test]
fn test_pause_resume_and_stats() {
    let env = TestEnv::new();
    env.enqueue_one("a.mp4");

    env.cmd()
        .args(["pause", "--reason", "vacation"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Queue paused"));

    let stats = env.json(&["stats", "--format", "json"]);
    assert_eq!(stats["paused"], true);
    assert_eq!(stats["pause_reason"], "vacation");
    assert_eq!(stats["counts"].as_array().unwrap().len(), 2);

    env.cmd()
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("PAUSED: vacation"))
        .stdout(predicate::str::contains("youtube: 1 pending"));

    env.cmd()
        .arg("resume")
        .assert()
        .success()
        .stdout(predicate::str::contains("Queue resumed"));

    let stats = env.json(&["stats", "--format", "json"]);
    assert_eq!(stats["paused"], false);
}

#[test]
fn test_reshuffle_and_sweep() {
    let env = TestEnv::new();
    env.enqueue_one("a.mp4");
    env.enqueue_one("b.mp4");

    env.cmd()
        .arg("reshuffle")
        .assert()
        .success()
        .stdout(predicate::str::contains("Reshuffled 4 task(s)"));

    env.cmd()
        .args(["sweep", "--older-than", "30d"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Archived 0 task(s)"));

    env.cmd()
        .args(["sweep", "--older-than", "a while"])
        .assert()
        .failure()
        .code(3);
}
