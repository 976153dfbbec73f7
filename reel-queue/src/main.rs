//! reel-queue - Manage the upload queue
//!
//! Unix-style tool for adding videos to the Reelcast queue and steering the
//! tasks already in it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use libreelcast::logging::LoggingConfig;
use libreelcast::types::{StateCount, TaskFilter, TaskTransition};
use libreelcast::{
    when, Config, Database, NewMedia, Platform, ReelcastError, Result, Task, TaskQueue, TaskState,
};

#[derive(Parser, Debug)]
#[command(name = "reel-queue")]
#[command(version)]
#[command(about = "Manage the upload queue")]
#[command(long_about = "\
reel-queue - Manage the upload queue

DESCRIPTION:
    reel-queue adds videos to the Reelcast queue and manages the tasks in it.
    Every video becomes one task per platform, each placed on the next free
    slot of the weekly timetable in [schedule].

COMMANDS:
    enqueue     Add videos to the queue
    list        List tasks
    stats       Task counts per platform and state
    history     State transitions of one task
    push        Move a task to the next free slot
    reshuffle   Reassign all waiting tasks to fresh slots in random order
    reschedule  Put a task at a specific time
    now         Upload a task on the next daemon tick
    remove      Delete a task
    pause       Stop the daemon from starting uploads
    resume      Resume uploads and reset the failure streak
    sweep       Archive posted and failed tasks

USAGE EXAMPLES:
    reel-queue enqueue clips/*.mp4 --title \"Daily short\" --platform youtube --platform tiktok
    reel-queue list --state pending --format json
    reel-queue reschedule <TASK_ID> \"2025-03-01 18:00\"
    reel-queue sweep --older-than 30d

CONFIGURATION:
    Configuration file: ~/.config/reelcast/config.toml
    Database location: ~/.local/share/reelcast/reelcast.db

    Override with environment variables:
        REELCAST_CONFIG    - Path to config file
        REELCAST_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed (task not found, not allowed in its state, slot taken)
    2 - Database or configuration error
    3 - Invalid input (bad file, time format, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add videos to the queue
    Enqueue {
        /// Video files
        #[arg(required = true)]
        files: Vec<String>,

        /// Title for every file (default: [defaults] title)
        #[arg(long)]
        title: Option<String>,

        /// Description for every file (default: [defaults] description)
        #[arg(long)]
        description: Option<String>,

        /// Target platform; repeat for several (default: all enabled)
        #[arg(short, long)]
        platform: Vec<Platform>,

        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// List tasks
    List {
        #[arg(short, long)]
        platform: Option<Platform>,

        #[arg(short, long)]
        state: Option<TaskState>,

        #[arg(short = 'n', long)]
        limit: Option<usize>,

        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Task counts per platform and state
    Stats {
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// State transitions of one task
    History {
        task_id: String,

        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Move a task to the next free slot after its current one
    Push { task_id: String },

    /// Reassign waiting tasks to fresh slots in random order
    Reshuffle {
        #[arg(short, long)]
        platform: Option<Platform>,
    },

    /// Put a task at a specific time
    Reschedule {
        task_id: String,

        /// New time, e.g. "2025-03-01 18:00", "in 2h", "tomorrow 9am"
        time: String,
    },

    /// Upload a task on the next daemon tick
    Now { task_id: String },

    /// Delete a task (not while it is uploading)
    Remove { task_id: String },

    /// Stop the daemon from starting uploads
    Pause {
        #[arg(long, default_value = "paused by operator")]
        reason: String,
    },

    /// Resume uploads and reset the failure streak
    Resume,

    /// Archive posted and failed tasks
    Sweep {
        /// Only tasks last updated longer ago than this, e.g. 30d
        #[arg(long, value_name = "DURATION")]
        older_than: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env(cli.verbose).init();

    // Run the main logic and handle errors
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Arc::new(Database::new(&config.db_path()).await?);
    let queue = TaskQueue::new(db, config.schedule()?);
    let now = Utc::now();

    match cli.command {
        Commands::Enqueue {
            files,
            title,
            description,
            platform,
            format,
        } => {
            let title = title.unwrap_or_else(|| config.defaults.title.clone());
            let description = description.unwrap_or_else(|| config.defaults.description.clone());
            let platforms = if platform.is_empty() {
                config.platforms.enabled.clone()
            } else {
                platform
            };
            let media = files
                .into_iter()
                .map(|file| NewMedia::new(file, title.clone(), description.clone()))
                .collect();
            let tasks = queue.enqueue(media, &platforms, now).await?;
            print_tasks(&tasks, format, now)?;
        }
        Commands::List {
            platform,
            state,
            limit,
            format,
        } => {
            let filter = TaskFilter {
                platform,
                state,
                media_id: None,
                limit,
            };
            let tasks = queue.list(&filter).await?;
            print_tasks(&tasks, format, now)?;
        }
        Commands::Stats { format } => {
            let stats = queue.stats().await?;
            let state = queue.queue_state().await?;
            match format {
                Format::Json => print_json(&serde_json::json!({
                    "paused": state.paused,
                    "pause_reason": state.pause_reason,
                    "consecutive_failures": state.consecutive_failures,
                    "counts": stats,
                }))?,
                Format::Text => print_stats(&stats, state.paused, state.pause_reason.as_deref()),
            }
        }
        Commands::History { task_id, format } => {
            let history = queue.history(&task_id).await?;
            match format {
                Format::Json => print_json(&history)?,
                Format::Text => print_history(&history),
            }
        }
        Commands::Push { task_id } => {
            let task = queue.push_to_next_slot(&task_id, now).await?;
            println!("{} -> {}", task.id, format_time(task.scheduled_time));
        }
        Commands::Reshuffle { platform } => {
            let moved = queue.reshuffle(platform, now).await?;
            println!("Reshuffled {} task(s)", moved);
        }
        Commands::Reschedule { task_id, time } => {
            let at = when::parse_when(&time, now, queue.schedule().timezone())?;
            let task = queue.reschedule(&task_id, at, now).await?;
            println!("{} -> {}", task.id, format_time(task.scheduled_time));
        }
        Commands::Now { task_id } => {
            let task = queue.force_now(&task_id, now).await?;
            println!("{} is due; reel-send uploads it on its next tick", task.id);
        }
        Commands::Remove { task_id } => {
            queue.remove(&task_id).await?;
            println!("Removed {}", task_id);
        }
        Commands::Pause { reason } => {
            if queue.pause(&reason, now).await? {
                println!("Queue paused");
            } else {
                println!("Queue was already paused");
            }
        }
        Commands::Resume => {
            if queue.resume().await? {
                println!("Queue resumed");
            } else {
                println!("Queue was not paused; failure streak reset");
            }
        }
        Commands::Sweep { older_than } => {
            let older_than = when::parse_duration(&older_than)?;
            let swept = queue.sweep(older_than, now).await?;
            println!("Archived {} task(s)", swept);
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| ReelcastError::InvalidInput(format!("Could not encode output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

fn print_tasks(tasks: &[Task], format: Format, now: DateTime<Utc>) -> Result<()> {
    if format == Format::Json {
        return print_json(tasks);
    }

    for task in tasks {
        let mut line = format!(
            "{} | {:<9} | {:<13} | {} ({}) | {}",
            task.id,
            task.platform,
            task.state,
            format_time(task.scheduled_time),
            format_time_until(now, task.eligible_at()),
            truncate_content(&task.title, 40),
        );
        if task.attempt_count > 0 {
            line.push_str(&format!(" | attempts {}", task.attempt_count));
        }
        if let Some(error) = &task.last_error {
            line.push_str(&format!(" | {}", truncate_content(error, 60)));
        }
        println!("{}", line);
    }
    Ok(())
}

fn print_stats(stats: &[StateCount], paused: bool, reason: Option<&str>) {
    if paused {
        println!("Queue PAUSED: {}", reason.unwrap_or("no reason recorded"));
    }
    for platform in Platform::ALL {
        let counts: Vec<String> = stats
            .iter()
            .filter(|s| s.platform == platform)
            .map(|s| format!("{} {}", s.count, s.state))
            .collect();
        if counts.is_empty() {
            continue;
        }
        println!("{}: {}", platform, counts.join(", "));
    }
}

fn print_history(history: &[TaskTransition]) {
    for entry in history {
        let from = entry
            .from_state
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        match &entry.note {
            Some(note) => println!("{} {} -> {} ({})", format_time(entry.at), from, entry.to_state, note),
            None => println!("{} {} -> {}", format_time(entry.at), from, entry.to_state),
        }
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M UTC").to_string()
}

/// Truncate content to max length with ellipsis
fn truncate_content(content: &str, max_len: usize) -> String {
    if content.chars().count() <= max_len {
        content.to_string()
    } else {
        let truncated: String = content.chars().take(max_len).collect();
        format!("{}...", truncated)
    }
}

/// Format time until scheduled time in human-readable format
fn format_time_until(now: DateTime<Utc>, at: DateTime<Utc>) -> String {
    let diff = (at - now).num_seconds();

    if diff < 0 {
        return "overdue".to_string();
    }

    let minutes = diff / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("in {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if minutes > 0 {
        format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        "in <1 minute".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_truncate_content() {
        assert_eq!(truncate_content("short", 10), "short");
        assert_eq!(truncate_content("ábcdéfgh", 4), "ábcd...");
    }

    #[test]
    fn test_format_time_until() {
        let now = Utc.with_ymd_and_hms(2025, 1, 6, 8, 0, 0).unwrap();
        assert_eq!(format_time_until(now, now - Duration::minutes(1)), "overdue");
        assert_eq!(format_time_until(now, now + Duration::seconds(30)), "in <1 minute");
        assert_eq!(format_time_until(now, now + Duration::hours(1)), "in 1 hour");
        assert_eq!(format_time_until(now, now + Duration::days(3)), "in 3 days");
    }
}
