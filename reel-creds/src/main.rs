//! reel-creds - Credential management tool for Reelcast
//!
//! Links, inspects, verifies and removes the platform credentials the
//! uploaders run with.

use std::io::Read;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use libreelcast::credentials::DEFAULT_ACCOUNT;
use libreelcast::logging::LoggingConfig;
use libreelcast::{Credential, Platform, RawCredential, Reelcast, ReelcastError};

#[derive(Parser)]
#[command(name = "reel-creds")]
#[command(version)]
#[command(about = "Manage Reelcast platform credentials")]
#[command(long_about = "\
reel-creds - Manage Reelcast platform credentials

DESCRIPTION:
    Every upload runs with the platform's most recently linked credential.
    Credentials are API tokens, browser cookie headers, or JSON cookie
    exports; the format is detected automatically with --stdin.

    Secrets are stored in the Reelcast database and are never printed.

USAGE EXAMPLES:
    reel-creds link youtube --token ya29.a0Af...
    reel-creds link tiktok --json-file ~/Downloads/cookies.json
    pbpaste | reel-creds link instagram --stdin
    reel-creds list --format json
    reel-creds verify tiktok
    reel-creds unlink instagram --account brand

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database, configuration or credential error
    3 - Invalid input
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct Source {
    /// API or session token
    #[arg(long)]
    token: Option<String>,

    /// Cookie header, e.g. "sessionid=abc; csrftoken=def"
    #[arg(long)]
    cookie: Option<String>,

    /// JSON cookie export from a browser extension
    #[arg(long, value_name = "PATH")]
    json_file: Option<String>,

    /// Read the credential from stdin and detect its format
    #[arg(long)]
    stdin: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a credential for a platform
    Link {
        /// Platform name (youtube, instagram, tiktok)
        platform: Platform,

        /// Account name
        #[arg(long, default_value = DEFAULT_ACCOUNT)]
        account: String,

        #[command(flatten)]
        source: Source,
    },

    /// List stored credentials (without showing values)
    List {
        /// Filter by platform
        #[arg(long)]
        platform: Option<Platform>,

        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Check a platform's active credential with its uploader
    Verify {
        /// Platform name, or omit to check every linked platform
        platform: Option<Platform>,
    },

    /// Delete credentials for a platform
    Unlink {
        /// Platform name (youtube, instagram, tiktok)
        platform: Platform,

        /// Only this account (default: every account of the platform)
        #[arg(long)]
        account: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run_command(cli.command).await {
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<ReelcastError>()
            .map(ReelcastError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run_command(command: Commands) -> Result<()> {
    let service = Reelcast::new().await?;

    match command {
        Commands::Link {
            platform,
            account,
            source,
        } => link_credential(&service, platform, &account, source).await,
        Commands::List { platform, format } => list_credentials(&service, platform, format).await,
        Commands::Verify { platform } => verify_credentials(&service, platform).await,
        Commands::Unlink { platform, account } => {
            let removed = service
                .credentials()
                .store()
                .unlink(platform, account.as_deref())
                .await?;
            if removed == 0 {
                println!("No credentials found for {}", platform);
            } else {
                println!("✓ Removed {} credential(s) for {}", removed, platform);
            }
            Ok(())
        }
    }
}

fn read_source(source: Source) -> Result<RawCredential> {
    if let Some(token) = source.token {
        return Ok(RawCredential::Token(token));
    }
    if let Some(cookie) = source.cookie {
        return Ok(RawCredential::CookieHeader(cookie));
    }
    if let Some(path) = source.json_file {
        let expanded = shellexpand::tilde(&path).to_string();
        let content = std::fs::read_to_string(&expanded)
            .with_context(|| format!("Failed to read cookie export {}", expanded))?;
        return Ok(RawCredential::JsonExport(content));
    }

    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read credential from stdin")?;
    Ok(RawCredential::detect(&input)?)
}

async fn link_credential(
    service: &Reelcast,
    platform: Platform,
    account: &str,
    source: Source,
) -> Result<()> {
    let raw = read_source(source)?;
    let credential = service
        .credentials()
        .store()
        .link(platform, account, raw, Utc::now())
        .await?;

    println!(
        "✓ Linked {} credential for {} account '{}'",
        credential.kind.as_str(),
        platform,
        credential.account
    );
    if let Some(expiry) = credential.estimated_expiry {
        println!("  Expires around {}", format_time(expiry));
    }
    if !service.config().platforms.enabled.contains(&platform) {
        println!("  Note: {} is not in [platforms] enabled", platform);
    }
    Ok(())
}

async fn list_credentials(service: &Reelcast, platform: Option<Platform>, format: Format) -> Result<()> {
    let credentials: Vec<Credential> = service
        .credentials()
        .store()
        .list()
        .await?
        .into_iter()
        .filter(|c| platform.map(|p| c.platform == p).unwrap_or(true))
        .collect();

    if format == Format::Json {
        let rows: Vec<serde_json::Value> = credentials.iter().map(credential_json).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if credentials.is_empty() {
        println!("No credentials stored.");
        println!();
        println!("To add credentials, run:");
        println!("  reel-creds link <platform> --stdin");
        return Ok(());
    }

    println!("Stored credentials:");
    println!();
    for credential in &credentials {
        println!(
            "  ✓ {} [{}]: {} ({}, {})",
            credential.platform,
            credential.account,
            credential.kind.as_str(),
            credential.status,
            credential
                .last_verified_at
                .map(|at| format!("verified {}", format_time(at)))
                .unwrap_or_else(|| "never verified".to_string()),
        );
        if let Some(expiry) = credential.estimated_expiry {
            println!("      expires around {}", format_time(expiry));
        }
    }
    Ok(())
}

async fn verify_credentials(service: &Reelcast, platform: Option<Platform>) -> Result<()> {
    let monitor = service.credentials();
    let now = Utc::now();

    let Some(platform) = platform else {
        let report = monitor.health_check(now).await?;
        println!(
            "Checked {}: {} verified, {} stale, {} invalid",
            report.checked, report.verified, report.stale, report.invalid
        );
        if report.invalid > 0 {
            anyhow::bail!("{} credential(s) need to be re-linked", report.invalid);
        }
        return Ok(());
    };

    let credential = monitor.verify_now(platform, now).await?;
    println!(
        "{} account '{}': {}",
        platform, credential.account, credential.status
    );
    if let Some(expiry) = credential.estimated_expiry {
        println!("  Expires around {}", format_time(expiry));
    }
    if credential.status != libreelcast::CredentialStatus::Valid {
        anyhow::bail!("{} credential is {}; re-link it", platform, credential.status);
    }
    Ok(())
}

fn credential_json(credential: &Credential) -> serde_json::Value {
    serde_json::json!({
        "platform": credential.platform,
        "account": credential.account,
        "kind": credential.kind.as_str(),
        "status": credential.status.as_str(),
        "linked_at": credential.linked_at,
        "last_verified_at": credential.last_verified_at,
        "estimated_expiry": credential.estimated_expiry,
    })
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M UTC").to_string()
}
