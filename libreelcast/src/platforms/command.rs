//! Process-backed publisher
//!
//! Each platform's uploader is an operator-supplied program. Reelcast spawns it
//! once per attempt, writes a JSON job to its stdin and reads a single JSON
//! result from its stdout:
//!
//! ```text
//! stdin:  {"task_id": "...", "platform": "youtube", "media_reference": "/v/a.mp4",
//!          "title": "...", "description": "...",
//!          "credential": {"account": "main", "kind": "token", "secret": "..."}}
//! stdout: {"status": "success", "posted_id": "abc123"}
//!     or: {"status": "failure", "error_kind": "rate_limited", "message": "..."}
//! ```
//!
//! A verifier uses the same program with `verify_args` and answers
//! `{"status": "valid" | "stale" | "invalid", "estimated_expiry": "<rfc3339>"}`.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::PublisherConfig;
use crate::credentials::{Credential, CredentialStatus, CredentialVerifier, Verification};
use crate::error::{CredentialError, PublishError, PublishErrorKind, Result};
use crate::platforms::{PublishReceipt, PublishRequest, Publisher};
use crate::types::Platform;

/// Longest slice of stderr quoted in an error message
const STDERR_EXCERPT: usize = 400;

#[derive(Serialize)]
struct Job<'a> {
    #[serde(flatten)]
    request: &'a PublishRequest,
    credential: CredentialPayload<'a>,
}

#[derive(Serialize)]
struct CredentialPayload<'a> {
    account: &'a str,
    kind: &'a str,
    secret: &'a str,
}

impl<'a> CredentialPayload<'a> {
    fn from_credential(credential: &'a Credential) -> Self {
        Self {
            account: &credential.account,
            kind: credential.kind.as_str(),
            secret: credential.secret.expose_secret(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum UploadOutput {
    Success {
        posted_id: String,
    },
    Failure {
        error_kind: String,
        #[serde(default)]
        message: String,
    },
}

#[derive(Deserialize)]
struct VerifyOutput {
    status: CredentialStatus,
    #[serde(default)]
    estimated_expiry: Option<DateTime<Utc>>,
}

struct RunOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Runs an uploader program per publish attempt
pub struct CommandPublisher {
    platform: Platform,
    config: PublisherConfig,
}

impl CommandPublisher {
    pub fn new(platform: Platform, config: PublisherConfig) -> Self {
        Self { platform, config }
    }

    /// A verifier for the same program, if `verify_args` is configured
    pub fn verifier(&self) -> Option<CommandVerifier> {
        self.config.verify_args.as_ref().map(|args| CommandVerifier {
            platform: self.platform,
            command: self.config.command.clone(),
            args: args.clone(),
        })
    }
}

async fn run(
    platform: Platform,
    command: &str,
    args: &[String],
    stdin_payload: &[u8],
) -> std::io::Result<RunOutput> {
    let program = shellexpand::tilde(command).to_string();
    let mut child = Command::new(&program)
        .args(args)
        .env("REELCAST_PLATFORM", platform.as_str())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        // The program may exit without reading its input
        if let Err(e) = stdin.write_all(stdin_payload).await {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e);
            }
        }
        drop(stdin);
    }

    let output = child.wait_with_output().await?;
    Ok(RunOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// The JSON result is the last non-empty line of stdout
fn last_line(stdout: &str) -> &str {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
}

fn excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.chars().count() <= STDERR_EXCERPT {
        return trimmed.to_string();
    }
    let tail: String = trimmed
        .chars()
        .rev()
        .take(STDERR_EXCERPT)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{}", tail)
}

#[async_trait]
impl Publisher for CommandPublisher {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn publish(
        &self,
        request: &PublishRequest,
        credential: &Credential,
    ) -> std::result::Result<PublishReceipt, PublishError> {
        let media = Path::new(&request.media_reference);
        if !media.is_file() {
            return Err(PublishError::PermanentReject(format!(
                "media file {} does not exist",
                request.media_reference
            )));
        }

        let job = Job {
            request,
            credential: CredentialPayload::from_credential(credential),
        };
        let payload = serde_json::to_vec(&job)
            .map_err(|e| PublishError::PermanentReject(format!("could not encode job: {}", e)))?;

        tracing::debug!(
            platform = %self.platform,
            task_id = %request.task_id,
            command = %self.config.command,
            "Starting uploader"
        );

        let output = run(self.platform, &self.config.command, &self.config.args, &payload)
            .await
            .map_err(|e| {
                PublishError::TransientNetwork(format!(
                    "could not run uploader '{}': {}",
                    self.config.command, e
                ))
            })?;

        match serde_json::from_str::<UploadOutput>(last_line(&output.stdout)) {
            Ok(UploadOutput::Success { posted_id }) if !posted_id.trim().is_empty() => {
                Ok(PublishReceipt { posted_id })
            }
            Ok(UploadOutput::Success { .. }) => Err(PublishError::TransientNetwork(
                "uploader reported success without a posted_id".to_string(),
            )),
            Ok(UploadOutput::Failure {
                error_kind,
                message,
            }) => {
                let kind = error_kind
                    .parse::<PublishErrorKind>()
                    .unwrap_or(PublishErrorKind::TransientNetwork);
                Err(PublishError::new(kind, message))
            }
            Err(e) => {
                tracing::warn!(
                    platform = %self.platform,
                    task_id = %request.task_id,
                    exit_ok = output.success,
                    stderr = %excerpt(&output.stderr),
                    "Uploader produced no usable result"
                );
                Err(PublishError::TransientNetwork(format!(
                    "uploader output unreadable ({}): {}",
                    e,
                    excerpt(&output.stderr)
                )))
            }
        }
    }
}

/// Runs the uploader program in credential-check mode
pub struct CommandVerifier {
    platform: Platform,
    command: String,
    args: Vec<String>,
}

#[async_trait]
impl CredentialVerifier for CommandVerifier {
    async fn verify(&self, credential: &Credential) -> Result<Verification> {
        let payload = serde_json::to_vec(&CredentialPayload::from_credential(credential))
            .map_err(|e| CredentialError::Verification(e.to_string()))?;

        let output = run(self.platform, &self.command, &self.args, &payload)
            .await
            .map_err(|e| {
                CredentialError::Verification(format!("could not run '{}': {}", self.command, e))
            })?;

        let parsed: VerifyOutput = serde_json::from_str(last_line(&output.stdout)).map_err(|e| {
            CredentialError::Verification(format!(
                "unreadable verifier output ({}): {}",
                e,
                excerpt(&output.stderr)
            ))
        })?;

        Ok(Verification {
            status: parsed.status,
            estimated_expiry: parsed.estimated_expiry,
        })
    }
}
