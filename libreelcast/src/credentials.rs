//! Platform credentials and their health
//!
//! Raw credential material arrives in whatever shape the operator has at hand
//! (a bare token, a `Cookie:` header copied from a browser, or a JSON cookie
//! export). [`RawCredential`] parses it once into a normalized secret which
//! is stored per `(platform, account)`.
//!
//! [`CredentialMonitor`] owns the health state machine: it decides whether a
//! platform may publish right now, re-verifies credentials through an
//! optional [`CredentialVerifier`], ages unverified ones to `stale`, and
//! sends the one-shot `AuthGap` / `CredentialStale` notifications.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::db::Database;
use crate::error::{CredentialError, ReelcastError, Result};
use crate::notify::{Event, Notifier};
use crate::types::Platform;

pub const DEFAULT_ACCOUNT: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Valid,
    Stale,
    Invalid,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Valid => "valid",
            CredentialStatus::Stale => "stale",
            CredentialStatus::Invalid => "invalid",
        }
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialStatus {
    type Err = ReelcastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "valid" => Ok(CredentialStatus::Valid),
            "stale" => Ok(CredentialStatus::Stale),
            "invalid" => Ok(CredentialStatus::Invalid),
            other => Err(ReelcastError::InvalidInput(format!(
                "Unknown credential status: {}",
                other
            ))),
        }
    }
}

/// Shape of the stored secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    Token,
    CookieHeader,
    JsonExport,
}

impl SecretKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretKind::Token => "token",
            SecretKind::CookieHeader => "cookie_header",
            SecretKind::JsonExport => "json_export",
        }
    }
}

impl FromStr for SecretKind {
    type Err = ReelcastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "token" => Ok(SecretKind::Token),
            "cookie_header" => Ok(SecretKind::CookieHeader),
            "json_export" => Ok(SecretKind::JsonExport),
            other => Err(ReelcastError::InvalidInput(format!(
                "Unknown secret kind: {}",
                other
            ))),
        }
    }
}

/// A linked account. The secret is never logged or serialized.
#[derive(Debug)]
pub struct Credential {
    pub platform: Platform,
    pub account: String,
    pub kind: SecretKind,
    pub secret: SecretString,
    pub status: CredentialStatus,
    pub linked_at: DateTime<Utc>,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub estimated_expiry: Option<DateTime<Utc>>,
}

impl Credential {
    /// Last point at which the credential was known good.
    pub fn verified_anchor(&self) -> DateTime<Utc> {
        self.last_verified_at.unwrap_or(self.linked_at)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.verified_anchor()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.estimated_expiry.map(|e| e <= now).unwrap_or(false)
    }
}

/// Operator-supplied credential material before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawCredential {
    Token(String),
    CookieHeader(String),
    JsonExport(String),
}

/// Result of [`RawCredential::normalize`].
pub struct NormalizedSecret {
    pub kind: SecretKind,
    pub secret: SecretString,
    pub estimated_expiry: Option<DateTime<Utc>>,
}

impl RawCredential {
    /// Guess the format: JSON if it starts with `{` or `[`, a cookie header if
    /// it has a `Cookie:` prefix or `name=value` pairs, otherwise a token.
    pub fn detect(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(CredentialError::Unparseable("credential is empty".to_string()).into());
        }
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            return Ok(RawCredential::JsonExport(trimmed.to_string()));
        }
        if strip_cookie_prefix(trimmed).is_some() || trimmed.contains('=') {
            return Ok(RawCredential::CookieHeader(trimmed.to_string()));
        }
        Ok(RawCredential::Token(trimmed.to_string()))
    }

    pub fn normalize(self) -> Result<NormalizedSecret> {
        match self {
            RawCredential::Token(mut raw) => {
                let token = raw.trim().to_string();
                raw.zeroize();
                if token.is_empty() || token.chars().any(char::is_whitespace) {
                    return Err(CredentialError::Unparseable(
                        "token must be a single non-empty word".to_string(),
                    )
                    .into());
                }
                Ok(NormalizedSecret {
                    kind: SecretKind::Token,
                    secret: SecretString::from(token),
                    estimated_expiry: None,
                })
            }
            RawCredential::CookieHeader(mut raw) => {
                let header = normalize_cookie_header(&raw);
                raw.zeroize();
                Ok(NormalizedSecret {
                    kind: SecretKind::CookieHeader,
                    secret: SecretString::from(header?),
                    estimated_expiry: None,
                })
            }
            RawCredential::JsonExport(mut raw) => {
                let parsed = normalize_json_export(&raw);
                raw.zeroize();
                parsed
            }
        }
    }
}

fn strip_cookie_prefix(input: &str) -> Option<&str> {
    let prefix = input.get(..7)?;
    if prefix.eq_ignore_ascii_case("cookie:") {
        Some(input[7..].trim_start())
    } else {
        None
    }
}

fn normalize_cookie_header(input: &str) -> Result<String> {
    let body = strip_cookie_prefix(input.trim()).unwrap_or(input.trim());
    let mut pairs = Vec::new();
    for part in body.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                pairs.push(format!("{}={}", name.trim(), value.trim()))
            }
            _ => {
                return Err(CredentialError::Unparseable(
                    "cookie segments must be name=value pairs".to_string(),
                )
                .into())
            }
        }
    }
    if pairs.is_empty() {
        return Err(CredentialError::Unparseable("cookie header has no cookies".to_string()).into());
    }
    Ok(pairs.join("; "))
}

/// Cookie arrays (browser exports, optionally wrapped in `{"cookies": [...]}`)
/// become a cookie header; any other JSON is stored compacted.
fn normalize_json_export(input: &str) -> Result<NormalizedSecret> {
    let value: serde_json::Value = serde_json::from_str(input)
        .map_err(|e| CredentialError::Unparseable(format!("invalid JSON: {}", e)))?;

    let cookies = match &value {
        serde_json::Value::Array(items) => Some(items),
        serde_json::Value::Object(map) => map.get("cookies").and_then(|c| c.as_array()),
        _ => None,
    };

    if let Some(cookies) = cookies {
        let mut pairs = Vec::new();
        let mut latest_expiry: Option<DateTime<Utc>> = None;
        for cookie in cookies {
            let name = cookie.get("name").and_then(|v| v.as_str());
            let value = cookie.get("value").and_then(|v| v.as_str());
            let (Some(name), Some(value)) = (name, value) else {
                return Err(CredentialError::Unparseable(
                    "cookie entries need string 'name' and 'value'".to_string(),
                )
                .into());
            };
            pairs.push(format!("{}={}", name, value));

            let expiry = cookie
                .get("expirationDate")
                .or_else(|| cookie.get("expires"))
                .and_then(|v| v.as_f64())
                .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single());
            if let Some(expiry) = expiry {
                latest_expiry = Some(latest_expiry.map_or(expiry, |l| l.max(expiry)));
            }
        }
        if pairs.is_empty() {
            return Err(CredentialError::Unparseable("cookie export is empty".to_string()).into());
        }
        return Ok(NormalizedSecret {
            kind: SecretKind::CookieHeader,
            secret: SecretString::from(pairs.join("; ")),
            estimated_expiry: latest_expiry,
        });
    }

    if !value.is_object() {
        return Err(CredentialError::Unparseable(
            "JSON credential must be an object or a cookie array".to_string(),
        )
        .into());
    }

    Ok(NormalizedSecret {
        kind: SecretKind::JsonExport,
        secret: SecretString::from(value.to_string()),
        estimated_expiry: None,
    })
}

/// Outcome of checking a credential against its platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub status: CredentialStatus,
    #[serde(default)]
    pub estimated_expiry: Option<DateTime<Utc>>,
}

/// Checks whether a credential still works.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, credential: &Credential) -> Result<Verification>;
}

/// Persistence for linked credentials.
#[derive(Clone)]
pub struct CredentialStore {
    db: Arc<Database>,
}

impl CredentialStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store (or replace) the credential for `(platform, account)` as valid and
    /// clear the platform's one-shot warnings.
    pub async fn link(
        &self,
        platform: Platform,
        account: &str,
        raw: RawCredential,
        now: DateTime<Utc>,
    ) -> Result<Credential> {
        let account = account.trim();
        if account.is_empty() {
            return Err(ReelcastError::InvalidInput("account name cannot be empty".to_string()));
        }

        let normalized = raw.normalize()?;
        let credential = Credential {
            platform,
            account: account.to_string(),
            kind: normalized.kind,
            secret: normalized.secret,
            status: CredentialStatus::Valid,
            linked_at: now,
            last_verified_at: Some(now),
            estimated_expiry: normalized.estimated_expiry,
        };
        self.db.upsert_credential(&credential).await?;
        self.clear_warnings(platform).await?;

        tracing::info!(platform = %platform, account = %credential.account, kind = credential.kind.as_str(), "Credential linked");
        Ok(credential)
    }

    /// The credential used for publishing: the most recently linked one
    pub async fn active(&self, platform: Platform) -> Result<Option<Credential>> {
        self.db.active_credential(platform).await
    }

    pub async fn list(&self) -> Result<Vec<Credential>> {
        self.db.list_credentials().await
    }

    /// Remove one account, or every account of the platform when `account`
    /// is `None`
    pub async fn unlink(&self, platform: Platform, account: Option<&str>) -> Result<u64> {
        let removed = self.db.delete_credential(platform, account).await?;
        if removed > 0 {
            tracing::info!(platform = %platform, removed, "Credential unlinked");
        }
        Ok(removed)
    }

    pub async fn set_status(
        &self,
        credential: &Credential,
        status: CredentialStatus,
        verified_at: Option<DateTime<Utc>>,
        estimated_expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.db
            .update_credential_status(
                credential.platform,
                &credential.account,
                status,
                verified_at,
                estimated_expiry,
            )
            .await?;
        Ok(())
    }

    async fn clear_warnings(&self, platform: Platform) -> Result<()> {
        self.db.clear_setting(&auth_gap_flag(platform)).await?;
        self.db.clear_setting(&stale_flag(platform)).await?;
        Ok(())
    }
}

fn auth_gap_flag(platform: Platform) -> String {
    format!("auth_gap_notified.{}", platform)
}

fn stale_flag(platform: Platform) -> String {
    format!("stale_warned.{}", platform)
}

/// Thresholds for credential freshness.
#[derive(Debug, Clone, Copy)]
pub struct CredentialPolicy {
    /// Unverified for this long means stale
    pub stale_after: Duration,
    /// How often the health check re-verifies
    pub verify_interval: Duration,
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::days(25),
            verify_interval: Duration::hours(6),
        }
    }
}

impl CredentialPolicy {
    pub fn from_config(config: &crate::config::CredentialsConfig) -> Result<Self> {
        Ok(Self {
            stale_after: to_chrono(config.stale_after, "credentials.stale_after")?,
            verify_interval: to_chrono(config.verify_interval, "credentials.verify_interval")?,
        })
    }
}

pub(crate) fn to_chrono(value: std::time::Duration, field: &str) -> Result<Duration> {
    Duration::from_std(value).map_err(|e| {
        crate::error::ConfigError::InvalidValue {
            field: field.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

/// Whether a platform may publish right now.
#[derive(Debug)]
pub enum Gate {
    Ready(Credential),
    Blocked(CredentialError),
}

/// Counts from one health check pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub verified: usize,
    pub stale: usize,
    pub invalid: usize,
}

/// Credential health state machine.
#[derive(Clone)]
pub struct CredentialMonitor {
    store: CredentialStore,
    db: Arc<Database>,
    verifiers: HashMap<Platform, Arc<dyn CredentialVerifier>>,
    policy: CredentialPolicy,
    notifier: Notifier,
}

impl CredentialMonitor {
    pub fn new(db: Arc<Database>, policy: CredentialPolicy, notifier: Notifier) -> Self {
        Self {
            store: CredentialStore::new(db.clone()),
            db,
            verifiers: HashMap::new(),
            policy,
            notifier,
        }
    }

    pub fn with_verifier(mut self, platform: Platform, verifier: Arc<dyn CredentialVerifier>) -> Self {
        self.verifiers.insert(platform, verifier);
        self
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn has_verifier(&self, platform: Platform) -> bool {
        self.verifiers.contains_key(&platform)
    }

    /// Decide whether `platform` may publish, re-verifying first if the
    /// credential is stale or past its freshness window.
    pub async fn gate(&self, platform: Platform, now: DateTime<Utc>) -> Result<Gate> {
        let Some(credential) = self.store.active(platform).await? else {
            return Ok(Gate::Blocked(CredentialError::Missing(platform)));
        };

        let needs_refresh = match credential.status {
            CredentialStatus::Invalid => false,
            CredentialStatus::Stale => true,
            CredentialStatus::Valid => {
                credential.age(now) >= self.policy.stale_after || credential.is_expired(now)
            }
        };

        let credential = if needs_refresh {
            self.refresh(credential, now).await?
        } else {
            credential
        };

        Ok(match credential.status {
            CredentialStatus::Valid => Gate::Ready(credential),
            status => Gate::Blocked(CredentialError::NotUsable {
                platform,
                status: status.to_string(),
            }),
        })
    }

    /// Run the verifier (if any) now and record the result.
    pub async fn verify_now(&self, platform: Platform, now: DateTime<Utc>) -> Result<Credential> {
        let credential = self
            .store
            .active(platform)
            .await?
            .ok_or(CredentialError::Missing(platform))?;
        let Some(verifier) = self.verifiers.get(&platform) else {
            return Err(CredentialError::Verification(format!(
                "no verifier configured for {}",
                platform
            ))
            .into());
        };
        let verification = verifier.verify(&credential).await?;
        self.apply(credential, verification, now).await
    }

    /// Mark a credential invalid after the platform rejected it.
    pub async fn invalidate(&self, credential: &Credential, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.store
            .set_status(credential, CredentialStatus::Invalid, None, None)
            .await?;
        tracing::warn!(platform = %credential.platform, account = %credential.account, reason, "Credential marked invalid");
        self.raise_auth_gap(credential.platform, reason, now).await
    }

    /// Emit `AuthGap` unless one is already outstanding for the platform.
    pub async fn raise_auth_gap(&self, platform: Platform, reason: &str, now: DateTime<Utc>) -> Result<()> {
        if self.db.set_flag_once(&auth_gap_flag(platform), now).await? {
            self.notifier
                .notify(Event::AuthGap {
                    platform,
                    reason: reason.to_string(),
                })
                .await;
        }
        Ok(())
    }

    /// Periodic pass over every linked credential.
    pub async fn health_check(&self, now: DateTime<Utc>) -> Result<HealthReport> {
        let mut report = HealthReport::default();

        for credential in self.store.list().await? {
            report.checked += 1;
            if credential.status == CredentialStatus::Invalid {
                report.invalid += 1;
                continue;
            }

            let verification_due = credential.status == CredentialStatus::Stale
                || credential
                    .last_verified_at
                    .map(|at| now - at >= self.policy.verify_interval)
                    .unwrap_or(true);

            let credential = if verification_due && self.has_verifier(credential.platform) {
                report.verified += 1;
                self.refresh(credential, now).await?
            } else if credential.status == CredentialStatus::Valid
                && (credential.age(now) >= self.policy.stale_after || credential.is_expired(now))
            {
                self.mark_stale(credential, now).await?
            } else {
                credential
            };

            match credential.status {
                CredentialStatus::Stale => report.stale += 1,
                CredentialStatus::Invalid => report.invalid += 1,
                CredentialStatus::Valid => {}
            }
        }

        tracing::debug!(?report, "Credential health check finished");
        Ok(report)
    }

    async fn refresh(&self, credential: Credential, now: DateTime<Utc>) -> Result<Credential> {
        let Some(verifier) = self.verifiers.get(&credential.platform) else {
            return match credential.status {
                CredentialStatus::Valid => self.mark_stale(credential, now).await,
                _ => Ok(credential),
            };
        };

        match verifier.verify(&credential).await {
            Ok(verification) => self.apply(credential, verification, now).await,
            Err(e) => {
                tracing::warn!(platform = %credential.platform, error = %e, "Credential verification failed to run");
                if credential.status == CredentialStatus::Valid
                    && credential.age(now) >= self.policy.stale_after
                {
                    self.mark_stale(credential, now).await
                } else {
                    Ok(credential)
                }
            }
        }
    }

    async fn apply(
        &self,
        mut credential: Credential,
        verification: Verification,
        now: DateTime<Utc>,
    ) -> Result<Credential> {
        let verified_at = (verification.status == CredentialStatus::Valid).then_some(now);
        self.store
            .set_status(
                &credential,
                verification.status,
                verified_at,
                verification.estimated_expiry,
            )
            .await?;

        credential.status = verification.status;
        if verified_at.is_some() {
            credential.last_verified_at = verified_at;
        }
        if verification.estimated_expiry.is_some() {
            credential.estimated_expiry = verification.estimated_expiry;
        }

        match credential.status {
            CredentialStatus::Valid => self.store.clear_warnings(credential.platform).await?,
            CredentialStatus::Stale => self.warn_stale(&credential, now).await?,
            CredentialStatus::Invalid => {
                self.raise_auth_gap(credential.platform, "verification rejected the credential", now)
                    .await?
            }
        }
        Ok(credential)
    }

    async fn mark_stale(&self, mut credential: Credential, now: DateTime<Utc>) -> Result<Credential> {
        self.store
            .set_status(&credential, CredentialStatus::Stale, None, None)
            .await?;
        credential.status = CredentialStatus::Stale;
        self.warn_stale(&credential, now).await?;
        Ok(credential)
    }

    async fn warn_stale(&self, credential: &Credential, now: DateTime<Utc>) -> Result<()> {
        if self.db.set_flag_once(&stale_flag(credential.platform), now).await? {
            self.notifier
                .notify(Event::CredentialStale {
                    platform: credential.platform,
                    account: credential.account.clone(),
                    age_days: credential.age(now).num_days(),
                })
                .await;
        }
        Ok(())
    }
}
