//! Mock publisher implementation for testing
//!
//! This module provides a configurable mock publisher that can simulate
//! successes, scripted failures and slow uploads. It's designed for use in
//! integration tests to verify dispatch logic without requiring real uploader
//! commands or platform credentials.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::credentials::{Credential, CredentialStatus, CredentialVerifier, Verification};
use crate::error::{PublishError, Result};
use crate::platforms::{PublishReceipt, PublishRequest, Publisher};
use crate::types::Platform;

/// Configuration for mock publisher behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub platform: Platform,

    /// Outcomes returned in order; once exhausted every call succeeds
    pub script: Arc<Mutex<VecDeque<std::result::Result<(), PublishError>>>>,

    /// Delay before completing the upload (simulates a slow upload)
    pub delay: Duration,

    /// Number of times publish has been called
    pub publish_call_count: Arc<Mutex<usize>>,

    /// Task ids that were published successfully (for verification)
    pub published: Arc<Mutex<Vec<String>>>,

    /// Uploads currently running, and the highest value seen
    pub in_flight: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
}

impl MockConfig {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            script: Arc::new(Mutex::new(VecDeque::new())),
            delay: Duration::from_millis(0),
            publish_call_count: Arc::new(Mutex::new(0)),
            published: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Mock publisher for testing
pub struct MockPublisher {
    config: MockConfig,
}

impl MockPublisher {
    /// Create a new mock publisher with the given configuration
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// Create a mock publisher that always succeeds
    pub fn success(platform: Platform) -> Self {
        Self::new(MockConfig::new(platform))
    }

    /// Create a mock publisher that fails every call with `error`
    pub fn always_failing(platform: Platform, error: PublishError, times: usize) -> Self {
        let publisher = Self::success(platform);
        for _ in 0..times {
            publisher.push_outcome(Err(error.clone()));
        }
        publisher
    }

    /// Create a mock publisher with a delay
    pub fn with_delay(platform: Platform, delay: Duration) -> Self {
        Self::new(MockConfig {
            delay,
            ..MockConfig::new(platform)
        })
    }

    /// Queue the outcome of a future call
    pub fn push_outcome(&self, outcome: std::result::Result<(), PublishError>) {
        self.config.script.lock().unwrap().push_back(outcome);
    }

    /// Get the number of times publish was called
    pub fn publish_call_count(&self) -> usize {
        *self.config.publish_call_count.lock().unwrap()
    }

    /// Get the task ids that were published successfully
    pub fn published(&self) -> Vec<String> {
        self.config.published.lock().unwrap().clone()
    }

    /// Highest number of overlapping publish calls observed
    pub fn max_in_flight(&self) -> usize {
        self.config.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    fn platform(&self) -> Platform {
        self.config.platform
    }

    async fn publish(
        &self,
        request: &PublishRequest,
        _credential: &Credential,
    ) -> std::result::Result<PublishReceipt, PublishError> {
        *self.config.publish_call_count.lock().unwrap() += 1;

        let running = self.config.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.config.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        let outcome = self.config.script.lock().unwrap().pop_front();
        self.config.in_flight.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Some(Err(e)) => Err(e),
            _ => {
                self.config
                    .published
                    .lock()
                    .unwrap()
                    .push(request.task_id.clone());
                Ok(PublishReceipt {
                    posted_id: format!("{}:mock-{}", self.config.platform, uuid::Uuid::new_v4()),
                })
            }
        }
    }
}

/// Verifier that reports a fixed status
pub struct MockVerifier {
    status: Mutex<CredentialStatus>,
    calls: Arc<Mutex<usize>>,
}

impl MockVerifier {
    pub fn new(status: CredentialStatus) -> Self {
        Self {
            status: Mutex::new(status),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn set_status(&self, status: CredentialStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl CredentialVerifier for MockVerifier {
    async fn verify(&self, _credential: &Credential) -> Result<Verification> {
        *self.calls.lock().unwrap() += 1;
        Ok(Verification {
            status: *self.status.lock().unwrap(),
            estimated_expiry: None,
        })
    }
}
