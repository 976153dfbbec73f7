//! Publishing adapters
//!
//! The dispatcher only knows the [`Publisher`] trait. Each enabled platform
//! gets one implementation, registered in a [`PublisherRegistry`]; the core
//! never branches on platform identity beyond grouping tasks into lanes.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use libreelcast::platforms::{PublisherRegistry, mock::MockPublisher};
//! use libreelcast::types::Platform;
//!
//! let mut registry = PublisherRegistry::new();
//! registry.register(Arc::new(MockPublisher::success(Platform::Youtube)));
//!
//! assert!(registry.get(Platform::Youtube).is_some());
//! assert!(registry.get(Platform::Tiktok).is_none());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credentials::Credential;
use crate::error::PublishError;
use crate::types::{Platform, Task};

pub mod command;

// Mock publisher is available for all builds (not just tests) to support integration tests
pub mod mock;

/// What a publisher is asked to upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub task_id: String,
    pub platform: Platform,
    pub media_reference: String,
    pub title: String,
    pub description: String,
}

impl PublishRequest {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            platform: task.platform,
            media_reference: task.media_reference.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
        }
    }
}

/// Proof of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Platform-side identifier of the uploaded video
    pub posted_id: String,
}

/// Upload capability for one platform
///
/// Implementations perform a single upload attempt. They must not retry on
/// their own: retries, backoff and pausing belong to the dispatcher, which
/// needs an honest classification of every failure.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// The platform this publisher uploads to
    fn platform(&self) -> Platform;

    /// Upload one video
    ///
    /// # Arguments
    ///
    /// * `request` - The media file and its metadata
    /// * `credential` - The platform's active credential; its status is
    ///   `valid` when the dispatcher calls this
    ///
    /// # Returns
    ///
    /// The platform's identifier for the uploaded video.
    ///
    /// # Errors
    ///
    /// Returns a [`PublishError`] whose kind decides what happens next:
    /// - `AuthExpired` - the credential was rejected; it is marked invalid and
    ///   the task waits for a re-link without consuming an attempt
    /// - `RateLimited` / `TransientNetwork` - retried with backoff
    /// - `PermanentReject` - the task fails immediately
    ///
    /// `Timeout` is produced by the dispatcher when the call exceeds the
    /// configured publish timeout; publishers need not return it themselves.
    async fn publish(
        &self,
        request: &PublishRequest,
        credential: &Credential,
    ) -> Result<PublishReceipt, PublishError>;
}

/// Publishers keyed by platform
#[derive(Clone, Default)]
pub struct PublisherRegistry {
    publishers: HashMap<Platform, Arc<dyn Publisher>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a publisher, replacing any previous one for its platform
    pub fn register(&mut self, publisher: Arc<dyn Publisher>) {
        self.publishers.insert(publisher.platform(), publisher);
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn Publisher>> {
        self.publishers.get(&platform).cloned()
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.publishers.keys().copied().collect();
        platforms.sort();
        platforms
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }
}
