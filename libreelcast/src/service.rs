//! Service facade for Reelcast
//!
//! [`Reelcast`] wires the store, queue, credential monitor, publishers and
//! notification sinks together from one [`Config`], so that each binary only
//! has to pick the parts it needs.
//!
//! # Example
//!
//! ```no_run
//! use libreelcast::service::Reelcast;
//!
//! # async fn example() -> libreelcast::Result<()> {
//! let service = Reelcast::new().await?;
//!
//! // Operator actions
//! let stats = service.queue().stats().await?;
//! println!("{} state buckets", stats.len());
//!
//! // The daemon
//! let dispatcher = service.dispatcher()?;
//! dispatcher.tick(chrono::Utc::now()).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::config::Config;
use crate::credentials::{CredentialMonitor, CredentialPolicy, CredentialVerifier};
use crate::db::Database;
use crate::dispatch::Dispatcher;
use crate::error::{ConfigError, Result};
use crate::notify::{EventBus, EventReceiver, LogSink, Notifier, TelegramSink};
use crate::platforms::command::CommandPublisher;
use crate::platforms::{Publisher, PublisherRegistry};
use crate::queue::TaskQueue;
use crate::retry::{RetryController, RetryPolicy};
use crate::types::Platform;

const EVENT_BUS_CAPACITY: usize = 100;

pub struct Reelcast {
    config: Arc<Config>,
    db: Arc<Database>,
    queue: TaskQueue,
    credentials: CredentialMonitor,
    publishers: PublisherRegistry,
    notifier: Notifier,
    events: EventBus,
}

impl Reelcast {
    /// Load configuration from the default location and open the database
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration cannot be loaded or is invalid
    /// - Database cannot be initialized or migrated
    pub async fn new() -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(config).await
    }

    pub async fn from_config(config: Config) -> Result<Self> {
        let db = Database::new(&config.db_path()).await?;
        Self::with_database(config, db)
    }

    /// Build on an already opened database (tests use an in-memory one)
    pub fn with_database(config: Config, db: Database) -> Result<Self> {
        config.validate()?;
        let db = Arc::new(db);
        let events = EventBus::new(EVENT_BUS_CAPACITY);

        let mut notifier = Notifier::new(config.notify.timeout)
            .with_sink(Arc::new(LogSink))
            .with_sink(Arc::new(events.clone()));
        if let Some(telegram) = &config.notify.telegram {
            let sink = TelegramSink::from_config(telegram).map_err(|e| ConfigError::InvalidValue {
                field: "notify.telegram".to_string(),
                message: e.to_string(),
            })?;
            notifier = notifier.with_sink(Arc::new(sink));
        }

        let mut publishers = PublisherRegistry::new();
        let mut credentials = CredentialMonitor::new(
            db.clone(),
            CredentialPolicy::from_config(&config.credentials)?,
            notifier.clone(),
        );
        for platform in Platform::ALL {
            let Some(publisher_config) = config.publisher(platform) else {
                continue;
            };
            let publisher = CommandPublisher::new(platform, publisher_config.clone());
            if let Some(verifier) = publisher.verifier() {
                credentials = credentials.with_verifier(platform, Arc::new(verifier));
            }
            publishers.register(Arc::new(publisher));
        }

        let queue = TaskQueue::new(db.clone(), config.schedule()?);

        Ok(Self {
            config: Arc::new(config),
            db,
            queue,
            credentials,
            publishers,
            notifier,
            events,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn credentials(&self) -> &CredentialMonitor {
        &self.credentials
    }

    pub fn publishers(&self) -> &PublisherRegistry {
        &self.publishers
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Watch operator events (auth gaps, failures, completions)
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Replace the publisher for its platform
    pub fn register_publisher(&mut self, publisher: Arc<dyn Publisher>) {
        self.publishers.register(publisher);
    }

    pub fn register_verifier(&mut self, platform: Platform, verifier: Arc<dyn CredentialVerifier>) {
        self.credentials = self.credentials.clone().with_verifier(platform, verifier);
    }

    /// Platforms that are enabled but have no publisher
    pub fn unpublishable_platforms(&self) -> Vec<Platform> {
        self.config
            .platforms
            .enabled
            .iter()
            .copied()
            .filter(|p| self.publishers.get(*p).is_none())
            .collect()
    }

    /// A dispatcher using this service's parts and configured timings
    pub fn dispatcher(&self) -> Result<Dispatcher> {
        let policy = RetryPolicy::from_config(&self.config.retry)?;
        let health_interval = crate::credentials::to_chrono(
            self.config.dispatch.health_check_interval,
            "dispatch.health_check_interval",
        )?;
        let (jitter_min, jitter_max) = self.config.dispatch.jitter_range()?;

        Ok(Dispatcher::new(
            self.queue.clone(),
            self.publishers.clone(),
            self.credentials.clone(),
            RetryController::new(policy, self.db.clone()),
            self.notifier.clone(),
        )
        .with_publish_timeout(self.config.dispatch.publish_timeout)
        .with_health_check_interval(health_interval)
        .with_jitter(jitter_min, jitter_max))
    }
}
