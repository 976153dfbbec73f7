//! In-process event bus
//!
//! Wraps `tokio::sync::broadcast` so that embedding code (or a future UI) can
//! watch operator events as they happen. Emitting never blocks; with no
//! subscribers the event is simply dropped, and lagging subscribers lose the
//! oldest events first.
//!
//! ```
//! use libreelcast::notify::{Event, EventBus};
//! use libreelcast::types::Platform;
//!
//! let bus = EventBus::new(16);
//! let mut receiver = bus.subscribe();
//! bus.emit(Event::AuthGap {
//!     platform: Platform::Tiktok,
//!     reason: "session expired".to_string(),
//! });
//! assert!(receiver.try_recv().is_ok());
//! ```

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{Event, NotificationSink, NotifyError};

pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer before lagging kicks in
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl NotificationSink for EventBus {
    fn name(&self) -> &str {
        "event_bus"
    }

    async fn notify(&self, event: &Event) -> Result<(), NotifyError> {
        self.emit(event.clone());
        Ok(())
    }
}
