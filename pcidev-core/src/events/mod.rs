//! Claim event bus.
//!
//! The record store publishes claim changes here; the claim controller
//! subscribes and reacts. Delivery is best-effort: a subscriber that falls
//! behind is told to resync instead of receiving the missed events.
//!
//! # Example
//!
//! ```ignore
//! let bus = ClaimEventBus::new();
//! let mut rx = bus.subscribe();
//!
//! bus.publish(ClaimEvent::Changed(claim));
//!
//! while let Some(event) = rx.recv().await {
//!     println!("Received: {}", event.kind());
//! }
//! ```

use crate::types::PciDeviceClaim;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Maximum number of events buffered in the broadcast channel.
const EVENT_BUFFER_SIZE: usize = 256;

/// A change to a claim record.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimEvent {
    /// Claim created or its spec updated
    Changed(PciDeviceClaim),
    /// Deletion requested; passthrough must be disabled before the record goes away
    Removing(PciDeviceClaim),
    /// Events were lost; the subscriber should re-list all claims
    Resync,
}

impl ClaimEvent {
    /// Short event name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ClaimEvent::Changed(_) => "claim.changed",
            ClaimEvent::Removing(_) => "claim.removing",
            ClaimEvent::Resync => "claim.resync",
        }
    }

    pub fn claim_name(&self) -> Option<&str> {
        match self {
            ClaimEvent::Changed(c) | ClaimEvent::Removing(c) => Some(&c.name),
            ClaimEvent::Resync => None,
        }
    }
}

/// Event bus for publishing and subscribing to claim events.
#[derive(Clone)]
pub struct ClaimEventBus {
    sender: broadcast::Sender<ClaimEvent>,
}

impl ClaimEventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: ClaimEvent) {
        debug!(event = event.kind(), claim = ?event.claim_name(), "Publishing event");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> ClaimSubscriber {
        ClaimSubscriber { receiver: self.sender.subscribe() }
    }

    /// Get the number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ClaimEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of the claim event bus.
pub struct ClaimSubscriber {
    receiver: broadcast::Receiver<ClaimEvent>,
}

impl ClaimSubscriber {
    /// Receive the next event; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<ClaimEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Claim subscriber lagged by {} events, requesting resync", n);
                Some(ClaimEvent::Resync)
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
