//! Notification system for the sync core.
//!
//! This module defines the closed set of notifications the core emits, the topics consumers
//! subscribe to, and the bus that fans notifications out. Relay layers (HTTP, websocket) register
//! a [`Subscription`] for the topics they care about and receive notifications in emission order.
//! Dropping or cancelling a subscription unregisters it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;

use crate::ledger::{CommitmentLevel, EventKind, ProgramEvent};
use crate::sync::types::{CommitmentState, TrackedEvent};

/// Generic event payload, carrying the commitment state it was emitted at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: ProgramEvent,
    pub signature: String,
    pub slot: u64,
    pub timestamp: DateTime<Utc>,
    pub commitment: CommitmentState,
}

impl From<&TrackedEvent> for EventEnvelope {
    fn from(tracked: &TrackedEvent) -> Self {
        Self {
            event: tracked.event.clone(),
            signature: tracked.signature.clone(),
            slot: tracked.slot,
            timestamp: tracked.timestamp,
            commitment: tracked.commitment,
        }
    }
}

/// Name-specific event payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventNotice {
    #[serde(flatten)]
    pub event: ProgramEvent,
    pub signature: String,
    pub slot: u64,
    pub timestamp: DateTime<Utc>,
}

impl From<&TrackedEvent> for EventNotice {
    fn from(tracked: &TrackedEvent) -> Self {
        Self {
            event: tracked.event.clone(),
            signature: tracked.signature.clone(),
            slot: tracked.slot,
            timestamp: tracked.timestamp,
        }
    }
}

/// What the single finality check saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "kebab-case")]
pub enum ObservedStatus {
    NotFound,
    Processed,
    Confirmed,
    Finalized,
    /// The status query itself failed
    Unavailable(String),
}

impl From<Option<CommitmentLevel>> for ObservedStatus {
    fn from(status: Option<CommitmentLevel>) -> Self {
        match status {
            None => ObservedStatus::NotFound,
            Some(CommitmentLevel::Processed) => ObservedStatus::Processed,
            Some(CommitmentLevel::Confirmed) => ObservedStatus::Confirmed,
            Some(CommitmentLevel::Finalized) => ObservedStatus::Finalized,
        }
    }
}

/// Payload of a potential-reorg warning.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReorgNotice {
    #[serde(flatten)]
    pub event: ProgramEvent,
    pub signature: String,
    pub slot: u64,
    pub timestamp: DateTime<Utc>,
    pub observed: ObservedStatus,
}

/// Notifications emitted by the sync core.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Notification {
    /// Every decoded event, at pending-confirmation commitment
    BlockchainEvent(EventEnvelope),
    /// The same event, addressed by its name
    ProgramEvent(EventNotice),
    /// A specific event whose transaction reached finality
    EventFinalized(EventNotice),
    /// Any event whose transaction reached finality
    TransactionFinalized(EventEnvelope),
    /// The finality check did not observe a finalized transaction
    PotentialReorg(ReorgNotice),
    /// The subscriber gave up reconnecting
    MaxReconnectAttemptsReached { attempts: u32 },
}

/// Discriminant of [`Notification`], used to pick topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    BlockchainEvent,
    ProgramEvent,
    EventFinalized,
    TransactionFinalized,
    PotentialReorg,
    MaxReconnectAttemptsReached,
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::BlockchainEvent(_) => NotificationKind::BlockchainEvent,
            Notification::ProgramEvent(_) => NotificationKind::ProgramEvent,
            Notification::EventFinalized(_) => NotificationKind::EventFinalized,
            Notification::TransactionFinalized(_) => NotificationKind::TransactionFinalized,
            Notification::PotentialReorg(_) => NotificationKind::PotentialReorg,
            Notification::MaxReconnectAttemptsReached { .. } => {
                NotificationKind::MaxReconnectAttemptsReached
            }
        }
    }

    /// Channel name used by relay layers, e.g. `CouponMinted-finalized`.
    pub fn name(&self) -> String {
        match self {
            Notification::BlockchainEvent(_) => "blockchain-event".to_string(),
            Notification::ProgramEvent(notice) => notice.event.name().to_string(),
            Notification::EventFinalized(notice) => format!("{}-finalized", notice.event.name()),
            Notification::TransactionFinalized(_) => "transaction-finalized".to_string(),
            Notification::PotentialReorg(_) => "potential-reorg".to_string(),
            Notification::MaxReconnectAttemptsReached { .. } => {
                "max-reconnect-attempts-reached".to_string()
            }
        }
    }

    fn event_kind(&self) -> Option<EventKind> {
        match self {
            Notification::ProgramEvent(notice) | Notification::EventFinalized(notice) => {
                Some(notice.event.kind())
            }
            _ => None,
        }
    }
}

/// What a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    All,
    Kind(NotificationKind),
    /// Name-specific notifications of one event kind
    Event(EventKind),
    /// Finalized notifications of one event kind
    EventFinalized(EventKind),
}

impl Topic {
    pub fn matches(&self, notification: &Notification) -> bool {
        match self {
            Topic::All => true,
            Topic::Kind(kind) => notification.kind() == *kind,
            Topic::Event(kind) => {
                notification.kind() == NotificationKind::ProgramEvent
                    && notification.event_kind() == Some(*kind)
            }
            Topic::EventFinalized(kind) => {
                notification.kind() == NotificationKind::EventFinalized
                    && notification.event_kind() == Some(*kind)
            }
        }
    }
}

struct Subscriber {
    topic: Topic,
    sender: mpsc::UnboundedSender<Notification>,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
}

impl BusInner {
    fn remove(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Fan-out of notifications to registered subscriptions.
///
/// Emission is synchronous: a notification is queued on every matching subscription before
/// `emit` returns, so notifications from one caller arrive in the order they were emitted.
#[derive(Clone, Default)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register for notifications matching `topic`.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Subscriber { topic, sender });

        Subscription {
            id,
            receiver,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `notification` to every matching subscription. Returns the number reached.
    pub fn emit(&self, notification: Notification) -> usize {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut delivered = 0;
        subscribers.retain(|_, subscriber| {
            if !subscriber.topic.matches(&notification) {
                return true;
            }
            match subscriber.sender.send(notification.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A registered interest in bus notifications. Unregisters on drop.
pub struct Subscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<Notification>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next notification.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    /// Take a queued notification without waiting.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }

    /// Stop receiving notifications.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

/// Shared flag telling deferred work whether the dispatch surface is still up.
#[derive(Debug, Clone, Default)]
pub struct LivenessFlag(Arc<AtomicBool>);

impl LivenessFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn deactivate(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
