//! Mirror Synchronization Module
//!
//! This module keeps the local mirror consistent with the ledger program it follows. It is composed
//! of several submodules, each responsible for one part of the sync process:
//!
//! - `subscriber`: Keeps a log subscription open for the program and reconnects with backoff when it drops.
//! - `parser`: Decodes program events from transaction logs and dispatches them as notifications.
//! - `finality`: Checks each dispatched event once after a delay and reports finality or a suspected reorg.
//! - `reconciliation`: Sweeps local records, overwriting drifted fields from the ledger and flagging orphans.
//! - `events`: Defines the notification types, subscription topics, and the notification bus.
//! - `report`: Statistics for reconciliation sweeps.
//!
//! Live ingestion gives low latency but may miss or misorder events; periodic reconciliation is the
//! correctness backstop that converges the mirror to ledger truth.

/// Notification system for relay layers
pub mod events;
/// Deferred finality checks
pub mod finality;
/// Log parsing and event dispatch
pub mod parser;
/// Drift correction between mirror and ledger
pub mod reconciliation;
/// Sweep statistics
pub mod report;
/// Ledger log subscription lifecycle
pub mod subscriber;
pub mod types;

#[cfg(test)]
mod testing;

pub use events::{LivenessFlag, Notification, NotificationBus, Topic};
pub use finality::{FinalityConfig, FinalityTracker};
pub use parser::{EventDispatcher, EventParser};
pub use reconciliation::{ReconcileConfig, ReconciliationEngine};
pub use subscriber::{EventSubscriber, SubscriberConfig};
pub use types::SyncError;
