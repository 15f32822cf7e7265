use std::cmp::Ordering as CmpOrdering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::events::{
	EventEnvelope, EventNotice, LivenessFlag, Notification, NotificationBus, ObservedStatus,
	ReorgNotice,
};
use super::types::TrackedEvent;
use crate::ledger::{CommitmentLevel, LedgerClient, LedgerError};

/// Configuration for finality checking
#[derive(Debug, Clone)]
pub struct FinalityConfig {
	/// Delay between dispatch and the single status check
	pub check_delay: Duration,
	/// Upper bound on status queries in flight
	pub max_concurrent_checks: usize,
}

impl Default for FinalityConfig {
	fn default() -> Self {
		Self {
			check_delay: Duration::from_secs(35),
			max_concurrent_checks: 16,
		}
	}
}

/// Counters of the finality tracker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FinalityStats {
	pub scheduled: u64,
	pub fired: u64,
	pub finalized: u64,
	pub reorg_suspected: u64,
}

#[derive(Default)]
struct Counters {
	scheduled: AtomicU64,
	fired: AtomicU64,
	finalized: AtomicU64,
	reorg_suspected: AtomicU64,
}

struct Scheduled {
	due: Instant,
	seq: u64,
	event: TrackedEvent,
}

impl PartialEq for Scheduled {
	fn eq(&self, other: &Self) -> bool {
		self.due == other.due && self.seq == other.seq
	}
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
	fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
		Some(self.cmp(other))
	}
}

impl Ord for Scheduled {
	fn cmp(&self, other: &Self) -> CmpOrdering {
		self.due
			.cmp(&other.due)
			.then_with(|| self.seq.cmp(&other.seq))
	}
}

/// Schedules one deferred status check per dispatched event.
///
/// Events are queued on a min-heap keyed by fire time and serviced by a single background
/// loop. Each due check runs as its own task, bounded by a semaphore, and settles the event
/// to `finalized` or `reorg-suspected` exactly once.
#[derive(Clone)]
pub struct FinalityTracker {
	ledger: Arc<dyn LedgerClient>,
	queue: mpsc::UnboundedSender<(Instant, TrackedEvent)>,
	check_delay: Duration,
	counters: Arc<Counters>,
}

impl FinalityTracker {
	/// Start the scheduling loop. Must be called from within a tokio runtime.
	pub fn spawn(
		ledger: Arc<dyn LedgerClient>,
		bus: NotificationBus,
		liveness: LivenessFlag,
		config: FinalityConfig,
	) -> Self {
		let (queue, incoming) = mpsc::unbounded_channel();
		let counters = Arc::new(Counters::default());

		let scheduler = Scheduler {
			ledger: ledger.clone(),
			bus,
			liveness,
			counters: counters.clone(),
			permits: Arc::new(Semaphore::new(config.max_concurrent_checks.max(1))),
		};
		tokio::spawn(scheduler.run(incoming));

		Self {
			ledger,
			queue,
			check_delay: config.check_delay,
			counters,
		}
	}

	/// Queue the finality check of a freshly dispatched event.
	pub fn track(&self, event: TrackedEvent) -> bool {
		let due = Instant::now() + self.check_delay;
		let signature = event.signature.clone();
		if self.queue.send((due, event)).is_err() {
			warn!(signature = %signature, "Finality scheduler is gone, event not tracked");
			return false;
		}
		self.counters.scheduled.fetch_add(1, Ordering::SeqCst);
		debug!(signature = %signature, "Finality check scheduled");
		true
	}

	/// Ask the ledger whether a transaction is finalized right now.
	pub async fn is_finalized(&self, signature: &str) -> Result<bool, LedgerError> {
		let status = self.ledger.get_signature_status(signature).await?;
		Ok(status == Some(CommitmentLevel::Finalized))
	}

	pub fn stats(&self) -> FinalityStats {
		FinalityStats {
			scheduled: self.counters.scheduled.load(Ordering::SeqCst),
			fired: self.counters.fired.load(Ordering::SeqCst),
			finalized: self.counters.finalized.load(Ordering::SeqCst),
			reorg_suspected: self.counters.reorg_suspected.load(Ordering::SeqCst),
		}
	}
}

struct Scheduler {
	ledger: Arc<dyn LedgerClient>,
	bus: NotificationBus,
	liveness: LivenessFlag,
	counters: Arc<Counters>,
	permits: Arc<Semaphore>,
}

impl Scheduler {
	async fn run(self, mut incoming: mpsc::UnboundedReceiver<(Instant, TrackedEvent)>) {
		let mut heap: BinaryHeap<Reverse<Scheduled>> = BinaryHeap::new();
		let mut seq = 0u64;
		let mut channel_open = true;

		loop {
			let next_due = heap.peek().map(|Reverse(s)| s.due);
			if !channel_open && next_due.is_none() {
				break;
			}

			tokio::select! {
				received = incoming.recv(), if channel_open => match received {
					Some((due, event)) => {
						heap.push(Reverse(Scheduled { due, seq, event }));
						seq += 1;
					}
					None => channel_open = false,
				},
				_ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
					let now = Instant::now();
					while heap.peek().is_some_and(|Reverse(s)| s.due <= now) {
						// at most `max_concurrent_checks` check tasks exist at once
						let Ok(permit) = self.permits.clone().acquire_owned().await else {
							warn!("Finality check permits closed, scheduler stopping");
							return;
						};
						if let Some(Reverse(scheduled)) = heap.pop() {
							self.fire(scheduled.event, permit);
						}
					}
				}
				else => break,
			}
		}
		debug!("Finality scheduler stopped");
	}

	fn fire(&self, event: TrackedEvent, permit: OwnedSemaphorePermit) {
		self.counters.fired.fetch_add(1, Ordering::SeqCst);

		let ledger = self.ledger.clone();
		let bus = self.bus.clone();
		let liveness = self.liveness.clone();
		let counters = self.counters.clone();

		tokio::spawn(async move {
			let _permit = permit;
			let status = ledger.get_signature_status(&event.signature).await;
			settle(event, status, &bus, &liveness, &counters);
		});
	}
}

fn settle(
	mut event: TrackedEvent,
	status: Result<Option<CommitmentLevel>, LedgerError>,
	bus: &NotificationBus,
	liveness: &LivenessFlag,
	counters: &Counters,
) {
	let observed = match status {
		Ok(status) => ObservedStatus::from(status),
		Err(e) => ObservedStatus::Unavailable(e.to_string()),
	};
	let finalized = observed == ObservedStatus::Finalized;

	if let Err(e) = event.resolve(finalized) {
		warn!(signature = %event.signature, "Skipping finality result: {}", e);
		return;
	}
	if finalized {
		counters.finalized.fetch_add(1, Ordering::SeqCst);
	} else {
		counters.reorg_suspected.fetch_add(1, Ordering::SeqCst);
	}

	if !liveness.is_live() {
		debug!(
			signature = %event.signature,
			"Dispatch surface is down, finality result not emitted"
		);
		return;
	}

	if finalized {
		info!(
			signature = %event.signature,
			slot = event.slot,
			"{} finalized",
			event.event.name()
		);
		bus.emit(Notification::TransactionFinalized(EventEnvelope::from(&event)));
		bus.emit(Notification::EventFinalized(EventNotice::from(&event)));
	} else {
		warn!(
			signature = %event.signature,
			slot = event.slot,
			observed = ?observed,
			"{} not finalized at check time, potential reorg",
			event.event.name()
		);
		bus.emit(Notification::PotentialReorg(ReorgNotice {
			event: event.event,
			signature: event.signature,
			slot: event.slot,
			timestamp: event.timestamp,
			observed,
		}));
	}
}
